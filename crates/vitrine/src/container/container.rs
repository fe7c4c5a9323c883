//! Container types and configuration.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

use super::error::{ContainerError, ContainerResult};

/// Deserialize a timestamp that may be a string (docker) or a Unix integer (podman).
fn deserialize_string_or_int<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Signed(i64),
        Unsigned(u64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Signed(n) => n.to_string(),
        Raw::Unsigned(n) => n.to_string(),
    })
}

/// Deserialize container names from either a comma separated string (docker)
/// or a list (podman).
fn deserialize_names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Joined(String),
        List(Vec<String>),
    }

    let names = match Raw::deserialize(deserializer)? {
        Raw::Joined(s) => s
            .split(',')
            .map(|n| n.trim().trim_start_matches('/').to_string())
            .filter(|n| !n.is_empty())
            .collect(),
        Raw::List(list) => list
            .into_iter()
            .map(|n| n.trim_start_matches('/').to_string())
            .collect(),
    };
    Ok(names)
}

/// A container port published on the host.
///
/// When `host_port` is `None` the runtime picks a free ephemeral port, which is
/// read back later with `docker port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Address the port is bound to on the host.
    pub host_ip: Option<String>,
    /// Fixed host port, or `None` for a dynamic one.
    pub host_port: Option<u16>,
    /// Port in the container.
    pub container_port: u16,
}

impl PortMapping {
    /// Publish `container_port` on a runtime-chosen host port.
    pub fn dynamic(host_ip: Option<String>, container_port: u16) -> Self {
        Self {
            host_ip,
            host_port: None,
            container_port,
        }
    }

    /// Render the `-p` argument understood by docker and podman.
    pub fn to_arg(&self) -> String {
        let host_port = self.host_port.map(|p| p.to_string()).unwrap_or_default();
        match self.host_ip.as_deref() {
            Some(ip) if ip.contains(':') => {
                format!("[{}]:{}:{}", ip, host_port, self.container_port)
            }
            Some(ip) => format!("{}:{}:{}", ip, host_port, self.container_port),
            None if self.host_port.is_some() => format!("{}:{}", host_port, self.container_port),
            None => self.container_port.to_string(),
        }
    }
}

/// Configuration for creating a new container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Container name.
    pub name: Option<String>,
    /// Docker/OCI image to use.
    pub image: String,
    /// Command to run (image default when empty).
    pub command: Vec<String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Published ports.
    pub ports: Vec<PortMapping>,
    /// Labels for the container.
    pub labels: BTreeMap<String, String>,
    /// Remove the container as soon as it stops.
    pub auto_remove: bool,
    /// Memory limit (e.g. "512m").
    pub memory_limit: Option<String>,
    /// CPU quota (e.g. "0.5").
    pub cpu_limit: Option<String>,
    /// Network to attach to.
    pub network: Option<String>,
}

impl ContainerConfig {
    /// Create a new container config with the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all container configuration fields.
    ///
    /// Every value ends up on a runtime command line, so anything that could be
    /// read as a flag or carries shell metacharacters is rejected.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }

        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }

        for key in self.labels.keys() {
            validate_label_key(key)?;
        }

        for port in &self.ports {
            if port.container_port == 0 {
                return Err(ContainerError::InvalidInput(
                    "container port cannot be 0".to_string(),
                ));
            }
            if let Some(ref ip) = port.host_ip {
                validate_host_ip(ip)?;
            }
        }

        if let Some(ref memory) = self.memory_limit {
            validate_limit(memory, "memory")?;
        }
        if let Some(ref cpus) = self.cpu_limit {
            validate_limit(cpus, "cpu")?;
        }
        if let Some(ref network) = self.network {
            validate_container_name(network)?;
        }

        Ok(())
    }

    /// Set the container name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add multiple environment variables.
    pub fn envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(envs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Publish a container port on a dynamic host port.
    pub fn publish(mut self, host_ip: Option<String>, container_port: u16) -> Self {
        self.ports
            .push(PortMapping::dynamic(host_ip, container_port));
        self
    }

    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Remove the container when it stops.
    pub fn auto_remove(mut self, enabled: bool) -> Self {
        self.auto_remove = enabled;
        self
    }

    pub fn memory_limit(mut self, limit: Option<String>) -> Self {
        self.memory_limit = limit;
        self
    }

    pub fn cpu_limit(mut self, limit: Option<String>) -> Self {
        self.cpu_limit = limit;
        self
    }

    pub fn network(mut self, network: Option<String>) -> Self {
        self.network = network;
        self
    }
}

/// Container state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Container is created but not started.
    Created,
    /// Container is running.
    Running,
    /// Container is paused.
    Paused,
    /// Container is restarting.
    Restarting,
    /// Container is being removed.
    Removing,
    /// Container has exited.
    Exited,
    /// Container is dead.
    Dead,
    /// Unknown state.
    #[default]
    #[serde(other)]
    Unknown,
}

impl ContainerState {
    /// Parse the lowercase status word printed by `inspect --format {{.State.Status}}`.
    pub fn parse(status: &str) -> Self {
        match status.trim().to_lowercase().as_str() {
            "created" | "configured" | "initialized" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "exited" | "stopped" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }

    /// The container will not come back without an explicit start.
    pub fn is_finished(&self) -> bool {
        matches!(self, ContainerState::Exited | ContainerState::Dead)
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Paused => write!(f, "paused"),
            ContainerState::Restarting => write!(f, "restarting"),
            ContainerState::Removing => write!(f, "removing"),
            ContainerState::Exited => write!(f, "exited"),
            ContainerState::Dead => write!(f, "dead"),
            ContainerState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Container information from `ps --format json`.
///
/// Docker prints one object per line with `ID` and a joined `Names` string,
/// podman prints an array with `Id` and a `Names` list. Both shapes decode here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Container {
    /// Container ID.
    #[serde(alias = "ID")]
    pub id: String,

    /// Container names.
    #[serde(default, deserialize_with = "deserialize_names")]
    pub names: Vec<String>,

    /// Image used.
    #[serde(default)]
    pub image: String,

    /// Container state.
    #[serde(default)]
    pub state: ContainerState,

    /// Status string (e.g., "Up 5 minutes").
    #[serde(default)]
    pub status: String,

    /// Creation timestamp.
    #[serde(
        default,
        alias = "CreatedAt",
        deserialize_with = "deserialize_string_or_int"
    )]
    pub created: String,
}

impl Container {
    /// First name carrying `prefix`, if any.
    pub fn name_with_prefix(&self, prefix: &str) -> Option<&str> {
        self.names
            .iter()
            .map(String::as_str)
            .find(|n| n.starts_with(prefix))
    }
}

/// Container resource statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerStats {
    /// Container ID.
    #[serde(alias = "ContainerID", alias = "Container")]
    pub container_id: String,

    /// Container name.
    #[serde(default)]
    pub name: String,

    /// CPU percentage.
    #[serde(default, alias = "CPUPerc", alias = "CPU")]
    pub cpu_percent: String,

    /// Memory usage.
    #[serde(default, alias = "MemUsage", alias = "MemUsageBytes")]
    pub mem_usage: String,

    /// Memory percentage.
    #[serde(default, alias = "MemPerc", alias = "Mem")]
    pub mem_percent: String,

    /// Network I/O.
    #[serde(default, alias = "NetIO")]
    pub net_io: String,

    /// Block I/O.
    #[serde(default, alias = "BlockIO")]
    pub block_io: String,

    /// Number of PIDs.
    #[serde(default, alias = "PIDs")]
    pub pids: String,
}

/// Parse `ps --format json` output in either the array or line-delimited shape.
pub fn parse_container_list(stdout: &str) -> ContainerResult<Vec<Container>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(vec![]);
    }

    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| ContainerError::ParseError(e.to_string()));
    }

    trimmed
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| ContainerError::ParseError(e.to_string())))
        .collect()
}

/// Parse `stats --no-stream --format json` output in either shape.
pub fn parse_stats(stdout: &str) -> ContainerResult<Option<ContainerStats>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    if trimmed.starts_with('[') {
        let stats: Vec<ContainerStats> = serde_json::from_str(trimmed)
            .map_err(|e| ContainerError::ParseError(e.to_string()))?;
        return Ok(stats.into_iter().next());
    }

    let first = trimmed.lines().next().unwrap_or_default();
    serde_json::from_str(first)
        .map(Some)
        .map_err(|e| ContainerError::ParseError(e.to_string()))
}

/// Parse the output of `docker port <container> <port>/tcp`.
///
/// Lines look like `0.0.0.0:49153` or `[::]:49153`; the first parseable port wins.
pub fn parse_port_output(stdout: &str) -> Option<u16> {
    stdout
        .lines()
        .filter_map(|line| line.trim().rsplit_once(':'))
        .filter_map(|(_, port)| port.trim().parse::<u16>().ok())
        .find(|port| *port > 0)
}

// ============================================================================
// Input Validation Functions
// ============================================================================

/// Validate a Docker/OCI image name.
///
/// Image names follow the pattern: `[registry/][namespace/]name[:tag][@digest]`
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    if image.starts_with('-') {
        return Err(ContainerError::InvalidInput(
            "image name cannot start with '-'".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '@')
    };

    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a container name.
///
/// Must start with an alphanumeric character or underscore and contain only
/// alphanumerics, `-`, `_` and `.`.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    let Some(first_char) = name.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    };

    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length of 128 characters".to_string(),
        ));
    }

    if !first_char.is_ascii_alphanumeric() && first_char != '_' {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if !name.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{}' contains invalid characters",
            name
        )));
    }

    Ok(())
}

/// Validate an environment variable key (POSIX style).
pub fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    let Some(first_char) = key.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    };

    if key.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "environment variable key exceeds maximum length of 256 characters".to_string(),
        ));
    }

    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' must start with a letter or underscore",
            key
        )));
    }

    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters",
            key
        )));
    }

    Ok(())
}

/// Validate a label key (reverse-DNS style, e.g. `vitrine.session`).
fn validate_label_key(key: &str) -> ContainerResult<()> {
    if key.is_empty() || key.len() > 128 {
        return Err(ContainerError::InvalidInput(format!(
            "label key '{}' must be 1-128 characters",
            key
        )));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/');
    if !key.chars().all(valid_chars) || key.starts_with('-') {
        return Err(ContainerError::InvalidInput(format!(
            "label key '{}' contains invalid characters",
            key
        )));
    }

    Ok(())
}

fn validate_host_ip(ip: &str) -> ContainerResult<()> {
    ip.parse::<IpAddr>().map(|_| ()).map_err(|_| {
        ContainerError::InvalidInput(format!("bind address '{}' is not an IP address", ip))
    })
}

/// Resource limits are plain numbers with an optional unit suffix.
fn validate_limit(value: &str, kind: &str) -> ContainerResult<()> {
    let valid = !value.is_empty()
        && value.len() <= 32
        && value.starts_with(|c: char| c.is_ascii_digit())
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '.');
    if valid {
        Ok(())
    } else {
        Err(ContainerError::InvalidInput(format!(
            "{} limit '{}' is not valid",
            kind, value
        )))
    }
}
