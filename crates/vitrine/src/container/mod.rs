//! Container runtime management module.
//!
//! Provides an async interface to manage demo containers via the Docker or
//! Podman CLI. The runtime is auto-detected or can be configured explicitly.
//! [`ContainerOrchestrator`] layers the demo lifecycle (create, start, freeze,
//! orphan cleanup) on top of any [`ContainerRuntimeApi`] implementation.

mod container;
mod error;
mod orchestrator;

pub use container::{
    Container, ContainerConfig, ContainerState, ContainerStats, PortMapping,
    parse_container_list, parse_port_output, parse_stats, validate_image_name,
};
pub use error::{ContainerError, ContainerResult};
pub use orchestrator::{ContainerOrchestrator, ContainerRef, ManagedContainer, OrchestratorConfig};

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::process::Command;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime.
    #[default]
    Docker,
    /// Podman runtime.
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

impl std::str::FromStr for RuntimeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(RuntimeType::Docker),
            "podman" => Ok(RuntimeType::Podman),
            _ => Err(format!("unknown container runtime: {}", s)),
        }
    }
}

/// Validate a container ID or name before it reaches a command line.
///
/// Container IDs are hex strings (12 or 64 chars for docker/podman).
fn validate_container_id_or_name(id: &str) -> ContainerResult<()> {
    if id.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }

    if id.starts_with('-') {
        return Err(ContainerError::InvalidInput(
            "container ID or name cannot start with '-'".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if !id.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container ID or name '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

/// Container runtime abstraction for testability.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create (but do not start) a container, returning its ID.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;
    async fn start_container(&self, container_id: &str) -> ContainerResult<()>;
    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()>;
    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;
    async fn pause_container(&self, container_id: &str) -> ContainerResult<()>;
    async fn unpause_container(&self, container_id: &str) -> ContainerResult<()>;
    /// List containers whose name contains `name_filter`.
    async fn list_containers(
        &self,
        all: bool,
        name_filter: Option<&str>,
    ) -> ContainerResult<Vec<Container>>;
    /// `Ok(None)` when the container does not exist.
    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>>;
    /// Host port published for `container_port`, `Ok(None)` while not yet bound.
    async fn port_binding(
        &self,
        container_id: &str,
        container_port: u16,
    ) -> ContainerResult<Option<u16>>;
    async fn get_stats(&self, container_id: &str) -> ContainerResult<ContainerStats>;
    /// Execute a command in a container and return its stdout.
    async fn exec_output(
        &self,
        container_id: &str,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> ContainerResult<String>;
}

/// Container runtime client driving the docker or podman CLI.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    /// The runtime type (docker or podman)
    runtime_type: RuntimeType,
    /// Path to the container binary
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Prefers Docker, then Podman. Falls back to Docker if neither is on
    /// PATH; calls will then fail at runtime.
    pub fn new() -> Self {
        for runtime_type in [RuntimeType::Docker, RuntimeType::Podman] {
            if Self::is_binary_available(runtime_type.default_binary()) {
                return Self::with_type(runtime_type);
            }
        }
        Self::with_type(RuntimeType::Docker)
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// Check if a binary is available in PATH.
    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run the runtime binary and return stdout.
    ///
    /// Non-zero exits are classified from stderr so callers can tell a missing
    /// container or image apart from other failures.
    async fn run(&self, command: &str, args: &[String]) -> ContainerResult<String> {
        // Arguments may carry session secrets, so only the subcommand is logged.
        debug!("running {} {}", self.binary, command);

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ContainerError::NoRuntimeAvailable
                } else {
                    ContainerError::CommandFailed {
                        command: command.to_string(),
                        message: e.to_string(),
                    }
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify_failure(command, args, stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> ContainerResult<String> {
        self.run("version", &args(["version", "--format", "json"]))
            .await
    }

    /// Create a container without starting it.
    ///
    /// The configuration is validated first; every value is passed as a
    /// separate argument, never through a shell.
    pub async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let mut owned_args: Vec<String> = vec!["create".to_string()];

        if let Some(ref name) = config.name {
            owned_args.push("--name".to_string());
            owned_args.push(name.clone());
        }

        if config.auto_remove {
            owned_args.push("--rm".to_string());
        }

        if let Some(ref network) = config.network {
            owned_args.push("--network".to_string());
            owned_args.push(network.clone());
        }

        for port in &config.ports {
            owned_args.push("-p".to_string());
            owned_args.push(port.to_arg());
        }

        for (key, value) in &config.env {
            owned_args.push("-e".to_string());
            owned_args.push(format!("{}={}", key, value));
        }

        for (key, value) in &config.labels {
            owned_args.push("--label".to_string());
            owned_args.push(format!("{}={}", key, value));
        }

        if let Some(ref memory) = config.memory_limit {
            owned_args.push("--memory".to_string());
            owned_args.push(memory.clone());
        }

        if let Some(ref cpus) = config.cpu_limit {
            owned_args.push("--cpus".to_string());
            owned_args.push(cpus.clone());
        }

        owned_args.push(config.image.clone());
        owned_args.extend(config.command.iter().cloned());

        let stdout = self
            .run("create", &owned_args)
            .await
            .map_err(|e| match e {
                ContainerError::ImageNotFound(_) => {
                    ContainerError::ImageNotFound(config.image.clone())
                }
                other => other,
            })?;

        // Image pulls print progress before the ID; the ID is the last line.
        stdout
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ContainerError::ParseError("create returned no container ID".into()))
    }

    /// Start a created or stopped container.
    pub async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;
        self.run("start", &args(["start", container_id])).await?;
        Ok(())
    }

    /// Stop a running container.
    pub async fn stop_container(
        &self,
        container_id: &str,
        timeout: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut owned_args: Vec<String> = vec!["stop".to_string()];
        if let Some(t) = timeout {
            owned_args.push("-t".to_string());
            owned_args.push(t.to_string());
        }
        owned_args.push(container_id.to_string());

        self.run("stop", &owned_args).await?;
        Ok(())
    }

    /// Remove a container.
    pub async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut owned_args = vec!["rm".to_string()];
        if force {
            owned_args.push("-f".to_string());
        }
        owned_args.push(container_id.to_string());

        self.run("rm", &owned_args).await?;
        Ok(())
    }

    /// Freeze all processes in a container.
    pub async fn pause_container(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;
        self.run("pause", &args(["pause", container_id])).await?;
        Ok(())
    }

    /// Resume a paused container.
    pub async fn unpause_container(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;
        self.run("unpause", &args(["unpause", container_id]))
            .await?;
        Ok(())
    }

    /// List containers.
    pub async fn list_containers(
        &self,
        all: bool,
        name_filter: Option<&str>,
    ) -> ContainerResult<Vec<Container>> {
        let mut owned_args = args(["ps", "--format", "json", "--no-trunc"]);
        if all {
            owned_args.push("-a".to_string());
        }
        if let Some(filter) = name_filter {
            validate_container_id_or_name(filter)?;
            owned_args.push("--filter".to_string());
            owned_args.push(format!("name={}", filter));
        }

        let stdout = self.run("ps", &owned_args).await?;
        parse_container_list(&stdout)
    }

    /// Get the container state status string (e.g. "running", "exited") via `inspect`.
    ///
    /// Returns `Ok(None)` when the container does not exist.
    pub async fn container_state_status(
        &self,
        id_or_name: &str,
    ) -> ContainerResult<Option<String>> {
        validate_container_id_or_name(id_or_name)?;

        match self
            .run(
                "inspect",
                &args(["inspect", "--format", "{{.State.Status}}", id_or_name]),
            )
            .await
        {
            Ok(stdout) => {
                let status = stdout.trim().trim_matches('"').to_string();
                Ok((!status.is_empty()).then_some(status))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Host port bound to `container_port`, read back with `port`.
    ///
    /// A container that exists but has not published the port yet yields
    /// `Ok(None)`.
    pub async fn port_binding(
        &self,
        container_id: &str,
        container_port: u16,
    ) -> ContainerResult<Option<u16>> {
        validate_container_id_or_name(container_id)?;

        let spec = format!("{}/tcp", container_port);
        match self
            .run("port", &args(["port", container_id, spec.as_str()]))
            .await
        {
            Ok(stdout) => Ok(parse_port_output(&stdout)),
            Err(e) if e.is_not_found() => Err(e),
            Err(ContainerError::CommandFailed { message, .. }) => {
                debug!("port {} not published yet: {}", spec, message);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Get container stats (single snapshot).
    pub async fn get_stats(&self, container_id: &str) -> ContainerResult<ContainerStats> {
        validate_container_id_or_name(container_id)?;

        let stdout = self
            .run(
                "stats",
                &args(["stats", "--no-stream", "--format", "json", container_id]),
            )
            .await?;

        parse_stats(&stdout)?
            .ok_or_else(|| ContainerError::ContainerNotFound(container_id.to_string()))
    }

    /// Execute a command in a container and return the output.
    pub async fn exec_output(
        &self,
        container_id: &str,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> ContainerResult<String> {
        validate_container_id_or_name(container_id)?;

        if command.is_empty() {
            return Err(ContainerError::InvalidInput(
                "exec command cannot be empty".to_string(),
            ));
        }

        let mut owned_args = vec!["exec".to_string()];
        for (key, value) in env {
            container::validate_env_var_key(key)?;
            owned_args.push("-e".to_string());
            owned_args.push(format!("{}={}", key, value));
        }
        owned_args.push(container_id.to_string());
        owned_args.extend(command.iter().cloned());

        self.run("exec", &owned_args).await
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        self.create_container(config).await
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        self.start_container(container_id).await
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        self.stop_container(container_id, timeout_seconds).await
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        self.remove_container(container_id, force).await
    }

    async fn pause_container(&self, container_id: &str) -> ContainerResult<()> {
        self.pause_container(container_id).await
    }

    async fn unpause_container(&self, container_id: &str) -> ContainerResult<()> {
        self.unpause_container(container_id).await
    }

    async fn list_containers(
        &self,
        all: bool,
        name_filter: Option<&str>,
    ) -> ContainerResult<Vec<Container>> {
        self.list_containers(all, name_filter).await
    }

    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>> {
        self.container_state_status(id_or_name).await
    }

    async fn port_binding(
        &self,
        container_id: &str,
        container_port: u16,
    ) -> ContainerResult<Option<u16>> {
        self.port_binding(container_id, container_port).await
    }

    async fn get_stats(&self, container_id: &str) -> ContainerResult<ContainerStats> {
        self.get_stats(container_id).await
    }

    async fn exec_output(
        &self,
        container_id: &str,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> ContainerResult<String> {
        self.exec_output(container_id, command, env).await
    }
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn is_missing_image(stderr_lower: &str) -> bool {
    stderr_lower.contains("no such image")
        || stderr_lower.contains("unable to find image")
        || stderr_lower.contains("manifest unknown")
        || stderr_lower.contains("pull access denied")
        || stderr_lower.contains("image not known")
}

/// Map a failed runtime invocation onto a typed error.
fn classify_failure(command: &str, args: &[String], stderr: String) -> ContainerError {
    let lower = stderr.to_lowercase();

    if lower.contains("no such container") || lower.contains("no container with name or id") {
        let target = args.last().cloned().unwrap_or_default();
        return ContainerError::ContainerNotFound(target);
    }

    if command == "create" && is_missing_image(&lower) {
        return ContainerError::ImageNotFound(stderr);
    }

    ContainerError::CommandFailed {
        command: command.to_string(),
        message: stderr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_container_runtime_health_check() {
        let runtime = ContainerRuntime::new();
        // Only meaningful when docker or podman is installed.
        if let Ok(version) = runtime.health_check().await {
            assert!(!version.is_empty());
        }
    }

    #[test]
    fn test_runtime_type_parse() {
        assert_eq!("Docker".parse::<RuntimeType>(), Ok(RuntimeType::Docker));
        assert_eq!("podman".parse::<RuntimeType>(), Ok(RuntimeType::Podman));
        assert!("lxc".parse::<RuntimeType>().is_err());
        assert_eq!(RuntimeType::Podman.to_string(), "podman");
    }

    #[test]
    fn test_validate_container_id_or_name() {
        assert!(validate_container_id_or_name("3f2a9c1b0d4e").is_ok());
        assert!(validate_container_id_or_name("vitrine-shop-1").is_ok());
        assert!(validate_container_id_or_name("").is_err());
        assert!(validate_container_id_or_name("--all").is_err());
        assert!(validate_container_id_or_name("a;b").is_err());
    }

    #[test]
    fn test_classify_failure() {
        let not_found = classify_failure(
            "stop",
            &args(["stop", "abc"]),
            "Error response from daemon: No such container: abc".to_string(),
        );
        assert!(matches!(not_found, ContainerError::ContainerNotFound(ref id) if id == "abc"));

        let image = classify_failure(
            "create",
            &args(["create", "--name", "x", "demo/missing:1"]),
            "Unable to find image 'demo/missing:1' locally".to_string(),
        );
        assert!(matches!(image, ContainerError::ImageNotFound(_)));

        let other = classify_failure("start", &args(["start", "abc"]), "boom".to_string());
        assert!(matches!(other, ContainerError::CommandFailed { .. }));
    }
}
