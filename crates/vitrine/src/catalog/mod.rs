//! Showcased projects and their demo credentials.
//!
//! The orchestrator only needs two lookups: the project definition for a name
//! and the credential for a `(project, username)` pair. Both are traits so a
//! content backend can serve them; [`StaticCatalog`] answers from the
//! `[[projects]]` tables of the config file.

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A showcased project that can be launched as a demo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Unique project name (also used in container and router names).
    pub name: String,
    /// Pre-built image the demo runs.
    pub image: String,
    /// Port the application listens on inside the container.
    pub container_port: u16,
    /// Subdomain label the demo is exposed under.
    pub subdomain: String,
    /// Optional path prefix in front of the application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_path: Option<String>,
    /// Allow several live sessions for the same identity.
    #[serde(default)]
    pub shared: bool,
    /// Extra environment for every container of this project.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Command run inside the container when the occupant switches identity.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identity_command: Vec<String>,
    /// Demo accounts visitors may launch the project as.
    #[serde(default)]
    pub credentials: Vec<CredentialEntry>,
}

impl Project {
    /// Whether at most one live session per identity is allowed.
    pub fn exclusive(&self) -> bool {
        !self.shared
    }
}

/// A demo account as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub username: String,
    pub role: String,
    pub secret: String,
}

/// A resolved credential for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub project_name: String,
    pub username: String,
    pub role: String,
    pub secret: String,
}

/// Read-only source of project definitions.
#[async_trait]
pub trait ProjectCatalog: Send + Sync {
    async fn project(&self, name: &str) -> Result<Option<Project>>;
    async fn projects(&self) -> Result<Vec<Project>>;
}

/// Read-only source of demo credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn credential(&self, project_name: &str, username: &str) -> Result<Option<Credential>>;
}

/// In-memory catalog built from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    projects: HashMap<String, Project>,
}

impl StaticCatalog {
    /// Build the catalog, rejecting duplicate or malformed entries.
    pub fn new(projects: Vec<Project>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(projects.len());
        for project in projects {
            validate_project(&project)?;
            if by_name.contains_key(&project.name) {
                bail!("duplicate project '{}' in catalog", project.name);
            }
            by_name.insert(project.name.clone(), project);
        }
        Ok(Self { projects: by_name })
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }
}

/// Project names and subdomains end up in container names and host rules.
fn is_label(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-')
}

fn validate_project(project: &Project) -> Result<()> {
    if !is_label(&project.name) {
        bail!(
            "project name '{}' must be lowercase alphanumerics and '-'",
            project.name
        );
    }
    if !is_label(&project.subdomain) {
        bail!(
            "subdomain '{}' of project '{}' is not a valid DNS label",
            project.subdomain,
            project.name
        );
    }
    if project.container_port == 0 {
        bail!("project '{}' must declare a container port", project.name);
    }
    if let Some(ref path) = project.route_path
        && !path.starts_with('/')
    {
        bail!("route path of project '{}' must start with '/'", project.name);
    }

    let mut seen = std::collections::HashSet::new();
    for entry in &project.credentials {
        if entry.username.trim().is_empty() {
            bail!("project '{}' has a credential without username", project.name);
        }
        if !seen.insert(entry.username.as_str()) {
            bail!(
                "project '{}' lists username '{}' twice",
                project.name,
                entry.username
            );
        }
    }
    Ok(())
}

#[async_trait]
impl ProjectCatalog for StaticCatalog {
    async fn project(&self, name: &str) -> Result<Option<Project>> {
        Ok(self.projects.get(name).cloned())
    }

    async fn projects(&self) -> Result<Vec<Project>> {
        let mut all: Vec<Project> = self.projects.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }
}

#[async_trait]
impl CredentialStore for StaticCatalog {
    async fn credential(&self, project_name: &str, username: &str) -> Result<Option<Credential>> {
        let credential = self.projects.get(project_name).and_then(|project| {
            project
                .credentials
                .iter()
                .find(|c| c.username == username)
                .map(|c| Credential {
                    project_name: project.name.clone(),
                    username: c.username.clone(),
                    role: c.role.clone(),
                    secret: c.secret.clone(),
                })
        });
        Ok(credential)
    }
}
