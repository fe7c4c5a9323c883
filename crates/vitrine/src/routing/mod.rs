//! Reverse-proxy route synchronization.
//!
//! All writes to the routing document go through one writer task, so
//! concurrent publishes and withdrawals never interleave on disk.

mod document;
mod reload;

pub use document::{RouteEntry, RoutingDocument};
pub use reload::{CommandReloader, NoopReloader, ProxyReloader};

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::catalog::Project;

/// Routing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Dynamic configuration file watched by the proxy.
    pub document_path: PathBuf,
    /// Prefix of router and service names owned by this process.
    pub router_prefix: String,
    /// Demos are served at `<subdomain>.<base_domain>`.
    pub base_domain: String,
    pub entry_points: Vec<String>,
    pub cert_resolver: Option<String>,
    /// Host the proxy uses to reach published container ports.
    pub upstream_host: String,
    /// Scheme of the public URL handed to visitors.
    pub scheme: String,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            document_path: PathBuf::from("dynamic/vitrine.yml"),
            router_prefix: "vitrine-".to_string(),
            base_domain: "demo.localhost".to_string(),
            entry_points: vec!["web".to_string()],
            cert_resolver: None,
            upstream_host: "127.0.0.1".to_string(),
            scheme: "http".to_string(),
        }
    }
}

enum RouteCommand {
    Publish {
        entry: RouteEntry,
        reply: oneshot::Sender<Result<bool>>,
    },
    Unpublish {
        name: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<BTreeMap<String, Option<String>>>>,
    },
}

/// Handle to the route writer task.
#[derive(Clone)]
pub struct RouteManager {
    tx: mpsc::Sender<RouteCommand>,
    config: Arc<RouteConfig>,
}

impl RouteManager {
    /// Start the writer task. It stops once every handle is dropped.
    pub fn spawn(config: RouteConfig, reloader: Arc<dyn ProxyReloader>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let config = Arc::new(config);
        let writer = RouteWriter {
            config: config.clone(),
            reloader,
        };
        let handle = tokio::spawn(writer.run(rx));
        (Self { tx, config }, handle)
    }

    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    /// Router name for a project.
    pub fn route_name(&self, project_name: &str) -> String {
        format!("{}{}", self.config.router_prefix, project_name)
    }

    pub fn host_for(&self, project: &Project) -> String {
        format!("{}.{}", project.subdomain, self.config.base_domain)
    }

    /// Public URL visitors open for a project.
    pub fn public_url(&self, project: &Project) -> String {
        format!(
            "{}://{}{}",
            self.config.scheme,
            self.host_for(project),
            project.route_path.as_deref().unwrap_or("")
        )
    }

    /// Route entry pointing a project at a published host port.
    pub fn entry_for(&self, project: &Project, host_port: u16) -> RouteEntry {
        RouteEntry {
            name: self.route_name(&project.name),
            host: self.host_for(project),
            path_prefix: project.route_path.clone(),
            target: format!("http://{}:{}", self.config.upstream_host, host_port),
            entry_points: self.config.entry_points.clone(),
            cert_resolver: self.config.cert_resolver.clone(),
        }
    }

    /// Publish (or repoint) the route of a project.
    pub async fn publish(&self, project: &Project, host_port: u16) -> Result<bool> {
        let entry = self.entry_for(project, host_port);
        let (reply, rx) = oneshot::channel();
        self.send(RouteCommand::Publish { entry, reply }).await?;
        rx.await.context("route writer dropped request")?
    }

    /// Withdraw the route of a project.
    pub async fn unpublish(&self, project_name: &str) -> Result<bool> {
        self.unpublish_route(self.route_name(project_name)).await
    }

    /// Withdraw a route by its router name.
    pub async fn unpublish_route(&self, name: String) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(RouteCommand::Unpublish { name, reply }).await?;
        rx.await.context("route writer dropped request")?
    }

    /// Managed routes currently in the document, with their targets.
    pub async fn snapshot(&self) -> Result<BTreeMap<String, Option<String>>> {
        let (reply, rx) = oneshot::channel();
        self.send(RouteCommand::Snapshot { reply }).await?;
        rx.await.context("route writer dropped request")?
    }

    async fn send(&self, command: RouteCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| anyhow!("route writer is not running"))
    }
}

struct RouteWriter {
    config: Arc<RouteConfig>,
    reloader: Arc<dyn ProxyReloader>,
}

impl RouteWriter {
    async fn run(self, mut rx: mpsc::Receiver<RouteCommand>) {
        debug!(
            "Route writer started for {}",
            self.config.document_path.display()
        );
        while let Some(command) = rx.recv().await {
            match command {
                RouteCommand::Publish { entry, reply } => {
                    let upserted = entry.clone();
                    let result = self.apply(move |doc| doc.upsert(&upserted)).await;
                    if matches!(result, Ok(true)) {
                        info!("Published route {} -> {}", entry.name, entry.target);
                    }
                    let _ = reply.send(result);
                }
                RouteCommand::Unpublish { name, reply } => {
                    let removed = name.clone();
                    let result = self.apply(move |doc| Ok(doc.remove(&removed))).await;
                    if matches!(result, Ok(true)) {
                        info!("Withdrew route {}", name);
                    }
                    let _ = reply.send(result);
                }
                RouteCommand::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot().await);
                }
            }
        }
        debug!("Route writer stopped");
    }

    async fn snapshot(&self) -> Result<BTreeMap<String, Option<String>>> {
        let path = self.config.document_path.clone();
        let prefix = self.config.router_prefix.clone();
        tokio::task::spawn_blocking(move || {
            RoutingDocument::load(&path).map(|doc| doc.managed(&prefix))
        })
        .await
        .context("routing document read task failed")?
    }

    /// Load, mutate, and persist the document when it changed.
    ///
    /// File I/O runs on the blocking pool.
    async fn apply<F>(&self, change: F) -> Result<bool>
    where
        F: FnOnce(&mut RoutingDocument) -> Result<bool> + Send + 'static,
    {
        let path = self.config.document_path.clone();
        let changed = tokio::task::spawn_blocking(move || -> Result<bool> {
            let mut doc = RoutingDocument::load(&path)?;
            if !change(&mut doc)? {
                return Ok(false);
            }
            doc.save_atomic(&path)?;
            Ok(true)
        })
        .await
        .context("routing document write task failed")??;

        if changed {
            let reloader = self.reloader.clone();
            tokio::spawn(async move {
                if let Err(e) = reloader.reload().await {
                    warn!("Proxy reload failed: {:#}", e);
                }
            });
        }
        Ok(changed)
    }
}
