//! Demo container lifecycle on top of a [`ContainerRuntimeApi`].
//!
//! Knows nothing about sessions or routing: it turns a project plus a session
//! id into a named, labelled container, waits for its published port, and
//! cleans up after it.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use super::{
    ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi, ContainerState,
    ContainerStats,
};
use crate::catalog::Project;

/// Label marking containers owned by this service.
pub const LABEL_MANAGED: &str = "vitrine.managed";
/// Label carrying the owning session id.
pub const LABEL_SESSION: &str = "vitrine.session";
/// Label carrying the project name.
pub const LABEL_PROJECT: &str = "vitrine.project";

/// Length of a hyphenated UUID, the suffix of every managed container name.
const SESSION_ID_LEN: usize = 36;

/// Tunables for the container layer.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Prefix of every managed container name.
    pub name_prefix: String,
    /// Host address published ports bind to.
    pub bind_address: Option<String>,
    /// Grace period handed to `stop` before the runtime kills the container.
    pub stop_timeout_seconds: u32,
    /// Upper bound for a container to publish its port after start.
    pub start_timeout: Duration,
    /// Delay between port probes while starting.
    pub port_poll_interval: Duration,
    /// Cap on concurrent `create` calls.
    pub max_concurrent_creates: usize,
    pub memory_limit: Option<String>,
    pub cpu_limit: Option<String>,
    pub network: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            name_prefix: "vitrine-".to_string(),
            bind_address: Some("127.0.0.1".to_string()),
            stop_timeout_seconds: 5,
            start_timeout: Duration::from_secs(60),
            port_poll_interval: Duration::from_millis(250),
            max_concurrent_creates: 4,
            memory_limit: None,
            cpu_limit: None,
            network: None,
        }
    }
}

/// Handle to a container created for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerRef {
    pub id: String,
    pub name: String,
}

/// A container carrying the managed name prefix.
#[derive(Debug, Clone, Serialize)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    /// Session id parsed from the name, when it has the expected shape.
    pub session_id: Option<String>,
    pub state: ContainerState,
}

impl ManagedContainer {
    pub fn handle(&self) -> ContainerRef {
        ContainerRef {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

/// Container lifecycle operations for demo sessions.
#[derive(Clone)]
pub struct ContainerOrchestrator {
    runtime: Arc<dyn ContainerRuntimeApi>,
    config: Arc<OrchestratorConfig>,
    create_permits: Arc<Semaphore>,
}

impl ContainerOrchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>, config: OrchestratorConfig) -> Self {
        let permits = config.max_concurrent_creates.max(1);
        Self {
            runtime,
            config: Arc::new(config),
            create_permits: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Container name for a session: `<prefix><project>-<session_id>`.
    pub fn container_name(&self, project_name: &str, session_id: &str) -> String {
        format!("{}{}-{}", self.config.name_prefix, project_name, session_id)
    }

    /// Session id encoded in a managed container name.
    pub fn session_id_from_name(&self, name: &str) -> Option<String> {
        let rest = name.strip_prefix(&self.config.name_prefix)?;
        if rest.len() <= SESSION_ID_LEN {
            return None;
        }
        let candidate = &rest[rest.len() - SESSION_ID_LEN..];
        uuid::Uuid::parse_str(candidate)
            .ok()
            .map(|_| candidate.to_string())
    }

    /// Provision a stopped container for a session.
    ///
    /// The project port is published on a runtime-chosen host port and the
    /// container is removed by the runtime once stopped.
    pub async fn create(
        &self,
        project: &Project,
        session_id: &str,
        env: &BTreeMap<String, String>,
    ) -> ContainerResult<ContainerRef> {
        let _permit = self
            .create_permits
            .acquire()
            .await
            .map_err(|_| ContainerError::CommandFailed {
                command: "create".to_string(),
                message: "create limiter closed".to_string(),
            })?;

        let name = self.container_name(&project.name, session_id);
        let config = ContainerConfig::new(&project.image)
            .name(&name)
            .auto_remove(true)
            .publish(self.config.bind_address.clone(), project.container_port)
            .envs(project.env.clone())
            .envs(env.clone())
            .label(LABEL_MANAGED, "true")
            .label(LABEL_SESSION, session_id)
            .label(LABEL_PROJECT, &project.name)
            .memory_limit(self.config.memory_limit.clone())
            .cpu_limit(self.config.cpu_limit.clone())
            .network(self.config.network.clone());

        let id = self.runtime.create_container(&config).await?;
        info!("Created container {} ({}) for session {}", name, id, session_id);

        Ok(ContainerRef { id, name })
    }

    /// Issue the runtime start for a created container.
    pub async fn launch(&self, container: &ContainerRef) -> ContainerResult<()> {
        self.runtime.start_container(&container.id).await?;
        debug!("Started container {}", container.name);
        Ok(())
    }

    /// Wait until the runtime reports the published host port.
    ///
    /// Bounded by `start_timeout`; a container that exits while starting fails
    /// immediately.
    pub async fn resolve_port(
        &self,
        container: &ContainerRef,
        container_port: u16,
    ) -> ContainerResult<u16> {
        let probe = async {
            loop {
                match self.runtime.container_state_status(&container.id).await? {
                    None => {
                        return Err(ContainerError::ContainerNotFound(container.name.clone()));
                    }
                    Some(status) if ContainerState::parse(&status).is_finished() => {
                        return Err(ContainerError::CommandFailed {
                            command: "start".to_string(),
                            message: format!(
                                "container {} {} during startup",
                                container.name, status
                            ),
                        });
                    }
                    Some(_) => {}
                }

                if let Some(port) = self
                    .runtime
                    .port_binding(&container.id, container_port)
                    .await?
                {
                    return Ok(port);
                }

                tokio::time::sleep(self.config.port_poll_interval).await;
            }
        };

        match tokio::time::timeout(self.config.start_timeout, probe).await {
            Ok(result) => result,
            Err(_) => Err(ContainerError::Timeout(format!(
                "container {} did not publish port {} within {:?}",
                container.name, container_port, self.config.start_timeout
            ))),
        }
    }

    /// Launch the container and return its host port.
    pub async fn start(&self, container: &ContainerRef, container_port: u16) -> ContainerResult<u16> {
        self.launch(container).await?;
        self.resolve_port(container, container_port).await
    }

    /// Stop a container. A missing container counts as stopped.
    pub async fn stop(&self, container: &ContainerRef) -> ContainerResult<()> {
        match self
            .runtime
            .stop_container(&container.id, Some(self.config.stop_timeout_seconds))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!("Container {} already gone on stop", container.name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Remove a container. A missing container counts as removed.
    pub async fn remove(&self, container: &ContainerRef) -> ContainerResult<()> {
        match self.runtime.remove_container(&container.id, true).await {
            Ok(()) => {
                info!("Removed container {}", container.name);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("Container {} already removed", container.name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stop then force-remove, tolerating a stop failure.
    pub async fn teardown(&self, container: &ContainerRef) -> ContainerResult<()> {
        if let Err(e) = self.stop(container).await {
            debug!(
                "Stop of container {} failed, removing anyway: {}",
                container.name, e
            );
        }
        self.remove(container).await
    }

    pub async fn freeze(&self, container: &ContainerRef) -> ContainerResult<()> {
        self.runtime.pause_container(&container.id).await?;
        info!("Froze container {}", container.name);
        Ok(())
    }

    pub async fn unfreeze(&self, container: &ContainerRef) -> ContainerResult<()> {
        self.runtime.unpause_container(&container.id).await?;
        info!("Unfroze container {}", container.name);
        Ok(())
    }

    /// Current runtime state, `None` when the container is gone.
    pub async fn state(&self, container: &ContainerRef) -> ContainerResult<Option<ContainerState>> {
        Ok(self
            .runtime
            .container_state_status(&container.id)
            .await?
            .map(|s| ContainerState::parse(&s)))
    }

    pub async fn inspect_port(
        &self,
        container: &ContainerRef,
        container_port: u16,
    ) -> ContainerResult<Option<u16>> {
        self.runtime.port_binding(&container.id, container_port).await
    }

    pub async fn stats(&self, container: &ContainerRef) -> ContainerResult<ContainerStats> {
        self.runtime.get_stats(&container.id).await
    }

    /// Run the project's identity command with the occupant's credentials.
    pub async fn exec_identity(
        &self,
        container: &ContainerRef,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> ContainerResult<String> {
        self.runtime.exec_output(&container.id, command, env).await
    }

    /// All containers, running or not, that carry the managed prefix.
    pub async fn list_managed(&self) -> ContainerResult<Vec<ManagedContainer>> {
        let prefix = self.config.name_prefix.as_str();
        let containers = self.runtime.list_containers(true, Some(prefix)).await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let name = c.name_with_prefix(prefix)?.to_string();
                Some(ManagedContainer {
                    session_id: self.session_id_from_name(&name),
                    id: c.id,
                    name,
                    state: c.state,
                })
            })
            .collect())
    }

    /// Remove listed containers whose session is not live.
    ///
    /// `candidates` must be listed before `live_session_ids` is read, so a
    /// container created in between is never judged an orphan.
    pub async fn cleanup_orphans(
        &self,
        candidates: &[ManagedContainer],
        live_session_ids: &HashSet<String>,
    ) -> Vec<ContainerRef> {
        let mut removed = Vec::new();

        for container in candidates {
            let live = container
                .session_id
                .as_ref()
                .is_some_and(|id| live_session_ids.contains(id));
            if live {
                continue;
            }

            info!(
                "Removing orphan container {} ({})",
                container.name, container.id
            );
            let handle = container.handle();
            match self.teardown(&handle).await {
                Ok(()) => removed.push(handle),
                Err(e) => warn!(
                    "Failed to remove orphan container {} ({}): {}",
                    container.name, container.id, e
                ),
            }
        }

        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Container;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedRuntime {
        containers: Mutex<Vec<Container>>,
        port_after_probes: AtomicUsize,
        probes: AtomicUsize,
        removed: Mutex<Vec<String>>,
        status: Mutex<Option<String>>,
    }

    #[async_trait]
    impl ContainerRuntimeApi for ScriptedRuntime {
        async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
            config.validate()?;
            Ok("c0ffee".to_string())
        }

        async fn start_container(&self, _id: &str) -> ContainerResult<()> {
            Ok(())
        }

        async fn stop_container(&self, id: &str, _t: Option<u32>) -> ContainerResult<()> {
            Err(ContainerError::ContainerNotFound(id.to_string()))
        }

        async fn remove_container(&self, id: &str, _force: bool) -> ContainerResult<()> {
            self.removed.lock().unwrap().push(id.to_string());
            Ok(())
        }

        async fn pause_container(&self, _id: &str) -> ContainerResult<()> {
            Ok(())
        }

        async fn unpause_container(&self, _id: &str) -> ContainerResult<()> {
            Ok(())
        }

        async fn list_containers(
            &self,
            _all: bool,
            _filter: Option<&str>,
        ) -> ContainerResult<Vec<Container>> {
            Ok(self.containers.lock().unwrap().clone())
        }

        async fn container_state_status(&self, _id: &str) -> ContainerResult<Option<String>> {
            Ok(self.status.lock().unwrap().clone())
        }

        async fn port_binding(&self, _id: &str, _port: u16) -> ContainerResult<Option<u16>> {
            let n = self.probes.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.port_after_probes.load(Ordering::SeqCst) {
                Ok(Some(49160))
            } else {
                Ok(None)
            }
        }

        async fn get_stats(&self, id: &str) -> ContainerResult<ContainerStats> {
            Err(ContainerError::ContainerNotFound(id.to_string()))
        }

        async fn exec_output(
            &self,
            _id: &str,
            _command: &[String],
            _env: &BTreeMap<String, String>,
        ) -> ContainerResult<String> {
            Ok(String::new())
        }
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            start_timeout: Duration::from_millis(200),
            port_poll_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn container(id: &str, name: &str) -> Container {
        Container {
            id: id.to_string(),
            names: vec![name.to_string()],
            image: "demo".to_string(),
            state: ContainerState::Running,
            status: String::new(),
            created: String::new(),
        }
    }

    #[test]
    fn test_container_name_roundtrips_session_id() {
        let orchestrator =
            ContainerOrchestrator::new(Arc::new(ScriptedRuntime::default()), fast_config());
        let session_id = "5f0c7a1e-9a53-4c3b-8c7e-2f1d2a4b6c8d";
        let name = orchestrator.container_name("shop", session_id);
        assert_eq!(name, format!("vitrine-shop-{}", session_id));
        assert_eq!(
            orchestrator.session_id_from_name(&name).as_deref(),
            Some(session_id)
        );
        assert_eq!(orchestrator.session_id_from_name("vitrine-shop"), None);
        assert_eq!(orchestrator.session_id_from_name("other-x"), None);
    }

    #[tokio::test]
    async fn test_resolve_port_polls_until_published() {
        let runtime = Arc::new(ScriptedRuntime::default());
        *runtime.status.lock().unwrap() = Some("running".to_string());
        runtime.port_after_probes.store(3, Ordering::SeqCst);
        let orchestrator = ContainerOrchestrator::new(runtime.clone(), fast_config());

        let handle = ContainerRef {
            id: "c0ffee".into(),
            name: "vitrine-shop-x".into(),
        };
        let port = orchestrator.resolve_port(&handle, 3000).await.unwrap();
        assert_eq!(port, 49160);
        assert_eq!(runtime.probes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_resolve_port_times_out() {
        let runtime = Arc::new(ScriptedRuntime::default());
        *runtime.status.lock().unwrap() = Some("running".to_string());
        runtime.port_after_probes.store(usize::MAX, Ordering::SeqCst);
        let orchestrator = ContainerOrchestrator::new(runtime, fast_config());

        let handle = ContainerRef {
            id: "c0ffee".into(),
            name: "vitrine-shop-x".into(),
        };
        let err = orchestrator.resolve_port(&handle, 3000).await.unwrap_err();
        assert!(matches!(err, ContainerError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_resolve_port_fails_fast_when_container_exits() {
        let runtime = Arc::new(ScriptedRuntime::default());
        *runtime.status.lock().unwrap() = Some("exited".to_string());
        let orchestrator = ContainerOrchestrator::new(runtime, fast_config());

        let handle = ContainerRef {
            id: "c0ffee".into(),
            name: "vitrine-shop-x".into(),
        };
        let err = orchestrator.resolve_port(&handle, 3000).await.unwrap_err();
        assert!(matches!(err, ContainerError::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn test_stop_tolerates_missing_container() {
        let orchestrator =
            ContainerOrchestrator::new(Arc::new(ScriptedRuntime::default()), fast_config());
        let handle = ContainerRef {
            id: "gone".into(),
            name: "vitrine-shop-gone".into(),
        };
        assert!(orchestrator.stop(&handle).await.is_ok());
    }

    #[tokio::test]
    async fn test_cleanup_orphans_keeps_live_sessions() {
        let live_id = "11111111-1111-4111-8111-111111111111";
        let dead_id = "22222222-2222-4222-8222-222222222222";
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.containers.lock().unwrap().extend([
            container("aaa", &format!("vitrine-shop-{}", live_id)),
            container("bbb", &format!("vitrine-shop-{}", dead_id)),
            container("ccc", "vitrine-malformed"),
            container("ddd", "unrelated"),
        ]);
        let orchestrator = ContainerOrchestrator::new(runtime.clone(), fast_config());

        let listed = orchestrator.list_managed().await.unwrap();
        assert_eq!(listed.len(), 3);

        let live: HashSet<String> = [live_id.to_string()].into_iter().collect();
        let removed = orchestrator.cleanup_orphans(&listed, &live).await;

        let removed_ids: Vec<&str> = removed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(removed_ids, vec!["bbb", "ccc"]);
        assert_eq!(*runtime.removed.lock().unwrap(), vec!["bbb", "ccc"]);
    }
}
