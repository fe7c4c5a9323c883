//! Shared fixtures: an in-memory container runtime and a wired coordinator.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tempfile::TempDir;

use vitrine::api::{AppState, create_router};
use vitrine::catalog::{CredentialEntry, Project, StaticCatalog};
use vitrine::container::{
    Container, ContainerConfig, ContainerError, ContainerOrchestrator, ContainerResult,
    ContainerRuntimeApi, ContainerState, ContainerStats, OrchestratorConfig,
};
use vitrine::db::Database;
use vitrine::jobs::{JobQueue, JobWorker};
use vitrine::routing::{NoopReloader, RouteConfig, RouteManager};
use vitrine::session::{DemoSessionConfig, DemoSessionOrchestrator, SessionRepository};
use vitrine::sweeper::{ReconciliationSweeper, SweeperConfig};
use vitrine::ws::StatusBroadcaster;

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub status: String,
    pub port: Option<u16>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ExecCall {
    pub container_id: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

struct FakeState {
    containers: BTreeMap<String, FakeContainer>,
    next_id: u64,
    next_port: u16,
    removed: Vec<String>,
    execs: Vec<ExecCall>,
}

/// Container runtime that keeps everything in memory.
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub withhold_port: AtomicBool,
    pub fail_exec: AtomicBool,
    pub fail_remove: AtomicBool,
    /// Upcoming create calls that fail as if the daemon were unreachable.
    pub create_failures: AtomicUsize,
    pub create_calls: AtomicUsize,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeState {
                containers: BTreeMap::new(),
                next_id: 1,
                next_port: 49152,
                removed: Vec::new(),
                execs: Vec::new(),
            }),
            fail_create: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            withhold_port: AtomicBool::new(false),
            fail_exec: AtomicBool::new(false),
            fail_remove: AtomicBool::new(false),
            create_failures: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
        }
    }
}

impl FakeRuntime {
    pub fn set(flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::SeqCst);
    }

    pub fn fail_next_creates(&self, count: usize) {
        self.create_failures.store(count, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.state.lock().unwrap().containers.values().cloned().collect()
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.state.lock().unwrap().containers.get(id).cloned()
    }

    /// Containers whose name ends with the session id.
    pub fn containers_for(&self, session_id: &str) -> Vec<FakeContainer> {
        self.containers()
            .into_iter()
            .filter(|c| c.name.ends_with(session_id))
            .collect()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn execs(&self) -> Vec<ExecCall> {
        self.state.lock().unwrap().execs.clone()
    }

    /// Plant a running container nobody asked for.
    pub fn plant(&self, name: &str) -> String {
        let mut state = self.state.lock().unwrap();
        let id = format!("planted{:04}", state.next_id);
        state.next_id += 1;
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: name.to_string(),
                status: "running".to_string(),
                port: None,
                env: BTreeMap::new(),
            },
        );
        id
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let flaky = self
            .create_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if flaky {
            return Err(ContainerError::CommandFailed {
                command: "create".to_string(),
                message: "Cannot connect to the Docker daemon at unix:///var/run/docker.sock"
                    .to_string(),
            });
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ContainerError::ImageNotFound(config.image.clone()));
        }
        let mut state = self.state.lock().unwrap();
        let id = format!("fake{:04}", state.next_id);
        state.next_id += 1;
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: config.name.clone().unwrap_or_else(|| id.clone()),
                status: "created".to_string(),
                port: None,
                env: config.env.clone(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "start".to_string(),
                message: "exec format error".to_string(),
            });
        }
        let withhold = self.withhold_port.load(Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let port = state.next_port;
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| ContainerError::ContainerNotFound(container_id.to_string()))?;
        container.status = "running".to_string();
        if !withhold {
            container.port = Some(port);
            state.next_port += 1;
        }
        Ok(())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| ContainerError::ContainerNotFound(container_id.to_string()))?;
        container.status = "exited".to_string();
        container.port = None;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "rm".to_string(),
                message: "device or resource busy".to_string(),
            });
        }
        let mut state = self.state.lock().unwrap();
        if state.containers.remove(container_id).is_none() {
            return Err(ContainerError::ContainerNotFound(container_id.to_string()));
        }
        state.removed.push(container_id.to_string());
        Ok(())
    }

    async fn pause_container(&self, container_id: &str) -> ContainerResult<()> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| ContainerError::ContainerNotFound(container_id.to_string()))?;
        container.status = "paused".to_string();
        Ok(())
    }

    async fn unpause_container(&self, container_id: &str) -> ContainerResult<()> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| ContainerError::ContainerNotFound(container_id.to_string()))?;
        container.status = "running".to_string();
        Ok(())
    }

    async fn list_containers(
        &self,
        all: bool,
        name_filter: Option<&str>,
    ) -> ContainerResult<Vec<Container>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .values()
            .filter(|c| all || c.status == "running")
            .filter(|c| name_filter.is_none_or(|f| c.name.contains(f)))
            .map(|c| Container {
                id: c.id.clone(),
                names: vec![c.name.clone()],
                image: "fake".to_string(),
                state: ContainerState::parse(&c.status),
                status: c.status.clone(),
                created: String::new(),
            })
            .collect())
    }

    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .values()
            .find(|c| c.id == id_or_name || c.name == id_or_name)
            .map(|c| c.status.clone()))
    }

    async fn port_binding(
        &self,
        container_id: &str,
        _container_port: u16,
    ) -> ContainerResult<Option<u16>> {
        let state = self.state.lock().unwrap();
        Ok(state.containers.get(container_id).and_then(|c| c.port))
    }

    async fn get_stats(&self, container_id: &str) -> ContainerResult<ContainerStats> {
        let state = self.state.lock().unwrap();
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| ContainerError::ContainerNotFound(container_id.to_string()))?;
        Ok(ContainerStats {
            container_id: container.id.clone(),
            name: container.name.clone(),
            cpu_percent: "1.50%".to_string(),
            mem_usage: "20MiB / 1GiB".to_string(),
            mem_percent: "1.95%".to_string(),
            net_io: "1kB / 2kB".to_string(),
            block_io: "0B / 0B".to_string(),
            pids: "3".to_string(),
        })
    }

    async fn exec_output(
        &self,
        container_id: &str,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> ContainerResult<String> {
        if self.fail_exec.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: "exec".to_string(),
                message: "permission denied".to_string(),
            });
        }
        let mut state = self.state.lock().unwrap();
        if !state.containers.contains_key(container_id) {
            return Err(ContainerError::ContainerNotFound(container_id.to_string()));
        }
        state.execs.push(ExecCall {
            container_id: container_id.to_string(),
            command: command.to_vec(),
            env: env.clone(),
        });
        Ok("ok\n".to_string())
    }
}

fn credential(username: &str, role: &str) -> CredentialEntry {
    CredentialEntry {
        username: username.to_string(),
        role: role.to_string(),
        secret: format!("{username}-secret"),
    }
}

/// `demo-app` allows one live session per identity, `gallery` any number.
pub fn projects() -> Vec<Project> {
    vec![
        Project {
            name: "demo-app".to_string(),
            image: "ghcr.io/example/demo-app:latest".to_string(),
            container_port: 3000,
            subdomain: "demo-app".to_string(),
            route_path: None,
            shared: false,
            env: BTreeMap::from([("NODE_ENV".to_string(), "demo".to_string())]),
            identity_command: vec!["demo-login".to_string()],
            credentials: vec![
                credential("alice", "admin"),
                credential("bob", "viewer"),
                credential("carol", "editor"),
            ],
        },
        Project {
            name: "gallery".to_string(),
            image: "ghcr.io/example/gallery:latest".to_string(),
            container_port: 8080,
            subdomain: "gallery".to_string(),
            route_path: None,
            shared: true,
            env: BTreeMap::new(),
            identity_command: Vec::new(),
            credentials: vec![credential("guest", "viewer")],
        },
    ]
}

pub struct Harness {
    pub runtime: Arc<FakeRuntime>,
    pub demo: DemoSessionOrchestrator,
    pub sweeper: Arc<ReconciliationSweeper>,
    pub routes: RouteManager,
    pub jobs: JobQueue,
    pub route_file: PathBuf,
    _dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_sweeper(SweeperConfig::default()).await
    }

    pub async fn with_sweeper(sweeper_config: SweeperConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let route_file = dir.path().join("dynamic").join("vitrine.yml");

        let db = Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());

        let runtime = Arc::new(FakeRuntime::default());
        let containers = ContainerOrchestrator::new(
            runtime.clone(),
            OrchestratorConfig {
                start_timeout: Duration::from_millis(300),
                port_poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );

        let (routes, _writer) = RouteManager::spawn(
            RouteConfig {
                document_path: route_file.clone(),
                ..Default::default()
            },
            Arc::new(NoopReloader),
        );

        let catalog = Arc::new(StaticCatalog::new(projects()).unwrap());
        let demo = DemoSessionOrchestrator::new(
            repo,
            containers,
            routes.clone(),
            Arc::new(StatusBroadcaster::default()),
            catalog.clone(),
            catalog,
            DemoSessionConfig {
                retry_delay: Duration::from_millis(10),
            },
        );
        let sweeper = Arc::new(ReconciliationSweeper::new(demo.clone(), sweeper_config));

        let (jobs, rx) = JobQueue::channel(16);
        JobWorker::new(demo.clone(), sweeper.clone()).spawn(rx);

        Self {
            runtime,
            demo,
            sweeper,
            routes,
            jobs,
            route_file,
            _dir: dir,
        }
    }

    pub fn app(&self) -> Router {
        create_router(AppState::new(self.demo.clone(), self.jobs.clone()))
    }

    /// Target of the project route, if published.
    pub async fn route_target(&self, project_name: &str) -> Option<String> {
        let snapshot = self.routes.snapshot().await.unwrap();
        snapshot
            .get(&self.routes.route_name(project_name))
            .cloned()
            .flatten()
    }
}

/// Poll until `check` holds, for up to two seconds.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
