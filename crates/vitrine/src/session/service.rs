//! Demo session coordinator.
//!
//! Drives the container runtime, the route writer and the status channels
//! for each session, holding the session's lock for the whole of every
//! operation. All state changes go through compare-and-set transitions in
//! the registry, so the sweeper and request handlers cannot overwrite each
//! other.

use log::{debug, info, warn};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::{Credential, CredentialStore, Project, ProjectCatalog};
use crate::container::{ContainerOrchestrator, ContainerRef, ContainerResult, ContainerStats};
use crate::routing::RouteManager;
use crate::ws::{StatusBroadcaster, StatusEvent};

use super::error::{DemoError, DemoResult, is_unique_violation};
use super::locks::SessionLocks;
use super::models::{
    AggregateStats, Credentials, DemoSession, SessionState, SessionTransition, SessionView,
    StartedSession, now_timestamp,
};
use super::repository::{SessionRepository, TransitionPatch};

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct DemoSessionConfig {
    /// Pause before the single retry of a transient runtime failure.
    pub retry_delay: Duration,
}

impl Default for DemoSessionConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Outcome of one route reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteReconciliation {
    pub published: usize,
    pub withdrawn: usize,
}

/// Coordinator for demo session lifecycles.
#[derive(Clone)]
pub struct DemoSessionOrchestrator {
    repo: SessionRepository,
    containers: ContainerOrchestrator,
    routes: RouteManager,
    broadcaster: Arc<StatusBroadcaster>,
    catalog: Arc<dyn ProjectCatalog>,
    credentials: Arc<dyn CredentialStore>,
    locks: SessionLocks,
    config: DemoSessionConfig,
}

/// Environment identifying the occupant inside the container.
fn identity_env(session_id: &str, credential: &Credential) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("DEMO_SESSION_ID".to_string(), session_id.to_string()),
        ("DEMO_USERNAME".to_string(), credential.username.clone()),
        ("DEMO_ROLE".to_string(), credential.role.clone()),
        ("DEMO_AUTH_SECRET".to_string(), credential.secret.clone()),
    ])
}

fn container_of(session: &DemoSession) -> Option<ContainerRef> {
    let id = session.container_id.clone()?;
    let name = session.container_name.clone().unwrap_or_else(|| id.clone());
    Some(ContainerRef { id, name })
}

impl DemoSessionOrchestrator {
    pub fn new(
        repo: SessionRepository,
        containers: ContainerOrchestrator,
        routes: RouteManager,
        broadcaster: Arc<StatusBroadcaster>,
        catalog: Arc<dyn ProjectCatalog>,
        credentials: Arc<dyn CredentialStore>,
        config: DemoSessionConfig,
    ) -> Self {
        Self {
            repo,
            containers,
            routes,
            broadcaster,
            catalog,
            credentials,
            locks: SessionLocks::new(),
            config,
        }
    }

    pub fn broadcaster(&self) -> &Arc<StatusBroadcaster> {
        &self.broadcaster
    }

    pub fn repository(&self) -> &SessionRepository {
        &self.repo
    }

    // ------------------------------------------------------------------
    // Coordinator API
    // ------------------------------------------------------------------

    /// Launch a demo of `project_name` for `username`.
    ///
    /// Returns once the container answers on its published port and the
    /// route is in place (or queued for retry).
    pub async fn start_session(
        &self,
        project_name: &str,
        username: &str,
    ) -> DemoResult<StartedSession> {
        let project = self.project(project_name).await?;
        let credential = self.credential(&project, username).await?;

        if project.exclusive()
            && let Some(existing) = self
                .repo
                .find_active_for_identity(&project.name, &credential.username)
                .await?
        {
            return Err(DemoError::Conflict(format!(
                "{} already has an active {} session ({})",
                credential.username, project.name, existing.id
            )));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let _guard = self.locks.acquire(&session_id).await;

        let session = DemoSession::pending(
            &session_id,
            &project.name,
            &credential.username,
            &credential.role,
            project.exclusive(),
            &now_timestamp(),
        );
        if let Err(e) = self.repo.insert(&session).await {
            if is_unique_violation(&e) {
                return Err(DemoError::Conflict(format!(
                    "{} already has an active {} session",
                    credential.username, project.name
                )));
            }
            return Err(DemoError::Storage(e));
        }
        info!(
            "Registered demo session {} ({} as {})",
            session_id, project.name, credential.username
        );
        self.emit_update(&session).await;

        match self.provision(&project, &credential, &session_id).await {
            Ok(host_port) => Ok(StartedSession {
                session_id,
                host_port,
                url: self.routes.public_url(&project),
                credentials: Credentials {
                    username: credential.username,
                    role: credential.role,
                    secret: credential.secret,
                },
            }),
            Err(e) => Err(self.fail_start(&project, &session_id, e).await),
        }
    }

    /// Change the occupant of a running session, keeping its container.
    pub async fn switch_user(&self, session_id: &str, new_username: &str) -> DemoResult<Credentials> {
        let _guard = self.locks.acquire(session_id).await;

        let session = self.load(session_id).await?;
        if session.state != SessionState::Running {
            return Err(DemoError::Conflict(format!(
                "session {} is {}, not running",
                session_id, session.state
            )));
        }
        let project = self.project(&session.project_name).await?;
        let credential = self.credential(&project, new_username).await?;

        if project.exclusive()
            && credential.username != session.username
            && let Some(other) = self
                .repo
                .find_active_for_identity(&project.name, &credential.username)
                .await?
            && other.id != session.id
        {
            return Err(DemoError::Conflict(format!(
                "{} already has an active {} session ({})",
                credential.username, project.name, other.id
            )));
        }

        let note = format!("switching {} -> {}", session.username, credential.username);
        self.advance(
            session_id,
            SessionState::Running,
            SessionState::Switching,
            TransitionPatch::default(),
            Some(&note),
        )
        .await?;
        self.status(
            session_id,
            "switching",
            format!("Signing in as {}", credential.username),
            session.container_id.clone(),
            None,
        );

        let mut unfrozen = false;
        let outcome: DemoResult<()> = async {
            let container = container_of(&session);
            if session.frozen
                && let Some(ref container) = container
            {
                self.containers.unfreeze(container).await?;
                unfrozen = true;
            }
            if !project.identity_command.is_empty() {
                let container = container.ok_or_else(|| {
                    DemoError::Infrastructure(format!("session {} has no container", session_id))
                })?;
                let output = self
                    .containers
                    .exec_identity(
                        &container,
                        &project.identity_command,
                        &identity_env(session_id, &credential),
                    )
                    .await?;
                debug!("Identity command for {}: {}", session_id, output.trim());
            }
            Ok(())
        }
        .await;
        let frozen = unfrozen.then_some(false);

        if let Err(e) = outcome {
            warn!("Switch of session {} failed: {}", session_id, e);
            self.revert_switch(session_id, frozen, &e.to_string()).await;
            return Err(e);
        }

        let now = now_timestamp();
        let patch = TransitionPatch {
            username: Some(credential.username.clone()),
            role: Some(credential.role.clone()),
            last_switch_at: Some(now.clone()),
            touch: Some(now),
            frozen,
            ..Default::default()
        };
        let done = format!("now {}", credential.username);
        match self
            .try_advance(
                session_id,
                SessionState::Switching,
                SessionState::Running,
                patch,
                Some(&done),
            )
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(DemoError::Conflict(format!(
                    "session {} changed during switch",
                    session_id
                )));
            }
            Err(DemoError::Storage(e)) if is_unique_violation(&e) => {
                let message = format!("{} took another session meanwhile", credential.username);
                self.revert_switch(session_id, frozen, &message).await;
                return Err(DemoError::Conflict(message));
            }
            Err(e) => {
                self.revert_switch(session_id, frozen, &e.to_string()).await;
                return Err(e);
            }
        }

        info!(
            "Session {} switched from {} to {}",
            session_id, session.username, credential.username
        );
        self.status(
            session_id,
            "running",
            format!("Signed in as {}", credential.username),
            session.container_id,
            None,
        );

        Ok(Credentials {
            username: credential.username,
            role: credential.role,
            secret: credential.secret,
        })
    }

    /// Stop a session and release everything it holds.
    ///
    /// Returns `false` when the session was already terminated.
    pub async fn terminate_session(&self, session_id: &str) -> DemoResult<bool> {
        let _guard = self.locks.acquire(session_id).await;
        self.terminate_locked(session_id, None).await
    }

    pub async fn get_status(&self, session_id: &str) -> DemoResult<SessionView> {
        let session = self.load(session_id).await?;
        Ok(self.view(session).await)
    }

    pub async fn list_active_sessions(&self) -> DemoResult<Vec<SessionView>> {
        let sessions = self.repo.list_active().await?;
        let mut views = Vec::with_capacity(sessions.len());
        for session in sessions {
            views.push(self.view(session).await);
        }
        Ok(views)
    }

    pub async fn aggregate_stats(&self) -> DemoResult<AggregateStats> {
        let (total_sessions, active_sessions, ended) = self.repo.aggregate().await?;
        let durations: Vec<f64> = ended.iter().filter_map(|s| s.duration_seconds()).collect();
        let avg_duration_seconds = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        };
        Ok(AggregateStats {
            total_sessions,
            active_sessions,
            avg_duration_seconds,
        })
    }

    // ------------------------------------------------------------------
    // Visitor activity and freezing
    // ------------------------------------------------------------------

    /// Record visitor activity; wakes a frozen session.
    pub async fn touch_activity(&self, session_id: &str) -> DemoResult<()> {
        let touched = self.repo.touch(session_id, &now_timestamp()).await?;
        let session = self.load(session_id).await?;
        if !touched && !session.is_active() {
            return Err(DemoError::Conflict(format!(
                "session {} is {}",
                session_id, session.state
            )));
        }
        if session.frozen && session.state == SessionState::Running {
            self.unfreeze_session(session_id).await?;
        }
        Ok(())
    }

    pub async fn freeze_session(&self, session_id: &str) -> DemoResult<SessionView> {
        let _guard = self.locks.acquire(session_id).await;
        self.set_frozen_locked(session_id, true).await
    }

    pub async fn unfreeze_session(&self, session_id: &str) -> DemoResult<SessionView> {
        let _guard = self.locks.acquire(session_id).await;
        self.set_frozen_locked(session_id, false).await
    }

    async fn set_frozen_locked(&self, session_id: &str, frozen: bool) -> DemoResult<SessionView> {
        let session = self.load(session_id).await?;
        if session.state != SessionState::Running {
            return Err(DemoError::Conflict(format!(
                "session {} is {}, not running",
                session_id, session.state
            )));
        }
        if session.frozen == frozen {
            return Ok(self.view(session).await);
        }

        let container = container_of(&session).ok_or_else(|| {
            DemoError::Infrastructure(format!("session {} has no container", session_id))
        })?;
        if frozen {
            self.containers.freeze(&container).await?;
        } else {
            self.containers.unfreeze(&container).await?;
        }
        self.repo.set_frozen(session_id, frozen).await?;

        let (status, message) = if frozen {
            ("frozen", "Demo paused")
        } else {
            ("running", "Demo resumed")
        };
        self.status(session_id, status, message, Some(container.id), None);

        let session = self.load(session_id).await?;
        self.emit_update(&session).await;
        Ok(self.view(session).await)
    }

    /// Resource usage of the container behind a live session.
    pub async fn session_stats(&self, session_id: &str) -> DemoResult<ContainerStats> {
        let session = self.load(session_id).await?;
        if !session.is_active() {
            return Err(DemoError::Conflict(format!(
                "session {} is {}",
                session_id, session.state
            )));
        }
        let container = container_of(&session).ok_or_else(|| {
            DemoError::Conflict(format!("session {} has no container yet", session_id))
        })?;
        Ok(self.containers.stats(&container).await?)
    }

    pub async fn session_history(&self, session_id: &str) -> DemoResult<Vec<SessionTransition>> {
        self.load(session_id).await?;
        Ok(self.repo.history(session_id).await?)
    }

    // ------------------------------------------------------------------
    // Reconciliation primitives
    // ------------------------------------------------------------------

    /// Unfinished sessions with no activity since `cutoff`.
    pub async fn idle_candidates(&self, cutoff: &str) -> DemoResult<Vec<DemoSession>> {
        Ok(self.repo.list_idle(cutoff).await?)
    }

    pub async fn freeze_candidates(&self, cutoff: &str) -> DemoResult<Vec<DemoSession>> {
        Ok(self.repo.list_freeze_candidates(cutoff).await?)
    }

    /// Terminate a session if it is still idle since before `cutoff`.
    ///
    /// A session busy with another operation is skipped. Activity recorded
    /// after the candidate listing wins over the termination.
    pub async fn terminate_if_idle(&self, session_id: &str, cutoff: &str) -> DemoResult<bool> {
        let Some(_guard) = self.locks.try_acquire(session_id) else {
            debug!("Session {} is busy, skipping idle check", session_id);
            return Ok(false);
        };
        let Some(session) = self.repo.get(session_id).await? else {
            return Ok(false);
        };
        if session.state == SessionState::Terminated || session.last_activity_at.as_str() >= cutoff
        {
            return Ok(false);
        }

        info!(
            "Terminating idle session {} (last activity {})",
            session_id, session.last_activity_at
        );
        self.terminate_locked(session_id, Some(cutoff.to_string()))
            .await
    }

    /// Sessions caught in the middle of an orchestration step.
    pub async fn interrupted_sessions(&self) -> DemoResult<Vec<DemoSession>> {
        let active = self.repo.list_active().await?;
        Ok(active
            .into_iter()
            .filter(|session| session.state.is_transient())
            .collect())
    }

    /// Fail and clean up a session a previous process left mid-operation.
    ///
    /// Idleness is not checked, so this must only run before the process
    /// accepts work of its own.
    pub async fn recover_interrupted(&self, session_id: &str) -> DemoResult<bool> {
        let Some(_guard) = self.locks.try_acquire(session_id) else {
            return Ok(false);
        };
        let Some(session) = self.repo.get(session_id).await? else {
            return Ok(false);
        };
        if !session.state.is_transient() {
            return Ok(false);
        }

        warn!(
            "Recovering session {} left in state {}",
            session_id, session.state
        );
        self.terminate_locked(session_id, None).await
    }

    /// Freeze a running session if it is still idle since before `cutoff`.
    pub async fn freeze_if_idle(&self, session_id: &str, cutoff: &str) -> DemoResult<bool> {
        let Some(_guard) = self.locks.try_acquire(session_id) else {
            return Ok(false);
        };
        let Some(session) = self.repo.get(session_id).await? else {
            return Ok(false);
        };
        if session.state != SessionState::Running
            || session.frozen
            || session.last_activity_at.as_str() >= cutoff
        {
            return Ok(false);
        }

        info!("Freezing idle session {}", session_id);
        self.set_frozen_locked(session_id, true).await?;
        Ok(true)
    }

    /// Make the routing document match the set of RUNNING sessions.
    ///
    /// Each project routes to its most recently started RUNNING session;
    /// managed routes of projects with nothing running are withdrawn.
    pub async fn reconcile_routes(&self) -> DemoResult<RouteReconciliation> {
        let mut outcome = RouteReconciliation::default();
        // Snapshot first: routes published after it are never withdrawn here.
        let snapshot = self.routes.snapshot().await?;

        let running = self.repo.list_by_state(SessionState::Running).await?;
        let starting = self.repo.list_by_state(SessionState::Starting).await?;

        let mut latest: BTreeMap<String, DemoSession> = BTreeMap::new();
        for session in &running {
            let newer = latest
                .get(&session.project_name)
                .is_none_or(|current| session.started_at > current.started_at);
            if newer {
                latest.insert(session.project_name.clone(), session.clone());
            }
        }

        let mut keep: HashSet<String> = starting
            .iter()
            .map(|s| self.routes.route_name(&s.project_name))
            .collect();
        let mut routed_projects = HashSet::new();

        for (project_name, session) in &latest {
            keep.insert(self.routes.route_name(project_name));
            let Some(project) = self.catalog.project(project_name).await? else {
                warn!("Running session {} belongs to unknown project {}", session.id, project_name);
                continue;
            };
            let Some(port) = session.host_port() else {
                continue;
            };

            let entry = self.routes.entry_for(&project, port);
            let current = snapshot.get(&entry.name).cloned().flatten();
            if current.as_deref() != Some(entry.target.as_str()) {
                if let Err(e) = self.routes.publish(&project, port).await {
                    warn!("Route repair for {} failed: {:#}", project_name, e);
                    continue;
                }
                outcome.published += 1;

                // The session may have stopped while we were publishing.
                if let Some(fresh) = self.repo.get(&session.id).await?
                    && fresh.state != SessionState::Running
                    && let Err(e) = self.sync_project_route(&project).await
                {
                    warn!("Route resync for {} failed: {:#}", project_name, e);
                }
            }
            routed_projects.insert(project_name.clone());
        }

        for session in running.iter().filter(|s| s.route_pending) {
            if routed_projects.contains(&session.project_name) {
                self.repo.set_route_pending(&session.id, false).await?;
            }
        }

        for name in snapshot.keys() {
            if keep.contains(name) {
                continue;
            }
            match self.routes.unpublish_route(name.clone()).await {
                Ok(true) => outcome.withdrawn += 1,
                Ok(false) => {}
                Err(e) => warn!("Withdrawing stale route {} failed: {:#}", name, e),
            }
        }

        Ok(outcome)
    }

    /// Remove managed containers that no live session owns.
    pub async fn cleanup_orphan_containers(&self) -> DemoResult<usize> {
        // Containers are listed before sessions are read.
        let candidates = self.containers.list_managed().await?;
        let live = self.repo.live_session_ids().await?;
        let removed = self.containers.cleanup_orphans(&candidates, &live).await;
        Ok(removed.len())
    }

    /// Delete finished sessions that ended before `cutoff`.
    pub async fn purge_expired(&self, cutoff: &str) -> DemoResult<u64> {
        let purged = self.repo.purge_ended_before(cutoff).await?;
        if purged > 0 {
            info!("Purged {} expired demo sessions", purged);
        }
        Ok(purged)
    }

    /// Terminate every active session. Used on shutdown.
    pub async fn terminate_all_active(&self) -> DemoResult<usize> {
        let sessions = self.repo.list_active().await?;
        let mut terminated = 0;
        for session in sessions {
            match self.terminate_session(&session.id).await {
                Ok(true) => terminated += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to terminate session {}: {}", session.id, e),
            }
        }
        Ok(terminated)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn project(&self, name: &str) -> DemoResult<Project> {
        self.catalog
            .project(name)
            .await?
            .ok_or_else(|| DemoError::NotFound(format!("project {}", name)))
    }

    async fn credential(&self, project: &Project, username: &str) -> DemoResult<Credential> {
        self.credentials
            .credential(&project.name, username)
            .await?
            .ok_or_else(|| {
                DemoError::NotFound(format!(
                    "credential for {} in project {}",
                    username, project.name
                ))
            })
    }

    async fn load(&self, session_id: &str) -> DemoResult<DemoSession> {
        self.repo
            .get(session_id)
            .await?
            .ok_or_else(|| DemoError::NotFound(format!("session {}", session_id)))
    }

    async fn public_url(&self, project_name: &str) -> Option<String> {
        match self.catalog.project(project_name).await {
            Ok(Some(project)) => Some(self.routes.public_url(&project)),
            _ => None,
        }
    }

    async fn view(&self, session: DemoSession) -> SessionView {
        let url = self.public_url(&session.project_name).await;
        SessionView::from_session(session, url)
    }

    async fn emit_update(&self, session: &DemoSession) {
        let url = self.public_url(&session.project_name).await;
        self.broadcaster
            .publish(&session.id, StatusEvent::session_update(session, url));
    }

    fn status(
        &self,
        session_id: &str,
        status: &str,
        message: impl Into<String>,
        container_id: Option<String>,
        error: Option<String>,
    ) {
        self.broadcaster.publish(
            session_id,
            StatusEvent::container_status(session_id, status, message, container_id, error),
        );
    }

    /// Apply a transition; `None` when the session moved on in the meantime.
    async fn try_advance(
        &self,
        session_id: &str,
        from: SessionState,
        to: SessionState,
        patch: TransitionPatch,
        note: Option<&str>,
    ) -> DemoResult<Option<DemoSession>> {
        if !self.repo.transition(session_id, from, to, &patch, note).await? {
            return Ok(None);
        }
        debug!("Session {}: {} -> {}", session_id, from, to);
        let session = self.load(session_id).await?;
        self.emit_update(&session).await;
        Ok(Some(session))
    }

    async fn advance(
        &self,
        session_id: &str,
        from: SessionState,
        to: SessionState,
        patch: TransitionPatch,
        note: Option<&str>,
    ) -> DemoResult<DemoSession> {
        self.try_advance(session_id, from, to, patch, note)
            .await?
            .ok_or_else(|| {
                DemoError::Conflict(format!("session {} is no longer {}", session_id, from))
            })
    }

    /// Run a runtime call, retrying once if the failure looks transient.
    async fn retry_once<T, F, Fut>(&self, what: &str, session_id: &str, mut call: F) -> ContainerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ContainerResult<T>>,
    {
        match call().await {
            Err(e) if e.is_transient() => {
                warn!(
                    "Transient failure during {} for session {}, retrying: {}",
                    what, session_id, e
                );
                tokio::time::sleep(self.config.retry_delay).await;
                call().await
            }
            other => other,
        }
    }

    /// PENDING through RUNNING. Returns the published host port.
    async fn provision(
        &self,
        project: &Project,
        credential: &Credential,
        session_id: &str,
    ) -> DemoResult<u16> {
        self.advance(
            session_id,
            SessionState::Pending,
            SessionState::Creating,
            TransitionPatch::default(),
            None,
        )
        .await?;
        self.status(session_id, "creating", "Creating container", None, None);

        let env = identity_env(session_id, credential);
        let container = self
            .retry_once("create", session_id, || {
                self.containers.create(project, session_id, &env)
            })
            .await?;
        self.repo
            .bind_container(session_id, &container.id, &container.name)
            .await?;

        self.retry_once("start", session_id, || self.containers.launch(&container))
            .await?;
        self.advance(
            session_id,
            SessionState::Creating,
            SessionState::Starting,
            TransitionPatch {
                container_id: Some(container.id.clone()),
                container_name: Some(container.name.clone()),
                ..Default::default()
            },
            None,
        )
        .await?;
        self.status(
            session_id,
            "starting",
            "Waiting for the application",
            Some(container.id.clone()),
            None,
        );

        let host_port = self
            .containers
            .resolve_port(&container, project.container_port)
            .await?;

        if let Err(e) = self.routes.publish(project, host_port).await {
            warn!(
                "Publishing route for session {} failed, will retry: {:#}",
                session_id, e
            );
            self.repo.set_route_pending(session_id, true).await?;
        }

        let now = now_timestamp();
        self.advance(
            session_id,
            SessionState::Starting,
            SessionState::Running,
            TransitionPatch {
                host_port: Some(host_port),
                started_at: Some(now.clone()),
                touch: Some(now),
                ..Default::default()
            },
            Some(&format!("port {}", host_port)),
        )
        .await?;
        info!(
            "Demo session {} running on port {} ({})",
            session_id, host_port, container.name
        );
        self.status(
            session_id,
            "running",
            "Demo ready",
            Some(container.id),
            None,
        );

        Ok(host_port)
    }

    /// Record a failed start and clean up behind it.
    async fn fail_start(&self, project: &Project, session_id: &str, err: DemoError) -> DemoError {
        let message = err.to_string();
        warn!("Demo session {} failed to start: {}", session_id, message);

        match self.repo.get(session_id).await {
            Ok(Some(session)) => {
                if session.state.can_transition_to(SessionState::Error) {
                    let patch = TransitionPatch {
                        error_message: Some(message.clone()),
                        ended_at: Some(now_timestamp()),
                        ..Default::default()
                    };
                    if let Err(e) = self
                        .try_advance(session_id, session.state, SessionState::Error, patch, Some(&message))
                        .await
                    {
                        warn!("Could not mark session {} as failed: {}", session_id, e);
                    }
                }
                self.status(
                    session_id,
                    "error",
                    "Demo failed to start",
                    session.container_id.clone(),
                    Some(message.clone()),
                );

                if let Some(container) = container_of(&session) {
                    let containers = self.containers.clone();
                    tokio::spawn(async move {
                        if let Err(e) = containers.teardown(&container).await {
                            warn!(
                                "Cleanup of failed container {} left it behind: {}",
                                container.name, e
                            );
                        }
                    });
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Could not load failed session {}: {:#}", session_id, e),
        }

        if let Err(e) = self.sync_project_route(project).await {
            warn!("Route resync for {} failed: {:#}", project.name, e);
        }

        DemoError::StartFailed {
            session_id: session_id.to_string(),
            message,
        }
    }

    /// Move a switching session back to RUNNING under its old identity.
    async fn revert_switch(&self, session_id: &str, frozen: Option<bool>, message: &str) {
        let patch = TransitionPatch {
            frozen,
            error_message: Some(message.to_string()),
            ..Default::default()
        };
        let note = format!("switch failed: {}", message);
        if let Err(e) = self
            .try_advance(
                session_id,
                SessionState::Switching,
                SessionState::Running,
                patch,
                Some(&note),
            )
            .await
        {
            warn!("Could not restore session {} after failed switch: {}", session_id, e);
        }
        self.status(
            session_id,
            "running",
            "Switch failed, previous user kept",
            None,
            Some(message.to_string()),
        );
    }

    /// Point the project route at its newest RUNNING session, or withdraw it.
    async fn sync_project_route(&self, project: &Project) -> anyhow::Result<()> {
        let running = self.repo.list_running_for_project(&project.name).await?;
        match running.iter().find_map(|s| s.host_port()) {
            Some(port) => {
                self.routes.publish(project, port).await?;
            }
            None => {
                self.routes.unpublish(&project.name).await?;
            }
        }
        Ok(())
    }

    /// Termination under the session lock.
    ///
    /// With `idle_before`, the first transition only applies if the session
    /// has seen no activity since then.
    async fn terminate_locked(&self, session_id: &str, idle_before: Option<String>) -> DemoResult<bool> {
        let mut session = self.load(session_id).await?;
        let mut idle_before = idle_before;

        loop {
            let guard = idle_before.take();
            let next = match session.state {
                SessionState::Terminated => return Ok(false),
                SessionState::Running => return self.stop_running(session, guard).await,
                SessionState::Error => return self.cleanup_failed(session, guard).await,
                SessionState::Switching => {
                    self.try_advance(
                        session_id,
                        SessionState::Switching,
                        SessionState::Running,
                        TransitionPatch {
                            idle_before: guard,
                            ..Default::default()
                        },
                        Some("interrupted switch"),
                    )
                    .await?
                }
                state => {
                    let message = format!("interrupted while {}", state);
                    self.try_advance(
                        session_id,
                        state,
                        SessionState::Error,
                        TransitionPatch {
                            error_message: Some(message.clone()),
                            ended_at: Some(now_timestamp()),
                            idle_before: guard,
                            ..Default::default()
                        },
                        Some(&message),
                    )
                    .await?
                }
            };
            match next {
                Some(next) => session = next,
                None => return Ok(false),
            }
        }
    }

    async fn stop_running(&self, session: DemoSession, idle_before: Option<String>) -> DemoResult<bool> {
        let session_id = session.id.as_str();
        let Some(session) = self
            .try_advance(
                session_id,
                SessionState::Running,
                SessionState::Stopping,
                TransitionPatch {
                    idle_before,
                    ..Default::default()
                },
                None,
            )
            .await?
        else {
            return Ok(false);
        };
        self.status(
            session_id,
            "stopping",
            "Stopping demo",
            session.container_id.clone(),
            None,
        );

        match self.catalog.project(&session.project_name).await {
            Ok(Some(project)) => {
                if let Err(e) = self.sync_project_route(&project).await {
                    warn!("Route withdrawal for {} failed: {:#}", project.name, e);
                }
            }
            _ => {
                if let Err(e) = self.routes.unpublish(&session.project_name).await {
                    warn!(
                        "Route withdrawal for {} failed: {:#}",
                        session.project_name, e
                    );
                }
            }
        }

        match self.release_container(&session).await {
            Ok(()) => {
                self.advance(
                    session_id,
                    SessionState::Stopping,
                    SessionState::Terminated,
                    TransitionPatch {
                        ended_at: Some(now_timestamp()),
                        frozen: Some(false),
                        ..Default::default()
                    },
                    None,
                )
                .await?;
                info!("Terminated demo session {}", session_id);
                self.status(
                    session_id,
                    "terminated",
                    "Demo ended",
                    session.container_id.clone(),
                    None,
                );
                self.broadcaster.close(session_id);
                Ok(true)
            }
            Err(e) => {
                let message = e.to_string();
                warn!("Cleanup of session {} failed: {}", session_id, message);
                self.try_advance(
                    session_id,
                    SessionState::Stopping,
                    SessionState::Error,
                    TransitionPatch {
                        error_message: Some(message.clone()),
                        ended_at: Some(now_timestamp()),
                        ..Default::default()
                    },
                    Some(&message),
                )
                .await?;
                self.status(
                    session_id,
                    "error",
                    "Demo cleanup failed",
                    session.container_id.clone(),
                    Some(message),
                );
                Err(e)
            }
        }
    }

    /// ERROR -> TERMINATED once the container is gone.
    async fn cleanup_failed(&self, session: DemoSession, idle_before: Option<String>) -> DemoResult<bool> {
        let session_id = session.id.as_str();
        self.release_container(&session).await?;

        let patch = TransitionPatch {
            ended_at: session.ended_at.is_none().then(now_timestamp),
            frozen: Some(false),
            idle_before,
            ..Default::default()
        };
        let Some(_) = self
            .try_advance(
                session_id,
                SessionState::Error,
                SessionState::Terminated,
                patch,
                Some("cleaned up"),
            )
            .await?
        else {
            return Ok(false);
        };
        info!("Cleaned up failed demo session {}", session_id);
        self.broadcaster.close(session_id);
        Ok(true)
    }

    async fn release_container(&self, session: &DemoSession) -> DemoResult<()> {
        let Some(container) = container_of(session) else {
            return Ok(());
        };
        if session.frozen
            && let Err(e) = self.containers.unfreeze(&container).await
        {
            debug!("Unfreeze of {} before stop failed: {}", container.name, e);
        }
        self.containers.teardown(&container).await?;
        Ok(())
    }
}
