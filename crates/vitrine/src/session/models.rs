//! Session data models.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of a demo session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Registered, nothing provisioned yet.
    Pending,
    /// Container is being created.
    Creating,
    /// Container started, waiting for its port.
    Starting,
    /// Reachable through the proxy.
    Running,
    /// Occupant identity is being changed.
    Switching,
    /// Being torn down.
    Stopping,
    /// Cleaned up. Final.
    Terminated,
    /// Failed; only cleanup remains.
    Error,
}

impl SessionState {
    /// States counted as holding (or about to hold) a container.
    pub const ACTIVE: [SessionState; 6] = [
        SessionState::Pending,
        SessionState::Creating,
        SessionState::Starting,
        SessionState::Running,
        SessionState::Switching,
        SessionState::Stopping,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Creating => "creating",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Switching => "switching",
            SessionState::Stopping => "stopping",
            SessionState::Terminated => "terminated",
            SessionState::Error => "error",
        }
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Pending, Creating)
                | (Pending, Error)
                | (Creating, Starting)
                | (Creating, Error)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Switching)
                | (Switching, Running)
                | (Running, Stopping)
                | (Stopping, Terminated)
                | (Stopping, Error)
                | (Error, Terminated)
        )
    }

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    /// In the middle of an orchestration step.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            SessionState::Pending
                | SessionState::Creating
                | SessionState::Starting
                | SessionState::Switching
                | SessionState::Stopping
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SessionState::Pending),
            "creating" => Ok(SessionState::Creating),
            "starting" => Ok(SessionState::Starting),
            "running" => Ok(SessionState::Running),
            "switching" => Ok(SessionState::Switching),
            "stopping" => Ok(SessionState::Stopping),
            "terminated" => Ok(SessionState::Terminated),
            "error" => Ok(SessionState::Error),
            _ => Err(format!("unknown session state: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// Format a timestamp the way it is stored.
///
/// Fixed-width UTC with microseconds, so string comparison in SQL orders the
/// same as time.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_timestamp() -> String {
    timestamp(Utc::now())
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// A demo session row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DemoSession {
    pub id: String,
    pub project_name: String,
    /// Current occupant.
    pub username: String,
    pub role: String,
    /// Set once at creation time, never replaced.
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub host_port: Option<i64>,
    #[sqlx(try_from = "String")]
    pub state: SessionState,
    /// The project forbids a second live session for the same identity.
    pub exclusive: bool,
    /// Container is paused.
    pub frozen: bool,
    /// Route publish failed and awaits the sweeper.
    pub route_pending: bool,
    pub error_message: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub last_activity_at: String,
    pub last_switch_at: Option<String>,
    pub ended_at: Option<String>,
}

impl DemoSession {
    /// A freshly registered session.
    pub fn pending(
        id: impl Into<String>,
        project_name: impl Into<String>,
        username: impl Into<String>,
        role: impl Into<String>,
        exclusive: bool,
        now: &str,
    ) -> Self {
        Self {
            id: id.into(),
            project_name: project_name.into(),
            username: username.into(),
            role: role.into(),
            container_id: None,
            container_name: None,
            host_port: None,
            state: SessionState::Pending,
            exclusive,
            frozen: false,
            route_pending: false,
            error_message: None,
            created_at: now.to_string(),
            started_at: None,
            last_activity_at: now.to_string(),
            last_switch_at: None,
            ended_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn host_port(&self) -> Option<u16> {
        self.host_port.and_then(|p| u16::try_from(p).ok())
    }

    /// Seconds between start and end, for sessions that did both.
    pub fn duration_seconds(&self) -> Option<f64> {
        let started = parse_timestamp(self.started_at.as_deref()?)?;
        let ended = parse_timestamp(self.ended_at.as_deref()?)?;
        let millis = (ended - started).num_milliseconds();
        (millis >= 0).then(|| millis as f64 / 1000.0)
    }
}

/// One applied state change.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SessionTransition {
    pub id: i64,
    pub session_id: String,
    pub from_state: Option<String>,
    pub to_state: String,
    pub at: String,
    pub note: Option<String>,
}

/// Public view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: String,
    pub project_name: String,
    pub username: String,
    pub role: String,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub frozen: bool,
    pub route_pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    pub last_activity_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_switch_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
}

impl SessionView {
    pub fn from_session(session: DemoSession, url: Option<String>) -> Self {
        let host_port = session.host_port();
        Self {
            id: session.id,
            project_name: session.project_name,
            username: session.username,
            role: session.role,
            state: session.state,
            container_id: session.container_id,
            host_port,
            url,
            frozen: session.frozen,
            route_pending: session.route_pending,
            error_message: session.error_message,
            created_at: session.created_at,
            started_at: session.started_at,
            last_activity_at: session.last_activity_at,
            last_switch_at: session.last_switch_at,
            ended_at: session.ended_at,
        }
    }
}

/// Credentials handed to the visitor for the current occupant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub username: String,
    pub role: String,
    pub secret: String,
}

/// Result of a successful start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedSession {
    pub session_id: String,
    pub host_port: u16,
    pub url: String,
    pub credentials: Credentials,
}

/// Totals across all recorded sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {
    pub total_sessions: i64,
    pub active_sessions: i64,
    pub avg_duration_seconds: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    #[serde(alias = "projectName")]
    pub project: String,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchUserRequest {
    pub username: String,
}
