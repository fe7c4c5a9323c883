//! WebSocket message types.

use serde::{Deserialize, Serialize};

use crate::session::{DemoSession, SessionState, SessionView};

/// Status event published for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StatusEvent {
    /// Progress of the container behind a session.
    #[serde(rename_all = "camelCase")]
    ContainerStatus {
        session_id: String,
        /// Short machine-readable phase, e.g. `creating` or `error`.
        status: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        container_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        at: String,
    },

    /// Snapshot of the session record after a change.
    #[serde(rename_all = "camelCase")]
    SessionUpdate {
        session_id: String,
        project_name: String,
        username: String,
        role: String,
        state: SessionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host_port: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        frozen: bool,
        route_pending: bool,
        at: String,
    },
}

impl StatusEvent {
    pub fn session_id(&self) -> &str {
        match self {
            StatusEvent::ContainerStatus { session_id, .. }
            | StatusEvent::SessionUpdate { session_id, .. } => session_id,
        }
    }

    pub fn container_status(
        session_id: &str,
        status: &str,
        message: impl Into<String>,
        container_id: Option<String>,
        error: Option<String>,
    ) -> Self {
        StatusEvent::ContainerStatus {
            session_id: session_id.to_string(),
            status: status.to_string(),
            message: message.into(),
            container_id,
            error,
            at: crate::session::now_timestamp(),
        }
    }

    pub fn session_update(session: &DemoSession, url: Option<String>) -> Self {
        StatusEvent::SessionUpdate {
            session_id: session.id.clone(),
            project_name: session.project_name.clone(),
            username: session.username.clone(),
            role: session.role.clone(),
            state: session.state,
            host_port: session.host_port(),
            url,
            frozen: session.frozen,
            route_pending: session.route_pending,
            at: crate::session::now_timestamp(),
        }
    }

    /// Snapshot sent to a client that just joined.
    pub fn from_view(view: &SessionView) -> Self {
        StatusEvent::SessionUpdate {
            session_id: view.id.clone(),
            project_name: view.project_name.clone(),
            username: view.username.clone(),
            role: view.role.clone(),
            state: view.state,
            host_port: view.host_port,
            url: view.url.clone(),
            frozen: view.frozen,
            route_pending: view.route_pending,
            at: crate::session::now_timestamp(),
        }
    }

    /// Whether nothing further will be published after this event.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            StatusEvent::SessionUpdate {
                state: SessionState::Terminated,
                ..
            }
        )
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WsEvent {
    Connected,
    #[serde(rename_all = "camelCase")]
    Joined { session_id: String },
    #[serde(rename_all = "camelCase")]
    Left { session_id: String },
    Ping,
    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

/// Messages sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WsCommand {
    #[serde(rename_all = "camelCase")]
    Join { session_id: String },
    #[serde(rename_all = "camelCase")]
    Leave { session_id: String },
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_event_wire_format() {
        let event = StatusEvent::container_status("s1", "creating", "Creating", None, None);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "containerStatus");
        assert_eq!(json["sessionId"], "s1");
        assert!(json.get("containerId").is_none());
    }

    #[test]
    fn test_parse_client_commands() {
        let cmd: WsCommand =
            serde_json::from_str(r#"{"type":"join","sessionId":"abc"}"#).unwrap();
        assert!(matches!(cmd, WsCommand::Join { session_id } if session_id == "abc"));

        let cmd: WsCommand = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert!(matches!(cmd, WsCommand::Pong));

        assert!(serde_json::from_str::<WsCommand>(r#"{"type":"shout"}"#).is_err());
    }
}
