//! WebSocket handler for status subscribers.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use log::{debug, info, warn};
use serde::Serialize;
use std::time::Duration;
use tokio_stream::StreamMap;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::api::AppState;
use crate::session::{DemoError, SessionState};

use super::types::{StatusEvent, WsCommand, WsEvent};

/// Ping interval for keepalive.
const PING_INTERVAL_SECS: u64 = 30;

type Subscriptions = StreamMap<String, BroadcastStream<StatusEvent>>;

/// WebSocket upgrade handler.
///
/// GET /api/ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

async fn send_json<T: Serialize>(sender: &mut SplitSink<WebSocket, Message>, value: &T) -> bool {
    let json = match serde_json::to_string(value) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize WebSocket message: {}", e);
            return true;
        }
    };
    sender.send(Message::Text(json.into())).await.is_ok()
}

async fn handle_ws_connection(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    debug!("WebSocket connection opened");

    if !send_json(&mut sender, &WsEvent::Connected).await {
        return;
    }

    let mut subscriptions: Subscriptions = StreamMap::new();
    let mut ping_interval = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
    ping_interval.tick().await;

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("WebSocket receive error: {}", e);
                        break;
                    }
                };

                let replies = match serde_json::from_str::<WsCommand>(text.as_str()) {
                    Ok(cmd) => handle_command(&state, &mut subscriptions, cmd).await,
                    Err(e) => vec![Reply::Ws(WsEvent::Error {
                        message: format!("invalid command: {}", e),
                        session_id: None,
                    })],
                };
                for reply in replies {
                    let sent = match reply {
                        Reply::Ws(event) => send_json(&mut sender, &event).await,
                        Reply::Status(event) => send_json(&mut sender, &event).await,
                    };
                    if !sent {
                        return;
                    }
                }
            }

            Some((session_id, item)) = subscriptions.next(), if !subscriptions.is_empty() => {
                match item {
                    Ok(event) => {
                        let last = event.is_final();
                        if !send_json(&mut sender, &event).await {
                            break;
                        }
                        if last {
                            subscriptions.remove(&session_id);
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        debug!("Subscriber of {} missed {} events", session_id, missed);
                    }
                }
            }

            _ = ping_interval.tick() => {
                if !send_json(&mut sender, &WsEvent::Ping).await {
                    break;
                }
            }
        }
    }

    debug!(
        "WebSocket connection closed ({} subscriptions dropped)",
        subscriptions.len()
    );
}

enum Reply {
    Ws(WsEvent),
    Status(StatusEvent),
}

async fn handle_command(state: &AppState, subscriptions: &mut Subscriptions, cmd: WsCommand) -> Vec<Reply> {
    match cmd {
        WsCommand::Pong => Vec::new(),

        WsCommand::Join { session_id } => {
            // Subscribe before reading the snapshot so no update falls
            // between the two.
            let rx = (!subscriptions.contains_key(&session_id))
                .then(|| state.broadcaster.subscribe(&session_id));

            let view = match state.demo.get_status(&session_id).await {
                Ok(view) => view,
                Err(e) => {
                    if rx.is_some() {
                        drop(rx);
                        state.broadcaster.release(&session_id);
                    }
                    let message = match e {
                        DemoError::NotFound(_) => "session not found",
                        e => {
                            warn!("Join of session {} failed: {}", session_id, e);
                            "could not load session"
                        }
                    };
                    return vec![Reply::Ws(WsEvent::Error {
                        message: message.to_string(),
                        session_id: Some(session_id),
                    })];
                }
            };

            if let Some(rx) = rx {
                if view.state == SessionState::Terminated {
                    // The channel may have been closed already; nothing
                    // further will be published on it.
                    drop(rx);
                    state.broadcaster.release(&session_id);
                } else {
                    subscriptions.insert(session_id.clone(), BroadcastStream::new(rx));
                    info!("WebSocket client joined session {}", session_id);
                }
            }

            vec![
                Reply::Ws(WsEvent::Joined { session_id }),
                Reply::Status(StatusEvent::from_view(&view)),
            ]
        }

        WsCommand::Leave { session_id } => {
            subscriptions.remove(&session_id);
            vec![Reply::Ws(WsEvent::Left { session_id })]
        }
    }
}
