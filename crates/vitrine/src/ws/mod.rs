//! Real-time session status over WebSocket.

mod handler;
mod hub;
mod types;

pub use handler::ws_handler;
pub use hub::{DEFAULT_CAPACITY, StatusBroadcaster};
pub use types::{StatusEvent, WsCommand, WsEvent};
