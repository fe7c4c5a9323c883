//! Application state shared across handlers.

use std::sync::Arc;

use crate::jobs::JobQueue;
use crate::session::DemoSessionOrchestrator;
use crate::ws::StatusBroadcaster;

#[derive(Clone)]
pub struct AppState {
    /// Coordinator for reads and quick operations.
    pub demo: DemoSessionOrchestrator,
    /// Status channels for WebSocket subscribers.
    pub broadcaster: Arc<StatusBroadcaster>,
    /// Queue for long-running orchestration work.
    pub jobs: JobQueue,
    /// Origins allowed by CORS. Empty means any.
    pub allowed_origins: Vec<String>,
}

impl AppState {
    pub fn new(demo: DemoSessionOrchestrator, jobs: JobQueue) -> Self {
        Self {
            broadcaster: demo.broadcaster().clone(),
            demo,
            jobs,
            allowed_origins: Vec::new(),
        }
    }

    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }
}
