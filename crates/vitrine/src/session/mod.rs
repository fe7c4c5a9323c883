//! Demo sessions: registry, coordinator and their types.

mod error;
mod locks;
mod models;
mod repository;
mod service;

pub use error::{DemoError, DemoResult, is_unique_violation};
pub use locks::{SessionGuard, SessionLocks};
pub use models::{
    AggregateStats, Credentials, DemoSession, SessionState, SessionTransition, SessionView,
    StartSessionRequest, StartedSession, SwitchUserRequest, now_timestamp, timestamp,
};
pub use repository::{SessionRepository, TransitionPatch};
pub use service::{DemoSessionConfig, DemoSessionOrchestrator, RouteReconciliation};
