//! Vitrine: ephemeral per-visitor demo containers for portfolio showcases.

pub mod api;
pub mod catalog;
pub mod container;
pub mod db;
pub mod jobs;
pub mod routing;
pub mod session;
pub mod sweeper;
pub mod ws;
