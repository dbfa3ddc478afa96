//! # mess
//!
//! A distributed task-execution server: clients submit command-line tasks
//! with a declarative property set; a fleet of long-lived worker bots
//! long-poll the server for matching work.
//!
//! ## Architecture
//!
//! - **Store**: durable task/bot/event tables behind one trait, two backends
//!   (in-memory snapshot, relational).
//! - **OutputStore**: append-only task stdout/stderr, bounded open handles.
//! - **BotBundle**: content-addressed worker ZIP builder.
//! - **Scheduler**: dimension-based task/bot matching and dispatch.
//! - **BotGateway** / **ClientGateway**: the two HTTP-facing surfaces.
//! - **Lifecycle**: boot, periodic snapshot, signal-driven shutdown.

/// HTTP API server and route assembly.
pub mod api;
/// Allow-list authorization middleware.
pub mod auth;
/// Worker bundle (ZIP) builder and content-hash cache.
pub mod bot_bundle;
/// Bot-facing HTTP surface.
pub mod bot_gateway;
/// Client-facing HTTP surface.
pub mod client_gateway;
/// System configuration.
pub mod config;
/// System-wide constants.
pub mod constants;
/// Error types and handling.
pub mod error;
/// Process boot, periodic snapshot, and shutdown orchestration.
pub mod lifecycle;
/// Core data models.
pub mod models;
/// Append-only per-task output storage.
pub mod output_store;
/// Rate limiting middleware.
pub mod rate_limit;
/// Task/bot matching and dispatch.
pub mod scheduler;
/// Durable storage: Store trait plus memory and relational backends.
pub mod store;
/// Input validation for inbound TaskRequests.
pub mod validation;

#[cfg(test)]
mod scenarios;

pub use error::{MessError, Result};
