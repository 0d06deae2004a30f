//! HTTP serving of an environment.
//!
//! This module provides:
//! - [`ServerInstance`]: bind, accept loop, events and shutdown
//! - [`EngineState`] and [`handle_request`]: the per-request pipeline
//! - [`MetricsServer`]: the Prometheus metrics listener
//! - CORS preflight, TLS acceptor and response helpers

pub mod admin;
pub mod cors;
pub mod events;
pub mod handler;
pub mod instance;
pub mod response;
pub mod tls;

pub use admin::MetricsServer;
pub use events::ServerEvent;
pub use handler::{handle_request, EngineState};
pub use instance::ServerInstance;
