//! Mockpit: a mock API server driven by declarative environments.
//!
//! An [`Environment`] describes routes, their candidate responses, selection
//! rules, data buckets and callbacks. [`ServerInstance`] serves it over HTTP(S)
//! and publishes a [`ServerEvent`] per completed exchange.

pub mod config;
pub mod data;
pub mod effects;
pub mod environment;
pub mod error;
pub mod metrics;
pub mod routing;
pub mod selection;
pub mod server;
pub mod template;
pub mod transaction;

pub use config::ServerOptions;
pub use environment::Environment;
pub use error::EngineError;
pub use server::{MetricsServer, ServerEvent, ServerInstance};
pub use transaction::Transaction;
