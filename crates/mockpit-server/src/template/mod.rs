//! Template rendering bridge.
//!
//! This module provides:
//! - [`RequestContext`]: the parsed request exposed to rules and templates
//! - [`TemplateRenderer`]: the `render(template, context)` contract and its
//!   Handlebars implementation
//! - [`RenderScope`]: per-request context building with lazy data buckets
//! - [`safe_path`]: allow-listed path evaluation used by every dynamic lookup

pub mod context;
pub mod helpers;
pub mod renderer;
pub mod safe_path;
pub mod scope;

pub use context::RequestContext;
pub use helpers::stringify;
pub use renderer::{HandlebarsRenderer, RenderError, TemplateRenderer};
pub use safe_path::SafePathError;
pub use scope::{referenced_buckets, RenderScope};
