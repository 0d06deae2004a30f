//! Template rendering contract and its Handlebars implementation.

use super::helpers::register_helpers;
use handlebars::Handlebars;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct RenderError {
    pub message: String,
}

impl RenderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<handlebars::RenderError> for RenderError {
    fn from(e: handlebars::RenderError) -> Self {
        RenderError::new(e.to_string())
    }
}

/// Narrow contract between the engine and the templating subsystem.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, context: &Value) -> Result<String, RenderError>;
}

/// Handlebars-backed renderer with the request and data helpers registered.
pub struct HandlebarsRenderer {
    registry: Handlebars<'static>,
}

impl HandlebarsRenderer {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        // Bodies are JSON, XML or plain text, never HTML
        registry.register_escape_fn(handlebars::no_escape);
        register_helpers(&mut registry);
        Self { registry }
    }
}

impl Default for HandlebarsRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer for HandlebarsRenderer {
    fn render(&self, template: &str, context: &Value) -> Result<String, RenderError> {
        Ok(self.registry.render_template(template, context)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_renders_context_values_without_escaping() {
        let renderer = HandlebarsRenderer::new();
        let out = renderer
            .render(
                r#"{"name": "{{request.query.name}}"}"#,
                &json!({"request": {"query": {"name": "<Ada & co>"}}}),
            )
            .unwrap();
        assert_eq!(out, r#"{"name": "<Ada & co>"}"#);
    }

    #[test]
    fn test_syntax_error_is_a_render_error() {
        let renderer = HandlebarsRenderer::new();
        assert!(renderer.render("{{#if}}", &json!({})).is_err());
    }
}
