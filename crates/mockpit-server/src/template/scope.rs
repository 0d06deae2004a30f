//! Per-request rendering scope.
//!
//! A [`RenderScope`] ties the renderer to one request: it builds the template
//! context (request snapshot, request number, referenced data buckets) and
//! evaluates data buckets lazily the first time a template references them.

use super::context::RequestContext;
use super::renderer::{RenderError, TemplateRenderer};
use crate::data::bucket::{parse_rendered, BucketStore};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::OnceLock;
use tracing::warn;

static BUCKET_REFERENCE: OnceLock<Regex> = OnceLock::new();
static DYNAMIC_BUCKET_REFERENCE: OnceLock<Regex> = OnceLock::new();

fn bucket_reference_regex() -> &'static Regex {
    BUCKET_REFERENCE.get_or_init(|| {
        Regex::new(r#"\b(?:data|dataRaw)\s+['"]([^'"]+)['"]"#)
            .expect("bucket reference pattern is valid")
    })
}

fn dynamic_bucket_reference_regex() -> &'static Regex {
    DYNAMIC_BUCKET_REFERENCE.get_or_init(|| {
        Regex::new(r#"(?:\{\{[#~]?|\()\s*(?:data|dataRaw)\s+[^'"\s}]"#)
            .expect("dynamic bucket reference pattern is valid")
    })
}

/// Whether a `data` helper takes its bucket from an expression rather than a
/// string literal, so the bucket is only known at render time.
pub fn references_buckets_dynamically(template: &str) -> bool {
    dynamic_bucket_reference_regex().is_match(template)
}

/// Bucket ids or names referenced through the `data` helpers.
pub fn referenced_buckets(template: &str) -> BTreeSet<String> {
    bucket_reference_regex()
        .captures_iter(template)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

pub struct RenderScope<'a> {
    renderer: &'a dyn TemplateRenderer,
    buckets: &'a BucketStore,
    request: &'a RequestContext,
    request_json: Value,
    request_number: u64,
}

impl<'a> RenderScope<'a> {
    pub fn new(
        renderer: &'a dyn TemplateRenderer,
        buckets: &'a BucketStore,
        request: &'a RequestContext,
        request_number: u64,
    ) -> Self {
        Self {
            renderer,
            buckets,
            request,
            request_json: request.to_json(),
            request_number,
        }
    }

    pub fn request(&self) -> &RequestContext {
        self.request
    }

    pub fn request_number(&self) -> u64 {
        self.request_number
    }

    pub fn buckets(&self) -> &BucketStore {
        self.buckets
    }

    /// Render a template against this request.
    pub fn render(&self, template: &str) -> Result<String, RenderError> {
        if !template.contains("{{") {
            return Ok(template.to_string());
        }
        let context = self.context_for(template);
        self.renderer.render(template, &context)
    }

    /// Render, falling back to the raw template when rendering fails.
    pub fn render_or_raw(&self, template: &str) -> String {
        self.render(template).unwrap_or_else(|e| {
            warn!("Template rendering failed, using raw value: {}", e);
            template.to_string()
        })
    }

    /// Template context with the buckets `template` references. Every bucket
    /// is loaded when the reference is computed at render time.
    pub fn context_for(&self, template: &str) -> Value {
        let references = if references_buckets_dynamically(template) {
            self.buckets.ids().into_iter().collect()
        } else {
            referenced_buckets(template)
        };
        let mut data = Map::new();
        for reference in references {
            if let Some(value) = self.bucket(&reference) {
                for alias in self.buckets.aliases(&reference) {
                    data.insert(alias, value.clone());
                }
            }
        }
        self.context_with(Value::Object(data))
    }

    fn context_with(&self, data: Value) -> Value {
        json!({
            "request": self.request_json,
            "requestNumber": self.request_number,
            "data": data,
        })
    }

    /// Current value of a bucket, evaluating its template on first use.
    pub fn bucket(&self, id_or_name: &str) -> Option<Value> {
        self.buckets
            .value(id_or_name, |template| self.evaluate_bucket(template))
    }

    /// Bucket evaluation callback for [`BucketStore`] accessors.
    pub fn evaluate_bucket(&self, template: &str) -> Value {
        if !template.contains("{{") {
            return parse_rendered(template);
        }
        // Bucket templates see the request but not other buckets
        let context = self.context_with(Value::Object(Map::new()));
        match self.renderer.render(template, &context) {
            Ok(rendered) => parse_rendered(&rendered),
            Err(e) => {
                warn!("Data bucket template failed to render: {}", e);
                Value::String(e.to_string())
            }
        }
    }
}
