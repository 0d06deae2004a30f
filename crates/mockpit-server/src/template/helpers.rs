//! Request and data helpers registered on the Handlebars registry.
//!
//! Helpers read the request snapshot and the data buckets from the render
//! context. Every path argument goes through [`safe_path`](super::safe_path).
//!
//! | helper                          | value                                    |
//! |---------------------------------|------------------------------------------|
//! | `urlParam name`                 | path parameter                           |
//! | `queryParam path [default]`     | query value (`queryParamRaw` keeps JSON) |
//! | `header name [default]`         | request header                           |
//! | `cookie name [default]`         | request cookie                           |
//! | `body [path] [default]`         | body value (`bodyRaw` keeps JSON)        |
//! | `data bucket [path]`            | data bucket value (`dataRaw` keeps JSON) |

use super::safe_path;
use handlebars::{
    Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext, RenderError,
    ScopedJson,
};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    UrlParam,
    QueryParam,
    Header,
    Cookie,
    Body,
    Data,
}

struct ValueHelper {
    source: Source,
    /// Keep the JSON value instead of its string form
    raw: bool,
}

pub fn register_helpers(registry: &mut Handlebars<'static>) {
    let helpers = [
        ("urlParam", Source::UrlParam, false),
        ("queryParam", Source::QueryParam, false),
        ("queryParamRaw", Source::QueryParam, true),
        ("header", Source::Header, false),
        ("cookie", Source::Cookie, false),
        ("body", Source::Body, false),
        ("bodyRaw", Source::Body, true),
        ("data", Source::Data, false),
        ("dataRaw", Source::Data, true),
    ];
    for (name, source, raw) in helpers {
        registry.register_helper(name, Box::new(ValueHelper { source, raw }));
    }
}

fn string_param(h: &Helper<'_, '_>, index: usize) -> String {
    match h.param(index).map(|p| p.value()) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn default_param(h: &Helper<'_, '_>, index: usize) -> Value {
    h.param(index)
        .map(|p| p.value().clone())
        .unwrap_or(Value::Null)
}

fn lookup(data: &Value, path: &str) -> Result<Option<Value>, RenderError> {
    safe_path::query(data, path).map_err(|e| RenderError::new(e.to_string()))
}

/// String form written into templates: strings as-is, null as empty,
/// everything else as JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl ValueHelper {
    fn resolve(&self, h: &Helper<'_, '_>, ctx: &Context) -> Result<Value, RenderError> {
        let root = ctx.data();
        let request = &root["request"];
        let found = match self.source {
            Source::UrlParam => request["params"].get(string_param(h, 0)).cloned(),
            Source::Header => request["headers"]
                .get(string_param(h, 0).to_lowercase())
                .cloned(),
            Source::Cookie => request["cookies"].get(string_param(h, 0)).cloned(),
            Source::QueryParam => lookup(&request["query"], &string_param(h, 0))?,
            Source::Body => {
                let path = string_param(h, 0);
                if path.is_empty() && !self.raw {
                    Some(request["bodyRaw"].clone())
                } else {
                    lookup(&request["body"], &path)?
                }
            }
            Source::Data => {
                let bucket = string_param(h, 0);
                match root["data"].get(&bucket) {
                    Some(value) => lookup(value, &string_param(h, 1))?,
                    None => None,
                }
            }
        };

        let default_index = match self.source {
            Source::UrlParam | Source::Data => None,
            _ => Some(1),
        };
        Ok(match (found, default_index) {
            (Some(value), _) if !value.is_null() => value,
            (_, Some(index)) => default_param(h, index),
            (found, None) => found.unwrap_or(Value::Null),
        })
    }
}

impl HelperDef for ValueHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'reg, 'rc>,
        _: &'reg Handlebars<'reg>,
        ctx: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'reg, 'rc>, RenderError> {
        Ok(ScopedJson::Derived(self.resolve(h, ctx)?))
    }

    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'reg, 'rc>,
        _: &'reg Handlebars<'reg>,
        ctx: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let value = self.resolve(h, ctx)?;
        out.write(&stringify(&value))?;
        Ok(())
    }
}
