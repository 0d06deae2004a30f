//! Resource actions over a data bucket.
//!
//! Every expanded resource sub-route maps to one [`ResourceOperation`]. The
//! action runs while the bucket lock is held and mutates the cached value in
//! place, so changes are visible to the next request of the same instance.
//!
//! This module provides:
//! - Collection listing with full-text search, field filters, sorting and paging
//! - Item lookup by key (object items) or by index (primitive items)
//! - Create, replace, merge and delete on collections and items

use crate::routing::ResourceOperation;
use crate::template::safe_path::{self, split_dot_path};
use crate::template::stringify;
use regex::RegexBuilder;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Paging size when `page` is given without `limit`.
pub const DEFAULT_PAGE_LIMIT: usize = 10;

pub const TOTAL_COUNT_HEADER: &str = "X-Total-Count";
pub const FILTERED_COUNT_HEADER: &str = "X-Filtered-Count";

/// Request inputs a resource action reads.
#[derive(Debug, Clone)]
pub struct ResourceRequest<'a> {
    /// Item key (dot path), `id` by default
    pub key: &'a str,
    /// Value of the `:id` path parameter for item operations
    pub id: Option<&'a str>,
    /// Parsed query string
    pub query: &'a Value,
    /// Parsed body, raw body string, or an empty object
    pub body: Value,
}

/// Status, body and extra headers produced by a resource action.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceOutcome {
    pub status: u16,
    pub body: Value,
    pub headers: Vec<(String, String)>,
}

impl ResourceOutcome {
    fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            body,
            headers: Vec::new(),
        }
    }

    fn not_found() -> Self {
        Self::new(404, Value::Object(Map::new()))
    }

    /// Response body text; empty for 204.
    pub fn body_text(&self) -> String {
        if self.status == 204 {
            return String::new();
        }
        match &self.body {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Whether the body is a JSON document rather than plain text.
    pub fn is_json(&self) -> bool {
        !matches!(self.body, Value::String(_))
    }
}

/// Run `operation` against the cached bucket value.
pub fn apply(
    operation: ResourceOperation,
    bucket: &mut Value,
    request: ResourceRequest<'_>,
) -> ResourceOutcome {
    let status = operation.default_status();
    debug!("Resource action {} (status {})", operation.as_str(), status);

    match operation {
        ResourceOperation::List => list(bucket, request.query),

        ResourceOperation::Read => match bucket {
            Value::Array(items) => match find_item(items, request.key, request.id) {
                Some(index) => ResourceOutcome::new(status, items[index].clone()),
                None => ResourceOutcome::not_found(),
            },
            other => ResourceOutcome::new(status, other.clone()),
        },

        ResourceOperation::Create => {
            let mut body = request.body;
            match bucket {
                Value::Array(items) => {
                    if body.is_object() && lookup(&body, request.key).is_none() {
                        let id = next_id(items, request.key);
                        if let Err(e) = safe_path::set_dot_path(&mut body, request.key, id) {
                            warn!("Resource key '{}' left unassigned: {}", request.key, e);
                        }
                    }
                    items.push(body.clone());
                }
                other => *other = body.clone(),
            }
            ResourceOutcome::new(status, body)
        }

        ResourceOperation::ReplaceAll => {
            *bucket = request.body;
            ResourceOutcome::new(status, bucket.clone())
        }

        ResourceOperation::Replace => match bucket {
            Value::Array(items) => {
                let Some(index) = find_item(items, request.key, request.id) else {
                    return ResourceOutcome::not_found();
                };
                let item = &mut items[index];
                if item.is_object() {
                    let current_id = lookup(item, request.key).cloned();
                    let mut replacement = match request.body {
                        Value::Object(map) => Value::Object(map),
                        _ => Value::Object(Map::new()),
                    };
                    if let Some(current_id) = current_id {
                        if lookup(&replacement, request.key).is_none() {
                            if let Err(e) = safe_path::set_dot_path(
                                &mut replacement,
                                request.key,
                                current_id,
                            ) {
                                warn!("Resource key '{}' left unassigned: {}", request.key, e);
                            }
                        }
                    }
                    *item = replacement;
                } else {
                    *item = request.body;
                }
                ResourceOutcome::new(status, item.clone())
            }
            other => {
                *other = request.body;
                ResourceOutcome::new(status, other.clone())
            }
        },

        ResourceOperation::MergeAll => {
            match (&mut *bucket, request.body) {
                (Value::Array(items), Value::Array(extra)) => items.extend(extra),
                (target, body) => merge_into(target, body),
            }
            ResourceOutcome::new(status, bucket.clone())
        }

        ResourceOperation::Merge => match bucket {
            Value::Array(items) => {
                let Some(index) = find_item(items, request.key, request.id) else {
                    return ResourceOutcome::not_found();
                };
                merge_into(&mut items[index], request.body);
                ResourceOutcome::new(status, items[index].clone())
            }
            other => {
                merge_into(other, request.body);
                ResourceOutcome::new(status, other.clone())
            }
        },

        ResourceOperation::Clear => {
            *bucket = if bucket.is_array() {
                Value::Array(Vec::new())
            } else {
                Value::Null
            };
            ResourceOutcome::new(status, Value::Null)
        }

        ResourceOperation::Delete => match bucket {
            Value::Array(items) => match find_item(items, request.key, request.id) {
                Some(index) => {
                    items.remove(index);
                    ResourceOutcome::new(status, Value::Null)
                }
                None => ResourceOutcome::not_found(),
            },
            other => {
                *other = Value::Null;
                ResourceOutcome::new(status, Value::Null)
            }
        },
    }
}

// ============================================================================
// Listing
// ============================================================================

fn list(bucket: &Value, query: &Value) -> ResourceOutcome {
    let Value::Array(items) = bucket else {
        return ResourceOutcome::new(200, bucket.clone());
    };

    let param = |name: &str| query.get(name).and_then(Value::as_str);
    let total = items.len();

    let search = param("search")
        .filter(|s| !s.is_empty())
        .and_then(search_regex);
    let filters = parse_filters(query);

    let mut selected: Vec<&Value> = items
        .iter()
        .filter(|item| search.as_ref().map_or(true, |re| full_text_match(item, re)))
        .filter(|item| filters.iter().all(|f| f.applies_to(item)))
        .collect();
    let filtered = selected.len();

    if let Some(sort) = param("sort") {
        let descending = param("order") == Some("desc");
        selected.sort_by(|a, b| {
            let ordering = compare_values(sort_key(a, sort), sort_key(b, sort));
            if descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
    }

    if param("limit").is_some() || param("page").is_some() {
        let limit = positive(param("limit")).unwrap_or(DEFAULT_PAGE_LIMIT);
        let page = positive(param("page")).unwrap_or(1);
        selected = selected
            .into_iter()
            .skip((page - 1).saturating_mul(limit))
            .take(limit)
            .collect();
    }

    let mut outcome = ResourceOutcome::new(
        200,
        Value::Array(selected.into_iter().cloned().collect()),
    );
    outcome.headers = vec![
        (TOTAL_COUNT_HEADER.to_string(), total.to_string()),
        (FILTERED_COUNT_HEADER.to_string(), filtered.to_string()),
    ];
    outcome
}

fn positive(raw: Option<&str>) -> Option<usize> {
    raw.and_then(|r| r.trim().parse::<usize>().ok()).filter(|&n| n > 0)
}

/// Search terms are regexes; invalid ones are matched literally.
fn search_regex(search: &str) -> Option<regex::Regex> {
    RegexBuilder::new(search)
        .case_insensitive(true)
        .build()
        .or_else(|_| {
            RegexBuilder::new(&regex::escape(search))
                .case_insensitive(true)
                .build()
        })
        .ok()
}

/// Case-insensitive match against every leaf of an item.
fn full_text_match(value: &Value, regex: &regex::Regex) -> bool {
    match value {
        Value::Object(map) => map.values().any(|v| full_text_match(v, regex)),
        Value::Array(items) => items.iter().any(|v| full_text_match(v, regex)),
        other => regex.is_match(&stringify_leaf(other)),
    }
}

fn stringify_leaf(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        other => stringify(other),
    }
}

fn sort_key<'v>(item: &'v Value, field: &str) -> Option<&'v Value> {
    match item {
        Value::Object(map) => map.get(field),
        other => Some(other),
    }
}

/// Order numbers numerically and strings case-insensitively; anything else
/// compares equal.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.to_lowercase().cmp(&b.to_lowercase()),
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        _ => Ordering::Equal,
    }
}

// ============================================================================
// Field filters
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    Start,
    End,
}

impl FilterKind {
    const SUFFIXES: [(&'static str, FilterKind); 9] = [
        ("_eq", FilterKind::Eq),
        ("_ne", FilterKind::Ne),
        ("_gte", FilterKind::Gte),
        ("_gt", FilterKind::Gt),
        ("_lte", FilterKind::Lte),
        ("_lt", FilterKind::Lt),
        ("_like", FilterKind::Like),
        ("_start", FilterKind::Start),
        ("_end", FilterKind::End),
    ];
}

/// One `<path>_<kind>=<value>` query filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFilter {
    pub path: String,
    pub kind: FilterKind,
    pub value: String,
}

/// Collect the field filters present in a parsed query string.
pub fn parse_filters(query: &Value) -> Vec<FieldFilter> {
    let Value::Object(params) = query else {
        return Vec::new();
    };
    params
        .iter()
        .filter_map(|(name, value)| {
            let value = value.as_str()?;
            let (path, kind) = FilterKind::SUFFIXES.iter().find_map(|(suffix, kind)| {
                name.strip_suffix(suffix).map(|path| (path, *kind))
            })?;
            Some(FieldFilter {
                path: path.to_string(),
                kind,
                value: value.to_string(),
            })
        })
        .collect()
}

impl FieldFilter {
    /// Whether an item passes this filter. An empty path applies to primitive
    /// items only.
    pub fn applies_to(&self, item: &Value) -> bool {
        let target = if self.path.is_empty() {
            if item.is_object() {
                return false;
            }
            Some(item.clone())
        } else {
            safe_path::query(item, &self.path).ok().flatten()
        };
        match target {
            Some(value) => self.compare(&value),
            None => self.kind == FilterKind::Ne,
        }
    }

    fn compare(&self, data: &Value) -> bool {
        let query = self.value.as_str();
        match self.kind {
            FilterKind::Eq => loosely_equal(data, query),
            FilterKind::Ne => !loosely_equal(data, query),
            FilterKind::Gt => ordered(data, query) == Some(Ordering::Greater),
            FilterKind::Gte => matches!(ordered(data, query), Some(Ordering::Greater | Ordering::Equal)),
            FilterKind::Lt => ordered(data, query) == Some(Ordering::Less),
            FilterKind::Lte => matches!(ordered(data, query), Some(Ordering::Less | Ordering::Equal)),
            FilterKind::Like => pattern_match(data, query),
            FilterKind::Start => pattern_match(data, &format!("^(?:{query})")),
            FilterKind::End => pattern_match(data, &format!("(?:{query})$")),
        }
    }
}

fn loosely_equal(data: &Value, query: &str) -> bool {
    match data {
        Value::Number(n) => {
            let query = query.trim();
            !query.is_empty()
                && query
                    .parse::<f64>()
                    .ok()
                    .zip(n.as_f64())
                    .is_some_and(|(q, n)| q == n)
        }
        Value::Bool(b) => query == if *b { "true" } else { "false" },
        Value::Null => query == "null",
        Value::String(s) => s == query,
        other => other.to_string() == query,
    }
}

fn ordered(data: &Value, query: &str) -> Option<Ordering> {
    match data {
        Value::Number(n) => {
            let query = query.trim().parse::<f64>().ok()?;
            n.as_f64()?.partial_cmp(&query)
        }
        Value::String(s) => Some(s.as_str().cmp(query)),
        _ => None,
    }
}

fn pattern_match(data: &Value, pattern: &str) -> bool {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map(|re| re.is_match(&stringify_leaf(data)))
        .unwrap_or(false)
}

// ============================================================================
// Item helpers
// ============================================================================

fn lookup<'v>(item: &'v Value, key: &str) -> Option<&'v Value> {
    let mut current = item;
    for segment in split_dot_path(key) {
        current = match current {
            Value::Object(map) => map.get(&segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Position of the item addressed by `id`: key match for object items,
/// index for primitive items (a non-numeric id addresses index 0).
fn find_item(items: &[Value], key: &str, id: Option<&str>) -> Option<usize> {
    let id = id.unwrap_or_default();
    items.iter().enumerate().position(|(index, item)| {
        if item.is_object() {
            match lookup(item, key) {
                None | Some(Value::Null) => false,
                Some(value) => stringify(value) == id,
            }
        } else {
            id.parse::<usize>().unwrap_or(0) == index
        }
    })
}

/// Highest numeric key plus one, or a fresh UUID when no item has one.
fn next_id(items: &[Value], key: &str) -> Value {
    let highest = items
        .iter()
        .filter_map(|item| lookup(item, key))
        .filter_map(Value::as_f64)
        .fold(None, |max: Option<f64>, id| Some(max.map_or(id, |m| m.max(id))));

    match highest {
        Some(max) if max.fract() == 0.0 && max >= i64::MIN as f64 && max < i64::MAX as f64 => {
            Value::from(max as i64 + 1)
        }
        Some(max) => Value::from(max + 1.0),
        None => Value::String(uuid::Uuid::new_v4().to_string()),
    }
}

/// Shallow merge of an object body; non-object targets are replaced.
fn merge_into(target: &mut Value, body: Value) {
    match target {
        Value::Object(existing) => {
            if let Value::Object(extra) = body {
                existing.extend(extra);
            }
        }
        other => *other = body,
    }
}
