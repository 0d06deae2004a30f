//! Request context exposed to rules and templates.
//!
//! This module provides:
//! - [`RequestContext`], a parsed snapshot of an incoming request
//! - Query string, cookie and body parsing (JSON, form-encoded, XML)

use crate::routing::{collapse_slashes, normalize_path};
use hyper::HeaderMap;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Parsed request data shared by rule evaluation and template rendering.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Uppercase HTTP method
    pub method: String,
    /// Normalized (decoded, deduplicated) path
    pub path: String,
    /// Deduplicated path with its percent escapes intact
    pub raw_path: String,
    pub raw_query: String,
    /// Parsed query string; repeated keys become arrays
    pub query: Value,
    /// Lowercase header names; repeated headers are joined with `, `
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
    /// Parsed body when the content type is understood and parsing succeeded
    pub body: Option<Value>,
    pub raw_body: String,
    pub hostname: String,
    pub ip: String,
}

impl RequestContext {
    /// Build the context from the request head and its collected body.
    /// `raw_path` is the path as received on the wire.
    pub fn from_parts(
        method: &str,
        raw_path: &str,
        raw_query: Option<&str>,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Self {
        let mut header_map: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in headers {
            let value = String::from_utf8_lossy(value.as_bytes()).to_string();
            header_map
                .entry(name.as_str().to_lowercase())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }

        let cookies = header_map
            .get("cookie")
            .map(|raw| parse_cookies(raw))
            .unwrap_or_default();
        let raw_body = String::from_utf8_lossy(body).to_string();
        let parsed_body = parse_body(header_map.get("content-type").map(String::as_str), &raw_body);
        let hostname = header_map
            .get("host")
            .map(|h| h.split(':').next().unwrap_or_default().to_string())
            .unwrap_or_default();
        let raw_query = raw_query.unwrap_or_default().to_string();

        Self {
            method: method.to_uppercase(),
            path: normalize_path(raw_path),
            raw_path: collapse_slashes(raw_path),
            query: parse_query(&raw_query),
            raw_query,
            headers: header_map,
            cookies,
            params: BTreeMap::new(),
            body: parsed_body,
            raw_body,
            hostname,
            ip: String::new(),
        }
    }

    pub fn with_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params = params;
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = ip.into();
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// JSON view used as the root of the template context.
    pub fn to_json(&self) -> Value {
        json!({
            "method": self.method,
            "path": self.path,
            "queryString": self.raw_query,
            "query": self.query,
            "headers": self.headers,
            "cookies": self.cookies,
            "params": self.params,
            "body": self.body.clone().unwrap_or(Value::Null),
            "bodyRaw": self.raw_body,
            "hostname": self.hostname,
            "ip": self.ip,
        })
    }
}

/// Parse a query string into a JSON object.
///
/// `a=1&a=2` and `a[]=1` produce arrays; `a[b]=1` produces a nested object.
pub fn parse_query(raw: &str) -> Value {
    let mut root = Map::new();
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode_component(key);
        let value = Value::String(decode_component(value));

        if let Some(name) = key.strip_suffix("[]") {
            push_value(&mut root, name, value, true);
        } else if let Some((name, rest)) = key.split_once('[') {
            let Some(child) = rest.strip_suffix(']') else {
                push_value(&mut root, &key, value, false);
                continue;
            };
            let entry = root
                .entry(name.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(nested) = entry {
                push_value(nested, child, value, false);
            }
        } else {
            push_value(&mut root, &key, value, false);
        }
    }
    Value::Object(root)
}

fn push_value(map: &mut Map<String, Value>, key: &str, value: Value, force_array: bool) {
    match map.get_mut(key) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let previous = existing.take();
            *existing = Value::Array(vec![previous, value]);
        }
        None if force_array => {
            map.insert(key.to_string(), Value::Array(vec![value]));
        }
        None => {
            map.insert(key.to_string(), value);
        }
    }
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}

/// Parse a `Cookie` header into name/value pairs.
pub fn parse_cookies(raw: &str) -> BTreeMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), decode_component(value.trim())))
        })
        .collect()
}

/// Parse a request body according to its content type.
pub fn parse_body(content_type: Option<&str>, raw: &str) -> Option<Value> {
    if raw.is_empty() {
        return None;
    }
    let content_type = content_type?.to_lowercase();
    let mime = content_type.split(';').next().unwrap_or_default().trim();

    if mime == "application/json" || mime.ends_with("+json") {
        serde_json::from_str(raw).ok()
    } else if mime == "application/x-www-form-urlencoded" {
        Some(parse_query(raw))
    } else if mime == "application/xml" || mime == "text/xml" || mime.ends_with("+xml") {
        xml_to_json(raw)
    } else {
        None
    }
}

/// Deepest element nesting converted from an XML body. Deeper documents are
/// left unparsed and only `bodyRaw` is available to rules and templates.
pub const MAX_XML_DEPTH: usize = 128;

/// Convert an XML document into a compact JSON form: elements become keys,
/// attributes live under `_attributes`, text under `_text`, and repeated
/// sibling elements become arrays.
pub fn xml_to_json(raw: &str) -> Option<Value> {
    use sxd_document::dom::ChildOfRoot;
    use sxd_document::parser;

    let package = parser::parse(raw).ok()?;
    let document = package.as_document();
    let mut root = Map::new();
    for child in document.root().children() {
        if let ChildOfRoot::Element(element) = child {
            let name = element.name().local_part().to_string();
            insert_child(&mut root, name, element_to_json(element, 1)?);
        }
    }
    Some(Value::Object(root))
}

fn element_to_json(element: sxd_document::dom::Element<'_>, depth: usize) -> Option<Value> {
    use sxd_document::dom::ChildOfElement;

    if depth > MAX_XML_DEPTH {
        debug!("XML body nested deeper than {} elements, keeping it raw", MAX_XML_DEPTH);
        return None;
    }

    let mut object = Map::new();
    let attributes = element.attributes();
    if !attributes.is_empty() {
        let attributes: Map<String, Value> = attributes
            .iter()
            .map(|a| {
                (
                    a.name().local_part().to_string(),
                    Value::String(a.value().to_string()),
                )
            })
            .collect();
        object.insert("_attributes".to_string(), Value::Object(attributes));
    }

    let mut text = String::new();
    for child in element.children() {
        match child {
            ChildOfElement::Element(nested) => {
                let name = nested.name().local_part().to_string();
                insert_child(&mut object, name, element_to_json(nested, depth + 1)?);
            }
            ChildOfElement::Text(t) => text.push_str(t.text()),
            _ => {}
        }
    }
    let text = text.trim();
    if !text.is_empty() {
        object.insert("_text".to_string(), Value::String(text.to_string()));
    }
    Some(Value::Object(object))
}

fn insert_child(map: &mut Map<String, Value>, name: String, value: Value) {
    match map.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let previous = existing.take();
            *existing = Value::Array(vec![previous, value]);
        }
        None => {
            map.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{HeaderValue, CONTENT_TYPE, COOKIE};

    #[test]
    fn test_parse_query() {
        let query = parse_query("a=1&b=hello+world&a=2&list[]=x&obj[k]=v&flag");
        assert_eq!(
            query,
            json!({
                "a": ["1", "2"],
                "b": "hello world",
                "list": ["x"],
                "obj": {"k": "v"},
                "flag": ""
            })
        );
    }

    #[test]
    fn test_parse_cookies() {
        let cookies = parse_cookies("session=abc; theme=dark%20mode;broken");
        assert_eq!(cookies.get("session").map(String::as_str), Some("abc"));
        assert_eq!(cookies.get("theme").map(String::as_str), Some("dark mode"));
        assert_eq!(cookies.len(), 2);
    }

    #[test]
    fn test_parse_json_body() {
        assert_eq!(
            parse_body(Some("application/json; charset=utf-8"), r#"{"a": 1}"#),
            Some(json!({"a": 1}))
        );
        assert_eq!(parse_body(Some("application/json"), "{not json"), None);
        assert_eq!(parse_body(Some("text/plain"), "hello"), None);
        assert_eq!(parse_body(None, "hello"), None);
    }

    #[test]
    fn test_parse_form_body() {
        assert_eq!(
            parse_body(Some("application/x-www-form-urlencoded"), "name=Ada&age=36"),
            Some(json!({"name": "Ada", "age": "36"}))
        );
    }

    #[test]
    fn test_parse_xml_body() {
        let xml = r#"<order id="7"><item>apple</item><item>pear</item><total>3</total></order>"#;
        assert_eq!(
            parse_body(Some("application/xml"), xml),
            Some(json!({
                "order": {
                    "_attributes": {"id": "7"},
                    "item": [{"_text": "apple"}, {"_text": "pear"}],
                    "total": {"_text": "3"}
                }
            }))
        );
    }

    #[test]
    fn test_deeply_nested_xml_stays_raw() {
        let depth = 20_000;
        let xml = format!("{}{}", "<a>".repeat(depth), "</a>".repeat(depth));
        assert_eq!(parse_body(Some("application/xml"), &xml), None);

        let headers = {
            let mut h = HeaderMap::new();
            h.insert(CONTENT_TYPE, HeaderValue::from_static("text/xml"));
            h
        };
        let ctx = RequestContext::from_parts("POST", "/xml", None, &headers, xml.as_bytes());
        assert!(ctx.body.is_none());
        assert_eq!(ctx.raw_body.len(), xml.len());
    }

    #[test]
    fn test_xml_at_depth_limit_is_parsed() {
        let xml = format!(
            "{}leaf{}",
            "<a>".repeat(MAX_XML_DEPTH),
            "</a>".repeat(MAX_XML_DEPTH)
        );
        let parsed = parse_body(Some("application/xml"), &xml).unwrap();
        let mut node = &parsed["a"];
        for _ in 1..MAX_XML_DEPTH {
            node = &node["a"];
        }
        assert_eq!(node["_text"], json!("leaf"));
    }

    #[test]
    fn test_from_parts() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(COOKIE, HeaderValue::from_static("token=t1"));
        headers.insert("host", HeaderValue::from_static("localhost:3000"));
        headers.append("x-multi", HeaderValue::from_static("a"));
        headers.append("x-multi", HeaderValue::from_static("b"));

        let ctx = RequestContext::from_parts("post", "/users", Some("page=2"), &headers, br#"{"name":"Ada"}"#);
        assert_eq!(ctx.method, "POST");
        assert_eq!(ctx.query, json!({"page": "2"}));
        assert_eq!(ctx.header("X-Multi"), Some("a, b"));
        assert_eq!(ctx.cookies.get("token").map(String::as_str), Some("t1"));
        assert_eq!(ctx.body, Some(json!({"name": "Ada"})));
        assert_eq!(ctx.hostname, "localhost");
        assert_eq!(ctx.to_json()["bodyRaw"], json!(r#"{"name":"Ada"}"#));
    }

    #[test]
    fn test_from_parts_keeps_raw_path() {
        let ctx = RequestContext::from_parts("GET", "//files/a%3Fb%23c", None, &HeaderMap::new(), b"");
        assert_eq!(ctx.path, "/files/a?b#c");
        assert_eq!(ctx.raw_path, "/files/a%3Fb%23c");
    }
}
