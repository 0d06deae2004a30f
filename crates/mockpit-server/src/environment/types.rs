//! Serde model of a mock environment.
//!
//! Field names follow the camelCase layout of stored environment files so a
//! migrated environment can be deserialized as-is.

use serde::{Deserialize, Serialize};

// =============================================================================
// Environment
// =============================================================================

/// One complete mock API configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default)]
    pub endpoint_prefix: String,
    /// Global latency in milliseconds, applied before matching
    #[serde(default)]
    pub latency: u64,
    #[serde(default)]
    pub tls_options: TlsOptions,
    #[serde(default)]
    pub cors: bool,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub proxy_mode: bool,
    #[serde(default)]
    pub proxy_host: String,
    #[serde(default)]
    pub proxy_remove_prefix: bool,
    #[serde(default)]
    pub proxy_req_headers: Vec<Header>,
    #[serde(default)]
    pub proxy_res_headers: Vec<Header>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub folders: Vec<Folder>,
    #[serde(default)]
    pub root_children: Vec<FolderChild>,
    #[serde(default)]
    pub data: Vec<DataBucket>,
    #[serde(default)]
    pub callbacks: Vec<Callback>,
}

fn default_port() -> u16 {
    3000
}

fn default_hostname() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_status() -> u16 {
    200
}

fn default_crud_key() -> String {
    "id".to_string()
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            uuid: String::new(),
            name: String::new(),
            port: default_port(),
            hostname: default_hostname(),
            endpoint_prefix: String::new(),
            latency: 0,
            tls_options: TlsOptions::default(),
            cors: false,
            headers: Vec::new(),
            proxy_mode: false,
            proxy_host: String::new(),
            proxy_remove_prefix: false,
            proxy_req_headers: Vec::new(),
            proxy_res_headers: Vec::new(),
            routes: Vec::new(),
            folders: Vec::new(),
            root_children: Vec::new(),
            data: Vec::new(),
            callbacks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TlsOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(rename = "type", default)]
    pub kind: TlsKind,
    #[serde(default)]
    pub pfx_path: String,
    #[serde(default)]
    pub cert_path: String,
    #[serde(default)]
    pub key_path: String,
    #[serde(default)]
    pub ca_path: String,
    #[serde(default)]
    pub passphrase: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TlsKind {
    #[default]
    Cert,
    Pfx,
}

// =============================================================================
// Folders
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Folder {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub children: Vec<FolderChild>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FolderChild {
    #[serde(rename = "type")]
    pub kind: FolderChildKind,
    pub uuid: String,
}

impl FolderChild {
    pub fn route(uuid: impl Into<String>) -> Self {
        Self {
            kind: FolderChildKind::Route,
            uuid: uuid.into(),
        }
    }

    pub fn folder(uuid: impl Into<String>) -> Self {
        Self {
            kind: FolderChildKind::Folder,
            uuid: uuid.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FolderChildKind {
    Route,
    Folder,
}

// =============================================================================
// Routes
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub uuid: String,
    #[serde(rename = "type", default)]
    pub kind: RouteKind,
    #[serde(default)]
    pub documentation: String,
    #[serde(default)]
    pub method: RouteMethod,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub responses: Vec<RouteResponse>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// `None` selects the rule-based mode
    #[serde(default)]
    pub response_mode: Option<ResponseMode>,
}

impl Route {
    /// Index of the response flagged as default, or the first one.
    pub fn default_response_index(&self) -> usize {
        default_response_index(&self.responses)
    }
}

/// Index of the response flagged as default, or the first one.
pub fn default_response_index(responses: &[RouteResponse]) -> usize {
    responses.iter().position(|r| r.is_default).unwrap_or(0)
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    #[default]
    Http,
    Crud,
    Ws,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RouteMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
    All,
}

impl RouteMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteMethod::Get => "GET",
            RouteMethod::Post => "POST",
            RouteMethod::Put => "PUT",
            RouteMethod::Patch => "PATCH",
            RouteMethod::Delete => "DELETE",
            RouteMethod::Head => "HEAD",
            RouteMethod::Options => "OPTIONS",
            RouteMethod::All => "ALL",
        }
    }

    /// Parse an HTTP method name; unknown methods have no route counterpart.
    pub fn from_http(method: &str) -> Option<Self> {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Some(RouteMethod::Get),
            "POST" => Some(RouteMethod::Post),
            "PUT" => Some(RouteMethod::Put),
            "PATCH" => Some(RouteMethod::Patch),
            "DELETE" => Some(RouteMethod::Delete),
            "HEAD" => Some(RouteMethod::Head),
            "OPTIONS" => Some(RouteMethod::Options),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseMode {
    Random,
    Sequential,
    DisableRules,
    /// Rule-based, but a route with no holding rule set yields no response
    Fallback,
}

// =============================================================================
// Responses and rules
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteResponse {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_status")]
    pub status_code: u16,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub body_type: BodyType,
    #[serde(default)]
    pub file_path: String,
    #[serde(rename = "databucketID", alias = "databucketId", default)]
    pub databucket_id: String,
    #[serde(default)]
    pub send_file_as_body: bool,
    /// Latency in milliseconds, applied after selection
    #[serde(default)]
    pub latency: u64,
    #[serde(default)]
    pub rules: Vec<ResponseRule>,
    #[serde(default)]
    pub rules_operator: RulesOperator,
    #[serde(default)]
    pub disable_templating: bool,
    #[serde(default)]
    pub fallback_to404: bool,
    #[serde(rename = "default", default)]
    pub is_default: bool,
    #[serde(default = "default_crud_key")]
    pub crud_key: String,
    #[serde(default)]
    pub callbacks: Vec<CallbackInvocation>,
}

impl Default for RouteResponse {
    fn default() -> Self {
        Self {
            uuid: String::new(),
            label: String::new(),
            status_code: default_status(),
            headers: Vec::new(),
            body: String::new(),
            body_type: BodyType::Inline,
            file_path: String::new(),
            databucket_id: String::new(),
            send_file_as_body: false,
            latency: 0,
            rules: Vec::new(),
            rules_operator: RulesOperator::Or,
            disable_templating: false,
            fallback_to404: false,
            is_default: false,
            crud_key: default_crud_key(),
            callbacks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum BodyType {
    #[default]
    Inline,
    File,
    Databucket,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RulesOperator {
    And,
    #[default]
    Or,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRule {
    pub target: RuleTarget,
    #[serde(default)]
    pub modifier: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub invert: bool,
    #[serde(default)]
    pub operator: RuleOperator,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleTarget {
    Body,
    Query,
    Header,
    Cookie,
    Params,
    Path,
    Method,
    RequestNumber,
    DataBucket,
    Templating,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    #[default]
    Equals,
    Regex,
    RegexI,
    Null,
    EmptyArray,
    ArrayIncludes,
}

// =============================================================================
// Data buckets and callbacks
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataBucket {
    #[serde(default)]
    pub uuid: String,
    /// Short public id referenced by responses and templates
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub documentation: String,
    /// Template string, rendered on first use
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Callback {
    pub uuid: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub documentation: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub body_type: BodyType,
    #[serde(rename = "databucketID", alias = "databucketId", default)]
    pub databucket_id: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub send_file_as_body: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallbackInvocation {
    pub uuid: String,
    #[serde(default)]
    pub latency: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_environment_defaults() {
        let env: Environment = serde_json::from_str(r#"{"name": "demo"}"#).unwrap();
        assert_eq!(env.port, 3000);
        assert_eq!(env.hostname, "0.0.0.0");
        assert!(env.routes.is_empty());
        assert!(!env.tls_options.enabled);
    }

    #[test]
    fn test_route_deserialization() {
        let json = r#"{
            "uuid": "r1",
            "type": "crud",
            "method": "post",
            "endpoint": "users",
            "responseMode": "SEQUENTIAL",
            "responses": [{
                "uuid": "a",
                "statusCode": 201,
                "bodyType": "DATABUCKET",
                "databucketID": "b1x2",
                "fallbackTo404": true,
                "default": true,
                "rulesOperator": "AND",
                "rules": [{"target": "request_number", "modifier": "", "value": "2", "operator": "equals", "invert": true}]
            }]
        }"#;
        let route: Route = serde_json::from_str(json).unwrap();
        assert_eq!(route.kind, RouteKind::Crud);
        assert_eq!(route.method, RouteMethod::Post);
        assert_eq!(route.response_mode, Some(ResponseMode::Sequential));
        assert!(route.enabled);
        let response = &route.responses[0];
        assert_eq!(response.status_code, 201);
        assert_eq!(response.body_type, BodyType::Databucket);
        assert_eq!(response.databucket_id, "b1x2");
        assert!(response.fallback_to404);
        assert!(response.is_default);
        assert_eq!(response.crud_key, "id");
        assert_eq!(response.rules_operator, RulesOperator::And);
        assert_eq!(response.rules[0].target, RuleTarget::RequestNumber);
        assert!(response.rules[0].invert);
    }

    #[test]
    fn test_null_response_mode_is_rule_based() {
        let route: Route =
            serde_json::from_str(r#"{"uuid": "r", "endpoint": "x", "responseMode": null}"#)
                .unwrap();
        assert_eq!(route.response_mode, None);
    }

    #[test]
    fn test_default_response_index() {
        let mut route: Route = serde_json::from_str(r#"{"uuid": "r", "endpoint": "x"}"#).unwrap();
        route.responses = vec![RouteResponse::default(), RouteResponse::default()];
        assert_eq!(route.default_response_index(), 0);
        route.responses[1].is_default = true;
        assert_eq!(route.default_response_index(), 1);
    }

    #[test]
    fn test_route_method_from_http() {
        assert_eq!(RouteMethod::from_http("get"), Some(RouteMethod::Get));
        assert_eq!(RouteMethod::from_http("PATCH"), Some(RouteMethod::Patch));
        assert_eq!(RouteMethod::from_http("BREW"), None);
    }
}
