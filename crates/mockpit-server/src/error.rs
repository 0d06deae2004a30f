//! Error taxonomy for the response resolution engine.
//!
//! Every per-request failure maps to an HTTP status and a stable client
//! message. Only [`EngineError::Bind`] and [`EngineError::TlsMaterial`] stop an
//! instance, and both are raised before the first request is accepted.

use hyper::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("No route matches {method} {path}")]
    RouteNotFound { method: String, path: String },

    #[error("Rule evaluation failed: {0}")]
    RuleEvaluation(String),

    #[error("Template rendering failed: {0}")]
    Render(String),

    #[error("File path '{0}' resolves outside of the environment directory")]
    PathTraversal(String),

    #[error("Unsafe path expression rejected: {0}")]
    UnsafePath(String),

    #[error("Error while serving the file content: {0}")]
    FileServing(String),

    #[error("Upstream proxy request to {target} failed: {reason}")]
    UpstreamProxy { target: String, reason: String },

    #[error("Data bucket '{0}' is not defined in the environment")]
    DataBucketNotFound(String),

    #[error("Failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("TLS material unavailable: {0}")]
    TlsMaterial(String),
}

impl EngineError {
    /// HTTP status reported to the client for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            EngineError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::PathTraversal(_) => StatusCode::FORBIDDEN,
            EngineError::UpstreamProxy { .. } => StatusCode::BAD_GATEWAY,
            EngineError::RuleEvaluation(_)
            | EngineError::Render(_)
            | EngineError::UnsafePath(_)
            | EngineError::FileServing(_)
            | EngineError::DataBucketNotFound(_)
            | EngineError::Bind { .. }
            | EngineError::TlsMaterial(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message sent to the client. Render and rule failures never expose the
    /// underlying template error, which is only logged.
    pub fn client_message(&self) -> String {
        match self {
            EngineError::RouteNotFound { method, path } => {
                format!("Cannot {method} {path}")
            }
            EngineError::RuleEvaluation(_) | EngineError::Render(_) => {
                "Error while rendering the response content".to_string()
            }
            EngineError::UnsafePath(_) => "Rejected an unsafe path expression".to_string(),
            EngineError::PathTraversal(_) => {
                "File path is outside of the environment directory".to_string()
            }
            EngineError::FileServing(_) => "Error while serving the file content".to_string(),
            EngineError::UpstreamProxy { .. } => "Error while proxying the request".to_string(),
            EngineError::DataBucketNotFound(id) => {
                format!("Configuration error: data bucket '{id}' does not exist")
            }
            other => other.to_string(),
        }
    }

    /// Short machine readable code used in server error events.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::RouteNotFound { .. } => "ROUTE_NOT_FOUND",
            EngineError::RuleEvaluation(_) => "RULE_EVALUATION_ERROR",
            EngineError::Render(_) => "RENDER_ERROR",
            EngineError::PathTraversal(_) => "PATH_TRAVERSAL_DENIED",
            EngineError::UnsafePath(_) => "UNSAFE_PATH_EXPRESSION",
            EngineError::FileServing(_) => "FILE_SERVING_ERROR",
            EngineError::UpstreamProxy { .. } => "PROXY_ERROR",
            EngineError::DataBucketNotFound(_) => "DATA_BUCKET_NOT_FOUND",
            EngineError::Bind { .. } => "PORT_BIND_ERROR",
            EngineError::TlsMaterial(_) => "TLS_MATERIAL_ERROR",
        }
    }

    /// Whether the error prevents the instance from serving at all.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Bind { .. } | EngineError::TlsMaterial(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            EngineError::RouteNotFound {
                method: "GET".into(),
                path: "/x".into()
            }
            .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            EngineError::PathTraversal("../etc/passwd".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            EngineError::UpstreamProxy {
                target: "http://up".into(),
                reason: "refused".into()
            }
            .status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            EngineError::DataBucketNotFound("abc".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_render_error_does_not_leak_details() {
        let err = EngineError::Render("Error rendering \"inline\" line 1, col 3".into());
        assert!(!err.client_message().contains("line 1"));
    }

    #[test]
    fn test_traversal_message_is_stable() {
        let a = EngineError::PathTraversal("../a".into()).client_message();
        let b = EngineError::PathTraversal("../../b".into()).client_message();
        assert_eq!(a, b);
    }

    #[test]
    fn test_only_startup_errors_are_fatal() {
        assert!(EngineError::Bind {
            address: "0.0.0.0:80".into(),
            reason: "denied".into()
        }
        .is_fatal());
        assert!(EngineError::TlsMaterial("missing cert".into()).is_fatal());
        assert!(!EngineError::Render("x".into()).is_fatal());
        assert!(!EngineError::DataBucketNotFound("x".into()).is_fatal());
    }
}
