//! CORS preflight support.

/// Headers sent on automatic preflight responses. Environment headers with
/// the same name take precedence.
pub const CORS_HEADERS: [(&str, &str); 3] = [
    ("Access-Control-Allow-Origin", "*"),
    (
        "Access-Control-Allow-Methods",
        "GET,POST,PUT,PATCH,DELETE,HEAD,OPTIONS",
    ),
    (
        "Access-Control-Allow-Headers",
        "Content-Type, Origin, Accept, Authorization, Content-Length, X-Requested-With",
    ),
];

/// Preflight headers: the CORS defaults overridden by environment headers.
pub fn preflight_headers(environment_headers: &[(String, String)]) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = CORS_HEADERS
        .iter()
        .filter(|(name, _)| {
            !environment_headers
                .iter()
                .any(|(key, _)| key.eq_ignore_ascii_case(name))
        })
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    headers.extend(environment_headers.iter().cloned());
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_environment_headers() {
        let headers = preflight_headers(&[]);
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0], ("Access-Control-Allow-Origin".to_string(), "*".to_string()));
    }

    #[test]
    fn test_environment_headers_override_defaults() {
        let env = vec![(
            "access-control-allow-origin".to_string(),
            "https://app.test".to_string(),
        )];
        let headers = preflight_headers(&env);
        assert_eq!(headers.len(), 3);
        assert!(headers.contains(&(
            "access-control-allow-origin".to_string(),
            "https://app.test".to_string()
        )));
        assert!(!headers.iter().any(|(k, v)| k == "Access-Control-Allow-Origin" && v == "*"));
    }
}
