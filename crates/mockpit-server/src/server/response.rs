//! Response helper functions.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode};
use tracing::debug;

/// Build an HTTP response with the given status and body.
///
/// Falls back to a minimal 500 response in the unlikely case the builder fails.
pub fn build_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from("Internal Server Error"))))
}

/// Build an HTTP response with headers.
///
/// Headers whose name or value is not valid HTTP are skipped. Repeated names
/// are appended, so several `Set-Cookie` entries survive.
pub fn build_response_with_headers(
    status: StatusCode,
    headers: impl IntoIterator<Item = (impl AsRef<str>, impl AsRef<str>)>,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = build_response(status, body);
    let map = response.headers_mut();
    for (key, value) in headers {
        let (key, value) = (key.as_ref(), value.as_ref());
        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => debug!("Skipping invalid response header '{}'", key),
        }
    }
    response
}

/// Collect request body into bytes
pub async fn collect_body(req: Request<Incoming>) -> Result<(hyper::http::request::Parts, Bytes), String> {
    use http_body_util::BodyExt;
    let (parts, body) = req.into_parts();
    body.collect()
        .await
        .map(|c| (parts, c.to_bytes()))
        .map_err(|e| format!("Failed to read request body: {e}"))
}
