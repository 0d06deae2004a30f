//! Outbound HTTP transport shared by proxy forwarding and callbacks.

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

/// Global HTTP client for outbound requests
static HTTP_CLIENT: std::sync::OnceLock<reqwest::Client> = std::sync::OnceLock::new();

fn get_http_client() -> &'static reqwest::Client {
    HTTP_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    })
}

/// Body of an outbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundBody {
    Empty,
    Bytes(Bytes),
    /// File sent as a multipart form upload
    Multipart {
        file_name: String,
        mime: Option<String>,
        content: Bytes,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: OutboundBody,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Sends outbound requests. Implemented over `reqwest` in production and by
/// recording fakes in tests.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> anyhow::Result<InboundResponse>;
}

/// [`HttpTransport`] backed by the shared `reqwest` client.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReqwestTransport;

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: OutboundRequest) -> anyhow::Result<InboundResponse> {
        let client = get_http_client();
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .with_context(|| format!("Invalid method {}", request.method))?;
        debug!("Outbound {} {}", method, request.url);

        let mut builder = client.request(method, &request.url);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        builder = match request.body {
            OutboundBody::Empty => builder,
            OutboundBody::Bytes(body) => builder.body(body),
            OutboundBody::Multipart {
                file_name,
                mime,
                content,
            } => {
                let mut part = reqwest::multipart::Part::bytes(content.to_vec()).file_name(file_name);
                if let Some(mime) = mime {
                    part = part
                        .mime_str(&mime)
                        .with_context(|| format!("Invalid MIME type {mime}"))?;
                }
                builder.multipart(reqwest::multipart::Form::new().part("file", part))
            }
        };

        let response = builder
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", request.url))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let body = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read response body from {}", request.url))?;

        Ok(InboundResponse {
            status,
            headers,
            body,
        })
    }
}
