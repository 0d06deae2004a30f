//! Post-response callbacks.
//!
//! Callback requests are rendered while the request scope is alive, then sent
//! from a detached task after their invocation latency. Outcomes are reported
//! as [`CallbackRecord`]s and never affect the primary response.

use super::file::{mime_for, FileResolver};
use super::transport::{HttpTransport, OutboundBody, OutboundRequest};
use crate::environment::{BodyType, CallbackInvocation, Environment};
use crate::error::EngineError;
use crate::metrics;
use crate::server::ServerEvent;
use crate::template::{stringify, RenderScope};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outcome of one callback invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRecord {
    pub callback_uuid: String,
    pub name: String,
    pub method: String,
    pub url: String,
    pub request_headers: Vec<(String, String)>,
    pub request_body: String,
    pub status: Option<u16>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub invoked_at: DateTime<Utc>,
}

/// Body source resolved at scheduling time.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingBody {
    Text(String),
    File { path: PathBuf, as_body: bool },
}

/// A rendered callback waiting for its latency to elapse.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledCallback {
    pub uuid: String,
    pub name: String,
    pub delay: Duration,
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: PendingBody,
}

/// Render the callbacks a response invokes. Unknown callbacks and callbacks
/// that fail to render are logged and skipped.
pub fn schedule(
    invocations: &[CallbackInvocation],
    environment: &Environment,
    scope: &RenderScope<'_>,
    resolver: &FileResolver,
    max_latency: Option<Duration>,
) -> Vec<ScheduledCallback> {
    invocations
        .iter()
        .filter_map(|invocation| {
            let Some(callback) = environment.find_callback(&invocation.uuid) else {
                warn!("Response references unknown callback {}", invocation.uuid);
                return None;
            };
            let mut delay = Duration::from_millis(invocation.latency);
            if let Some(max) = max_latency {
                delay = delay.min(max);
            }
            match render(callback, scope, resolver) {
                Ok((url, headers, body)) => Some(ScheduledCallback {
                    uuid: callback.uuid.clone(),
                    name: callback.name.clone(),
                    delay,
                    method: if callback.method.is_empty() {
                        "GET".to_string()
                    } else {
                        callback.method.to_uppercase()
                    },
                    url,
                    headers,
                    body,
                }),
                Err(e) => {
                    warn!("Skipping callback {}: {}", callback.name, e);
                    metrics::record_template_error("callback");
                    None
                }
            }
        })
        .collect()
}

type RenderedCallback = (String, Vec<(String, String)>, PendingBody);

fn render(
    callback: &crate::environment::Callback,
    scope: &RenderScope<'_>,
    resolver: &FileResolver,
) -> Result<RenderedCallback, EngineError> {
    let url = scope
        .render(&callback.uri)
        .map_err(|e| EngineError::Render(e.to_string()))?;
    let headers = callback
        .headers
        .iter()
        .filter(|h| !h.key.trim().is_empty())
        .map(|h| (h.key.clone(), scope.render_or_raw(&h.value)))
        .collect();

    let body = match callback.body_type {
        BodyType::Inline => PendingBody::Text(
            scope
                .render(&callback.body)
                .map_err(|e| EngineError::Render(e.to_string()))?,
        ),
        BodyType::Databucket => {
            let value = scope
                .bucket(&callback.databucket_id)
                .ok_or_else(|| EngineError::DataBucketNotFound(callback.databucket_id.clone()))?;
            PendingBody::Text(stringify(&value))
        }
        BodyType::File => PendingBody::File {
            path: resolver.resolve(&callback.file_path, scope)?,
            as_body: callback.send_file_as_body,
        },
    };
    Ok((url, headers, body))
}

async fn outbound_body(body: &PendingBody) -> Result<(OutboundBody, String), EngineError> {
    match body {
        PendingBody::Text(text) if text.is_empty() => Ok((OutboundBody::Empty, String::new())),
        PendingBody::Text(text) => Ok((OutboundBody::Bytes(Bytes::from(text.clone())), text.clone())),
        PendingBody::File { path, as_body } => {
            let content = super::file::load(path).await?;
            let summary = format!("<file {}>", path.display());
            if *as_body {
                Ok((OutboundBody::Bytes(content), summary))
            } else {
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                Ok((
                    OutboundBody::Multipart {
                        file_name,
                        mime: mime_for(path),
                        content,
                    },
                    summary,
                ))
            }
        }
    }
}

/// Send one scheduled callback and describe the outcome.
pub async fn invoke(transport: &dyn HttpTransport, callback: &ScheduledCallback) -> CallbackRecord {
    let invoked_at = Utc::now();
    let started = Instant::now();
    let mut record = CallbackRecord {
        callback_uuid: callback.uuid.clone(),
        name: callback.name.clone(),
        method: callback.method.clone(),
        url: callback.url.clone(),
        request_headers: callback.headers.clone(),
        request_body: String::new(),
        status: None,
        response_body: None,
        error: None,
        duration_ms: 0,
        invoked_at,
    };

    match outbound_body(&callback.body).await {
        Ok((body, summary)) => {
            record.request_body = summary;
            let request = OutboundRequest {
                method: callback.method.clone(),
                url: callback.url.clone(),
                headers: callback.headers.clone(),
                body,
            };
            match transport.send(request).await {
                Ok(response) => {
                    record.status = Some(response.status);
                    record.response_body = Some(String::from_utf8_lossy(&response.body).to_string());
                }
                Err(e) => record.error = Some(format!("{e:#}")),
            }
        }
        Err(e) => record.error = Some(e.to_string()),
    }
    record.duration_ms = started.elapsed().as_millis() as u64;
    record
}

/// Fire scheduled callbacks from detached tasks. Pending callbacks are dropped
/// when `shutdown` is cancelled.
pub fn dispatch(
    callbacks: Vec<ScheduledCallback>,
    transport: Arc<dyn HttpTransport>,
    events: broadcast::Sender<ServerEvent>,
    shutdown: CancellationToken,
) {
    for callback in callbacks {
        let transport = Arc::clone(&transport);
        let events = events.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Callback {} cancelled by shutdown", callback.name);
                    metrics::record_callback("cancelled");
                    return;
                }
                _ = tokio::time::sleep(callback.delay) => {}
            }

            let record = invoke(transport.as_ref(), &callback).await;
            match &record.error {
                Some(error) => {
                    warn!("Callback {} to {} failed: {}", record.name, record.url, error);
                    metrics::record_callback("error");
                }
                None => {
                    debug!("Callback {} answered {:?}", record.name, record.status);
                    metrics::record_callback("success");
                }
            }
            // No subscribers is fine
            let _ = events.send(ServerEvent::CallbackInvoked(record));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::BucketStore;
    use crate::effects::transport::InboundResponse;
    use crate::environment::{Callback, DataBucket, Header};
    use crate::template::{HandlebarsRenderer, RequestContext};
    use async_trait::async_trait;
    use hyper::HeaderMap;
    use parking_lot::Mutex;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<OutboundRequest>>,
    }

    #[async_trait]
    impl HttpTransport for RecordingTransport {
        async fn send(&self, request: OutboundRequest) -> anyhow::Result<InboundResponse> {
            self.sent.lock().push(request);
            Ok(InboundResponse {
                status: 202,
                headers: Vec::new(),
                body: Bytes::from_static(b"ok"),
            })
        }
    }

    fn environment() -> Environment {
        Environment {
            callbacks: vec![
                Callback {
                    uuid: "cb-1".into(),
                    id: "notify".into(),
                    name: "notify".into(),
                    documentation: String::new(),
                    method: "post".into(),
                    uri: "http://hooks.test/{{urlParam 'id'}}".into(),
                    headers: vec![Header::new("X-Request", "{{request.method}}")],
                    body: r#"{"id": "{{urlParam 'id'}}"}"#.into(),
                    body_type: BodyType::Inline,
                    databucket_id: String::new(),
                    file_path: String::new(),
                    send_file_as_body: false,
                },
                Callback {
                    uuid: "cb-2".into(),
                    id: "dump".into(),
                    name: "dump".into(),
                    documentation: String::new(),
                    method: "PUT".into(),
                    uri: "http://hooks.test/dump".into(),
                    headers: Vec::new(),
                    body: String::new(),
                    body_type: BodyType::Databucket,
                    databucket_id: "b1".into(),
                    file_path: String::new(),
                    send_file_as_body: false,
                },
            ],
            data: vec![DataBucket {
                uuid: "u".into(),
                id: "b1".into(),
                name: "items".into(),
                documentation: String::new(),
                value: "[1, 2]".into(),
            }],
            ..Default::default()
        }
    }

    fn invocation(uuid: &str, latency: u64) -> CallbackInvocation {
        CallbackInvocation {
            uuid: uuid.into(),
            latency,
        }
    }

    fn scheduled(invocations: &[CallbackInvocation]) -> Vec<ScheduledCallback> {
        let env = environment();
        let renderer = HandlebarsRenderer::new();
        let buckets = BucketStore::from_environment(&env);
        let request = RequestContext::from_parts("DELETE", "/users/7", None, &HeaderMap::new(), b"")
            .with_params([("id".to_string(), "7".to_string())].into());
        let scope = RenderScope::new(&renderer, &buckets, &request, 1);
        let dir = tempfile::tempdir().unwrap();
        let resolver = FileResolver::new(dir.path());
        schedule(invocations, &env, &scope, &resolver, Some(Duration::from_millis(50)))
    }

    #[test]
    #[traced_test]
    fn test_schedule_renders_request() {
        let callbacks = scheduled(&[invocation("cb-1", 10), invocation("missing", 0)]);
        assert_eq!(callbacks.len(), 1);
        assert!(logs_contain("unknown callback missing"));
        let callback = &callbacks[0];
        assert_eq!(callback.method, "POST");
        assert_eq!(callback.url, "http://hooks.test/7");
        assert_eq!(callback.headers, vec![("X-Request".to_string(), "DELETE".to_string())]);
        assert_eq!(callback.body, PendingBody::Text(r#"{"id": "7"}"#.to_string()));
        assert_eq!(callback.delay, Duration::from_millis(10));
    }

    #[test]
    fn test_schedule_caps_latency_and_reads_buckets() {
        let callbacks = scheduled(&[invocation("cb-2", 10_000)]);
        assert_eq!(callbacks[0].delay, Duration::from_millis(50));
        assert_eq!(callbacks[0].body, PendingBody::Text("[1,2]".to_string()));
    }

    #[tokio::test]
    async fn test_invoke_records_outcome() {
        let transport = RecordingTransport::default();
        let callbacks = scheduled(&[invocation("cb-1", 0)]);
        let record = invoke(&transport, &callbacks[0]).await;
        assert_eq!(record.status, Some(202));
        assert_eq!(record.response_body.as_deref(), Some("ok"));
        assert!(record.error.is_none());
        assert_eq!(transport.sent.lock()[0].url, "http://hooks.test/7");
    }

    #[tokio::test]
    async fn test_dispatch_emits_event() {
        let transport: Arc<dyn HttpTransport> = Arc::new(RecordingTransport::default());
        let (events, mut receiver) = broadcast::channel(8);
        dispatch(
            scheduled(&[invocation("cb-1", 0)]),
            transport,
            events,
            CancellationToken::new(),
        );
        let event = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ServerEvent::CallbackInvoked(record) => assert_eq!(record.name, "notify"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_cancelled_before_latency() {
        let transport = Arc::new(RecordingTransport::default());
        let (events, mut receiver) = broadcast::channel(8);
        let shutdown = CancellationToken::new();
        let mut callbacks = scheduled(&[invocation("cb-1", 0)]);
        callbacks[0].delay = Duration::from_secs(30);
        dispatch(callbacks, transport.clone(), events, shutdown.clone());
        shutdown.cancel();

        let received = tokio::time::timeout(Duration::from_millis(200), receiver.recv()).await;
        assert!(received.is_err() || received.unwrap().is_err());
        assert!(transport.sent.lock().is_empty());
    }
}
