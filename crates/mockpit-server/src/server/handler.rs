//! Request pipeline of a running instance.
//!
//! global latency → match → select → response latency → body → headers →
//! transaction event → callbacks. Unmatched requests fall through to the CORS
//! preflight, then the proxy, then a 404.

use super::cors::preflight_headers;
use super::events::ServerEvent;
use super::response::{build_response, build_response_with_headers};
use crate::config::ServerOptions;
use crate::data::crud::{self, ResourceRequest};
use crate::data::BucketStore;
use crate::effects::{callbacks, file, proxy, FileResolver, HttpTransport, ScheduledCallback};
use crate::environment::{BodyType, Environment, Header, RouteResponse};
use crate::error::EngineError;
use crate::metrics;
use crate::routing::{RequestMatcher, RouteMatch, RouteTable, RESOURCE_ID_PARAM};
use crate::selection::{ResponseSelector, Selection};
use crate::template::{stringify, HandlebarsRenderer, RenderScope, RequestContext};
use crate::transaction::{Exchange, Transaction};
use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::http::request::Parts;
use hyper::{Request, Response, StatusCode};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Value used for a header whose template fails to render.
pub const HEADER_PARSING_ERROR: &str = "-- Header parsing error --";

/// Everything a request needs, shared by all connections of one instance.
pub struct EngineState {
    environment: Environment,
    options: ServerOptions,
    matcher: RequestMatcher,
    selector: ResponseSelector,
    buckets: BucketStore,
    renderer: HandlebarsRenderer,
    files: FileResolver,
    transport: Arc<dyn HttpTransport>,
    proxy_target: Option<reqwest::Url>,
    events: broadcast::Sender<ServerEvent>,
    shutdown: CancellationToken,
}

/// Response being assembled for one exchange.
struct Reply {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Bytes,
    route_id: Option<String>,
    response_id: Option<String>,
    proxied: bool,
    callbacks: Vec<ScheduledCallback>,
}

impl Reply {
    fn new(status: StatusCode, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
            route_id: None,
            response_id: None,
            proxied: false,
            callbacks: Vec::new(),
        }
    }

    fn from_error(error: &EngineError) -> Self {
        let body = serde_json::json!({ "error": error.client_message() }).to_string();
        Self::new(
            error.status(),
            vec![("Content-Type".to_string(), "application/json".to_string())],
            body,
        )
    }
}

impl EngineState {
    pub fn new(
        environment: Environment,
        options: ServerOptions,
        transport: Arc<dyn HttpTransport>,
        events: broadcast::Sender<ServerEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let table = RouteTable::build(&environment, &options.disabled_routes);
        info!(
            "Environment '{}' serves {} concrete routes",
            environment.name,
            table.len()
        );
        let buckets = BucketStore::from_environment(&environment);
        let files = FileResolver::new(options.environment_directory());
        let proxy_target = proxy::proxy_target(&environment);
        Self {
            environment,
            options,
            matcher: RequestMatcher::new(table),
            selector: ResponseSelector::new(),
            buckets,
            renderer: HandlebarsRenderer::new(),
            files,
            transport,
            proxy_target,
            events,
            shutdown,
        }
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn selector(&self) -> &ResponseSelector {
        &self.selector
    }

    pub fn buckets(&self) -> &BucketStore {
        &self.buckets
    }

    pub fn proxy_enabled(&self) -> bool {
        self.proxy_target.is_some()
    }

    fn emit(&self, event: ServerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_error(&self, error: &EngineError) {
        self.emit(ServerEvent::Error {
            code: error.code().to_string(),
            message: error.to_string(),
        });
    }

    /// Sleep for an artificial latency. Returns false when the instance is
    /// stopping.
    async fn delay(&self, latency_ms: u64) -> bool {
        if latency_ms == 0 {
            return true;
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(Duration::from_millis(latency_ms)) => true,
        }
    }

    /// Answer one request whose body has been collected.
    pub async fn respond(&self, parts: &Parts, body: Bytes, remote: SocketAddr) -> Response<Full<Bytes>> {
        let started = Instant::now();
        let method = parts.method.as_str().to_uppercase();
        let context = RequestContext::from_parts(&method, parts.uri.path(), parts.uri.query(), &parts.headers, &body)
            .with_ip(remote.ip().to_string());

        let (context, reply) = self.resolve(context, body).await;

        let response_headers = reply.headers.clone();
        let callback_ids: Vec<String> = reply.callbacks.iter().map(|c| c.uuid.clone()).collect();
        let transaction = Transaction::from_exchange(Exchange {
            request: &context,
            status_code: reply.status.as_u16(),
            response_headers: &response_headers,
            response_body: &reply.body,
            route_id: reply.route_id.as_deref(),
            route_response_id: reply.response_id.as_deref(),
            proxied: reply.proxied,
            callbacks: &callback_ids,
            completed_at: Utc::now(),
        });
        info!(
            "{} {} -> {}{}",
            method,
            context.path,
            reply.status.as_u16(),
            if reply.proxied { " (proxied)" } else { "" }
        );
        self.emit(ServerEvent::TransactionComplete(Box::new(transaction)));
        metrics::record_request(&method, reply.status.as_u16(), started.elapsed().as_secs_f64() * 1000.0);

        if !reply.callbacks.is_empty() {
            callbacks::dispatch(
                reply.callbacks,
                Arc::clone(&self.transport),
                self.events.clone(),
                self.shutdown.clone(),
            );
        }
        build_response_with_headers(reply.status, response_headers, reply.body)
    }

    async fn resolve(&self, context: RequestContext, body: Bytes) -> (RequestContext, Reply) {
        if !self.delay(self.environment.latency).await {
            return (context, stopping_reply());
        }

        // Candidates are tried most specific first; a route that yields no
        // response hands the request to the next one.
        let mut context = context;
        for found in self.matcher.find_all(&context.method, &context.raw_path) {
            context = context.with_params(found.params.clone());
            let selection = self.selector.select(&found.route, &self.renderer, &self.buckets, &context);
            if let Some(index) = selection.response_index {
                let reply = self.serve_route(&found, index, selection, &context).await;
                return (context, reply);
            }
            debug!("Route {} yielded no response, trying the next match", found.route.route_id);
        }

        let context = context.with_params(BTreeMap::new());
        let reply = self.serve_unmatched(&context, body).await;
        (context, reply)
    }

    // ========================================================================
    // Matched routes
    // ========================================================================

    async fn serve_route(
        &self,
        found: &RouteMatch,
        index: usize,
        selection: Selection,
        context: &RequestContext,
    ) -> Reply {
        let route = &found.route;
        let response = &route.responses[index];
        if !self.delay(response.latency).await {
            return stopping_reply();
        }

        let scope = RenderScope::new(&self.renderer, &self.buckets, context, selection.request_number);
        let mut reply = match self.produce_body(found, index, selection, response, &scope).await {
            Ok(reply) => reply,
            Err(error) => {
                warn!("Route {} failed: {}", route.route_id, error);
                self.emit_error(&error);
                Reply::from_error(&error)
            }
        };

        let route_headers = render_headers(&response.headers, &scope, "header");
        let environment_headers = render_headers(&self.environment.headers, &scope, "header");
        reply.headers = merge_headers(environment_headers, std::mem::take(&mut reply.headers), route_headers);
        reply.route_id = Some(route.route_id.clone());
        reply.response_id = Some(response.uuid.clone());
        reply.callbacks = callbacks::schedule(
            &response.callbacks,
            &self.environment,
            &scope,
            &self.files,
            self.options.max_callback_latency_ms.map(Duration::from_millis),
        );
        reply
    }

    async fn produce_body(
        &self,
        found: &RouteMatch,
        index: usize,
        selection: Selection,
        response: &RouteResponse,
        scope: &RenderScope<'_>,
    ) -> Result<Reply, EngineError> {
        let status = status_code(response.status_code);

        if let Some(binding) = found.route.resource.as_ref().filter(|b| b.response_index == index) {
            return self.resource_action(found, binding, scope);
        }

        match response.body_type {
            BodyType::Databucket => {
                let value = scope
                    .bucket(&response.databucket_id)
                    .ok_or_else(|| EngineError::DataBucketNotFound(response.databucket_id.clone()))?;
                let mut headers = Vec::new();
                if !value.is_string() {
                    headers.push(("Content-Type".to_string(), "application/json".to_string()));
                }
                Ok(Reply::new(status, headers, stringify(&value)))
            }
            BodyType::File => {
                let range = scope.request().header("range").map(str::to_string);
                match file::serve(&self.files, response, range.as_deref(), scope).await {
                    Ok(file_reply) => Ok(Reply::new(
                        file_reply.status.map(status_code).unwrap_or(status),
                        file_reply.headers,
                        file_reply.body,
                    )),
                    Err(EngineError::FileServing(reason)) if response.fallback_to404 => {
                        debug!("File unavailable ({}), falling back to 404", reason);
                        let body = self.render_inline(response, scope)?;
                        Ok(Reply::new(StatusCode::NOT_FOUND, Vec::new(), body))
                    }
                    Err(error) => {
                        if matches!(error, EngineError::Render(_)) {
                            metrics::record_template_error("file");
                        }
                        Err(error)
                    }
                }
            }
            BodyType::Inline => {
                let body = self.render_inline(response, scope)?;
                if selection.used_default_fallback && response.fallback_to404 && body.is_empty() {
                    return Ok(Reply::new(StatusCode::NOT_FOUND, Vec::new(), body));
                }
                Ok(Reply::new(status, Vec::new(), body))
            }
        }
    }

    fn render_inline(&self, response: &RouteResponse, scope: &RenderScope<'_>) -> Result<String, EngineError> {
        if response.disable_templating {
            return Ok(response.body.clone());
        }
        scope.render(&response.body).map_err(|e| {
            metrics::record_template_error("body");
            EngineError::Render(e.to_string())
        })
    }

    fn resource_action(
        &self,
        found: &RouteMatch,
        binding: &crate::routing::ResourceBinding,
        scope: &RenderScope<'_>,
    ) -> Result<Reply, EngineError> {
        let request = scope.request();
        let body = match (&request.body, request.raw_body.is_empty()) {
            (Some(parsed), _) => parsed.clone(),
            (None, false) => Value::String(request.raw_body.clone()),
            (None, true) => Value::Object(Map::new()),
        };
        let resource_request = ResourceRequest {
            key: &binding.key,
            id: found.params.get(RESOURCE_ID_PARAM).map(String::as_str),
            query: &request.query,
            body,
        };

        let outcome = self
            .buckets
            .with_value_mut(
                &binding.bucket_id,
                |template| scope.evaluate_bucket(template),
                |value| crud::apply(binding.operation, value, resource_request),
            )
            .ok_or_else(|| EngineError::DataBucketNotFound(binding.bucket_id.clone()))?;

        let mut headers = outcome.headers.clone();
        if outcome.is_json() && outcome.status != 204 {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }
        Ok(Reply::new(status_code(outcome.status), headers, outcome.body_text()))
    }

    // ========================================================================
    // Unmatched requests
    // ========================================================================

    async fn serve_unmatched(&self, context: &RequestContext, body: Bytes) -> Reply {
        let scope = RenderScope::new(&self.renderer, &self.buckets, context, 0);

        if context.method == "OPTIONS" && self.environment.cors {
            let environment_headers = render_headers(&self.environment.headers, &scope, "header");
            return Reply::new(StatusCode::OK, preflight_headers(&environment_headers), Bytes::new());
        }

        if let Some(target) = &self.proxy_target {
            return self.proxy(target, &scope, body).await;
        }

        let error = EngineError::RouteNotFound {
            method: context.method.clone(),
            path: context.path.clone(),
        };
        debug!("{}", error);
        let environment_headers = render_headers(&self.environment.headers, &scope, "header");
        let mut reply = Reply::from_error(&error);
        reply.headers = merge_headers(environment_headers, reply.headers, Vec::new());
        reply
    }

    async fn proxy(&self, target: &reqwest::Url, scope: &RenderScope<'_>, body: Bytes) -> Reply {
        let request_headers: Vec<(String, String)> = scope
            .request()
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let outbound = proxy::build_request(&self.environment, target, scope, &request_headers, body);

        let mut reply = match proxy::forward(self.transport.as_ref(), outbound).await {
            Ok(upstream) => {
                metrics::record_proxied(Some(upstream.status));
                let relayed = proxy::relay_headers(&upstream.headers, &self.environment, scope);
                let environment_headers = render_headers(&self.environment.headers, scope, "header");
                Reply::new(
                    status_code(upstream.status),
                    merge_headers(environment_headers, relayed, Vec::new()),
                    upstream.body,
                )
            }
            Err(error) => {
                metrics::record_proxied(None);
                self.emit_error(&error);
                Reply::from_error(&error)
            }
        };
        reply.proxied = true;
        reply
    }
}

/// hyper service entry point.
pub async fn handle_request(
    req: Request<Incoming>,
    state: Arc<EngineState>,
    remote: SocketAddr,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = match super::response::collect_body(req).await {
        Ok(collected) => collected,
        Err(e) => {
            warn!("{}", e);
            return Ok(build_response(StatusCode::BAD_REQUEST, e));
        }
    };
    Ok(state.respond(&parts, body, remote).await)
}

fn stopping_reply() -> Reply {
    let body = serde_json::json!({ "error": "Server is stopping" }).to_string();
    Reply::new(
        StatusCode::SERVICE_UNAVAILABLE,
        vec![("Content-Type".to_string(), "application/json".to_string())],
        body,
    )
}

fn status_code(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or_else(|_| {
        warn!("Invalid status code {}, answering 500", code);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Render configured headers. Values that fail to render are replaced with
/// [`HEADER_PARSING_ERROR`].
fn render_headers(headers: &[Header], scope: &RenderScope<'_>, source: &str) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|h| !h.key.trim().is_empty())
        .map(|h| {
            let value = scope.render(&h.value).unwrap_or_else(|e| {
                warn!("Header '{}' failed to render: {}", h.key, e);
                metrics::record_template_error(source);
                HEADER_PARSING_ERROR.to_string()
            });
            (h.key.clone(), value)
        })
        .collect()
}

/// Layer headers by precedence: route headers over body headers (content
/// type, ranges, resource counts) over environment headers. Names compare
/// case-insensitively; repeated names within one layer are all kept.
fn merge_headers(
    environment: Vec<(String, String)>,
    body: Vec<(String, String)>,
    route: Vec<(String, String)>,
) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = Vec::new();
    for layer in [environment, body, route] {
        let names: Vec<String> = layer.iter().map(|(k, _)| k.to_ascii_lowercase()).collect();
        merged.retain(|(k, _)| !names.contains(&k.to_ascii_lowercase()));
        merged.extend(layer);
    }
    merged
}
