//! Metrics listener.
//!
//! Serves `GET /metrics` in the Prometheus text format and `GET /health`,
//! on a port separate from the mock environments.

use super::response::{build_response, build_response_with_headers};
use crate::metrics::collect_metrics;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info};

pub struct MetricsServer {
    listener: TcpListener,
}

impl MetricsServer {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self) -> anyhow::Result<()> {
        info!("Metrics listening on http://{}/metrics", self.local_addr()?);

        loop {
            let (stream, _) = self.listener.accept().await?;
            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                    Ok::<_, Infallible>(route(req.method(), req.uri().path()))
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Metrics connection error: {}", e);
                }
            });
        }
    }
}

fn route(method: &Method, path: &str) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/metrics") => build_response_with_headers(
            StatusCode::OK,
            [("Content-Type", "text/plain; version=0.0.4")],
            collect_metrics(),
        ),
        (&Method::GET, "/health") => build_response(StatusCode::OK, "ok"),
        _ => build_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics;

    #[test]
    fn test_unknown_paths_are_not_found() {
        assert_eq!(route(&Method::GET, "/").status(), StatusCode::NOT_FOUND);
        assert_eq!(route(&Method::POST, "/metrics").status(), StatusCode::NOT_FOUND);
        assert_eq!(route(&Method::GET, "/health").status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_serves_prometheus_text() {
        metrics::record_request("GET", 200, 3.0);
        let server = MetricsServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let task = tokio::spawn(server.run());

        let response = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body = response.text().await.unwrap();
        assert!(body.contains("mockpit_requests_total"));

        task.abort();
    }
}
