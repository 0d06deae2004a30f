//! Lifecycle of one running environment: bind, accept, serve, stop.

use super::events::ServerEvent;
use super::handler::{handle_request, EngineState};
use super::tls::acceptor_for;
use crate::config::ServerOptions;
use crate::effects::{HttpTransport, ReqwestTransport};
use crate::environment::Environment;
use crate::error::EngineError;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const EVENT_CAPACITY: usize = 1024;

/// A bound, serving environment.
pub struct ServerInstance {
    state: Arc<EngineState>,
    address: SocketAddr,
    events: broadcast::Sender<ServerEvent>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown: CancellationToken,
}

impl ServerInstance {
    /// Start serving `environment` with the default HTTP transport.
    pub async fn start(environment: Environment, options: ServerOptions) -> Result<Self, EngineError> {
        Self::start_with_transport(environment, options, Arc::new(ReqwestTransport)).await
    }

    /// Start serving with a custom transport for proxying and callbacks.
    ///
    /// TLS material is loaded before binding, so both fatal errors surface
    /// before any request is accepted.
    pub async fn start_with_transport(
        mut environment: Environment,
        options: ServerOptions,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, EngineError> {
        if let Some(hostname) = &options.hostname_override {
            environment.hostname = hostname.clone();
        }
        if let Some(port) = options.port_override {
            environment.port = port;
        }

        let acceptor = acceptor_for(&environment.tls_options, &options.environment_directory())?;

        let host = if environment.hostname.trim().is_empty() {
            "0.0.0.0".to_string()
        } else {
            environment.hostname.trim().to_string()
        };
        let port = environment.port;
        let listener = TcpListener::bind((host.as_str(), port))
            .await
            .map_err(|e| EngineError::Bind {
                address: format!("{host}:{port}"),
                reason: e.to_string(),
            })?;
        let address = listener.local_addr().map_err(|e| EngineError::Bind {
            address: format!("{host}:{port}"),
            reason: e.to_string(),
        })?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);
        let shutdown = CancellationToken::new();
        let state = Arc::new(EngineState::new(
            environment,
            options,
            transport,
            events.clone(),
            shutdown.clone(),
        ));

        let scheme = if acceptor.is_some() { "https" } else { "http" };
        info!(
            "Environment '{}' listening on {}://{}",
            state.environment().name,
            scheme,
            address
        );
        let _ = events.send(ServerEvent::Started { address });
        if state.proxy_enabled() {
            info!("Forwarding unmatched requests to {}", state.environment().proxy_host);
            let _ = events.send(ServerEvent::CreatingProxy);
        }

        spawn_accept_loop(listener, acceptor, Arc::clone(&state), shutdown_tx.subscribe());

        Ok(Self {
            state,
            address,
            events,
            shutdown_tx,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    /// Receive events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Stop accepting connections and cancel pending latencies and callbacks.
    pub fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Stopping environment '{}' on {}", self.state.environment().name, self.address);
        self.shutdown.cancel();
        let _ = self.shutdown_tx.send(());
        let _ = self.events.send(ServerEvent::Stopped);
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    state: Arc<EngineState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote)) => {
                            let state = Arc::clone(&state);
                            let acceptor = acceptor.clone();
                            tokio::spawn(async move {
                                let service = service_fn(move |req| {
                                    let state = Arc::clone(&state);
                                    async move { handle_request(req, state, remote).await }
                                });
                                let served = match acceptor {
                                    Some(acceptor) => match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            http1::Builder::new()
                                                .serve_connection(TokioIo::new(tls_stream), service)
                                                .await
                                        }
                                        Err(e) => {
                                            debug!("TLS handshake with {} failed: {}", remote, e);
                                            return;
                                        }
                                    },
                                    None => {
                                        http1::Builder::new()
                                            .serve_connection(TokioIo::new(stream), service)
                                            .await
                                    }
                                };
                                if let Err(e) = served {
                                    debug!("Connection error from {}: {}", remote, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Accept loop shutting down");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::TlsOptions;

    fn options() -> ServerOptions {
        ServerOptions {
            hostname_override: Some("127.0.0.1".to_string()),
            port_override: Some(0),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_binds_ephemeral_port() {
        let instance = ServerInstance::start(Environment::default(), options()).await.unwrap();
        assert_ne!(instance.local_addr().port(), 0);
        instance.stop();
    }

    #[tokio::test]
    async fn test_port_in_use_is_bind_error() {
        let first = ServerInstance::start(Environment::default(), options()).await.unwrap();
        let taken = ServerOptions {
            port_override: Some(first.local_addr().port()),
            ..options()
        };
        let err = ServerInstance::start(Environment::default(), taken).await.err().unwrap();
        assert!(matches!(err, EngineError::Bind { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_missing_tls_material_fails_before_binding() {
        let environment = Environment {
            tls_options: TlsOptions {
                enabled: true,
                cert_path: "missing.pem".into(),
                key_path: "missing.key".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = ServerInstance::start(environment, options()).await.err().unwrap();
        assert!(matches!(err, EngineError::TlsMaterial(_)));
    }

    #[tokio::test]
    async fn test_stop_publishes_event() {
        let instance = ServerInstance::start(Environment::default(), options()).await.unwrap();
        let mut events = instance.subscribe();
        instance.stop();
        assert!(matches!(events.recv().await.unwrap(), ServerEvent::Stopped));
        // Second stop is a no-op
        instance.stop();
    }
}
