//! Network module with deferred startup lifecycle.
//!
//! `new()` allocates the shared registries, `start()` binds the listener and
//! fixes the callback URLs (the bound port is only known then), and `serve()`
//! accepts connections until the shutdown future resolves.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tracing::{info, warn};

use super::config::{DispatchConfig, NetworkConfig, TlsConfig};
use super::connection::{OutboundMessage, WorkerConnectionRegistry};
use super::handlers::{
    completions_handler, ensure_error_body, health_handler, liveness_handler,
    readiness_handler, result_handler, result_stream_handler, AppState, CallbackEndpoints,
};
use super::middleware::build_http_layers;
use super::shutdown::{DispatchKind, ShutdownController};
use crate::bus::{MessageBus, ProducerCache};
use crate::correlation::CorrelationRegistry;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the gateway's HTTP/WebSocket server and its shared state.
pub struct NetworkModule {
    network: NetworkConfig,
    dispatch: DispatchConfig,
    listener: Option<TcpListener>,
    endpoints: Option<CallbackEndpoints>,
    correlation: Arc<CorrelationRegistry>,
    producers: Arc<ProducerCache>,
    workers: Arc<WorkerConnectionRegistry>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    /// Creates the module without binding any port.
    #[must_use]
    pub fn new(network: NetworkConfig, dispatch: DispatchConfig, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            network,
            dispatch,
            listener: None,
            endpoints: None,
            correlation: Arc::new(CorrelationRegistry::new()),
            producers: Arc::new(ProducerCache::new(bus)),
            workers: Arc::new(WorkerConnectionRegistry::new()),
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    #[must_use]
    pub fn correlation(&self) -> Arc<CorrelationRegistry> {
        Arc::clone(&self.correlation)
    }

    #[must_use]
    pub fn workers(&self) -> Arc<WorkerConnectionRegistry> {
        Arc::clone(&self.workers)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Callback URLs, available once `start()` has bound the listener.
    #[must_use]
    pub fn endpoints(&self) -> Option<&CallbackEndpoints> {
        self.endpoints.as_ref()
    }

    /// Binds the listener and returns the bound port.
    ///
    /// Port 0 binds an OS-assigned port; the callback URLs use the real one.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.network.host, self.network.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        let callback_host = self
            .network
            .advertise_host
            .as_deref()
            .unwrap_or(&self.network.host);
        let endpoints = CallbackEndpoints::new(callback_host, port, self.network.tls.is_some());
        info!(
            bind = %format!("{}:{port}", self.network.host),
            result_endpoint = %endpoints.result,
            stream_endpoint = %endpoints.stream,
            "TCP listener bound"
        );

        self.endpoints = Some(endpoints);
        self.listener = Some(listener);
        Ok(port)
    }

    fn state(&self, endpoints: CallbackEndpoints) -> AppState {
        AppState {
            correlation: Arc::clone(&self.correlation),
            producers: Arc::clone(&self.producers),
            workers: Arc::clone(&self.workers),
            shutdown: Arc::clone(&self.shutdown),
            network: Arc::new(self.network.clone()),
            dispatch: Arc::new(self.dispatch.clone()),
            endpoints: Arc::new(endpoints),
            start_time: Instant::now(),
        }
    }

    /// Assembles the router.
    ///
    /// Routes:
    /// - `POST /api/v1/chat/completions`
    /// - `POST /res` (bounded by the callback timeout)
    /// - `GET /res/ws`
    /// - `GET /health`, `/health/live`, `/health/ready`
    ///
    /// Every error response carries the standard error body.
    fn build_router(&self, state: AppState) -> Router {
        let callback_timeout =
            TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, self.network.callback_timeout);

        Router::new()
            .route("/api/v1/chat/completions", post(completions_handler))
            .route("/res", post(result_handler).layer(callback_timeout))
            .route("/res/ws", get(result_stream_handler))
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .layer(axum::middleware::map_response(ensure_error_body))
            .layer(DefaultBodyLimit::max(self.network.max_body_bytes))
            .layer(build_http_layers(&self.network))
            .with_state(state)
    }

    /// Serves until `shutdown` resolves, then drains.
    ///
    /// After the signal, streams end with an error event, worker sockets get
    /// a close frame, and in-flight requests get up to 30 seconds to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called, the TLS material cannot
    /// be loaded, or the server hits a fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let (Some(listener), Some(endpoints)) = (self.listener.take(), self.endpoints.take()) else {
            anyhow::bail!("start() must be called before serve()");
        };

        let router = self.build_router(self.state(endpoints));
        let workers = Arc::clone(&self.workers);
        let shutdown_ctrl = Arc::clone(&self.shutdown);

        // Flip the controller as soon as the signal fires so open streams and
        // worker sockets wind down while the server stops accepting.
        let signal_ctrl = Arc::clone(&shutdown_ctrl);
        let signal_workers = Arc::clone(&workers);
        let shutdown = async move {
            shutdown.await;
            signal_ctrl.trigger_shutdown();
            close_workers(&signal_workers);
        };

        shutdown_ctrl.set_ready();

        if let Some(tls_config) = &self.network.tls {
            serve_tls(listener, router, tls_config, shutdown).await?;
        } else {
            serve_plain(listener, router, shutdown).await?;
        }

        drain(&workers, &shutdown_ctrl).await;
        Ok(())
    }
}

async fn serve_plain(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!("Serving plain HTTP/WS connections");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

/// Serves TLS via `axum-server` with rustls, reusing the bound listener.
async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls_config: &TlsConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls_config = RustlsConfig::from_pem_file(&tls_config.cert_path, &tls_config.key_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load TLS certificates: {e}"))?;

    let addr = listener.local_addr()?;
    let std_listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        shutdown.await;
        shutdown_handle.graceful_shutdown(Some(DRAIN_TIMEOUT));
    });

    info!("Serving TLS connections on {}", addr);

    axum_server::from_tcp_rustls(std_listener, rustls_config)
        .handle(handle)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    Ok(())
}

/// Sends a close frame to every worker socket.
fn close_workers(workers: &WorkerConnectionRegistry) {
    let handles = workers.drain_all();
    if !handles.is_empty() {
        info!("Closing {} worker connections", handles.len());
    }
    for handle in &handles {
        let _ = handle.try_send(OutboundMessage::Close(Some(
            "server shutting down".to_string(),
        )));
    }
}

/// Final shutdown pass once the server stopped accepting.
async fn drain(workers: &WorkerConnectionRegistry, shutdown_ctrl: &ShutdownController) {
    shutdown_ctrl.trigger_shutdown();
    close_workers(workers);

    if shutdown_ctrl.wait_for_drain(DRAIN_TIMEOUT).await {
        info!("All in-flight requests drained");
    } else {
        warn!(
            single = shutdown_ctrl.in_flight_of(DispatchKind::Single),
            stream = shutdown_ctrl.in_flight_of(DispatchKind::Stream),
            "Drain timeout expired with requests remaining"
        );
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::bus::InMemoryBus;
    use crate::network::{ConnectionConfig, HealthState};

    fn module(network: NetworkConfig) -> NetworkModule {
        let (bus, _rx) = InMemoryBus::new();
        NetworkModule::new(network, DispatchConfig::default(), Arc::new(bus))
    }

    fn local() -> NetworkConfig {
        NetworkConfig {
            host: "127.0.0.1".to_string(),
            ..NetworkConfig::default()
        }
    }

    #[test]
    fn new_creates_module_without_binding() {
        let module = module(NetworkConfig::default());
        assert!(module.listener.is_none());
        assert!(module.endpoints().is_none());
    }

    #[test]
    fn shared_handles_are_the_same_arc() {
        let module = module(NetworkConfig::default());
        assert!(Arc::ptr_eq(&module.correlation(), &module.correlation()));
        assert!(Arc::ptr_eq(&module.workers(), &module.workers()));
        assert!(Arc::ptr_eq(
            &module.shutdown_controller(),
            &module.shutdown_controller()
        ));
    }

    #[tokio::test]
    async fn start_binds_and_builds_callback_urls() {
        let mut module = module(NetworkConfig {
            advertise_host: Some("gw-7.internal".to_string()),
            ..local()
        });
        let port = module.start().await.unwrap();
        assert!(port > 0);

        let endpoints = module.endpoints().unwrap();
        assert_eq!(endpoints.result, format!("http://gw-7.internal:{port}/res"));
        assert_eq!(endpoints.stream, format!("ws://gw-7.internal:{port}/res/ws"));
    }

    #[tokio::test]
    async fn callback_host_defaults_to_bind_host() {
        let mut module = module(local());
        let port = module.start().await.unwrap();
        assert_eq!(
            module.endpoints().unwrap().result,
            format!("http://127.0.0.1:{port}/res")
        );
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let module = module(NetworkConfig::default());
        let err = module.serve(std::future::pending::<()>()).await.unwrap_err();
        assert!(err.to_string().contains("start()"));
    }

    fn router(network: NetworkConfig) -> Router {
        let module = module(network);
        let state = module.state(CallbackEndpoints::new("gw.test", 8080, false));
        module.build_router(state)
    }

    async fn error_of(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        json["error"].clone()
    }

    #[tokio::test]
    async fn oversized_bodies_are_413_with_error_body() {
        let network = NetworkConfig {
            max_body_bytes: 16,
            ..local()
        };
        for uri in ["/api/v1/chat/completions", "/res"] {
            let request = Request::post(uri)
                .header("content-type", "application/json")
                .body(Body::from(vec![b' '; 64]))
                .unwrap();
            let response = router(network.clone()).oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE, "{uri}");
            let error = error_of(response).await;
            assert_eq!(error["message"], "Request body too large");
            assert_eq!(error["type"], "request_too_large_error");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_callback_is_408_with_error_body() {
        let network = NetworkConfig {
            callback_timeout: Duration::from_millis(50),
            ..local()
        };
        let stalled = futures_util::stream::pending::<Result<bytes::Bytes, std::io::Error>>();
        let request = Request::post("/res")
            .body(Body::from_stream(stalled))
            .unwrap();

        let response = router(network).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(error_of(response).await["type"], "request_timeout_error");
    }

    #[tokio::test]
    async fn unknown_route_and_wrong_method_have_error_body() {
        let response = router(local())
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(error_of(response).await["type"], "invalid_request_error");

        let response = router(local())
            .oneshot(
                Request::get("/api/v1/chat/completions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(error_of(response).await["message"], "Method Not Allowed");
    }

    #[tokio::test]
    async fn shutdown_closes_workers_and_stops() {
        let mut module = module(local());
        module.start().await.unwrap();
        let ctrl = module.shutdown_controller();
        let workers = module.workers();
        let (_conn, mut control) = workers.register(None, &ConnectionConfig::default());

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(module.serve(async move {
            let _ = rx.await;
        }));

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();

        assert_eq!(ctrl.health_state(), HealthState::Stopped);
        assert_eq!(workers.count(), 0);
        assert_eq!(
            control.recv().await,
            Some(OutboundMessage::Close(Some("server shutting down".into())))
        );
    }
}
