//! HTTP boundary for the execution engine
//!
//! Exposes `POST /execute` for running code, `GET /metrics` for the per-mode
//! rollup and `GET /health` for warm-up and pool state. Handlers are thin:
//! they translate JSON into engine calls and engine errors into status codes.

pub mod error;

pub use error::{Result, ServerError};

use axum::extract::{DefaultBodyLimit, Json as AxumJson, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::{middleware, Router};
use lambda_core::{Engine, ExecutionError, ExecutionRequest, WarmupState};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Body of `POST /execute`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteBody {
    pub code: String,
    pub lang: String,
    #[serde(rename = "useGVisor", default)]
    pub use_gvisor: bool,
    #[serde(default)]
    pub token: String,
}

impl From<ExecuteBody> for ExecutionRequest {
    fn from(body: ExecuteBody) -> Self {
        ExecutionRequest {
            code: body.code,
            lang: body.lang,
            use_gvisor: body.use_gvisor,
            token: body.token,
        }
    }
}

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub warmup: WarmupState,
    pub pools: BTreeMap<String, BTreeMap<String, usize>>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
}

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Enable CORS
    pub enable_cors: bool,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
    /// Enable request logging
    pub enable_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3001)),
            enable_cors: true,
            max_body_size: 1024 * 1024, // 1MB
            enable_logging: true,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Parse and set the bind address from a string.
    pub fn with_bind_addr_str(self, addr: &str) -> Result<Self> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| ServerError::config_error(format!("Invalid bind address '{}': {}", addr, e)))?;
        Ok(self.with_bind_addr(addr))
    }

    pub fn with_cors(mut self, enable: bool) -> Self {
        self.enable_cors = enable;
        self
    }

    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    pub fn with_logging(mut self, enable: bool) -> Self {
        self.enable_logging = enable;
        self
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Status code for each failure class. Infrastructure and user-code failures
/// carry distinct `kind`s in the body even where the status is shared.
pub fn execution_status(error: &ExecutionError) -> StatusCode {
    match error {
        ExecutionError::Unauthorized => StatusCode::UNAUTHORIZED,
        ExecutionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ExecutionError::ContainerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ExecutionError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ExecutionError::StagingFailed(_) | ExecutionError::RuntimeError(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Handler for the /execute POST endpoint.
async fn execute_handler(
    State(app_state): State<AppState>,
    AxumJson(body): AxumJson<ExecuteBody>,
) -> std::result::Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    log::debug!(
        "Received execute request: lang={} gvisor={} code_len={}",
        body.lang,
        body.use_gvisor,
        body.code.len()
    );

    match app_state.engine.dispatcher().execute(body.into()).await {
        Ok(result) => Ok(Json(json!({ "output": result.output }))),
        Err(ExecutionError::Unauthorized) => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Unauthorized" })),
        )),
        Err(e) => {
            let status = execution_status(&e);
            if e.is_infrastructure() {
                log::error!("Execution failed ({}): {}", e.kind(), e);
            }
            Err((
                status,
                Json(json!({
                    "error": e.to_string(),
                    "kind": e.kind(),
                    "timestamp": chrono::Utc::now()
                })),
            ))
        }
    }
}

/// Handler for the /metrics GET endpoint.
async fn metrics_handler(State(app_state): State<AppState>) -> Json<serde_json::Value> {
    let report = app_state.engine.metrics().report().await;
    Json(json!(report))
}

/// Handler for the /health GET endpoint.
async fn health_handler(State(app_state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let warmup = app_state.engine.warmup_state();
    let (status, code) = match warmup {
        WarmupState::Pending => ("warming", StatusCode::OK),
        WarmupState::Ready { failed: 0, .. } => ("healthy", StatusCode::OK),
        WarmupState::Ready { .. } => ("degraded", StatusCode::OK),
        WarmupState::Failed { .. } => ("unhealthy", StatusCode::SERVICE_UNAVAILABLE),
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            warmup,
            pools: app_state.engine.pool_sizes().await,
            timestamp: chrono::Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

pub struct LambdaServer {
    engine: Arc<Engine>,
    config: ServerConfig,
}

impl LambdaServer {
    /// Create a new server with the given engine and default configuration.
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            config: ServerConfig::default(),
        }
    }

    /// Create a new server with custom configuration.
    pub fn with_config(engine: Arc<Engine>, config: ServerConfig) -> Self {
        Self { engine, config }
    }

    /// Build the Axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            engine: self.engine.clone(),
        };

        let mut router = Router::new()
            .route("/execute", post(execute_handler))
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .layer(DefaultBodyLimit::max(self.config.max_body_size))
            .with_state(state);

        if self.config.enable_logging {
            router = router.layer(middleware::from_fn(
                |request: axum::http::Request<axum::body::Body>, next: axum::middleware::Next| async {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    let method = request.method().clone();
                    let uri = request.uri().clone();

                    // Health probes are frequent; keep them out of the info log.
                    if uri.path() == "/health" {
                        log::debug!("Request {} {} {}", request_id, method, uri);
                    } else {
                        log::info!("Request {} {} {}", request_id, method, uri);
                    }

                    let start = std::time::Instant::now();
                    let response = next.run(request).await;
                    let duration = start.elapsed();

                    if uri.path() == "/health" {
                        log::debug!("Response {} {} in {:?}", request_id, response.status(), duration);
                    } else {
                        log::info!("Response {} {} in {:?}", request_id, response.status(), duration);
                    }

                    response
                },
            ));
        }

        router = router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            router = router.layer(CorsLayer::permissive());
        }

        router
    }

    /// Start the server with graceful shutdown support.
    ///
    /// The server will shut down when the provided shutdown signal is received.
    pub async fn serve_with_shutdown<F>(self, shutdown_signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| {
                ServerError::config_error(format!(
                    "Failed to bind to {}: {}",
                    self.config.bind_addr, e
                ))
            })?;

        log::info!("Execution engine listening on {}", self.config.bind_addr);
        log::info!("Execute endpoint: http://{}/execute", self.config.bind_addr);
        log::info!("Metrics endpoint: http://{}/metrics", self.config.bind_addr);
        log::info!("Health check: http://{}/health", self.config.bind_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ServerError::internal(format!("Server error: {}", e)))?;

        log::info!("HTTP server shut down gracefully");
        Ok(())
    }
}

/// Utility function to create a shutdown signal from Ctrl+C.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}
