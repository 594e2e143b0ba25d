//! Server assembly: state, router, health, and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::HeaderValue;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use oxbow_core::{ApiKeyHasher, WebhookSigner};
use oxbow_flow::admission::{AdmissionConfig, AdmissionController};
use oxbow_flow::broker::memory::{BrokerConfig, InMemoryBroker};
use oxbow_flow::broker::QueueBroker;
use oxbow_flow::budget::{BudgetAccountant, BudgetConfig};
use oxbow_flow::circuit::{CircuitBreakerConfig, CircuitRegistry};
use oxbow_flow::gate::{GateConfig, SubmissionGate, WebhookGate};
use oxbow_flow::handler::HandlerRegistry;
use oxbow_flow::outbox::{LogSink, OutboxRelay, RelayConfig};
use oxbow_flow::retry::BackoffPolicy;
use oxbow_flow::store::memory::MemoryStore;
use oxbow_flow::store::Store;
use oxbow_flow::worker::{WorkerConfig, WorkerPool};

use crate::config::Config;
use crate::metrics::{init_metrics, metrics_middleware, serve_metrics};
use crate::routes::{admin, stream, tasks, webhooks};

/// Shared application state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Durable store.
    pub store: Arc<dyn Store>,
    /// Queue broker.
    pub broker: Arc<dyn QueueBroker>,
    /// Idempotent submission gate.
    pub submission: Arc<SubmissionGate>,
    /// Webhook intake gate.
    pub webhooks: Arc<WebhookGate>,
    /// Circuit breaker registry.
    pub circuits: Arc<CircuitRegistry>,
    /// Budget accountant.
    pub budget: Arc<BudgetAccountant>,
    /// API key hasher.
    pub hasher: ApiKeyHasher,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("store", &"<Store>")
            .field("broker", &"<QueueBroker>")
            .finish()
    }
}

impl AppState {
    /// Builds application state over in-memory backends.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let broker: Arc<dyn QueueBroker> = Arc::new(InMemoryBroker::new(BrokerConfig {
            lease_ttl: config.task_lease,
            capacity: None,
        }));
        Self::with_backends(config, store, broker)
    }

    /// Builds application state over the given backends.
    #[must_use]
    pub fn with_backends(
        config: Config,
        store: Arc<dyn Store>,
        broker: Arc<dyn QueueBroker>,
    ) -> Self {
        let budget = Arc::new(BudgetAccountant::new(
            store.clone(),
            BudgetConfig {
                daily_budget_usd: config.daily_budget_usd,
                ..BudgetConfig::default()
            },
        ));
        let circuits = Arc::new(CircuitRegistry::new(
            store.clone(),
            CircuitBreakerConfig {
                failure_threshold: config.circuit_breaker_threshold,
                open_timeout: config.circuit_breaker_timeout,
                ..CircuitBreakerConfig::default()
            },
        ));
        let admission = Arc::new(AdmissionController::new(
            broker.clone(),
            budget.clone(),
            circuits.clone(),
            AdmissionConfig {
                max_queue_depth: config.max_queue_depth,
            },
        ));
        let gate_config = GateConfig {
            max_retries: config.task_max_retries,
        };
        let submission = Arc::new(SubmissionGate::new(
            store.clone(),
            broker.clone(),
            admission.clone(),
            gate_config,
        ));
        let webhooks = Arc::new(WebhookGate::new(
            store.clone(),
            broker.clone(),
            admission,
            WebhookSigner::new(&config.webhook_secret),
            gate_config,
        ));
        let hasher = ApiKeyHasher::new(&config.api_key_salt);

        Self {
            config,
            store,
            broker,
            submission,
            webhooks,
            circuits,
            budget,
            hasher,
        }
    }

    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            max_concurrency: self.config.max_concurrency,
            lease: self.config.task_lease,
            backoff: BackoffPolicy::new(
                std::time::Duration::from_secs(1),
                self.config.task_backoff_max,
            ),
            shutdown_grace: self.config.shutdown_grace,
            ..WorkerConfig::default()
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `healthy` or `degraded`.
    pub status: &'static str,
    /// Per-dependency reachability.
    pub checks: HealthChecks,
}

/// Per-dependency health booleans.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Durable store reachable.
    pub store: bool,
    /// Queue broker reachable.
    pub broker: bool,
}

async fn health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> impl IntoResponse {
    let store = state.store.ping().await.is_ok();
    let broker = state.broker.ping().await.is_ok();
    let healthy = store && broker;

    let status = if healthy {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "degraded" },
            checks: HealthChecks { store, broker },
        }),
    )
}

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "oxbow",
        "status": "operational",
    }))
}

fn cors_layer(config: &Config) -> CorsLayer {
    if config.cors_allowed_origins.is_empty() {
        return CorsLayer::new();
    }
    let origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Builds the full application router.
#[must_use]
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(serve_metrics))
        .route("/tasks", post(tasks::submit_task))
        .route("/tasks/:id", get(tasks::get_task))
        .route("/stream/:id", get(stream::stream_task))
        .route("/webhooks/:source", post(webhooks::accept_webhook))
        .route("/admin/runs", get(admin::recent_runs))
        .route("/admin/dlq/:kind", get(admin::list_dlq))
        .route("/admin/dlq/:kind/drain", post(admin::drain_dlq))
        .route("/admin/keys", get(admin::list_keys).post(admin::create_key))
        .route("/admin/keys/:id", delete(admin::revoke_key))
        .route("/admin/keys/:id/rotate", post(admin::rotate_key))
        .route("/admin/circuits", get(admin::list_circuits))
        .route("/admin/budgets", get(admin::list_budgets))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// The API server: HTTP surface plus the embedded worker pool and outbox
/// relay.
pub struct Server {
    state: AppState,
    registry: Arc<HandlerRegistry>,
}

impl Server {
    /// Creates a server over in-memory backends with the given handlers.
    #[must_use]
    pub fn new(config: Config, registry: HandlerRegistry) -> Self {
        Self {
            state: AppState::new(config),
            registry: Arc::new(registry),
        }
    }

    /// Returns the shared state, for tests and embedding.
    #[must_use]
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Binds and serves until SIGINT/SIGTERM, then drains: the worker pools
    /// stop leasing immediately and in-flight handlers get the configured
    /// grace.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind or the server fails.
    pub async fn serve(self) -> std::io::Result<()> {
        init_metrics();

        let shutdown = CancellationToken::new();

        // Worker replicas share the store/broker and drain independently.
        let mut pool_handles = Vec::new();
        for replica in 0..self.state.config.worker_replicas {
            let pool = Arc::new(WorkerPool::new(
                self.state.store.clone(),
                self.state.broker.clone(),
                self.registry.clone(),
                self.state.circuits.clone(),
                self.state.budget.clone(),
                self.state.worker_config(),
            ));
            tracing::info!(replica, consumer_id = %pool.consumer_id(), "starting worker replica");

            let pool_shutdown = pool.shutdown_token();
            let parent = shutdown.clone();
            tokio::spawn(async move {
                parent.cancelled().await;
                pool_shutdown.cancel();
            });

            pool_handles.push(tokio::spawn(pool.run()));
        }

        let relay = OutboxRelay::new(
            self.state.store.clone(),
            Arc::new(LogSink),
            RelayConfig::default(),
            shutdown.child_token(),
        );
        let relay_handle = tokio::spawn(async move { relay.run().await });

        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                wait_for_signal().await;
                tracing::info!("shutdown signal received");
                shutdown.cancel();
            });
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        tracing::info!(%addr, "HTTP server listening");
        let listener = tokio::net::TcpListener::bind(addr).await?;

        let app = router(self.state);
        let serve_shutdown = shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
            .await?;

        // The pools observe the same token; wait for their drain.
        for handle in pool_handles {
            let _ = handle.await;
        }
        let _ = relay_handle.await;

        tracing::info!("server stopped");
        Ok(())
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(error) => {
                tracing::error!(%error, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
