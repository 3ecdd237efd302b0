//! Fulfillment worker for the storefront core.
//!
//! Wires the record store, the order services and the side-effect
//! dispatcher together, runs the lifecycle scheduler and the guest session
//! sweep in the background, and serves `/health` and `/metrics`.

pub mod config;
pub mod error;
pub mod routes;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use domain::{GuestCartService, OrderService};
use fulfillment::{
    FulfillmentDispatcher, InMemoryPublisher, MessagePublisher, MetricsSink, NatsPublisher,
    PrometheusSink,
};
use metrics_exporter_prometheus::PrometheusHandle;
use store::Store;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use config::Config;
use error::WorkerError;

/// Shared state of the operational endpoints.
#[derive(Debug, Clone, Copy)]
pub struct AppState {
    pub store_backend: &'static str,
    pub publisher_backend: &'static str,
}

/// Creates the operational router.
pub fn create_app(state: AppState, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health))
        .with_state(state)
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
}

/// The domain services the worker drives.
#[derive(Clone)]
pub struct Services<S: Store> {
    pub orders: OrderService<S>,
    pub guests: GuestCartService<S>,
}

/// Builds the order and guest services with the dispatcher attached.
pub fn build_services<S: Store + Clone>(
    store: S,
    config: &Config,
    publisher: Arc<dyn MessagePublisher>,
    metrics: Arc<dyn MetricsSink>,
) -> Services<S> {
    let dispatcher = FulfillmentDispatcher::new(publisher, metrics)
        .with_emit_timeout(config.side_effect_timeout);

    let orders = OrderService::new(store.clone())
        .with_pricing(config.pricing)
        .with_observer(Arc::new(dispatcher))
        .with_observer_timeout(config.side_effect_timeout);
    let guests = GuestCartService::new(store).with_session_ttl(config.guest_session_ttl);

    Services { orders, guests }
}

/// Selects the message publisher: NATS when configured, otherwise in-memory.
pub async fn connect_publisher(
    config: &Config,
) -> Result<(Arc<dyn MessagePublisher>, &'static str), WorkerError> {
    match &config.nats_url {
        Some(url) => {
            let publisher = NatsPublisher::connect(url).await?;
            Ok((Arc::new(publisher), "nats"))
        }
        None => {
            tracing::warn!("NATS_URL not set, side-effect messages stay in memory");
            Ok((Arc::new(InMemoryPublisher::new()), "memory"))
        }
    }
}

/// Running background loops and the token that stops them.
pub struct BackgroundTasks {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Starts the lifecycle scheduler and the guest session sweep.
    pub fn spawn<S: Store + Clone + 'static>(services: &Services<S>, config: &Config) -> Self {
        let shutdown = CancellationToken::new();
        let handles = vec![
            fulfillment::spawn_lifecycle_scheduler(
                services.orders.clone(),
                config.scheduler_interval,
                shutdown.clone(),
            ),
            fulfillment::spawn_session_sweeper(
                services.guests.clone(),
                config.session_sweep_interval,
                shutdown.clone(),
            ),
        ];
        Self { shutdown, handles }
    }

    /// Signals every loop to stop and waits for them to finish.
    pub async fn stop(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Background task panicked");
            }
        }
    }
}

/// Runs the worker on `store` until `shutdown` resolves.
pub async fn run<S, F>(
    store: S,
    store_backend: &'static str,
    config: &Config,
    metrics_handle: PrometheusHandle,
    shutdown: F,
) -> Result<(), WorkerError>
where
    S: Store + Clone + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let (publisher, publisher_backend) = connect_publisher(config).await?;
    let services = build_services(store, config, publisher, Arc::new(PrometheusSink));
    let tasks = BackgroundTasks::spawn(&services, config);

    let app = create_app(
        AppState {
            store_backend,
            publisher_backend,
        },
        metrics_handle,
    );

    let addr = config.addr();
    tracing::info!(%addr, store = store_backend, publisher = publisher_backend, "starting worker");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    tasks.stop().await;
    served?;
    tracing::info!("worker shut down gracefully");
    Ok(())
}
