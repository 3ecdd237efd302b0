//! Fulfillment side effects for the storefront core.
//!
//! This crate provides the parts of order fulfillment that live outside
//! the order's atomic unit:
//! - Message publisher and metrics sink ports with in-memory, NATS and
//!   Prometheus implementations
//! - The [`FulfillmentDispatcher`], an order observer that emits
//!   best-effort messages and metrics for lifecycle events
//! - Background loops for the lifecycle scheduler and the guest session sweep

pub mod dispatcher;
pub mod error;
pub mod publisher;
pub mod scheduler;
pub mod sink;

pub use dispatcher::{DEFAULT_EMIT_TIMEOUT, FulfillmentDispatcher, Notification};
pub use error::{MetricsError, PublishError};
pub use publisher::{
    InMemoryPublisher, MessagePublisher, NatsPublisher, PublishedMessage,
    TOPIC_ORDER_NOTIFICATIONS, TOPIC_ORDER_PROCESSING,
};
pub use scheduler::{
    DEFAULT_LIFECYCLE_INTERVAL, DEFAULT_SESSION_SWEEP_INTERVAL, spawn_lifecycle_scheduler,
    spawn_session_sweeper,
};
pub use sink::{InMemoryMetrics, MetricSample, MetricsSink, PrometheusSink};
