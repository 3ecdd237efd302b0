//! Best-effort side effects of order lifecycle events.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{LifecycleEvent, OrderObserver};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::error::{MetricsError, PublishError};
use crate::publisher::{MessagePublisher, TOPIC_ORDER_NOTIFICATIONS, TOPIC_ORDER_PROCESSING};
use crate::sink::MetricsSink;

/// Default bound on a single emission.
pub const DEFAULT_EMIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Notification published for customers and operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub event_type: &'static str,
    pub subject: String,
    pub message: String,
    pub order_id: String,
    pub order_number: String,
    /// Contact email when one is known.
    pub recipient: Option<String>,
}

impl Notification {
    /// Builds the notification for a lifecycle event.
    pub fn for_event(event: &LifecycleEvent) -> Self {
        let order = event.order();
        let recipient = order.owner.guest_email().map(str::to_string);

        let (subject, message) = match event {
            LifecycleEvent::OrderPlaced { .. } => (
                "Order Placed",
                format!(
                    "New order {} placed!\nCustomer: {}\nTotal: {}",
                    order.order_number,
                    recipient.as_deref().unwrap_or("registered customer"),
                    order.total
                ),
            ),
            LifecycleEvent::OrderShipped { .. } => (
                "Order Shipped",
                format!(
                    "Order {} has been shipped!\nTracking Number: {}",
                    order.order_number,
                    event.tracking_number()
                ),
            ),
            LifecycleEvent::OrderDelivered { .. } => (
                "Order Delivered",
                format!(
                    "Order {} has been delivered!\nThank you for shopping with us.",
                    order.order_number
                ),
            ),
        };

        Self {
            event_type: event.event_type(),
            subject: subject.to_string(),
            message,
            order_id: order.id.to_string(),
            order_number: order.order_number.clone(),
            recipient,
        }
    }
}

#[derive(Debug, Error)]
enum EmitError {
    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("timed out")]
    Timeout,
}

/// Observer that turns lifecycle events into messages and metrics.
///
/// On placement it enqueues a processing message, publishes a notification
/// and records `orders_placed` and `order_revenue`. Shipping and delivery
/// publish a notification and record `orders_shipped` or `orders_completed`.
/// Every emission is independent: it runs under its own timeout, and a
/// failure is logged and counted without affecting the others.
#[derive(Clone)]
pub struct FulfillmentDispatcher {
    publisher: Arc<dyn MessagePublisher>,
    metrics: Arc<dyn MetricsSink>,
    emit_timeout: Duration,
}

impl FulfillmentDispatcher {
    pub fn new(publisher: Arc<dyn MessagePublisher>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            publisher,
            metrics,
            emit_timeout: DEFAULT_EMIT_TIMEOUT,
        }
    }

    pub fn with_emit_timeout(mut self, timeout: Duration) -> Self {
        self.emit_timeout = timeout;
        self
    }

    async fn guarded<F, E>(&self, effect: &'static str, event: &LifecycleEvent, emission: F)
    where
        F: Future<Output = Result<(), E>>,
        E: Into<EmitError>,
    {
        let outcome = match tokio::time::timeout(self.emit_timeout, emission).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(EmitError::Timeout),
        };

        if let Err(e) = outcome {
            metrics::counter!("fulfillment_side_effect_failures_total", "effect" => effect)
                .increment(1);
            tracing::warn!(
                effect,
                event_type = event.event_type(),
                order_number = %event.order().order_number,
                error = %e,
                "Side effect failed"
            );
        }
    }

    async fn notify(&self, event: &LifecycleEvent) {
        let notification = Notification::for_event(event);
        self.guarded("notification", event, async {
            let payload = serde_json::to_value(&notification)?;
            self.publisher
                .publish(TOPIC_ORDER_NOTIFICATIONS, payload)
                .await
        })
        .await;
    }

    async fn count(&self, event: &LifecycleEvent, name: &'static str) {
        let tag = event.event_type().to_ascii_lowercase();
        self.guarded("metric", event, async {
            self.metrics.record(name, 1.0, &[("event", tag.as_str())]).await
        })
        .await;
    }

    async fn order_placed(&self, event: &LifecycleEvent) {
        let order = event.order();
        let tag = event.event_type().to_ascii_lowercase();

        let enqueue = self.guarded("processing_message", event, async {
            self.publisher
                .publish(TOPIC_ORDER_PROCESSING, json!({ "order_id": order.id.to_string() }))
                .await
        });
        let revenue = self.guarded("metric", event, async {
            self.metrics
                .record(
                    "order_revenue",
                    order.total.as_dollars_f64(),
                    &[("event", tag.as_str())],
                )
                .await
        });

        tokio::join!(
            enqueue,
            self.notify(event),
            self.count(event, "orders_placed"),
            revenue
        );
    }
}

#[async_trait]
impl OrderObserver for FulfillmentDispatcher {
    #[tracing::instrument(skip_all, fields(event_type = event.event_type()))]
    async fn on_event(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::OrderPlaced { .. } => self.order_placed(event).await,
            LifecycleEvent::OrderShipped { .. } => {
                tokio::join!(self.notify(event), self.count(event, "orders_shipped"));
            }
            LifecycleEvent::OrderDelivered { .. } => {
                tokio::join!(self.notify(event), self.count(event, "orders_completed"));
            }
        }
    }
}
