//! Non-transactional observer of committed order changes.

use async_trait::async_trait;
use serde::Serialize;
use store::OrderRecord;

/// A committed order change that external systems may want to hear about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleEvent {
    OrderPlaced { order: OrderRecord },
    OrderShipped { order: OrderRecord },
    OrderDelivered { order: OrderRecord },
}

impl LifecycleEvent {
    pub fn order(&self) -> &OrderRecord {
        match self {
            LifecycleEvent::OrderPlaced { order }
            | LifecycleEvent::OrderShipped { order }
            | LifecycleEvent::OrderDelivered { order } => order,
        }
    }

    /// Stable name used to route notifications.
    pub fn event_type(&self) -> &'static str {
        match self {
            LifecycleEvent::OrderPlaced { .. } => "ORDER_PLACED",
            LifecycleEvent::OrderShipped { .. } => "ORDER_SHIPPED",
            LifecycleEvent::OrderDelivered { .. } => "ORDER_DELIVERED",
        }
    }

    /// Tracking number to quote in a shipping notice.
    ///
    /// Falls back to `TRACK-<order number>` when no tracking was recorded.
    pub fn tracking_number(&self) -> String {
        let order = self.order();
        match &order.tracking {
            Some(tracking) => tracking.tracking_number.clone(),
            None => format!("TRACK-{}", order.order_number),
        }
    }
}

/// Receives lifecycle events after the state change has committed.
///
/// Implementations must not fail the caller: they handle their own errors.
/// The domain additionally bounds each call with a timeout.
#[async_trait]
pub trait OrderObserver: Send + Sync {
    async fn on_event(&self, event: &LifecycleEvent);
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

#[async_trait]
impl OrderObserver for NoopObserver {
    async fn on_event(&self, _event: &LifecycleEvent) {}
}
