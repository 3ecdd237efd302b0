//! Time-based promotion rules for the order status lifecycle.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use store::{OrderRecord, OrderStatus};

/// How long after creation an order becomes due for each automatic step.
///
/// Every threshold is measured from `created_at`, not from the previous
/// transition, so an order that waited long enough may advance through more
/// than one status in a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePolicy {
    pub confirm_after: Duration,
    pub process_after: Duration,
    pub ship_after: Duration,
    pub deliver_after: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            confirm_after: Duration::minutes(1),
            process_after: Duration::minutes(2),
            ship_after: Duration::minutes(5),
            deliver_after: Duration::minutes(10),
        }
    }
}

impl LifecyclePolicy {
    /// Statuses scanned by the scheduler, in the order they are scanned.
    pub const BUCKETS: [OrderStatus; 4] = [
        OrderStatus::Pending,
        OrderStatus::Confirmed,
        OrderStatus::Processing,
        OrderStatus::Shipped,
    ];

    /// Age at which an order in `status` moves to the next forward status.
    pub fn dwell_for(&self, status: OrderStatus) -> Option<Duration> {
        match status {
            OrderStatus::Pending => Some(self.confirm_after),
            OrderStatus::Confirmed => Some(self.process_after),
            OrderStatus::Processing => Some(self.ship_after),
            OrderStatus::Shipped => Some(self.deliver_after),
            OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Refunded => None,
        }
    }

    /// Returns the status the order should move to at `now`, if it is due.
    ///
    /// Due means `created_at + dwell` is strictly before `now`.
    pub fn due_transition(&self, order: &OrderRecord, now: DateTime<Utc>) -> Option<OrderStatus> {
        let dwell = self.dwell_for(order.status)?;
        if order.created_at + dwell < now {
            order.status.next_forward()
        } else {
            None
        }
    }
}

/// Outcome of one scheduler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    /// Orders moved one status forward.
    pub promoted: usize,
    /// Orders that changed status concurrently and were left alone.
    pub conflicts: usize,
    /// Scans or promotions that failed and will be retried next tick.
    pub failures: usize,
}
