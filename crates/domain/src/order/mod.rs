//! Orders: checkout, queries, the status lifecycle and reorder.

mod lifecycle;
mod number;
mod observer;
mod service;

pub use lifecycle::{LifecyclePolicy, TickReport};
pub use number::{ORDER_NUMBER_PREFIX, OrderNumberSource, RandomOrderNumbers, format_order_number};
pub use observer::{LifecycleEvent, NoopObserver, OrderObserver};
pub use service::{DEFAULT_OBSERVER_TIMEOUT, OrderService};

use common::Money;
use serde::{Deserialize, Serialize};
use store::{OrderLine, OrderRecord, OrderStatus, ShippingAddress};

use crate::error::{DomainError, Result};

/// Note written to the history when an order is created.
pub const NOTE_ORDER_PLACED: &str = "Order placed";

/// Note written to the history when an order is cancelled.
pub const NOTE_ORDER_CANCELLED: &str = "Order cancelled";

/// What the shopper submits at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub shipping_address: ShippingAddress,
    pub promo_code: Option<String>,
}

impl CheckoutRequest {
    pub fn new(shipping_address: ShippingAddress) -> Self {
        Self {
            shipping_address,
            promo_code: None,
        }
    }

    pub fn with_promo_code(mut self, code: impl Into<String>) -> Self {
        self.promo_code = Some(code.into());
        self
    }
}

/// Rejects addresses with a blank field.
pub fn validate_shipping_address(address: &ShippingAddress) -> Result<()> {
    let fields = [
        ("line", &address.line),
        ("city", &address.city),
        ("state", &address.state),
        ("zip", &address.zip),
        ("country", &address.country),
    ];
    match fields.iter().find(|(_, value)| value.trim().is_empty()) {
        Some((name, _)) => Err(DomainError::InvalidShippingAddress(*name)),
        None => Ok(()),
    }
}

/// Outcome of putting a past order's items back in the cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderSummary {
    pub added: usize,
    pub skipped: usize,
}

/// Read model of an order. The subtotal is re-derived from the lines; every
/// other amount is the one stored at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub order_number: String,
    pub status: OrderStatus,
    pub lines: Vec<OrderLine>,
    pub item_count: u32,
    pub subtotal: Money,
    pub discount: Money,
    pub tax: Money,
    pub shipping: Money,
    pub total: Money,
    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
}

impl OrderSummary {
    pub fn from_order(order: &OrderRecord) -> Self {
        let subtotal: Money = order.lines.iter().map(OrderLine::total_price).sum();

        Self {
            order_number: order.order_number.clone(),
            status: order.status,
            lines: order.lines.clone(),
            item_count: order.lines.iter().map(|line| line.quantity).sum(),
            subtotal,
            discount: order.discount,
            tax: order.tax,
            shipping: order.shipping_cost,
            total: order.total,
            tracking_number: order.tracking.as_ref().map(|t| t.tracking_number.clone()),
            carrier: order.tracking.as_ref().map(|t| t.carrier.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> ShippingAddress {
        ShippingAddress {
            line: "1 Main St".to_string(),
            city: "Springfield".to_string(),
            state: "IL".to_string(),
            zip: "62701".to_string(),
            country: "US".to_string(),
        }
    }

    #[test]
    fn blank_address_fields_are_rejected() {
        assert!(validate_shipping_address(&address()).is_ok());

        let mut missing_zip = address();
        missing_zip.zip = "   ".to_string();
        assert!(matches!(
            validate_shipping_address(&missing_zip),
            Err(DomainError::InvalidShippingAddress("zip"))
        ));
    }
}
