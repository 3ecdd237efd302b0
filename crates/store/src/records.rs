//! Persisted record shapes.

use chrono::{DateTime, Utc};
use common::{Money, OrderId, ProductId, SessionId, UserId};
use serde::{Deserialize, Serialize};

use crate::status::OrderStatus;

/// Catalog product as seen by the fulfillment core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    /// Current catalog price per unit.
    pub price: Money,
    /// Units available for sale. Never negative.
    pub stock_quantity: u32,
    pub active: bool,
}

impl Product {
    /// Creates an active product.
    pub fn new(name: impl Into<String>, price: Money, stock_quantity: u32) -> Self {
        Self {
            id: ProductId::new(),
            name: name.into(),
            price,
            stock_quantity,
            active: true,
        }
    }
}

/// Owner of a cart: a registered user or an anonymous session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CartOwner {
    User(UserId),
    Guest(SessionId),
}

impl std::fmt::Display for CartOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CartOwner::User(id) => write!(f, "user:{id}"),
            CartOwner::Guest(id) => write!(f, "guest:{id}"),
        }
    }
}

/// One line of a cart. At most one line exists per (owner, product).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub owner: CartOwner,
    pub product_id: ProductId,
    /// Always at least 1.
    pub quantity: u32,
    pub added_at: DateTime<Utc>,
}

/// Anonymous shopping session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestSession {
    pub session_id: SessionId,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl GuestSession {
    /// Returns true once `now` is past the expiry instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// How a promo code computes its discount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscountRule {
    /// A share of the order amount, in basis points (2000 = 20 %).
    Percentage { basis_points: u32 },
    /// A flat amount off.
    Fixed { amount: Money },
}

impl DiscountRule {
    pub(crate) fn kind_str(&self) -> &'static str {
        match self {
            DiscountRule::Percentage { .. } => "PERCENTAGE",
            DiscountRule::Fixed { .. } => "FIXED",
        }
    }
}

/// A promotional code and its usage counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoCode {
    pub code: String,
    pub rule: DiscountRule,
    pub min_purchase: Option<Money>,
    /// Ceiling applied to percentage discounts.
    pub max_discount: Option<Money>,
    /// Global cap on redemptions; `None` is unlimited.
    pub usage_limit: Option<u32>,
    pub usage_count: u32,
    pub per_user_limit: u32,
    pub active: bool,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

impl PromoCode {
    /// Returns true if `now` falls inside the validity window (inclusive).
    pub fn is_within_window(&self, now: DateTime<Utc>) -> bool {
        now >= self.valid_from && now <= self.valid_until
    }

    /// Returns true if the global usage cap has been reached.
    pub fn is_exhausted(&self) -> bool {
        self.usage_limit
            .is_some_and(|limit| self.usage_count >= limit)
    }
}

/// A recorded redemption of a promo code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoUsage {
    pub code: String,
    /// `None` for guest orders.
    pub user_id: Option<UserId>,
    pub order_id: OrderId,
    pub discount: Money,
    pub used_at: DateTime<Utc>,
}

/// Redemption to record as part of an order commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPromoUsage {
    pub code: String,
    pub user_id: Option<UserId>,
    pub discount: Money,
}

/// Who an order belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderOwner {
    Registered(UserId),
    Guest {
        session_id: SessionId,
        email: Option<String>,
    },
}

impl OrderOwner {
    /// Returns the registered user, if any.
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            OrderOwner::Registered(id) => Some(*id),
            OrderOwner::Guest { .. } => None,
        }
    }

    /// Returns the guest contact email, if any.
    pub fn guest_email(&self) -> Option<&str> {
        match self {
            OrderOwner::Registered(_) => None,
            OrderOwner::Guest { email, .. } => email.as_deref(),
        }
    }
}

/// Shipping destination captured at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingAddress {
    pub line: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub country: String,
}

/// Carrier tracking details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracking {
    pub tracking_number: String,
    pub carrier: String,
    pub estimated_delivery: Option<DateTime<Utc>>,
}

/// Immutable snapshot of a purchased product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: u32,
    /// Catalog price at the moment of purchase.
    pub unit_price: Money,
}

impl OrderLine {
    /// Returns quantity * unit price.
    pub fn total_price(&self) -> Money {
        self.unit_price.multiply(self.quantity)
    }
}

/// A placed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: OrderId,
    pub order_number: String,
    pub owner: OrderOwner,
    pub lines: Vec<OrderLine>,
    pub subtotal: Money,
    pub discount: Money,
    pub tax: Money,
    pub shipping_cost: Money,
    pub total: Money,
    pub status: OrderStatus,
    pub shipping_address: ShippingAddress,
    pub tracking: Option<Tracking>,
    pub promo_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of an order's append-only audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

/// Everything committed atomically when an order is placed.
#[derive(Debug, Clone)]
pub struct NewOrder {
    /// The order to insert, in `Pending` status.
    pub order: OrderRecord,
    /// Cart emptied once the order is written.
    pub source_cart: CartOwner,
    /// Promo redemption to record against the new order.
    pub promo_usage: Option<NewPromoUsage>,
    /// Note of the initial history row.
    pub history_note: String,
}

/// A guarded status change.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub order_id: OrderId,
    /// Status the order must currently be in; `None` skips the guard.
    pub expected: Option<OrderStatus>,
    pub to: OrderStatus,
    pub note: String,
    /// Return every line's quantity to stock as part of the change.
    pub restock: bool,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn promo(now: DateTime<Utc>) -> PromoCode {
        PromoCode {
            code: "SAVE20".to_string(),
            rule: DiscountRule::Percentage {
                basis_points: 2_000,
            },
            min_purchase: None,
            max_discount: None,
            usage_limit: Some(2),
            usage_count: 0,
            per_user_limit: 1,
            active: true,
            valid_from: now - Duration::days(1),
            valid_until: now + Duration::days(1),
        }
    }

    #[test]
    fn session_expires_strictly_after_deadline() {
        let now = Utc::now();
        let session = GuestSession {
            session_id: SessionId::generate(),
            email: None,
            created_at: now,
            expires_at: now + Duration::hours(24),
        };
        assert!(!session.is_expired(now));
        assert!(!session.is_expired(session.expires_at));
        assert!(session.is_expired(session.expires_at + Duration::seconds(1)));
    }

    #[test]
    fn promo_window_is_inclusive() {
        let now = Utc::now();
        let code = promo(now);
        assert!(code.is_within_window(now));
        assert!(code.is_within_window(code.valid_until));
        assert!(!code.is_within_window(code.valid_until + Duration::seconds(1)));
        assert!(!code.is_within_window(code.valid_from - Duration::seconds(1)));
    }

    #[test]
    fn promo_exhausts_at_limit() {
        let mut code = promo(Utc::now());
        assert!(!code.is_exhausted());
        code.usage_count = 2;
        assert!(code.is_exhausted());
        code.usage_limit = None;
        assert!(!code.is_exhausted());
    }

    #[test]
    fn order_owner_accessors() {
        let user = UserId::new();
        assert_eq!(OrderOwner::Registered(user).user_id(), Some(user));
        let guest = OrderOwner::Guest {
            session_id: SessionId::generate(),
            email: Some("guest@example.com".to_string()),
        };
        assert_eq!(guest.user_id(), None);
        assert_eq!(guest.guest_email(), Some("guest@example.com"));
    }

    #[test]
    fn order_line_total() {
        let line = OrderLine {
            product_id: ProductId::new(),
            product_name: "Widget".to_string(),
            quantity: 3,
            unit_price: Money::from_cents(1_250),
        };
        assert_eq!(line.total_price().cents(), 3_750);
    }
}
