//! Domain error types.

use common::{OrderId, ProductId};
use store::{OrderStatus, StoreError};
use thiserror::Error;

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// A referenced user, product, order, cart line, promo or session is missing.
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// A cart change would hold more units than the catalog has.
    #[error("Out of stock: product {product_id} requested {requested}, available {available}")]
    OutOfStock {
        product_id: ProductId,
        requested: u32,
        available: u32,
    },

    /// Stock ran short at checkout.
    #[error(
        "Insufficient stock for product {product_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
        available: u32,
    },

    /// Quantities must be at least one.
    #[error("Invalid quantity: {0} (must be greater than 0)")]
    InvalidQuantity(u32),

    /// The code does not exist or is switched off.
    #[error("Invalid promo code: {0}")]
    InvalidPromoCode(String),

    /// The code is outside its validity window or hit its global cap.
    #[error("Promo code expired or exhausted: {0}")]
    PromoExpiredOrExhausted(String),

    /// The order amount is below the code's minimum purchase.
    #[error("Minimum purchase of {minimum} not met for promo code {code}")]
    MinimumPurchaseNotMet { code: String, minimum: common::Money },

    /// The caller already redeemed the code as often as allowed.
    #[error("Per-user limit reached for promo code {0}")]
    PerUserLimitReached(String),

    /// The cart was consumed or edited while its checkout was committing.
    #[error("Cart {0} changed during checkout")]
    CartChanged(String),

    /// Checkout was attempted with no cart lines.
    #[error("Cart is empty")]
    EmptyCart,

    /// The guest session does not exist.
    #[error("Guest session not found: {0}")]
    SessionNotFound(String),

    /// The guest session is past its expiry.
    #[error("Guest session has expired: {0}")]
    SessionExpired(String),

    /// One or more shipping fields are blank.
    #[error("Invalid shipping address: {0} is required")]
    InvalidShippingAddress(&'static str),

    /// The order is not in a status that allows the change.
    #[error("Invalid transition for order {order_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },

    /// The caller does not own the order.
    #[error("Order {0} does not belong to the caller")]
    NotOwner(String),

    /// None of an order's products could be put back in the cart.
    #[error("No items from order {0} are currently available")]
    NothingAvailable(String),

    /// Every generated order number collided.
    #[error("Order number already exists: {0}")]
    DuplicateOrderNumber(String),

    /// An error occurred in the record store.
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl DomainError {
    pub(crate) fn not_found(entity: &'static str, key: impl std::fmt::Display) -> Self {
        DomainError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Returns true if repeating the operation may succeed without any change
    /// on the caller's side.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DomainError::DuplicateOrderNumber(_)
                | DomainError::CartChanged(_)
                | DomainError::Store(StoreError::StatusConflict { .. })
                | DomainError::Store(StoreError::Database(_))
        )
    }

    /// Short stable label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            DomainError::NotFound { .. } => "not_found",
            DomainError::OutOfStock { .. } => "out_of_stock",
            DomainError::InsufficientStock { .. } => "insufficient_stock",
            DomainError::InvalidQuantity(_) => "invalid_quantity",
            DomainError::InvalidPromoCode(_) => "invalid_promo_code",
            DomainError::PromoExpiredOrExhausted(_) => "promo_expired_or_exhausted",
            DomainError::MinimumPurchaseNotMet { .. } => "minimum_purchase_not_met",
            DomainError::PerUserLimitReached(_) => "per_user_limit_reached",
            DomainError::CartChanged(_) => "cart_changed",
            DomainError::EmptyCart => "empty_cart",
            DomainError::SessionNotFound(_) => "session_not_found",
            DomainError::SessionExpired(_) => "session_expired",
            DomainError::InvalidShippingAddress(_) => "invalid_shipping_address",
            DomainError::InvalidTransition { .. } => "invalid_transition",
            DomainError::NotOwner(_) => "not_owner",
            DomainError::NothingAvailable(_) => "nothing_available",
            DomainError::DuplicateOrderNumber(_) => "duplicate_order_number",
            DomainError::Store(_) => "store",
        }
    }
}

impl From<StoreError> for DomainError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity, key } => DomainError::NotFound { entity, key },
            StoreError::InsufficientStock {
                product_id,
                requested,
                available,
            } => DomainError::InsufficientStock {
                product_id,
                requested,
                available,
            },
            StoreError::DuplicateOrderNumber(number) => DomainError::DuplicateOrderNumber(number),
            StoreError::PromoExhausted(code) => DomainError::PromoExpiredOrExhausted(code),
            StoreError::PerUserLimitReached(code) => DomainError::PerUserLimitReached(code),
            StoreError::CartChanged(cart) => DomainError::CartChanged(cart),
            other => DomainError::Store(other),
        }
    }
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_onto_domain_taxonomy() {
        let product_id = ProductId::new();
        let err: DomainError = StoreError::InsufficientStock {
            product_id,
            requested: 5,
            available: 3,
        }
        .into();
        assert!(matches!(
            err,
            DomainError::InsufficientStock {
                requested: 5,
                available: 3,
                ..
            }
        ));

        let err: DomainError = StoreError::not_found("Order", "42").into();
        assert!(matches!(err, DomainError::NotFound { entity: "Order", .. }));

        let err: DomainError = StoreError::PromoExhausted("SAVE20".into()).into();
        assert!(matches!(err, DomainError::PromoExpiredOrExhausted(_)));

        let err: DomainError = StoreError::PerUserLimitReached("SAVE20".into()).into();
        assert!(matches!(err, DomainError::PerUserLimitReached(_)));

        let err: DomainError = StoreError::CartChanged("user:1".into()).into();
        assert!(matches!(err, DomainError::CartChanged(_)));
    }

    #[test]
    fn retryable_errors() {
        assert!(DomainError::DuplicateOrderNumber("ORD-1".into()).is_retryable());
        assert!(
            DomainError::Store(StoreError::StatusConflict {
                order_id: OrderId::new(),
                expected: OrderStatus::Pending,
                actual: OrderStatus::Confirmed,
            })
            .is_retryable()
        );
        assert!(DomainError::CartChanged("user:1".into()).is_retryable());
        assert!(!DomainError::EmptyCart.is_retryable());
        assert!(!DomainError::InvalidPromoCode("X".into()).is_retryable());
    }

    #[test]
    fn stock_error_message_names_all_quantities() {
        let err = DomainError::InsufficientStock {
            product_id: ProductId::new(),
            requested: 5,
            available: 3,
        };
        let message = err.to_string();
        assert!(message.contains("requested 5"));
        assert!(message.contains("available 3"));
    }
}
