use common::{OrderId, ProductId};
use thiserror::Error;

use crate::status::OrderStatus;

/// Errors that can occur when interacting with the record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A referenced record does not exist.
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// A stock reservation asked for more than is available.
    #[error(
        "Insufficient stock for product {product_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
        available: u32,
    },

    /// The generated order number is already taken.
    #[error("Order number already exists: {0}")]
    DuplicateOrderNumber(String),

    /// The promo code reached its global usage cap while the order was committed.
    #[error("Promo code usage limit reached: {0}")]
    PromoExhausted(String),

    /// The source cart no longer holds the lines being ordered.
    #[error("Cart {0} changed during checkout")]
    CartChanged(String),

    /// The user already redeemed the promo code as often as allowed.
    #[error("Per-user limit reached for promo code {0}")]
    PerUserLimitReached(String),

    /// A guarded status change found the order in a different status.
    #[error("Status conflict for order {order_id}: expected {expected}, found {actual}")]
    StatusConflict {
        order_id: OrderId,
        expected: OrderStatus,
        actual: OrderStatus,
    },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A record handed to the store violates a structural invariant.
    #[error("Invalid record: {0}")]
    Invalid(String),

    /// A stored value could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Builds a [`StoreError::NotFound`] for the given entity and key.
    pub fn not_found(entity: &'static str, key: impl std::fmt::Display) -> Self {
        StoreError::NotFound {
            entity,
            key: key.to_string(),
        }
    }
}

/// Result type for record store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
