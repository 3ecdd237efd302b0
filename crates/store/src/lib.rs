//! Transactional record store for the storefront fulfillment core.
//!
//! The [`Store`] trait is the only way the domain reaches persisted state.
//! Every method is atomic on its own; the multi-row units (order commit,
//! guarded status changes, session purges) run inside a single transaction
//! so stock and promo counters can never be partially applied.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod records;
pub mod status;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use records::{
    CartLine, CartOwner, DiscountRule, GuestSession, NewOrder, NewPromoUsage, OrderLine,
    OrderOwner, OrderRecord, Product, PromoCode, PromoUsage, ShippingAddress, StatusChange,
    StatusHistoryEntry, Tracking,
};
pub use status::OrderStatus;
pub use store::{Store, StoreExt};
