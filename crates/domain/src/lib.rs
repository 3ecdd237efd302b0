//! Domain layer for the storefront fulfillment core.
//!
//! This crate provides the services that turn carts into orders:
//! - Cart and guest cart services with advisory stock checks
//! - Promo code validation and discount calculation
//! - Checkout, the order status lifecycle and reorder
//!
//! All persistence goes through the [`store::Store`] trait.

pub mod cart;
pub mod clock;
pub mod error;
pub mod guest;
pub mod order;
pub mod pricing;
pub mod promo;

pub use cart::{CartService, PricedLine};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, Result};
pub use guest::{DEFAULT_SESSION_TTL_HOURS, GuestCartService};
pub use order::{
    CheckoutRequest, LifecycleEvent, LifecyclePolicy, NoopObserver, OrderNumberSource,
    OrderObserver, OrderService, OrderSummary, RandomOrderNumbers, ReorderSummary, TickReport,
};
pub use pricing::{PriceBreakdown, PricingPolicy};
pub use promo::{AppliedPromo, PromoEngine, calculate_discount};
