//! Order money arithmetic.

use common::Money;
use serde::{Deserialize, Serialize};

/// Default tax rate: 10 %.
pub const DEFAULT_TAX_RATE_BP: u32 = 1_000;

/// Default flat shipping fee: $10.00.
pub const DEFAULT_SHIPPING_CENTS: i64 = 1_000;

/// Flat tax and shipping rules applied at checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingPolicy {
    /// Tax on the post-discount subtotal, in basis points.
    pub tax_rate_bp: u32,
    /// Shipping charged once per order.
    pub shipping_flat: Money,
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            tax_rate_bp: DEFAULT_TAX_RATE_BP,
            shipping_flat: Money::from_cents(DEFAULT_SHIPPING_CENTS),
        }
    }
}

/// The money fields of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub subtotal: Money,
    pub discount: Money,
    pub tax: Money,
    pub shipping: Money,
    pub total: Money,
}

impl PricingPolicy {
    /// Computes tax, shipping and total for a subtotal and an already capped discount.
    ///
    /// `total = (subtotal - discount) + tax + shipping`, with tax rounded half-up
    /// to the cent.
    pub fn price(&self, subtotal: Money, discount: Money) -> PriceBreakdown {
        let discounted = subtotal - discount;
        let tax = discounted.percent_bp(self.tax_rate_bp);
        let shipping = self.shipping_flat;

        PriceBreakdown {
            subtotal,
            discount,
            tax,
            shipping,
            total: discounted + tax + shipping,
        }
    }
}
