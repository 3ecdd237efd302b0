//! Cart aggregate shared by registered users and guest sessions.

use std::sync::Arc;

use common::{Money, ProductId};
use serde::{Deserialize, Serialize};
use store::{CartLine, CartOwner, Product, Store, StoreExt};

use crate::clock::{Clock, SystemClock};
use crate::error::{DomainError, Result};

/// A cart line priced with the live catalog price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricedLine {
    pub product_id: ProductId,
    pub product_name: String,
    pub unit_price: Money,
    pub quantity: u32,
    pub subtotal: Money,
}

/// Cart operations keyed by [`CartOwner`].
///
/// Stock checks here are advisory: they compare the prospective cart quantity
/// with current stock but reserve nothing. Checkout re-checks and reserves.
#[derive(Clone)]
pub struct CartService<S: Store> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: Store> CartService<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn check_stock(product: &Product, requested: u32) -> Result<()> {
        if product.stock_quantity < requested {
            return Err(DomainError::OutOfStock {
                product_id: product.id,
                requested,
                available: product.stock_quantity,
            });
        }
        Ok(())
    }

    /// Adds `quantity` units, merging into an existing line for the product.
    ///
    /// The stock check uses the merged quantity.
    #[tracing::instrument(skip(self), fields(owner = %owner))]
    pub async fn add_item(
        &self,
        owner: &CartOwner,
        product_id: ProductId,
        quantity: u32,
    ) -> Result<CartLine> {
        if quantity == 0 {
            return Err(DomainError::InvalidQuantity(quantity));
        }

        let product = self.store.require_product(product_id).await?;
        let line = match self.store.cart_line(owner, product_id).await? {
            Some(existing) => CartLine {
                quantity: existing.quantity.saturating_add(quantity),
                ..existing
            },
            None => CartLine {
                owner: owner.clone(),
                product_id,
                quantity,
                added_at: self.clock.now(),
            },
        };
        Self::check_stock(&product, line.quantity)?;

        self.store.save_cart_line(line.clone()).await?;
        tracing::info!(%product_id, quantity = line.quantity, "Cart line saved");
        Ok(line)
    }

    /// Replaces the quantity of an existing line.
    #[tracing::instrument(skip(self), fields(owner = %owner))]
    pub async fn update_item(
        &self,
        owner: &CartOwner,
        product_id: ProductId,
        quantity: u32,
    ) -> Result<CartLine> {
        if quantity == 0 {
            return Err(DomainError::InvalidQuantity(quantity));
        }

        let existing = self
            .store
            .cart_line(owner, product_id)
            .await?
            .ok_or_else(|| DomainError::not_found("CartItem", product_id))?;
        let product = self.store.require_product(product_id).await?;
        Self::check_stock(&product, quantity)?;

        let line = CartLine {
            quantity,
            ..existing
        };
        self.store.save_cart_line(line.clone()).await?;
        Ok(line)
    }

    pub async fn remove_item(&self, owner: &CartOwner, product_id: ProductId) -> Result<()> {
        if !self.store.delete_cart_line(owner, product_id).await? {
            return Err(DomainError::not_found("CartItem", product_id));
        }
        tracing::info!(%owner, %product_id, "Cart line removed");
        Ok(())
    }

    /// Removes every line. Returns how many were removed.
    pub async fn clear(&self, owner: &CartOwner) -> Result<u64> {
        let removed = self.store.clear_cart(owner).await?;
        tracing::info!(%owner, removed, "Cart cleared");
        Ok(removed)
    }

    /// Returns the cart priced with current catalog prices, oldest line first.
    pub async fn lines(&self, owner: &CartOwner) -> Result<Vec<PricedLine>> {
        let mut priced = Vec::new();
        for line in self.store.cart_lines(owner).await? {
            let product = self.store.require_product(line.product_id).await?;
            priced.push(PricedLine {
                product_id: product.id,
                subtotal: product.price.multiply(line.quantity),
                product_name: product.name,
                unit_price: product.price,
                quantity: line.quantity,
            });
        }
        Ok(priced)
    }

    pub async fn total(&self, owner: &CartOwner) -> Result<Money> {
        Ok(self.lines(owner).await?.iter().map(|line| line.subtotal).sum())
    }

    /// Total number of units across all lines.
    pub async fn item_count(&self, owner: &CartOwner) -> Result<u32> {
        Ok(self
            .store
            .cart_lines(owner)
            .await?
            .iter()
            .map(|line| line.quantity)
            .sum())
    }
}
