use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, ProductId, SessionId, UserId};

use crate::{
    CartLine, CartOwner, GuestSession, NewOrder, OrderRecord, OrderStatus, Product, PromoCode,
    PromoUsage, Result, StatusChange, StatusHistoryEntry, StoreError, Tracking,
};

/// Core trait for record store implementations.
///
/// Each method is atomic. Methods that touch several rows (`commit_order`,
/// `change_status`, `purge_expired_sessions`) apply all of their writes or
/// none of them. Stock and promo counters are only ever changed through
/// guarded check-and-update operations, so concurrent writers serialize
/// per product and per code.
#[async_trait]
pub trait Store: Send + Sync {
    /// Loads a catalog product.
    async fn get_product(&self, id: ProductId) -> Result<Option<Product>>;

    /// Inserts or replaces a catalog product.
    async fn upsert_product(&self, product: Product) -> Result<()>;

    /// Atomically takes `quantity` units out of stock.
    ///
    /// Fails with `InsufficientStock` if fewer units are available; stock is
    /// left unchanged in that case. Returns the remaining quantity.
    async fn reserve_stock(&self, id: ProductId, quantity: u32) -> Result<u32>;

    /// Atomically returns `quantity` units to stock. Returns the new quantity.
    async fn release_stock(&self, id: ProductId, quantity: u32) -> Result<u32>;

    /// Returns every line of a cart, oldest first.
    async fn cart_lines(&self, owner: &CartOwner) -> Result<Vec<CartLine>>;

    /// Returns the line for a product in a cart.
    async fn cart_line(&self, owner: &CartOwner, product_id: ProductId)
    -> Result<Option<CartLine>>;

    /// Inserts or replaces the line keyed by (owner, product).
    async fn save_cart_line(&self, line: CartLine) -> Result<()>;

    /// Deletes one line. Returns false if it did not exist.
    async fn delete_cart_line(&self, owner: &CartOwner, product_id: ProductId) -> Result<bool>;

    /// Deletes every line of a cart. Returns the number of lines removed.
    async fn clear_cart(&self, owner: &CartOwner) -> Result<u64>;

    /// Inserts or replaces a guest session.
    async fn save_session(&self, session: GuestSession) -> Result<()>;

    /// Loads a guest session.
    async fn get_session(&self, id: &SessionId) -> Result<Option<GuestSession>>;

    /// Deletes every session expired at `now` together with its cart lines.
    ///
    /// Returns the number of sessions removed.
    async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Loads a promo code by its code string.
    async fn get_promo(&self, code: &str) -> Result<Option<PromoCode>>;

    /// Inserts or replaces a promo code.
    async fn upsert_promo(&self, promo: PromoCode) -> Result<()>;

    /// Counts how many times a user has redeemed a code.
    async fn count_promo_usage(&self, code: &str, user_id: UserId) -> Result<u64>;

    /// Returns every redemption of a code.
    async fn promo_usages(&self, code: &str) -> Result<Vec<PromoUsage>>;

    /// Places an order as one atomic unit.
    ///
    /// Empties the source cart, which must still hold exactly the ordered
    /// quantities ([`StoreError::CartChanged`] otherwise). Then reserves stock
    /// for every line, inserts the order with its line snapshots and initial
    /// history row and, if a promo was applied, bumps the code's usage counter
    /// (respecting its global and per-user caps) and records the redemption.
    /// Any failure rolls back all of it.
    async fn commit_order(&self, new_order: NewOrder) -> Result<OrderRecord>;

    /// Loads an order by id.
    async fn get_order(&self, id: OrderId) -> Result<Option<OrderRecord>>;

    /// Loads an order by its order number.
    async fn find_order_by_number(&self, order_number: &str) -> Result<Option<OrderRecord>>;

    /// Returns every order currently in `status`, oldest first.
    async fn orders_with_status(&self, status: OrderStatus) -> Result<Vec<OrderRecord>>;

    /// Returns a user's orders, newest first.
    async fn orders_for_user(&self, user_id: UserId) -> Result<Vec<OrderRecord>>;

    /// Applies a guarded status change and appends its history row.
    ///
    /// Fails with `StatusConflict` if `change.expected` is set and does not
    /// match the current status.
    async fn change_status(&self, change: StatusChange) -> Result<OrderRecord>;

    /// Replaces tracking details and appends a history row; status is unchanged.
    async fn update_tracking(
        &self,
        order_id: OrderId,
        tracking: Tracking,
        note: String,
        at: DateTime<Utc>,
    ) -> Result<OrderRecord>;

    /// Returns an order's audit trail, oldest first.
    async fn status_history(&self, order_id: OrderId) -> Result<Vec<StatusHistoryEntry>>;
}

/// Extension trait providing convenience methods for stores.
#[async_trait]
pub trait StoreExt: Store {
    /// Loads a product or fails with `NotFound`.
    async fn require_product(&self, id: ProductId) -> Result<Product> {
        self.get_product(id)
            .await?
            .ok_or_else(|| StoreError::not_found("Product", id))
    }

    /// Loads an order or fails with `NotFound`.
    async fn require_order(&self, id: OrderId) -> Result<OrderRecord> {
        self.get_order(id)
            .await?
            .ok_or_else(|| StoreError::not_found("Order", id))
    }
}

// Blanket implementation for all Store implementations
impl<T: Store + ?Sized> StoreExt for T {}

/// Validates an order before it is committed.
pub fn validate_new_order(new_order: &NewOrder) -> Result<()> {
    let order = &new_order.order;

    if order.lines.is_empty() {
        return Err(StoreError::Invalid("order has no lines".to_string()));
    }

    if order.status != OrderStatus::Pending {
        return Err(StoreError::Invalid(format!(
            "new orders must be PENDING, got {}",
            order.status
        )));
    }

    if let Some(line) = order.lines.iter().find(|line| line.quantity == 0) {
        return Err(StoreError::Invalid(format!(
            "line for product {} has zero quantity",
            line.product_id
        )));
    }

    let mut seen = std::collections::HashSet::new();
    if let Some(line) = order.lines.iter().find(|line| !seen.insert(line.product_id)) {
        return Err(StoreError::Invalid(format!(
            "product {} appears on more than one line",
            line.product_id
        )));
    }

    Ok(())
}

/// Checks that the cart being consumed holds exactly the ordered quantities.
pub(crate) fn ensure_cart_matches(
    source_cart: &CartOwner,
    cart: impl IntoIterator<Item = (ProductId, u32)>,
    order: &OrderRecord,
) -> Result<()> {
    let held: HashMap<ProductId, u32> = cart.into_iter().collect();
    let matches = held.len() == order.lines.len()
        && order
            .lines
            .iter()
            .all(|line| held.get(&line.product_id) == Some(&line.quantity));

    if matches {
        Ok(())
    } else {
        Err(StoreError::CartChanged(source_cart.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use common::{Money, UserId};

    use super::*;
    use crate::{OrderLine, OrderOwner, ShippingAddress};

    fn new_order(lines: Vec<OrderLine>) -> NewOrder {
        let now = Utc::now();
        let user = UserId::new();
        NewOrder {
            order: OrderRecord {
                id: OrderId::new(),
                order_number: "ORD-202601-ABCDEF12".to_string(),
                owner: OrderOwner::Registered(user),
                lines,
                subtotal: Money::zero(),
                discount: Money::zero(),
                tax: Money::zero(),
                shipping_cost: Money::zero(),
                total: Money::zero(),
                status: OrderStatus::Pending,
                shipping_address: ShippingAddress {
                    line: "1 Main St".to_string(),
                    city: "Springfield".to_string(),
                    state: "IL".to_string(),
                    zip: "62701".to_string(),
                    country: "US".to_string(),
                },
                tracking: None,
                promo_code: None,
                created_at: now,
                updated_at: now,
            },
            source_cart: CartOwner::User(user),
            promo_usage: None,
            history_note: "Order placed".to_string(),
        }
    }

    fn line(product_id: ProductId, quantity: u32) -> OrderLine {
        OrderLine {
            product_id,
            product_name: "Widget".to_string(),
            quantity,
            unit_price: Money::from_cents(1000),
        }
    }

    #[test]
    fn test_validate_accepts_well_formed_order() {
        let order = new_order(vec![line(ProductId::new(), 1), line(ProductId::new(), 2)]);
        assert!(validate_new_order(&order).is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_order() {
        let order = new_order(vec![]);
        assert!(matches!(
            validate_new_order(&order),
            Err(StoreError::Invalid(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_quantity() {
        let order = new_order(vec![line(ProductId::new(), 0)]);
        assert!(validate_new_order(&order).is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_products() {
        let product = ProductId::new();
        let order = new_order(vec![line(product, 1), line(product, 2)]);
        assert!(validate_new_order(&order).is_err());
    }

    #[test]
    fn test_validate_rejects_non_pending_status() {
        let mut order = new_order(vec![line(ProductId::new(), 1)]);
        order.order.status = OrderStatus::Confirmed;
        assert!(validate_new_order(&order).is_err());
    }
}
