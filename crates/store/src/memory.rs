use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, ProductId, SessionId, UserId};
use tokio::sync::RwLock;

use crate::{
    CartLine, CartOwner, GuestSession, NewOrder, OrderRecord, OrderStatus, Product, PromoCode,
    PromoUsage, Result, StatusChange, StatusHistoryEntry, StoreError, Tracking,
    store::{Store, ensure_cart_matches, validate_new_order},
};

#[derive(Debug, Default)]
struct Tables {
    products: HashMap<ProductId, Product>,
    cart_lines: Vec<CartLine>,
    sessions: HashMap<SessionId, GuestSession>,
    promos: HashMap<String, PromoCode>,
    promo_usages: Vec<PromoUsage>,
    orders: HashMap<OrderId, OrderRecord>,
    order_numbers: HashMap<String, OrderId>,
    history: Vec<StatusHistoryEntry>,
}

impl Tables {
    fn product_mut(&mut self, id: ProductId) -> Result<&mut Product> {
        self.products
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("Product", id))
    }

    fn check_stock(&self, id: ProductId, quantity: u32) -> Result<()> {
        let product = self
            .products
            .get(&id)
            .ok_or_else(|| StoreError::not_found("Product", id))?;
        if product.stock_quantity < quantity {
            return Err(StoreError::InsufficientStock {
                product_id: id,
                requested: quantity,
                available: product.stock_quantity,
            });
        }
        Ok(())
    }
}

/// In-memory record store.
///
/// All tables sit behind one lock, so every method runs as a single critical
/// section and multi-row operations are trivially atomic. Used by tests and
/// by the worker when no database is configured.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
    fail_status_changes: Arc<AtomicBool>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `change_status` call fail with a database error.
    pub fn set_fail_status_changes(&self, fail: bool) {
        self.fail_status_changes.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of history rows across all orders.
    pub async fn history_row_count(&self) -> usize {
        self.tables.read().await.history.len()
    }

    /// Returns the number of stored orders.
    pub async fn order_count(&self) -> usize {
        self.tables.read().await.orders.len()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_product(&self, id: ProductId) -> Result<Option<Product>> {
        Ok(self.tables.read().await.products.get(&id).cloned())
    }

    async fn upsert_product(&self, product: Product) -> Result<()> {
        self.tables
            .write()
            .await
            .products
            .insert(product.id, product);
        Ok(())
    }

    async fn reserve_stock(&self, id: ProductId, quantity: u32) -> Result<u32> {
        let mut tables = self.tables.write().await;
        tables.check_stock(id, quantity)?;
        let product = tables.product_mut(id)?;
        product.stock_quantity -= quantity;
        Ok(product.stock_quantity)
    }

    async fn release_stock(&self, id: ProductId, quantity: u32) -> Result<u32> {
        let mut tables = self.tables.write().await;
        let product = tables.product_mut(id)?;
        product.stock_quantity += quantity;
        Ok(product.stock_quantity)
    }

    async fn cart_lines(&self, owner: &CartOwner) -> Result<Vec<CartLine>> {
        let tables = self.tables.read().await;
        let mut lines: Vec<_> = tables
            .cart_lines
            .iter()
            .filter(|line| &line.owner == owner)
            .cloned()
            .collect();
        lines.sort_by_key(|line| line.added_at);
        Ok(lines)
    }

    async fn cart_line(
        &self,
        owner: &CartOwner,
        product_id: ProductId,
    ) -> Result<Option<CartLine>> {
        let tables = self.tables.read().await;
        Ok(tables
            .cart_lines
            .iter()
            .find(|line| &line.owner == owner && line.product_id == product_id)
            .cloned())
    }

    async fn save_cart_line(&self, line: CartLine) -> Result<()> {
        if line.quantity == 0 {
            return Err(StoreError::Invalid("cart line quantity must be >= 1".into()));
        }
        let mut tables = self.tables.write().await;
        match tables
            .cart_lines
            .iter_mut()
            .find(|existing| existing.owner == line.owner && existing.product_id == line.product_id)
        {
            Some(existing) => existing.quantity = line.quantity,
            None => tables.cart_lines.push(line),
        }
        Ok(())
    }

    async fn delete_cart_line(&self, owner: &CartOwner, product_id: ProductId) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let before = tables.cart_lines.len();
        tables
            .cart_lines
            .retain(|line| !(&line.owner == owner && line.product_id == product_id));
        Ok(tables.cart_lines.len() < before)
    }

    async fn clear_cart(&self, owner: &CartOwner) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.cart_lines.len();
        tables.cart_lines.retain(|line| &line.owner != owner);
        Ok((before - tables.cart_lines.len()) as u64)
    }

    async fn save_session(&self, session: GuestSession) -> Result<()> {
        self.tables
            .write()
            .await
            .sessions
            .insert(session.session_id.clone(), session);
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<GuestSession>> {
        Ok(self.tables.read().await.sessions.get(id).cloned())
    }

    async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let expired: Vec<SessionId> = tables
            .sessions
            .values()
            .filter(|session| session.is_expired(now))
            .map(|session| session.session_id.clone())
            .collect();

        for session_id in &expired {
            tables.sessions.remove(session_id);
            let owner = CartOwner::Guest(session_id.clone());
            tables.cart_lines.retain(|line| line.owner != owner);
        }

        Ok(expired.len() as u64)
    }

    async fn get_promo(&self, code: &str) -> Result<Option<PromoCode>> {
        Ok(self.tables.read().await.promos.get(code).cloned())
    }

    async fn upsert_promo(&self, promo: PromoCode) -> Result<()> {
        self.tables
            .write()
            .await
            .promos
            .insert(promo.code.clone(), promo);
        Ok(())
    }

    async fn count_promo_usage(&self, code: &str, user_id: UserId) -> Result<u64> {
        let tables = self.tables.read().await;
        Ok(tables
            .promo_usages
            .iter()
            .filter(|usage| usage.code == code && usage.user_id == Some(user_id))
            .count() as u64)
    }

    async fn promo_usages(&self, code: &str) -> Result<Vec<PromoUsage>> {
        let tables = self.tables.read().await;
        Ok(tables
            .promo_usages
            .iter()
            .filter(|usage| usage.code == code)
            .cloned()
            .collect())
    }

    async fn commit_order(&self, new_order: NewOrder) -> Result<OrderRecord> {
        validate_new_order(&new_order)?;

        let NewOrder {
            order,
            source_cart,
            promo_usage,
            history_note,
        } = new_order;

        let mut tables = self.tables.write().await;

        // Check everything before the first write so a failure leaves no trace
        ensure_cart_matches(
            &source_cart,
            tables
                .cart_lines
                .iter()
                .filter(|line| line.owner == source_cart)
                .map(|line| (line.product_id, line.quantity)),
            &order,
        )?;
        if tables.order_numbers.contains_key(&order.order_number) {
            return Err(StoreError::DuplicateOrderNumber(order.order_number));
        }
        for line in &order.lines {
            tables.check_stock(line.product_id, line.quantity)?;
        }
        if let Some(usage) = &promo_usage {
            let promo = tables
                .promos
                .get(&usage.code)
                .ok_or_else(|| StoreError::not_found("PromoCode", &usage.code))?;
            if promo.is_exhausted() {
                return Err(StoreError::PromoExhausted(usage.code.clone()));
            }
            if let Some(user_id) = usage.user_id {
                let used = tables
                    .promo_usages
                    .iter()
                    .filter(|past| past.code == usage.code && past.user_id == Some(user_id))
                    .count();
                if used >= promo.per_user_limit as usize {
                    return Err(StoreError::PerUserLimitReached(usage.code.clone()));
                }
            }
        }

        for line in &order.lines {
            tables.product_mut(line.product_id)?.stock_quantity -= line.quantity;
        }

        tables
            .order_numbers
            .insert(order.order_number.clone(), order.id);
        tables.orders.insert(order.id, order.clone());
        tables.history.push(StatusHistoryEntry {
            order_id: order.id,
            status: order.status,
            note: history_note,
            created_at: order.created_at,
        });

        tables.cart_lines.retain(|line| line.owner != source_cart);

        if let Some(usage) = promo_usage {
            if let Some(promo) = tables.promos.get_mut(&usage.code) {
                promo.usage_count += 1;
            }
            tables.promo_usages.push(PromoUsage {
                code: usage.code,
                user_id: usage.user_id,
                order_id: order.id,
                discount: usage.discount,
                used_at: order.created_at,
            });
        }

        Ok(order)
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<OrderRecord>> {
        Ok(self.tables.read().await.orders.get(&id).cloned())
    }

    async fn find_order_by_number(&self, order_number: &str) -> Result<Option<OrderRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .order_numbers
            .get(order_number)
            .and_then(|id| tables.orders.get(id))
            .cloned())
    }

    async fn orders_with_status(&self, status: OrderStatus) -> Result<Vec<OrderRecord>> {
        let tables = self.tables.read().await;
        let mut orders: Vec<_> = tables
            .orders
            .values()
            .filter(|order| order.status == status)
            .cloned()
            .collect();
        orders.sort_by_key(|order| order.created_at);
        Ok(orders)
    }

    async fn orders_for_user(&self, user_id: UserId) -> Result<Vec<OrderRecord>> {
        let tables = self.tables.read().await;
        let mut orders: Vec<_> = tables
            .orders
            .values()
            .filter(|order| order.owner.user_id() == Some(user_id))
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn change_status(&self, change: StatusChange) -> Result<OrderRecord> {
        if self.fail_status_changes.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }

        let mut tables = self.tables.write().await;

        let order = tables
            .orders
            .get(&change.order_id)
            .ok_or_else(|| StoreError::not_found("Order", change.order_id))?
            .clone();

        if let Some(expected) = change.expected
            && order.status != expected
        {
            return Err(StoreError::StatusConflict {
                order_id: order.id,
                expected,
                actual: order.status,
            });
        }

        if change.restock {
            for line in &order.lines {
                tables.product_mut(line.product_id)?.stock_quantity += line.quantity;
            }
        }

        let updated = tables
            .orders
            .get_mut(&change.order_id)
            .ok_or_else(|| StoreError::not_found("Order", change.order_id))?;
        updated.status = change.to;
        updated.updated_at = change.at;
        let updated = updated.clone();

        tables.history.push(StatusHistoryEntry {
            order_id: change.order_id,
            status: change.to,
            note: change.note,
            created_at: change.at,
        });

        Ok(updated)
    }

    async fn update_tracking(
        &self,
        order_id: OrderId,
        tracking: Tracking,
        note: String,
        at: DateTime<Utc>,
    ) -> Result<OrderRecord> {
        let mut tables = self.tables.write().await;

        let order = tables
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| StoreError::not_found("Order", order_id))?;
        order.tracking = Some(tracking);
        order.updated_at = at;
        let updated = order.clone();

        tables.history.push(StatusHistoryEntry {
            order_id,
            status: updated.status,
            note,
            created_at: at,
        });

        Ok(updated)
    }

    async fn status_history(&self, order_id: OrderId) -> Result<Vec<StatusHistoryEntry>> {
        let tables = self.tables.read().await;
        let mut entries: Vec<_> = tables
            .history
            .iter()
            .filter(|entry| entry.order_id == order_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for rows written in the same instant
        entries.sort_by_key(|entry| entry.created_at);
        Ok(entries)
    }
}
