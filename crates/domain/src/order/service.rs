//! Order service: checkout, queries, status changes and reorder.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common::{Money, OrderId, SessionId, UserId};
use store::{
    CartOwner, NewOrder, NewPromoUsage, OrderLine, OrderOwner, OrderRecord, OrderStatus,
    StatusChange, StatusHistoryEntry, Store, StoreError, StoreExt, Tracking,
};

use crate::cart::CartService;
use crate::clock::{Clock, SystemClock};
use crate::error::{DomainError, Result};
use crate::guest::require_live_session;
use crate::pricing::PricingPolicy;
use crate::promo::{PromoEngine, calculate_discount};

use super::{
    CheckoutRequest, LifecycleEvent, LifecyclePolicy, NOTE_ORDER_CANCELLED, NOTE_ORDER_PLACED,
    NoopObserver, OrderNumberSource, OrderObserver, OrderSummary, RandomOrderNumbers,
    ReorderSummary, TickReport, validate_shipping_address,
};

/// Attempts at finding an unused order number before giving up.
const MAX_ORDER_NUMBER_ATTEMPTS: usize = 3;

/// Default bound on a single observer call.
pub const DEFAULT_OBSERVER_TIMEOUT: Duration = Duration::from_secs(2);

/// Service for placing orders and driving them through their lifecycle.
///
/// Registered and guest checkouts share one code path; the owner is the only
/// branch point. Every authoritative write goes through a single atomic store
/// call; observers run afterwards and cannot affect the outcome.
#[derive(Clone)]
pub struct OrderService<S: Store> {
    store: S,
    carts: CartService<S>,
    promos: PromoEngine<S>,
    clock: Arc<dyn Clock>,
    pricing: PricingPolicy,
    lifecycle: LifecyclePolicy,
    numbers: Arc<dyn OrderNumberSource>,
    observer: Arc<dyn OrderObserver>,
    observer_timeout: Duration,
}

impl<S: Store + Clone> OrderService<S> {
    /// Creates a new order service with default policies and no observer.
    pub fn new(store: S) -> Self {
        Self {
            carts: CartService::new(store.clone()),
            promos: PromoEngine::new(store.clone()),
            store,
            clock: Arc::new(SystemClock),
            pricing: PricingPolicy::default(),
            lifecycle: LifecyclePolicy::default(),
            numbers: Arc::new(RandomOrderNumbers),
            observer: Arc::new(NoopObserver),
            observer_timeout: DEFAULT_OBSERVER_TIMEOUT,
        }
    }
}

impl<S: Store> OrderService<S> {
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.carts = self.carts.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn with_pricing(mut self, pricing: PricingPolicy) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: LifecyclePolicy) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_number_source(mut self, numbers: Arc<dyn OrderNumberSource>) -> Self {
        self.numbers = numbers;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn OrderObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_observer_timeout(mut self, timeout: Duration) -> Self {
        self.observer_timeout = timeout;
        self
    }

    pub fn pricing(&self) -> &PricingPolicy {
        &self.pricing
    }

    pub fn lifecycle(&self) -> &LifecyclePolicy {
        &self.lifecycle
    }

    /// Returns the underlying record store.
    pub fn store(&self) -> &S {
        &self.store
    }

    // Checkout

    /// Converts a registered user's cart into a pending order.
    #[tracing::instrument(skip(self, request))]
    pub async fn create_order_from_cart(
        &self,
        user_id: UserId,
        request: CheckoutRequest,
    ) -> Result<OrderRecord> {
        self.checkout(
            OrderOwner::Registered(user_id),
            CartOwner::User(user_id),
            request,
        )
        .await
    }

    /// Converts a guest cart into a pending order.
    ///
    /// The contact email falls back to the one attached to the session.
    #[tracing::instrument(skip(self, request))]
    pub async fn create_guest_order(
        &self,
        session_id: &SessionId,
        guest_email: Option<String>,
        request: CheckoutRequest,
    ) -> Result<OrderRecord> {
        let session = require_live_session(&self.store, session_id, self.clock.now()).await?;
        let email = guest_email
            .filter(|email| !email.trim().is_empty())
            .or(session.email);

        self.checkout(
            OrderOwner::Guest {
                session_id: session_id.clone(),
                email,
            },
            CartOwner::Guest(session_id.clone()),
            request,
        )
        .await
    }

    async fn checkout(
        &self,
        owner: OrderOwner,
        cart: CartOwner,
        request: CheckoutRequest,
    ) -> Result<OrderRecord> {
        let start = Instant::now();
        let result = self.place_order(owner, cart, request).await;
        metrics::histogram!("checkout_duration_seconds").record(start.elapsed().as_secs_f64());

        match result {
            Ok(order) => {
                metrics::counter!("checkout_orders_created_total").increment(1);
                tracing::info!(
                    order_number = %order.order_number,
                    total = %order.total,
                    "Order placed"
                );
                self.notify(LifecycleEvent::OrderPlaced {
                    order: order.clone(),
                })
                .await;
                Ok(order)
            }
            Err(e) => {
                metrics::counter!("checkout_failures_total", "reason" => e.reason()).increment(1);
                tracing::warn!(error = %e, "Checkout failed");
                Err(e)
            }
        }
    }

    async fn place_order(
        &self,
        owner: OrderOwner,
        cart: CartOwner,
        request: CheckoutRequest,
    ) -> Result<OrderRecord> {
        validate_shipping_address(&request.shipping_address)?;

        let cart_lines = self.store.cart_lines(&cart).await?;
        if cart_lines.is_empty() {
            return Err(DomainError::EmptyCart);
        }

        // Stock may have moved since the items were added; the commit re-checks atomically
        let mut lines = Vec::with_capacity(cart_lines.len());
        for cart_line in &cart_lines {
            let product = self.store.require_product(cart_line.product_id).await?;
            if product.stock_quantity < cart_line.quantity {
                return Err(DomainError::InsufficientStock {
                    product_id: product.id,
                    requested: cart_line.quantity,
                    available: product.stock_quantity,
                });
            }
            lines.push(OrderLine {
                product_id: product.id,
                product_name: product.name,
                quantity: cart_line.quantity,
                unit_price: product.price,
            });
        }

        let subtotal: Money = lines.iter().map(OrderLine::total_price).sum();
        let now = self.clock.now();

        let (discount, promo_usage) = match request.promo_code.as_deref() {
            Some(code) => {
                let promo = self
                    .promos
                    .validate(code, owner.user_id(), subtotal, now)
                    .await?;
                let discount = calculate_discount(&promo, subtotal);
                let usage = NewPromoUsage {
                    code: promo.code,
                    user_id: owner.user_id(),
                    discount,
                };
                (discount, Some(usage))
            }
            None => (Money::zero(), None),
        };

        let price = self.pricing.price(subtotal, discount);
        let mut order = OrderRecord {
            id: OrderId::new(),
            order_number: String::new(),
            owner,
            lines,
            subtotal: price.subtotal,
            discount: price.discount,
            tax: price.tax,
            shipping_cost: price.shipping,
            total: price.total,
            status: OrderStatus::Pending,
            shipping_address: request.shipping_address,
            tracking: None,
            promo_code: promo_usage.as_ref().map(|usage| usage.code.clone()),
            created_at: now,
            updated_at: now,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            order.order_number = self.numbers.next_number(now);

            let new_order = NewOrder {
                order: order.clone(),
                source_cart: cart.clone(),
                promo_usage: promo_usage.clone(),
                history_note: NOTE_ORDER_PLACED.to_string(),
            };

            match self.store.commit_order(new_order).await {
                Ok(placed) => return Ok(placed),
                Err(StoreError::DuplicateOrderNumber(number))
                    if attempt < MAX_ORDER_NUMBER_ATTEMPTS =>
                {
                    tracing::warn!(order_number = %number, attempt, "Order number collision, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // Queries

    pub async fn get_order(&self, order_id: OrderId) -> Result<OrderRecord> {
        Ok(self.store.require_order(order_id).await?)
    }

    /// Returns a user's orders, newest first.
    pub async fn orders_for_user(&self, user_id: UserId) -> Result<Vec<OrderRecord>> {
        Ok(self.store.orders_for_user(user_id).await?)
    }

    /// Returns an order's audit trail, oldest first.
    pub async fn status_history(&self, order_id: OrderId) -> Result<Vec<StatusHistoryEntry>> {
        self.store.require_order(order_id).await?;
        Ok(self.store.status_history(order_id).await?)
    }

    /// Looks up a guest order by number, checking the contact email.
    pub async fn guest_order(&self, order_number: &str, email: &str) -> Result<OrderRecord> {
        let order = self
            .store
            .find_order_by_number(order_number)
            .await?
            .ok_or_else(|| DomainError::not_found("Order", order_number))?;

        let email_matches = order
            .owner
            .guest_email()
            .is_some_and(|owner_email| owner_email.eq_ignore_ascii_case(email.trim()));
        if !email_matches {
            return Err(DomainError::NotOwner(order_number.to_string()));
        }
        Ok(order)
    }

    pub async fn summary(&self, order_id: OrderId) -> Result<OrderSummary> {
        let order = self.get_order(order_id).await?;
        Ok(OrderSummary::from_order(&order))
    }

    // Status changes

    /// Administrative override: moves the order to any status.
    ///
    /// The history row carries `note`, or a generated description of the move.
    /// Setting the current status again records history but notifies nobody.
    /// Fails with a retryable store conflict if the status changed concurrently.
    #[tracing::instrument(skip(self, note))]
    pub async fn update_status(
        &self,
        order_id: OrderId,
        new_status: OrderStatus,
        note: Option<String>,
    ) -> Result<OrderRecord> {
        let order = self.store.require_order(order_id).await?;
        let from = order.status;
        let note = note
            .filter(|note| !note.trim().is_empty())
            .unwrap_or_else(|| format!("Status updated from {from} to {new_status}"));

        let updated = self
            .store
            .change_status(StatusChange {
                order_id,
                expected: Some(from),
                to: new_status,
                note,
                restock: false,
                at: self.clock.now(),
            })
            .await?;

        tracing::info!(
            order_number = %updated.order_number,
            %from,
            to = %new_status,
            "Order status updated"
        );
        // Re-setting the same status only adds a history row
        if from != new_status {
            metrics::counter!("lifecycle_transitions_total", "to" => new_status.as_str())
                .increment(1);
            self.notify_transition(&updated).await;
        }
        Ok(updated)
    }

    /// Cancels a pending order and returns its stock.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, order_id: OrderId) -> Result<OrderRecord> {
        let order = self.store.require_order(order_id).await?;
        if !order.status.can_cancel() {
            return Err(DomainError::InvalidTransition {
                order_id,
                from: order.status,
                to: OrderStatus::Cancelled,
            });
        }

        let result = self
            .store
            .change_status(StatusChange {
                order_id,
                expected: Some(OrderStatus::Pending),
                to: OrderStatus::Cancelled,
                note: NOTE_ORDER_CANCELLED.to_string(),
                restock: true,
                at: self.clock.now(),
            })
            .await;

        match result {
            Ok(cancelled) => {
                metrics::counter!("lifecycle_transitions_total", "to" => OrderStatus::Cancelled.as_str())
                    .increment(1);
                tracing::info!(order_number = %cancelled.order_number, "Order cancelled");
                Ok(cancelled)
            }
            Err(StoreError::StatusConflict { actual, .. }) => Err(DomainError::InvalidTransition {
                order_id,
                from: actual,
                to: OrderStatus::Cancelled,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Records carrier tracking. Status is unchanged; a history row is appended.
    #[tracing::instrument(skip(self))]
    pub async fn update_tracking(
        &self,
        order_id: OrderId,
        tracking_number: &str,
        carrier: &str,
        estimated_delivery: Option<DateTime<Utc>>,
    ) -> Result<OrderRecord> {
        let note = format!("Tracking information added: {carrier} - {tracking_number}");
        let tracking = Tracking {
            tracking_number: tracking_number.to_string(),
            carrier: carrier.to_string(),
            estimated_delivery,
        };

        let updated = self
            .store
            .update_tracking(order_id, tracking, note, self.clock.now())
            .await?;
        tracing::info!(order_number = %updated.order_number, carrier, "Tracking updated");
        Ok(updated)
    }

    /// Puts the items of a past order back into the owner's cart.
    ///
    /// Inactive products, products without stock and items the cart refuses
    /// are skipped.
    #[tracing::instrument(skip(self))]
    pub async fn reorder_items(&self, order_id: OrderId, user_id: UserId) -> Result<ReorderSummary> {
        let order = self.store.require_order(order_id).await?;
        if order.owner.user_id() != Some(user_id) {
            return Err(DomainError::NotOwner(order.order_number));
        }

        let owner = CartOwner::User(user_id);
        let mut summary = ReorderSummary {
            added: 0,
            skipped: 0,
        };

        for line in &order.lines {
            let available = match self.store.get_product(line.product_id).await? {
                Some(product) => product.active && product.stock_quantity >= 1,
                None => false,
            };
            if !available {
                summary.skipped += 1;
                continue;
            }

            match self
                .carts
                .add_item(&owner, line.product_id, line.quantity)
                .await
            {
                Ok(_) => summary.added += 1,
                Err(e) => {
                    tracing::warn!(product_id = %line.product_id, error = %e, "Reorder item skipped");
                    summary.skipped += 1;
                }
            }
        }

        tracing::info!(
            order_number = %order.order_number,
            added = summary.added,
            skipped = summary.skipped,
            "Reorder finished"
        );

        if summary.added == 0 {
            return Err(DomainError::NothingAvailable(order.order_number));
        }
        Ok(summary)
    }

    // Scheduler

    /// Runs one scheduler pass at the current clock time.
    pub async fn advance_lifecycle(&self) -> TickReport {
        self.advance_lifecycle_at(self.clock.now()).await
    }

    /// Promotes every order whose dwell time has elapsed at `now`.
    ///
    /// Buckets are scanned in forward order with a fresh query each, so an
    /// order promoted out of one bucket can be promoted again in the same pass.
    /// Each promotion is a compare-and-set on the scanned status, so re-running
    /// a pass or racing an administrator never double-promotes. Failures are
    /// counted and left for the next pass.
    #[tracing::instrument(skip(self))]
    pub async fn advance_lifecycle_at(&self, now: DateTime<Utc>) -> TickReport {
        let start = Instant::now();
        let mut report = TickReport::default();

        for bucket in LifecyclePolicy::BUCKETS {
            let orders = match self.store.orders_with_status(bucket).await {
                Ok(orders) => orders,
                Err(e) => {
                    tracing::error!(status = %bucket, error = %e, "Failed to scan orders");
                    report.failures += 1;
                    continue;
                }
            };

            for order in orders {
                let Some(to) = self.lifecycle.due_transition(&order, now) else {
                    continue;
                };

                let change = StatusChange {
                    order_id: order.id,
                    expected: Some(bucket),
                    to,
                    note: format!("Automatically transitioned from {bucket} to {to}"),
                    restock: false,
                    at: now,
                };

                match self.store.change_status(change).await {
                    Ok(updated) => {
                        report.promoted += 1;
                        metrics::counter!("lifecycle_transitions_total", "to" => to.as_str())
                            .increment(1);
                        tracing::info!(
                            order_number = %updated.order_number,
                            from = %bucket,
                            %to,
                            "Order transitioned"
                        );
                        self.notify_transition(&updated).await;
                    }
                    Err(StoreError::StatusConflict { actual, .. }) => {
                        report.conflicts += 1;
                        tracing::debug!(
                            order_number = %order.order_number,
                            expected = %bucket,
                            %actual,
                            "Order changed concurrently, skipping"
                        );
                    }
                    Err(e) => {
                        report.failures += 1;
                        tracing::warn!(
                            order_number = %order.order_number,
                            error = %e,
                            "Order transition failed, will retry"
                        );
                    }
                }
            }
        }

        metrics::histogram!("lifecycle_tick_duration_seconds").record(start.elapsed().as_secs_f64());
        report
    }

    // Observer

    async fn notify_transition(&self, order: &OrderRecord) {
        let event = match order.status {
            OrderStatus::Shipped => LifecycleEvent::OrderShipped {
                order: order.clone(),
            },
            OrderStatus::Delivered => LifecycleEvent::OrderDelivered {
                order: order.clone(),
            },
            _ => return,
        };
        self.notify(event).await;
    }

    async fn notify(&self, event: LifecycleEvent) {
        let notified = tokio::time::timeout(self.observer_timeout, self.observer.on_event(&event));
        if notified.await.is_err() {
            tracing::warn!(
                event_type = event.event_type(),
                order_number = %event.order().order_number,
                "Order observer timed out"
            );
        }
    }
}
