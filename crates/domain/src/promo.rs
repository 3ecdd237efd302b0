//! Promo code validation and discount computation.

use chrono::{DateTime, Utc};
use common::{Money, UserId};
use serde::{Deserialize, Serialize};
use store::{DiscountRule, PromoCode, Store};

use crate::error::{DomainError, Result};

/// A validated code together with the discount it grants on an amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedPromo {
    pub code: String,
    pub discount: Money,
}

/// Computes the discount a code grants on `order_amount`.
///
/// Percentage codes round half-up to the cent and are then capped by the
/// code's max discount. Every discount is capped by the order amount, so the
/// discounted subtotal is never negative. Pure: no state is read or written.
pub fn calculate_discount(promo: &PromoCode, order_amount: Money) -> Money {
    let raw = match promo.rule {
        DiscountRule::Percentage { basis_points } => {
            let discount = order_amount.percent_bp(basis_points);
            match promo.max_discount {
                Some(ceiling) => discount.min(ceiling),
                None => discount,
            }
        }
        DiscountRule::Fixed { amount } => amount,
    };

    raw.min(order_amount).max(Money::zero())
}

/// Looks up and validates promo codes against the record store.
#[derive(Clone)]
pub struct PromoEngine<S: Store> {
    store: S,
}

impl<S: Store> PromoEngine<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Loads an active code, failing `InvalidPromoCode` if it is missing or switched off.
    pub async fn lookup(&self, code: &str) -> Result<PromoCode> {
        match self.store.get_promo(code).await? {
            Some(promo) if promo.active => Ok(promo),
            _ => Err(DomainError::InvalidPromoCode(code.to_string())),
        }
    }

    /// Checks that a code may be applied to an order of `order_amount`.
    ///
    /// Guests (`user_id == None`) skip only the per-user cap.
    #[tracing::instrument(skip(self))]
    pub async fn validate(
        &self,
        code: &str,
        user_id: Option<UserId>,
        order_amount: Money,
        now: DateTime<Utc>,
    ) -> Result<PromoCode> {
        let promo = self.lookup(code).await?;

        if !promo.is_within_window(now) || promo.is_exhausted() {
            return Err(DomainError::PromoExpiredOrExhausted(promo.code));
        }

        if let Some(minimum) = promo.min_purchase {
            if order_amount < minimum {
                return Err(DomainError::MinimumPurchaseNotMet {
                    code: promo.code,
                    minimum,
                });
            }
        }

        if let Some(user_id) = user_id {
            let used = self.store.count_promo_usage(&promo.code, user_id).await?;
            if used >= u64::from(promo.per_user_limit) {
                return Err(DomainError::PerUserLimitReached(promo.code));
            }
        }

        Ok(promo)
    }

    /// Validates a code and computes its discount, without recording anything.
    pub async fn apply(
        &self,
        code: &str,
        user_id: Option<UserId>,
        order_amount: Money,
        now: DateTime<Utc>,
    ) -> Result<AppliedPromo> {
        let promo = self.validate(code, user_id, order_amount, now).await?;
        let discount = calculate_discount(&promo, order_amount);
        Ok(AppliedPromo {
            code: promo.code,
            discount,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use common::OrderId;
    use store::{InMemoryStore, NewOrder, NewPromoUsage};

    use super::*;

    fn save20(now: DateTime<Utc>) -> PromoCode {
        PromoCode {
            code: "SAVE20".to_string(),
            rule: DiscountRule::Percentage {
                basis_points: 2_000,
            },
            min_purchase: Some(Money::from_dollars(50)),
            max_discount: Some(Money::from_dollars(15)),
            usage_limit: Some(100),
            usage_count: 0,
            per_user_limit: 1,
            active: true,
            valid_from: now - Duration::days(1),
            valid_until: now + Duration::days(1),
        }
    }

    async fn engine_with(promo: PromoCode) -> (PromoEngine<InMemoryStore>, InMemoryStore) {
        let store = InMemoryStore::new();
        store.upsert_promo(promo).await.unwrap();
        (PromoEngine::new(store.clone()), store)
    }

    #[test]
    fn percentage_discount_respects_ceiling() {
        let promo = save20(Utc::now());
        assert_eq!(
            calculate_discount(&promo, Money::from_dollars(100)),
            Money::from_dollars(15)
        );
        assert_eq!(
            calculate_discount(&promo, Money::from_dollars(60)),
            Money::from_dollars(12)
        );
    }

    #[test]
    fn percentage_discount_rounds_half_up() {
        let mut promo = save20(Utc::now());
        promo.max_discount = None;
        promo.rule = DiscountRule::Percentage { basis_points: 1_250 };
        // 12.5 % of $0.20 is 2.5 cents
        assert_eq!(
            calculate_discount(&promo, Money::from_cents(20)),
            Money::from_cents(3)
        );
    }

    #[test]
    fn fixed_discount_never_exceeds_amount() {
        let mut promo = save20(Utc::now());
        promo.rule = DiscountRule::Fixed {
            amount: Money::from_dollars(25),
        };
        assert_eq!(
            calculate_discount(&promo, Money::from_dollars(40)),
            Money::from_dollars(25)
        );
        assert_eq!(
            calculate_discount(&promo, Money::from_dollars(10)),
            Money::from_dollars(10)
        );
    }

    #[test]
    fn calculate_discount_is_deterministic() {
        let promo = save20(Utc::now());
        let amount = Money::from_cents(12_345);
        assert_eq!(
            calculate_discount(&promo, amount),
            calculate_discount(&promo, amount)
        );
    }

    #[tokio::test]
    async fn unknown_or_inactive_code_is_invalid() {
        let now = Utc::now();
        let mut promo = save20(now);
        promo.active = false;
        let (engine, _) = engine_with(promo).await;

        for code in ["SAVE20", "NOPE"] {
            let result = engine
                .validate(code, None, Money::from_dollars(100), now)
                .await;
            assert!(matches!(result, Err(DomainError::InvalidPromoCode(_))));
        }
    }

    #[tokio::test]
    async fn expired_or_exhausted_code_is_rejected() {
        let now = Utc::now();
        let (engine, store) = engine_with(save20(now)).await;

        let result = engine
            .validate("SAVE20", None, Money::from_dollars(100), now + Duration::days(2))
            .await;
        assert!(matches!(
            result,
            Err(DomainError::PromoExpiredOrExhausted(_))
        ));

        let mut exhausted = save20(now);
        exhausted.usage_count = 100;
        store.upsert_promo(exhausted).await.unwrap();
        let result = engine
            .validate("SAVE20", None, Money::from_dollars(100), now)
            .await;
        assert!(matches!(
            result,
            Err(DomainError::PromoExpiredOrExhausted(_))
        ));
    }

    #[tokio::test]
    async fn minimum_purchase_boundary() {
        let now = Utc::now();
        let (engine, _) = engine_with(save20(now)).await;

        let applied = engine
            .apply("SAVE20", Some(UserId::new()), Money::from_dollars(100), now)
            .await
            .unwrap();
        assert_eq!(applied.discount, Money::from_dollars(15));

        let result = engine
            .validate("SAVE20", Some(UserId::new()), Money::from_dollars(40), now)
            .await;
        assert!(matches!(
            result,
            Err(DomainError::MinimumPurchaseNotMet { .. })
        ));

        // exactly the minimum is accepted
        assert!(
            engine
                .validate("SAVE20", None, Money::from_dollars(50), now)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn per_user_limit_applies_to_registered_users_only() {
        let now = Utc::now();
        let (engine, store) = engine_with(save20(now)).await;
        let user = UserId::new();

        // Record one redemption through an order commit
        let product = store::Product::new("Widget", Money::from_dollars(100), 5);
        store.upsert_product(product.clone()).await.unwrap();
        store
            .save_cart_line(store::CartLine {
                owner: store::CartOwner::User(user),
                product_id: product.id,
                quantity: 1,
                added_at: now,
            })
            .await
            .unwrap();
        store
            .commit_order(NewOrder {
                order: store::OrderRecord {
                    id: OrderId::new(),
                    order_number: "ORD-202601-00000001".to_string(),
                    owner: store::OrderOwner::Registered(user),
                    lines: vec![store::OrderLine {
                        product_id: product.id,
                        product_name: product.name.clone(),
                        quantity: 1,
                        unit_price: product.price,
                    }],
                    subtotal: Money::from_dollars(100),
                    discount: Money::from_dollars(15),
                    tax: Money::from_cents(850),
                    shipping_cost: Money::from_dollars(10),
                    total: Money::from_cents(10_350),
                    status: store::OrderStatus::Pending,
                    shipping_address: store::ShippingAddress {
                        line: "1 Main St".to_string(),
                        city: "Springfield".to_string(),
                        state: "IL".to_string(),
                        zip: "62701".to_string(),
                        country: "US".to_string(),
                    },
                    tracking: None,
                    promo_code: Some("SAVE20".to_string()),
                    created_at: now,
                    updated_at: now,
                },
                source_cart: store::CartOwner::User(user),
                promo_usage: Some(NewPromoUsage {
                    code: "SAVE20".to_string(),
                    user_id: Some(user),
                    discount: Money::from_dollars(15),
                }),
                history_note: "Order placed".to_string(),
            })
            .await
            .unwrap();

        let result = engine
            .validate("SAVE20", Some(user), Money::from_dollars(100), now)
            .await;
        assert!(matches!(result, Err(DomainError::PerUserLimitReached(_))));

        assert!(
            engine
                .validate("SAVE20", Some(UserId::new()), Money::from_dollars(100), now)
                .await
                .is_ok()
        );
        assert!(
            engine
                .validate("SAVE20", None, Money::from_dollars(100), now)
                .await
                .is_ok()
        );
    }
}
