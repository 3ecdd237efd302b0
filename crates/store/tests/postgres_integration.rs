//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container and need a Docker daemon.
//! Run with:
//!
//! ```bash
//! cargo test -p store --test postgres_integration -- --ignored
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{Money, OrderId, ProductId, SessionId, UserId};
use serial_test::serial;
use sqlx::PgPool;
use store::{
    CartLine, CartOwner, DiscountRule, GuestSession, NewOrder, NewPromoUsage, OrderLine,
    OrderOwner, OrderRecord, OrderStatus, PostgresStore, Product, PromoCode, ShippingAddress,
    StatusChange, Store, StoreError, StoreExt, Tracking,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_storefront_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE promo_code_usage, order_status_history, order_items, orders, \
         promo_codes, cart_items, guest_sessions, products",
    )
    .execute(&pool)
    .await
    .unwrap();

    PostgresStore::new(pool)
}

async fn seed_product(store: &PostgresStore, stock: u32) -> Product {
    let product = Product::new("Widget", Money::from_cents(2_500), stock);
    store.upsert_product(product.clone()).await.unwrap();
    product
}

fn new_order(user: UserId, number: &str, lines: Vec<(ProductId, u32)>) -> NewOrder {
    // Postgres keeps microseconds
    let now = Utc::now().with_nanosecond_trunc();
    NewOrder {
        order: OrderRecord {
            id: OrderId::new(),
            order_number: number.to_string(),
            owner: OrderOwner::Registered(user),
            lines: lines
                .into_iter()
                .map(|(product_id, quantity)| OrderLine {
                    product_id,
                    product_name: "Widget".to_string(),
                    quantity,
                    unit_price: Money::from_cents(2_500),
                })
                .collect(),
            subtotal: Money::from_cents(2_500),
            discount: Money::zero(),
            tax: Money::from_cents(250),
            shipping_cost: Money::from_dollars(10),
            total: Money::from_cents(3_750),
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

trait TruncateNanos {
    fn with_nanosecond_trunc(self) -> Self;
}

impl TruncateNanos for chrono::DateTime<Utc> {
    fn with_nanosecond_trunc(self) -> Self {
        chrono::DateTime::from_timestamp_micros(self.timestamp_micros()).unwrap()
    }
}

/// Fills the source cart with the order's lines, then commits.
async fn place(store: &PostgresStore, new_order: NewOrder) -> Result<OrderRecord, StoreError> {
    for line in &new_order.order.lines {
        store
            .save_cart_line(CartLine {
                owner: new_order.source_cart.clone(),
                product_id: line.product_id,
                quantity: line.quantity,
                added_at: Utc::now(),
            })
            .await?;
    }
    store.commit_order(new_order).await
}

fn promo(code: &str, usage_limit: Option<u32>) -> PromoCode {
    let now = Utc::now();
    PromoCode {
        code: code.to_string(),
        rule: DiscountRule::Percentage {
            basis_points: 1_000,
        },
        min_purchase: Some(Money::from_dollars(20)),
        max_discount: Some(Money::from_dollars(50)),
        usage_limit,
        usage_count: 0,
        per_user_limit: 1,
        active: true,
        valid_from: now - Duration::days(1),
        valid_until: now + Duration::days(1),
    }
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn product_round_trip_and_stock_guard() {
    let store = get_test_store().await;
    let product = seed_product(&store, 3).await;

    let loaded = store.require_product(product.id).await.unwrap();
    assert_eq!(loaded, product);

    assert_eq!(store.reserve_stock(product.id, 2).await.unwrap(), 1);
    let result = store.reserve_stock(product.id, 2).await;
    assert!(matches!(
        result,
        Err(StoreError::InsufficientStock {
            requested: 2,
            available: 1,
            ..
        })
    ));
    assert_eq!(store.release_stock(product.id, 2).await.unwrap(), 3);
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn cart_lines_upsert_per_owner() {
    let store = get_test_store().await;
    let product = seed_product(&store, 10).await;
    let user = CartOwner::User(UserId::new());
    let guest = CartOwner::Guest(SessionId::generate());

    for (owner, quantity) in [(&user, 1), (&user, 3), (&guest, 2)] {
        store
            .save_cart_line(CartLine {
                owner: owner.clone(),
                product_id: product.id,
                quantity,
                added_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    let user_lines = store.cart_lines(&user).await.unwrap();
    assert_eq!(user_lines.len(), 1);
    assert_eq!(user_lines[0].quantity, 3);

    let guest_line = store.cart_line(&guest, product.id).await.unwrap().unwrap();
    assert_eq!(guest_line.quantity, 2);

    assert!(store.delete_cart_line(&user, product.id).await.unwrap());
    assert!(!store.delete_cart_line(&user, product.id).await.unwrap());
    assert_eq!(store.clear_cart(&guest).await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn commit_order_is_atomic() {
    let store = get_test_store().await;
    let user = UserId::new();
    let product = seed_product(&store, 5).await;
    store.upsert_promo(promo("SAVE10", Some(5))).await.unwrap();
    store
        .save_cart_line(CartLine {
            owner: CartOwner::User(user),
            product_id: product.id,
            quantity: 1,
            added_at: Utc::now(),
        })
        .await
        .unwrap();

    let mut order = new_order(user, "ORD-202601-AAAAAAAA", vec![(product.id, 1)]);
    order.promo_usage = Some(NewPromoUsage {
        code: "SAVE10".to_string(),
        user_id: Some(user),
        discount: Money::from_cents(250),
    });
    let placed = store.commit_order(order).await.unwrap();

    let loaded = store.require_order(placed.id).await.unwrap();
    assert_eq!(loaded, placed);
    assert_eq!(
        store.require_product(product.id).await.unwrap().stock_quantity,
        4
    );
    assert!(
        store
            .cart_lines(&CartOwner::User(user))
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(store.count_promo_usage("SAVE10", user).await.unwrap(), 1);
    assert_eq!(
        store.get_promo("SAVE10").await.unwrap().unwrap().usage_count,
        1
    );

    let by_number = store
        .find_order_by_number("ORD-202601-AAAAAAAA")
        .await
        .unwrap();
    assert_eq!(by_number.map(|o| o.id), Some(placed.id));
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn failed_commit_leaves_no_trace() {
    let store = get_test_store().await;
    let user = UserId::new();
    let plenty = seed_product(&store, 10).await;
    let scarce = seed_product(&store, 1).await;

    let order = new_order(
        user,
        "ORD-202601-BBBBBBBB",
        vec![(plenty.id, 2), (scarce.id, 5)],
    );
    let result = place(&store, order).await;
    assert!(matches!(result, Err(StoreError::InsufficientStock { .. })));
    assert_eq!(
        store.cart_lines(&CartOwner::User(user)).await.unwrap().len(),
        2
    );

    assert_eq!(
        store.require_product(plenty.id).await.unwrap().stock_quantity,
        10
    );
    assert!(store.orders_for_user(user).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn duplicate_order_number_is_reported() {
    let store = get_test_store().await;
    let user = UserId::new();
    let product = seed_product(&store, 10).await;

    place(&store, new_order(user, "ORD-202601-CCCCCCCC", vec![(product.id, 1)]))
        .await
        .unwrap();
    let result = place(&store, new_order(user, "ORD-202601-CCCCCCCC", vec![(product.id, 1)])).await;

    assert!(matches!(result, Err(StoreError::DuplicateOrderNumber(_))));
    assert_eq!(
        store.require_product(product.id).await.unwrap().stock_quantity,
        9
    );
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn promo_cap_enforced_at_commit() {
    let store = get_test_store().await;
    let product = seed_product(&store, 10).await;
    store.upsert_promo(promo("ONCE", Some(1))).await.unwrap();

    for (n, expect_ok) in [("ORD-202601-DDDDDDD1", true), ("ORD-202601-DDDDDDD2", false)] {
        let user = UserId::new();
        let mut order = new_order(user, n, vec![(product.id, 1)]);
        order.promo_usage = Some(NewPromoUsage {
            code: "ONCE".to_string(),
            user_id: Some(user),
            discount: Money::from_cents(250),
        });
        let result = place(&store, order).await;
        assert_eq!(result.is_ok(), expect_ok);
        if !expect_ok {
            assert!(matches!(result, Err(StoreError::PromoExhausted(_))));
        }
    }

    assert_eq!(store.promo_usages("ONCE").await.unwrap().len(), 1);
    assert_eq!(
        store.require_product(product.id).await.unwrap().stock_quantity,
        9
    );
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn concurrent_commits_of_one_cart_place_one_order() {
    let store = get_test_store().await;
    let user = UserId::new();
    let product = seed_product(&store, 10).await;
    store
        .save_cart_line(CartLine {
            owner: CartOwner::User(user),
            product_id: product.id,
            quantity: 2,
            added_at: Utc::now(),
        })
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        store.commit_order(new_order(user, "ORD-202601-GGGGGGG1", vec![(product.id, 2)])),
        store.commit_order(new_order(user, "ORD-202601-GGGGGGG2", vec![(product.id, 2)])),
    );

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(StoreError::CartChanged(_))))
    );
    assert_eq!(store.orders_for_user(user).await.unwrap().len(), 1);
    assert_eq!(
        store.require_product(product.id).await.unwrap().stock_quantity,
        8
    );
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn per_user_limit_enforced_at_commit() {
    let store = get_test_store().await;
    let user = UserId::new();
    let product = seed_product(&store, 10).await;
    store.upsert_promo(promo("PERUSER", None)).await.unwrap();

    for (n, expect_ok) in [("ORD-202601-HHHHHHH1", true), ("ORD-202601-HHHHHHH2", false)] {
        let mut order = new_order(user, n, vec![(product.id, 1)]);
        order.promo_usage = Some(NewPromoUsage {
            code: "PERUSER".to_string(),
            user_id: Some(user),
            discount: Money::from_cents(250),
        });
        let result = place(&store, order).await;
        assert_eq!(result.is_ok(), expect_ok);
        if !expect_ok {
            assert!(matches!(result, Err(StoreError::PerUserLimitReached(_))));
        }
    }

    assert_eq!(store.count_promo_usage("PERUSER", user).await.unwrap(), 1);
    assert_eq!(
        store.get_promo("PERUSER").await.unwrap().unwrap().usage_count,
        1
    );
    assert_eq!(
        store.require_product(product.id).await.unwrap().stock_quantity,
        9
    );
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn guarded_status_change_and_restock() {
    let store = get_test_store().await;
    let user = UserId::new();
    let product = seed_product(&store, 4).await;
    let order = place(&store, new_order(user, "ORD-202601-EEEEEEEE", vec![(product.id, 3)]))
        .await
        .unwrap();

    let conflict = store
        .change_status(StatusChange {
            order_id: order.id,
            expected: Some(OrderStatus::Confirmed),
            to: OrderStatus::Processing,
            note: "Auto".to_string(),
            restock: false,
            at: Utc::now(),
        })
        .await;
    assert!(matches!(conflict, Err(StoreError::StatusConflict { .. })));

    let cancelled = store
        .change_status(StatusChange {
            order_id: order.id,
            expected: Some(OrderStatus::Pending),
            to: OrderStatus::Cancelled,
            note: "Order cancelled".to_string(),
            restock: true,
            at: Utc::now(),
        })
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(
        store.require_product(product.id).await.unwrap().stock_quantity,
        4
    );

    let history = store.status_history(order.id).await.unwrap();
    let statuses: Vec<_> = history.iter().map(|h| h.status).collect();
    assert_eq!(statuses, vec![OrderStatus::Pending, OrderStatus::Cancelled]);
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn tracking_and_status_queries() {
    let store = get_test_store().await;
    let user = UserId::new();
    let product = seed_product(&store, 10).await;

    let mut older = new_order(user, "ORD-202601-FFFFFFF1", vec![(product.id, 1)]);
    older.order.created_at = older.order.created_at - Duration::minutes(10);
    let older = place(&store, older).await.unwrap();
    let newer = place(&store, new_order(user, "ORD-202601-FFFFFFF2", vec![(product.id, 1)]))
        .await
        .unwrap();

    let pending = store
        .orders_with_status(OrderStatus::Pending)
        .await
        .unwrap();
    assert_eq!(
        pending.iter().map(|o| o.id).collect::<Vec<_>>(),
        vec![older.id, newer.id]
    );
    let mine = store.orders_for_user(user).await.unwrap();
    assert_eq!(mine[0].id, newer.id);

    let tracked = store
        .update_tracking(
            newer.id,
            Tracking {
                tracking_number: "1Z999".to_string(),
                carrier: "UPS".to_string(),
                estimated_delivery: None,
            },
            "Tracking information added: UPS - 1Z999".to_string(),
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(tracked.status, OrderStatus::Pending);
    assert_eq!(
        tracked.tracking.map(|t| t.carrier),
        Some("UPS".to_string())
    );
    assert_eq!(store.status_history(newer.id).await.unwrap().len(), 2);
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn purge_expired_sessions_drops_their_carts() {
    let store = get_test_store().await;
    let product = seed_product(&store, 10).await;
    let now = Utc::now();

    let expired = GuestSession {
        session_id: SessionId::generate(),
        email: Some("old@example.com".to_string()),
        created_at: now - Duration::hours(48),
        expires_at: now - Duration::hours(24),
    };
    let live = GuestSession {
        session_id: SessionId::generate(),
        email: None,
        created_at: now,
        expires_at: now + Duration::hours(24),
    };
    for session in [&expired, &live] {
        store.save_session(session.clone()).await.unwrap();
        store
            .save_cart_line(CartLine {
                owner: CartOwner::Guest(session.session_id.clone()),
                product_id: product.id,
                quantity: 1,
                added_at: now,
            })
            .await
            .unwrap();
    }

    assert_eq!(store.purge_expired_sessions(now).await.unwrap(), 1);
    assert!(store.get_session(&expired.session_id).await.unwrap().is_none());
    assert!(store.get_session(&live.session_id).await.unwrap().is_some());
    assert!(
        store
            .cart_lines(&CartOwner::Guest(expired.session_id))
            .await
            .unwrap()
            .is_empty()
    );
}
