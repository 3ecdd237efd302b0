use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Money, OrderId, ProductId, SessionId, UserId};
use sqlx::{PgConnection, PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    CartLine, CartOwner, DiscountRule, GuestSession, NewOrder, OrderLine, OrderOwner,
    OrderRecord, OrderStatus, Product, PromoCode, PromoUsage, Result, ShippingAddress,
    StatusChange, StatusHistoryEntry, StoreError, Tracking,
    store::{Store, ensure_cart_matches, validate_new_order},
};

const ORDER_COLUMNS: &str = "id, order_number, user_id, guest_session_id, guest_email, \
    subtotal_cents, discount_cents, tax_cents, shipping_cents, total_cents, status, \
    shipping_line, shipping_city, shipping_state, shipping_zip, shipping_country, \
    tracking_number, carrier, estimated_delivery, promo_code, created_at, updated_at";

const PROMO_COLUMNS: &str = "code, discount_type, discount_value, min_purchase_cents, \
    max_discount_cents, usage_limit, usage_count, per_user_limit, active, valid_from, valid_until";

/// PostgreSQL-backed record store implementation.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL record store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a connection pool to `url`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_product(row: PgRow) -> Result<Product> {
        Ok(Product {
            id: ProductId::from_uuid(row.try_get::<Uuid, _>("id")?),
            name: row.try_get("name")?,
            price: Money::from_cents(row.try_get("price_cents")?),
            stock_quantity: to_u32(row.try_get("stock_quantity")?, "stock_quantity")?,
            active: row.try_get("active")?,
        })
    }

    fn row_to_cart_line(row: PgRow) -> Result<CartLine> {
        let user_id: Option<Uuid> = row.try_get("user_id")?;
        let session_id: Option<String> = row.try_get("session_id")?;
        let owner = match (user_id, session_id) {
            (Some(user_id), None) => CartOwner::User(UserId::from_uuid(user_id)),
            (None, Some(session_id)) => CartOwner::Guest(SessionId::new(session_id)),
            _ => return Err(StoreError::Corrupt("cart line without a single owner".into())),
        };

        Ok(CartLine {
            owner,
            product_id: ProductId::from_uuid(row.try_get::<Uuid, _>("product_id")?),
            quantity: to_u32(row.try_get("quantity")?, "quantity")?,
            added_at: row.try_get("added_at")?,
        })
    }

    fn row_to_session(row: PgRow) -> Result<GuestSession> {
        Ok(GuestSession {
            session_id: SessionId::new(row.try_get::<String, _>("session_id")?),
            email: row.try_get("email")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }

    fn row_to_promo(row: PgRow) -> Result<PromoCode> {
        let discount_type: String = row.try_get("discount_type")?;
        let discount_value: i64 = row.try_get("discount_value")?;
        let rule = match discount_type.as_str() {
            "PERCENTAGE" => DiscountRule::Percentage {
                basis_points: u32::try_from(discount_value).map_err(|_| {
                    StoreError::Corrupt(format!("percentage out of range: {discount_value}"))
                })?,
            },
            "FIXED" => DiscountRule::Fixed {
                amount: Money::from_cents(discount_value),
            },
            other => {
                return Err(StoreError::Corrupt(format!("unknown discount type: {other}")));
            }
        };

        Ok(PromoCode {
            code: row.try_get("code")?,
            rule,
            min_purchase: row
                .try_get::<Option<i64>, _>("min_purchase_cents")?
                .map(Money::from_cents),
            max_discount: row
                .try_get::<Option<i64>, _>("max_discount_cents")?
                .map(Money::from_cents),
            usage_limit: row
                .try_get::<Option<i32>, _>("usage_limit")?
                .map(|limit| to_u32(limit, "usage_limit"))
                .transpose()?,
            usage_count: to_u32(row.try_get("usage_count")?, "usage_count")?,
            per_user_limit: to_u32(row.try_get("per_user_limit")?, "per_user_limit")?,
            active: row.try_get("active")?,
            valid_from: row.try_get("valid_from")?,
            valid_until: row.try_get("valid_until")?,
        })
    }

    fn row_to_promo_usage(row: PgRow) -> Result<PromoUsage> {
        Ok(PromoUsage {
            code: row.try_get("code")?,
            user_id: row
                .try_get::<Option<Uuid>, _>("user_id")?
                .map(UserId::from_uuid),
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            discount: Money::from_cents(row.try_get("discount_cents")?),
            used_at: row.try_get("used_at")?,
        })
    }

    fn row_to_order(row: &PgRow, lines: Vec<OrderLine>) -> Result<OrderRecord> {
        let user_id: Option<Uuid> = row.try_get("user_id")?;
        let guest_session_id: Option<String> = row.try_get("guest_session_id")?;
        let owner = match (user_id, guest_session_id) {
            (Some(user_id), None) => OrderOwner::Registered(UserId::from_uuid(user_id)),
            (None, Some(session_id)) => OrderOwner::Guest {
                session_id: SessionId::new(session_id),
                email: row.try_get("guest_email")?,
            },
            _ => return Err(StoreError::Corrupt("order without a single owner".into())),
        };

        let tracking_number: Option<String> = row.try_get("tracking_number")?;
        let carrier: Option<String> = row.try_get("carrier")?;
        let tracking = match (tracking_number, carrier) {
            (Some(tracking_number), Some(carrier)) => Some(Tracking {
                tracking_number,
                carrier,
                estimated_delivery: row.try_get("estimated_delivery")?,
            }),
            _ => None,
        };

        Ok(OrderRecord {
            id: OrderId::from_uuid(row.try_get::<Uuid, _>("id")?),
            order_number: row.try_get("order_number")?,
            owner,
            lines,
            subtotal: Money::from_cents(row.try_get("subtotal_cents")?),
            discount: Money::from_cents(row.try_get("discount_cents")?),
            tax: Money::from_cents(row.try_get("tax_cents")?),
            shipping_cost: Money::from_cents(row.try_get("shipping_cents")?),
            total: Money::from_cents(row.try_get("total_cents")?),
            status: parse_status(row.try_get("status")?)?,
            shipping_address: ShippingAddress {
                line: row.try_get("shipping_line")?,
                city: row.try_get("shipping_city")?,
                state: row.try_get("shipping_state")?,
                zip: row.try_get("shipping_zip")?,
                country: row.try_get("shipping_country")?,
            },
            tracking,
            promo_code: row.try_get("promo_code")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    /// Loads the line snapshots of several orders, keyed by order id.
    async fn load_lines(
        conn: &mut PgConnection,
        order_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Vec<OrderLine>>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, product_id, product_name, quantity, unit_price_cents
            FROM order_items
            WHERE order_id = ANY($1)
            ORDER BY order_id, position ASC
            "#,
        )
        .bind(order_ids)
        .fetch_all(&mut *conn)
        .await?;

        let mut lines: HashMap<Uuid, Vec<OrderLine>> = HashMap::new();
        for row in rows {
            let order_id: Uuid = row.try_get("order_id")?;
            lines.entry(order_id).or_default().push(OrderLine {
                product_id: ProductId::from_uuid(row.try_get::<Uuid, _>("product_id")?),
                product_name: row.try_get("product_name")?,
                quantity: to_u32(row.try_get("quantity")?, "quantity")?,
                unit_price: Money::from_cents(row.try_get("unit_price_cents")?),
            });
        }
        Ok(lines)
    }

    /// Turns order rows into records, loading their lines in one round trip.
    async fn hydrate_orders(conn: &mut PgConnection, rows: Vec<PgRow>) -> Result<Vec<OrderRecord>> {
        let ids = rows
            .iter()
            .map(|row| row.try_get::<Uuid, _>("id"))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut lines = Self::load_lines(conn, &ids).await?;

        rows.iter()
            .zip(ids)
            .map(|(row, id)| Self::row_to_order(row, lines.remove(&id).unwrap_or_default()))
            .collect()
    }

    async fn load_order(conn: &mut PgConnection, id: OrderId) -> Result<Option<OrderRecord>> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&mut *conn)
            .await?;

        match row {
            Some(row) => Ok(Self::hydrate_orders(conn, vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    /// Guarded decrement; explains a refusal as `NotFound` or `InsufficientStock`.
    async fn take_stock(conn: &mut PgConnection, id: ProductId, quantity: u32) -> Result<u32> {
        let requested = to_i32(quantity, "quantity")?;
        let remaining: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE products
            SET stock_quantity = stock_quantity - $1
            WHERE id = $2 AND stock_quantity >= $1
            RETURNING stock_quantity
            "#,
        )
        .bind(requested)
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(remaining) = remaining {
            return to_u32(remaining, "stock_quantity");
        }

        let available: Option<i32> =
            sqlx::query_scalar("SELECT stock_quantity FROM products WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&mut *conn)
                .await?;

        match available {
            Some(available) => Err(StoreError::InsufficientStock {
                product_id: id,
                requested: quantity,
                available: to_u32(available, "stock_quantity")?,
            }),
            None => Err(StoreError::not_found("Product", id)),
        }
    }

    async fn put_stock(conn: &mut PgConnection, id: ProductId, quantity: u32) -> Result<u32> {
        let remaining: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE products
            SET stock_quantity = stock_quantity + $1
            WHERE id = $2
            RETURNING stock_quantity
            "#,
        )
        .bind(to_i32(quantity, "quantity")?)
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?;

        match remaining {
            Some(remaining) => to_u32(remaining, "stock_quantity"),
            None => Err(StoreError::not_found("Product", id)),
        }
    }

    async fn insert_history(
        conn: &mut PgConnection,
        order_id: OrderId,
        status: OrderStatus,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO order_status_history (order_id, status, note, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(status.as_str())
        .bind(note)
        .bind(at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

fn to_u32(value: i32, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {column}: {value}")))
}

fn to_i32(value: u32, what: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| StoreError::Invalid(format!("{what} out of range: {value}")))
}

fn parse_status(value: String) -> Result<OrderStatus> {
    value
        .parse()
        .map_err(|e: crate::status::UnknownStatus| StoreError::Corrupt(e.to_string()))
}

/// Splits a cart owner into its (user_id, session_id) columns.
fn owner_columns(owner: &CartOwner) -> (Option<Uuid>, Option<&str>) {
    match owner {
        CartOwner::User(id) => (Some(id.as_uuid()), None),
        CartOwner::Guest(id) => (None, Some(id.as_str())),
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn get_product(&self, id: ProductId) -> Result<Option<Product>> {
        let row = sqlx::query(
            "SELECT id, name, price_cents, stock_quantity, active FROM products WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_product).transpose()
    }

    async fn upsert_product(&self, product: Product) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO products (id, name, price_cents, stock_quantity, active)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                price_cents = EXCLUDED.price_cents,
                stock_quantity = EXCLUDED.stock_quantity,
                active = EXCLUDED.active
            "#,
        )
        .bind(product.id.as_uuid())
        .bind(&product.name)
        .bind(product.price.cents())
        .bind(to_i32(product.stock_quantity, "stock_quantity")?)
        .bind(product.active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reserve_stock(&self, id: ProductId, quantity: u32) -> Result<u32> {
        let mut conn = self.pool.acquire().await?;
        Self::take_stock(&mut conn, id, quantity).await
    }

    async fn release_stock(&self, id: ProductId, quantity: u32) -> Result<u32> {
        let mut conn = self.pool.acquire().await?;
        Self::put_stock(&mut conn, id, quantity).await
    }

    async fn cart_lines(&self, owner: &CartOwner) -> Result<Vec<CartLine>> {
        let (user_id, session_id) = owner_columns(owner);
        let rows = sqlx::query(
            r#"
            SELECT user_id, session_id, product_id, quantity, added_at
            FROM cart_items
            WHERE user_id IS NOT DISTINCT FROM $1 AND session_id IS NOT DISTINCT FROM $2
            ORDER BY added_at ASC, id ASC
            "#,
        )
        .bind(user_id)
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_cart_line).collect()
    }

    async fn cart_line(
        &self,
        owner: &CartOwner,
        product_id: ProductId,
    ) -> Result<Option<CartLine>> {
        let (user_id, session_id) = owner_columns(owner);
        let row = sqlx::query(
            r#"
            SELECT user_id, session_id, product_id, quantity, added_at
            FROM cart_items
            WHERE user_id IS NOT DISTINCT FROM $1
              AND session_id IS NOT DISTINCT FROM $2
              AND product_id = $3
            "#,
        )
        .bind(user_id)
        .bind(session_id)
        .bind(product_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_cart_line).transpose()
    }

    async fn save_cart_line(&self, line: CartLine) -> Result<()> {
        if line.quantity == 0 {
            return Err(StoreError::Invalid("cart line quantity must be >= 1".into()));
        }

        let conflict_target = match line.owner {
            CartOwner::User(_) => "(user_id, product_id) WHERE user_id IS NOT NULL",
            CartOwner::Guest(_) => "(session_id, product_id) WHERE session_id IS NOT NULL",
        };
        let sql = format!(
            "INSERT INTO cart_items (user_id, session_id, product_id, quantity, added_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT {conflict_target} DO UPDATE SET quantity = EXCLUDED.quantity"
        );

        let (user_id, session_id) = owner_columns(&line.owner);
        sqlx::query(&sql)
            .bind(user_id)
            .bind(session_id)
            .bind(line.product_id.as_uuid())
            .bind(to_i32(line.quantity, "quantity")?)
            .bind(line.added_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete_cart_line(&self, owner: &CartOwner, product_id: ProductId) -> Result<bool> {
        let (user_id, session_id) = owner_columns(owner);
        let result = sqlx::query(
            r#"
            DELETE FROM cart_items
            WHERE user_id IS NOT DISTINCT FROM $1
              AND session_id IS NOT DISTINCT FROM $2
              AND product_id = $3
            "#,
        )
        .bind(user_id)
        .bind(session_id)
        .bind(product_id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn clear_cart(&self, owner: &CartOwner) -> Result<u64> {
        let (user_id, session_id) = owner_columns(owner);
        let result = sqlx::query(
            "DELETE FROM cart_items WHERE user_id IS NOT DISTINCT FROM $1 AND session_id IS NOT DISTINCT FROM $2",
        )
        .bind(user_id)
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn save_session(&self, session: GuestSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO guest_sessions (session_id, email, created_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (session_id) DO UPDATE SET
                email = EXCLUDED.email,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(session.session_id.as_str())
        .bind(&session.email)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<GuestSession>> {
        let row = sqlx::query(
            "SELECT session_id, email, created_at, expires_at FROM guest_sessions WHERE session_id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_session).transpose()
    }

    async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM cart_items
            WHERE session_id IN (SELECT session_id FROM guest_sessions WHERE expires_at < $1)
            "#,
        )
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("DELETE FROM guest_sessions WHERE expires_at < $1")
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn get_promo(&self, code: &str) -> Result<Option<PromoCode>> {
        let row = sqlx::query(&format!(
            "SELECT {PROMO_COLUMNS} FROM promo_codes WHERE code = $1"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_promo).transpose()
    }

    async fn upsert_promo(&self, promo: PromoCode) -> Result<()> {
        let discount_value = match promo.rule {
            DiscountRule::Percentage { basis_points } => i64::from(basis_points),
            DiscountRule::Fixed { amount } => amount.cents(),
        };

        sqlx::query(&format!(
            "INSERT INTO promo_codes ({PROMO_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (code) DO UPDATE SET \
                 discount_type = EXCLUDED.discount_type, \
                 discount_value = EXCLUDED.discount_value, \
                 min_purchase_cents = EXCLUDED.min_purchase_cents, \
                 max_discount_cents = EXCLUDED.max_discount_cents, \
                 usage_limit = EXCLUDED.usage_limit, \
                 usage_count = EXCLUDED.usage_count, \
                 per_user_limit = EXCLUDED.per_user_limit, \
                 active = EXCLUDED.active, \
                 valid_from = EXCLUDED.valid_from, \
                 valid_until = EXCLUDED.valid_until"
        ))
        .bind(&promo.code)
        .bind(promo.rule.kind_str())
        .bind(discount_value)
        .bind(promo.min_purchase.map(|m| m.cents()))
        .bind(promo.max_discount.map(|m| m.cents()))
        .bind(
            promo
                .usage_limit
                .map(|limit| to_i32(limit, "usage_limit"))
                .transpose()?,
        )
        .bind(to_i32(promo.usage_count, "usage_count")?)
        .bind(to_i32(promo.per_user_limit, "per_user_limit")?)
        .bind(promo.active)
        .bind(promo.valid_from)
        .bind(promo.valid_until)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn count_promo_usage(&self, code: &str, user_id: UserId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM promo_code_usage WHERE code = $1 AND user_id = $2",
        )
        .bind(code)
        .bind(user_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn promo_usages(&self, code: &str) -> Result<Vec<PromoUsage>> {
        let rows = sqlx::query(
            r#"
            SELECT code, user_id, order_id, discount_cents, used_at
            FROM promo_code_usage
            WHERE code = $1
            ORDER BY id ASC
            "#,
        )
        .bind(code)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_promo_usage).collect()
    }

    #[tracing::instrument(skip(self, new_order), fields(order_number = %new_order.order.order_number))]
    async fn commit_order(&self, new_order: NewOrder) -> Result<OrderRecord> {
        validate_new_order(&new_order)?;
        let start = Instant::now();

        let NewOrder {
            order,
            source_cart,
            promo_usage,
            history_note,
        } = new_order;

        let mut tx = self.pool.begin().await?;

        // A concurrent checkout of the same cart blocks here and then sees no rows
        let (cart_user, cart_session) = owner_columns(&source_cart);
        let consumed: Vec<(Uuid, i32)> = sqlx::query_as(
            r#"
            DELETE FROM cart_items
            WHERE user_id IS NOT DISTINCT FROM $1 AND session_id IS NOT DISTINCT FROM $2
            RETURNING product_id, quantity
            "#,
        )
        .bind(cart_user)
        .bind(cart_session)
        .fetch_all(&mut *tx)
        .await?;
        ensure_cart_matches(
            &source_cart,
            consumed.into_iter().map(|(product_id, quantity)| {
                (ProductId::from_uuid(product_id), quantity.max(0) as u32)
            }),
            &order,
        )?;

        // Lock product rows in a fixed order so concurrent checkouts cannot deadlock
        let mut reservations: Vec<&OrderLine> = order.lines.iter().collect();
        reservations.sort_by_key(|line| line.product_id);
        for line in reservations {
            Self::take_stock(&mut *tx, line.product_id, line.quantity).await?;
        }

        let (user_id, guest_session_id, guest_email) = match &order.owner {
            OrderOwner::Registered(id) => (Some(id.as_uuid()), None, None),
            OrderOwner::Guest { session_id, email } => {
                (None, Some(session_id.as_str()), email.as_deref())
            }
        };
        let tracking = order.tracking.as_ref();

        sqlx::query(&format!(
            "INSERT INTO orders ({ORDER_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)"
        ))
        .bind(order.id.as_uuid())
        .bind(&order.order_number)
        .bind(user_id)
        .bind(guest_session_id)
        .bind(guest_email)
        .bind(order.subtotal.cents())
        .bind(order.discount.cents())
        .bind(order.tax.cents())
        .bind(order.shipping_cost.cents())
        .bind(order.total.cents())
        .bind(order.status.as_str())
        .bind(&order.shipping_address.line)
        .bind(&order.shipping_address.city)
        .bind(&order.shipping_address.state)
        .bind(&order.shipping_address.zip)
        .bind(&order.shipping_address.country)
        .bind(tracking.map(|t| t.tracking_number.as_str()))
        .bind(tracking.map(|t| t.carrier.as_str()))
        .bind(tracking.and_then(|t| t.estimated_delivery))
        .bind(&order.promo_code)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("unique_order_number")
            {
                return StoreError::DuplicateOrderNumber(order.order_number.clone());
            }
            StoreError::Database(e)
        })?;

        for (position, line) in order.lines.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO order_items (order_id, position, product_id, product_name, quantity, unit_price_cents)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(order.id.as_uuid())
            .bind(position as i32)
            .bind(line.product_id.as_uuid())
            .bind(&line.product_name)
            .bind(to_i32(line.quantity, "quantity")?)
            .bind(line.unit_price.cents())
            .execute(&mut *tx)
            .await?;
        }

        Self::insert_history(&mut *tx, order.id, order.status, &history_note, order.created_at)
            .await?;

        if let Some(usage) = promo_usage {
            let bumped = sqlx::query(
                r#"
                UPDATE promo_codes
                SET usage_count = usage_count + 1
                WHERE code = $1 AND (usage_limit IS NULL OR usage_count < usage_limit)
                "#,
            )
            .bind(&usage.code)
            .execute(&mut *tx)
            .await?;

            if bumped.rows_affected() == 0 {
                let exists: Option<String> =
                    sqlx::query_scalar("SELECT code FROM promo_codes WHERE code = $1")
                        .bind(&usage.code)
                        .fetch_optional(&mut *tx)
                        .await?;
                return Err(match exists {
                    Some(_) => StoreError::PromoExhausted(usage.code),
                    None => StoreError::not_found("PromoCode", usage.code),
                });
            }

            // The bump above holds the promo row lock, so this count is serialized per code
            if let Some(user_id) = usage.user_id {
                let (per_user_limit, used): (i32, i64) = sqlx::query_as(
                    r#"
                    SELECT p.per_user_limit,
                           (SELECT COUNT(*) FROM promo_code_usage u WHERE u.code = p.code AND u.user_id = $2)
                    FROM promo_codes p
                    WHERE p.code = $1
                    "#,
                )
                .bind(&usage.code)
                .bind(user_id.as_uuid())
                .fetch_one(&mut *tx)
                .await?;

                if used >= i64::from(per_user_limit) {
                    return Err(StoreError::PerUserLimitReached(usage.code));
                }
            }

            sqlx::query(
                r#"
                INSERT INTO promo_code_usage (code, user_id, order_id, discount_cents, used_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&usage.code)
            .bind(usage.user_id.map(|id| id.as_uuid()))
            .bind(order.id.as_uuid())
            .bind(usage.discount.cents())
            .bind(order.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        metrics::histogram!("store_commit_order_duration_seconds")
            .record(start.elapsed().as_secs_f64());
        tracing::debug!(order_id = %order.id, "Order committed");

        Ok(order)
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<OrderRecord>> {
        let mut conn = self.pool.acquire().await?;
        Self::load_order(&mut conn, id).await
    }

    async fn find_order_by_number(&self, order_number: &str) -> Result<Option<OrderRecord>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE order_number = $1"
        ))
        .bind(order_number)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => Ok(Self::hydrate_orders(&mut conn, vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn orders_with_status(&self, status: OrderStatus) -> Result<Vec<OrderRecord>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE status = $1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&mut *conn)
        .await?;

        Self::hydrate_orders(&mut conn, rows).await
    }

    async fn orders_for_user(&self, user_id: UserId) -> Result<Vec<OrderRecord>> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 ORDER BY created_at DESC, id DESC"
        ))
        .bind(user_id.as_uuid())
        .fetch_all(&mut *conn)
        .await?;

        Self::hydrate_orders(&mut conn, rows).await
    }

    async fn change_status(&self, change: StatusChange) -> Result<OrderRecord> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM orders WHERE id = $1 FOR UPDATE")
                .bind(change.order_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;
        let current = match current {
            Some(status) => parse_status(status)?,
            None => return Err(StoreError::not_found("Order", change.order_id)),
        };

        if let Some(expected) = change.expected
            && current != expected
        {
            return Err(StoreError::StatusConflict {
                order_id: change.order_id,
                expected,
                actual: current,
            });
        }

        if change.restock {
            let lines = Self::load_lines(&mut *tx, &[change.order_id.as_uuid()]).await?;
            let mut lines = lines.into_values().flatten().collect::<Vec<_>>();
            lines.sort_by_key(|line| line.product_id);
            for line in lines {
                Self::put_stock(&mut *tx, line.product_id, line.quantity).await?;
            }
        }

        sqlx::query("UPDATE orders SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(change.to.as_str())
            .bind(change.at)
            .bind(change.order_id.as_uuid())
            .execute(&mut *tx)
            .await?;

        Self::insert_history(&mut *tx, change.order_id, change.to, &change.note, change.at).await?;

        let order = Self::load_order(&mut *tx, change.order_id)
            .await?
            .ok_or_else(|| StoreError::not_found("Order", change.order_id))?;

        tx.commit().await?;
        Ok(order)
    }

    async fn update_tracking(
        &self,
        order_id: OrderId,
        tracking: Tracking,
        note: String,
        at: DateTime<Utc>,
    ) -> Result<OrderRecord> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE orders
            SET tracking_number = $1, carrier = $2, estimated_delivery = $3, updated_at = $4
            WHERE id = $5
            RETURNING status
            "#,
        )
        .bind(&tracking.tracking_number)
        .bind(&tracking.carrier)
        .bind(tracking.estimated_delivery)
        .bind(at)
        .bind(order_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        let status = match status {
            Some(status) => parse_status(status)?,
            None => return Err(StoreError::not_found("Order", order_id)),
        };

        Self::insert_history(&mut *tx, order_id, status, &note, at).await?;

        let order = Self::load_order(&mut *tx, order_id)
            .await?
            .ok_or_else(|| StoreError::not_found("Order", order_id))?;

        tx.commit().await?;
        Ok(order)
    }

    async fn status_history(&self, order_id: OrderId) -> Result<Vec<StatusHistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, status, note, created_at
            FROM order_status_history
            WHERE order_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(StatusHistoryEntry {
                    order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
                    status: parse_status(row.try_get("status")?)?,
                    note: row.try_get("note")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
