//! Guest sessions and the guest cart.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::{Money, ProductId, SessionId};
use store::{CartLine, CartOwner, GuestSession, Store};

use crate::cart::{CartService, PricedLine};
use crate::clock::{Clock, SystemClock};
use crate::error::{DomainError, Result};

/// Default lifetime of a guest session.
pub const DEFAULT_SESSION_TTL_HOURS: i64 = 24;

/// Loads a session and rejects it if missing or expired at `now`.
pub(crate) async fn require_live_session<S: Store + ?Sized>(
    store: &S,
    session_id: &SessionId,
    now: DateTime<Utc>,
) -> Result<GuestSession> {
    let session = store
        .get_session(session_id)
        .await?
        .ok_or_else(|| DomainError::SessionNotFound(session_id.to_string()))?;

    if session.is_expired(now) {
        return Err(DomainError::SessionExpired(session_id.to_string()));
    }
    Ok(session)
}

/// Cart operations for anonymous shoppers.
///
/// Every cart operation first checks that the session exists and has not
/// expired; the cart logic itself is the registered user's.
#[derive(Clone)]
pub struct GuestCartService<S: Store> {
    store: S,
    carts: CartService<S>,
    clock: Arc<dyn Clock>,
    session_ttl: Duration,
}

impl<S: Store + Clone> GuestCartService<S> {
    pub fn new(store: S) -> Self {
        Self {
            carts: CartService::new(store.clone()),
            store,
            clock: Arc::new(SystemClock),
            session_ttl: Duration::hours(DEFAULT_SESSION_TTL_HOURS),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.carts = self.carts.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }
}

impl<S: Store> GuestCartService<S> {
    async fn owner(&self, session_id: &SessionId) -> Result<CartOwner> {
        require_live_session(&self.store, session_id, self.clock.now()).await?;
        Ok(CartOwner::Guest(session_id.clone()))
    }

    /// Opens a new session with a fresh random id.
    #[tracing::instrument(skip(self))]
    pub async fn create_session(&self) -> Result<GuestSession> {
        let now = self.clock.now();
        let session = GuestSession {
            session_id: SessionId::generate(),
            email: None,
            created_at: now,
            expires_at: now + self.session_ttl,
        };
        self.store.save_session(session.clone()).await?;
        tracing::info!(session_id = %session.session_id, "Guest session created");
        Ok(session)
    }

    /// Returns the session if it exists and has not expired.
    pub async fn session(&self, session_id: &SessionId) -> Result<GuestSession> {
        require_live_session(&self.store, session_id, self.clock.now()).await
    }

    /// Records the shopper's email for later order correlation.
    pub async fn attach_email(
        &self,
        session_id: &SessionId,
        email: impl Into<String>,
    ) -> Result<GuestSession> {
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| DomainError::SessionNotFound(session_id.to_string()))?;
        session.email = Some(email.into());
        self.store.save_session(session.clone()).await?;
        Ok(session)
    }

    pub async fn add_item(
        &self,
        session_id: &SessionId,
        product_id: ProductId,
        quantity: u32,
    ) -> Result<CartLine> {
        let owner = self.owner(session_id).await?;
        self.carts.add_item(&owner, product_id, quantity).await
    }

    pub async fn update_item(
        &self,
        session_id: &SessionId,
        product_id: ProductId,
        quantity: u32,
    ) -> Result<CartLine> {
        let owner = self.owner(session_id).await?;
        self.carts.update_item(&owner, product_id, quantity).await
    }

    pub async fn remove_item(&self, session_id: &SessionId, product_id: ProductId) -> Result<()> {
        let owner = self.owner(session_id).await?;
        self.carts.remove_item(&owner, product_id).await
    }

    pub async fn clear(&self, session_id: &SessionId) -> Result<u64> {
        let owner = self.owner(session_id).await?;
        self.carts.clear(&owner).await
    }

    pub async fn lines(&self, session_id: &SessionId) -> Result<Vec<PricedLine>> {
        let owner = self.owner(session_id).await?;
        self.carts.lines(&owner).await
    }

    pub async fn total(&self, session_id: &SessionId) -> Result<Money> {
        let owner = self.owner(session_id).await?;
        self.carts.total(&owner).await
    }

    pub async fn item_count(&self, session_id: &SessionId) -> Result<u32> {
        let owner = self.owner(session_id).await?;
        self.carts.item_count(&owner).await
    }

    /// Deletes expired sessions together with their cart lines.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup_expired_sessions(&self) -> Result<u64> {
        let reclaimed = self.store.purge_expired_sessions(self.clock.now()).await?;
        metrics::counter!("guest_sessions_reclaimed_total").increment(reclaimed);
        if reclaimed > 0 {
            tracing::info!(reclaimed, "Expired guest sessions removed");
        }
        Ok(reclaimed)
    }
}
