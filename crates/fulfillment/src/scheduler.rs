//! Periodic background tasks: order lifecycle promotion and guest session sweep.

use std::time::Duration;

use domain::{GuestCartService, OrderService};
use store::Store;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Default interval between lifecycle passes.
pub const DEFAULT_LIFECYCLE_INTERVAL: Duration = Duration::from_secs(30);

/// Default interval between guest session sweeps.
pub const DEFAULT_SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

fn ticker(every: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Spawns the loop that promotes orders through the automatic lifecycle.
///
/// A pass never fails; orders it could not promote are retried next tick.
/// The loop stops when `shutdown` is cancelled, after any running pass.
pub fn spawn_lifecycle_scheduler<S>(
    orders: OrderService<S>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    S: Store + Clone + 'static,
{
    tokio::spawn(async move {
        let mut ticker = ticker(every);
        tracing::info!(interval_secs = every.as_secs_f64(), "Lifecycle scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = orders.advance_lifecycle().await;
                    if report.promoted > 0 || report.failures > 0 {
                        tracing::info!(
                            promoted = report.promoted,
                            conflicts = report.conflicts,
                            failures = report.failures,
                            "Lifecycle pass finished"
                        );
                    }
                }
            }
        }

        tracing::info!("Lifecycle scheduler stopped");
    })
}

/// Spawns the loop that deletes expired guest sessions and their carts.
pub fn spawn_session_sweeper<S>(
    guests: GuestCartService<S>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    S: Store + Clone + 'static,
{
    tokio::spawn(async move {
        let mut ticker = ticker(every);
        tracing::info!(interval_secs = every.as_secs_f64(), "Session sweeper started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = guests.cleanup_expired_sessions().await {
                        tracing::warn!(error = %e, "Session sweep failed");
                    }
                }
            }
        }

        tracing::info!("Session sweeper stopped");
    })
}
