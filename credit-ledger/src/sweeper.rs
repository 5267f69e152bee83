//! Expiry sweeper
//!
//! Periodically flags grants whose expiry has passed. Debits already skip
//! past-expiry grants on their own, so the sweep only makes the flag durable.

use crate::error::Result;
use crate::metrics::{GRANTS_EXPIRED_TOTAL, SWEEP_FAILURES_TOTAL};
use crate::store::LedgerStore;
use crate::types::GrantId;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

/// Outcome of one sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<GrantId>,
    pub swept_at: DateTime<Utc>,
}

impl SweepReport {
    pub fn count(&self) -> usize {
        self.expired.len()
    }
}

pub struct ExpirySweeper {
    store: Arc<dyn LedgerStore>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(store: Arc<dyn LedgerStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Flag every non-expired grant with `expiry <= now`, in one transaction
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut tx = self.store.begin().await?;

        let expired = match tx.expire_due_grants(now).await {
            Ok(expired) => expired,
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    error!(error = %rollback_err, "Sweep rollback failed");
                }
                return Err(e);
            }
        };
        tx.commit().await?;

        GRANTS_EXPIRED_TOTAL.inc_by(expired.len() as u64);

        Ok(SweepReport {
            expired,
            swept_at: now,
        })
    }

    /// Sweep on every tick until `shutdown` flips to `true`. The first tick
    /// fires immediately; a failed sweep is retried on the next tick.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Expiry sweeper started");

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep(Utc::now()).await {
                        Ok(report) => info!(expired = report.count(), "Expiry sweep complete"),
                        Err(e) => {
                            SWEEP_FAILURES_TOTAL.inc();
                            error!(error = %e, "Expiry sweep failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Expiry sweeper stopped");
    }

    /// Run the sweep loop on a background task
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLedgerStore;
    use crate::types::{DepositRequest, UserId};
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    async fn store_with_grant(expiry: DateTime<Utc>) -> (Arc<MemoryLedgerStore>, UserId) {
        let store = Arc::new(MemoryLedgerStore::new());
        let user = UserId::random();
        store.register_user(user).await;

        let mut tx = store.begin().await.unwrap();
        tx.insert_grant(
            &DepositRequest {
                user_id: user,
                amount: dec!(5),
                transaction_type: "Promo".to_string(),
                priority: 1,
                expiry,
            },
            Utc::now(),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        (store, user)
    }

    #[tokio::test]
    async fn test_sweep_flags_due_grants_once() {
        let now = Utc::now();
        let (store, user) = store_with_grant(now - ChronoDuration::seconds(1)).await;
        let sweeper = ExpirySweeper::new(store.clone(), Duration::from_secs(60));

        let report = sweeper.sweep(now).await.unwrap();
        assert_eq!(report.count(), 1);

        let grants = store.list_grants(user).await.unwrap();
        assert!(grants[0].expired);
        assert_eq!(grants[0].remaining, dec!(5));

        // Already flagged grants are not counted again
        assert_eq!(sweeper.sweep(now).await.unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_leaves_future_grants() {
        let now = Utc::now();
        let (store, user) = store_with_grant(now + ChronoDuration::days(1)).await;
        let sweeper = ExpirySweeper::new(store.clone(), Duration::from_secs(60));

        assert_eq!(sweeper.sweep(now).await.unwrap().count(), 0);
        assert!(!store.list_grants(user).await.unwrap()[0].expired);
    }

    #[tokio::test]
    async fn test_run_sweeps_immediately_and_stops() {
        let (store, user) = store_with_grant(Utc::now() - ChronoDuration::seconds(1)).await;
        let sweeper = Arc::new(ExpirySweeper::new(store.clone(), Duration::from_secs(3600)));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = sweeper.spawn(shutdown_rx);

        // First tick fires on start
        let mut flagged = false;
        for _ in 0..50 {
            if store.list_grants(user).await.unwrap()[0].expired {
                flagged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(flagged);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
