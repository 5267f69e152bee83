//! Ledger storage
//!
//! Grants and the append-only activity log, mutated only inside a
//! [`LedgerTx`]. A transaction that is dropped without `commit` leaves no
//! trace.

pub mod memory;
pub mod postgres;

use crate::error::Result;
use crate::types::{
    ActivityQuery, ActivityRecord, CreditGrant, DepositRequest, GrantId, NewActivity,
    TransactionId, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

/// Durable store of grants and activity
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a new unit of work
    async fn begin(&self) -> Result<Box<dyn LedgerTx>>;

    /// Activity for a user ordered by transaction id ascending
    async fn list_activity(
        &self,
        user_id: UserId,
        query: &ActivityQuery,
    ) -> Result<Vec<ActivityRecord>>;

    /// Every grant of a user, including consumed and expired ones
    async fn list_grants(&self, user_id: UserId) -> Result<Vec<CreditGrant>>;
}

/// One atomic unit of work against the store
#[async_trait]
pub trait LedgerTx: Send {
    /// Lock the user row for the rest of the transaction.
    /// Returns `false` if the user does not exist.
    async fn lock_user(&mut self, user_id: UserId) -> Result<bool>;

    /// Insert a grant with remaining = deposited = `request.amount`
    async fn insert_grant(&mut self, request: &DepositRequest, now: DateTime<Utc>)
        -> Result<GrantId>;

    async fn insert_activity(
        &mut self,
        activity: &NewActivity,
        now: DateTime<Utc>,
    ) -> Result<TransactionId>;

    /// Lock and classify the user's grants with something remaining, ordered
    /// by priority descending then grant id ascending
    async fn fetch_spendable_grants(
        &mut self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<GrantScan>;

    async fn update_grant_remaining(
        &mut self,
        grant_id: GrantId,
        remaining: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Flag every non-expired grant with `expiry <= now` as expired
    async fn expire_due_grants(&mut self, now: DateTime<Utc>) -> Result<Vec<GrantId>>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Grants a debit may draw from, plus whether any candidate was excluded
/// because of its expiry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GrantScan {
    pub usable: Vec<CreditGrant>,
    pub expired_seen: bool,
}

impl GrantScan {
    /// Split ordered candidates (remaining > 0) into usable and expired.
    /// Order of the usable grants is preserved.
    pub fn classify(candidates: Vec<CreditGrant>, now: DateTime<Utc>) -> Self {
        let mut scan = GrantScan::default();

        for grant in candidates {
            if grant.remaining <= Decimal::ZERO {
                continue;
            }
            if grant.is_past_expiry(now) {
                scan.expired_seen = true;
            } else {
                scan.usable.push(grant);
            }
        }

        scan
    }
}
