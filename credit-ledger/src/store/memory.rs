//! In-process ledger store
//!
//! Every transaction holds the single writer lock and works on a private copy
//! of the state, which replaces the shared state on commit. Readers wait for
//! the lock, so they never observe a half-applied unit of work.

use super::{GrantScan, LedgerStore, LedgerTx};
use crate::error::{LedgerError, Result};
use crate::types::{
    ActivityQuery, ActivityRecord, CreditGrant, DepositRequest, GrantId, NewActivity,
    TransactionId, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Default, Clone)]
struct LedgerState {
    users: HashSet<UserId>,
    grants: BTreeMap<GrantId, CreditGrant>,
    activity: Vec<ActivityRecord>,
    last_grant_id: i64,
    last_transaction_id: i64,
}

/// Ledger store kept entirely in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<Mutex<LedgerState>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a user known to the ledger (users are owned by an external registry)
    pub async fn register_user(&self, user_id: UserId) {
        let mut state = self.state.lock().await;
        state.users.insert(user_id);
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();

        Ok(Box::new(MemoryLedgerTx { guard, working }))
    }

    async fn list_activity(
        &self,
        user_id: UserId,
        query: &ActivityQuery,
    ) -> Result<Vec<ActivityRecord>> {
        let state = self.state.lock().await;
        let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);

        Ok(state
            .activity
            .iter()
            .filter(|r| r.user_id == user_id)
            .filter(|r| query.after_id.map_or(true, |after| r.transaction_id > after))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_grants(&self, user_id: UserId) -> Result<Vec<CreditGrant>> {
        let state = self.state.lock().await;

        Ok(state
            .grants
            .values()
            .filter(|g| g.user_id == user_id)
            .cloned()
            .collect())
    }
}

/// Transaction over [`MemoryLedgerStore`]
pub struct MemoryLedgerTx {
    guard: OwnedMutexGuard<LedgerState>,
    working: LedgerState,
}

#[async_trait]
impl LedgerTx for MemoryLedgerTx {
    async fn lock_user(&mut self, user_id: UserId) -> Result<bool> {
        Ok(self.working.users.contains(&user_id))
    }

    async fn insert_grant(
        &mut self,
        request: &DepositRequest,
        now: DateTime<Utc>,
    ) -> Result<GrantId> {
        if !self.working.users.contains(&request.user_id) {
            return Err(LedgerError::Storage(format!(
                "credit_grants.user_id references unknown user {}",
                request.user_id
            )));
        }

        self.working.last_grant_id += 1;
        let grant_id = GrantId(self.working.last_grant_id);

        self.working.grants.insert(
            grant_id,
            CreditGrant {
                user_id: request.user_id,
                grant_id,
                deposited: request.amount,
                remaining: request.amount,
                transaction_type: request.transaction_type.clone(),
                priority: request.priority,
                expiry: request.expiry,
                expired: false,
                created_at: now,
                updated_at: now,
            },
        );

        Ok(grant_id)
    }

    async fn insert_activity(
        &mut self,
        activity: &NewActivity,
        now: DateTime<Utc>,
    ) -> Result<TransactionId> {
        match self.working.grants.get(&activity.grant_id) {
            Some(grant) if grant.user_id == activity.user_id => {}
            _ => {
                return Err(LedgerError::Storage(format!(
                    "activity_log.grant_id references unknown grant {}",
                    activity.grant_id
                )))
            }
        }

        self.working.last_transaction_id += 1;
        let transaction_id = TransactionId(self.working.last_transaction_id);

        self.working.activity.push(ActivityRecord {
            transaction_id,
            user_id: activity.user_id,
            grant_id: activity.grant_id,
            is_credit: activity.is_credit,
            amount: activity.amount,
            created_at: now,
        });

        Ok(transaction_id)
    }

    async fn fetch_spendable_grants(
        &mut self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<GrantScan> {
        let mut candidates: Vec<CreditGrant> = self
            .working
            .grants
            .values()
            .filter(|g| g.user_id == user_id && g.remaining > Decimal::ZERO)
            .cloned()
            .collect();

        candidates.sort_by_key(|g| (Reverse(g.priority), g.grant_id));

        Ok(GrantScan::classify(candidates, now))
    }

    async fn update_grant_remaining(
        &mut self,
        grant_id: GrantId,
        remaining: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if remaining < Decimal::ZERO {
            return Err(LedgerError::Storage(format!(
                "remaining of grant {} would become negative",
                grant_id
            )));
        }

        let grant = self
            .working
            .grants
            .get_mut(&grant_id)
            .ok_or_else(|| LedgerError::Storage(format!("grant {} not found", grant_id)))?;

        grant.remaining = remaining;
        grant.updated_at = now;

        Ok(())
    }

    async fn expire_due_grants(&mut self, now: DateTime<Utc>) -> Result<Vec<GrantId>> {
        let mut expired = Vec::new();

        for grant in self.working.grants.values_mut() {
            if !grant.expired && grant.expiry <= now {
                grant.expired = true;
                grant.updated_at = now;
                expired.push(grant.grant_id);
            }
        }

        Ok(expired)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryLedgerTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        debug!("Discarding in-memory transaction");
        Ok(())
    }
}
