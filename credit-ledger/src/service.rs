//! Credit service
//!
//! Runs the allocator and the store inside one unit of work per mutation and
//! keeps the activity cache coherent with committed state.

use crate::allocator::{allocate, Allocation};
use crate::cache::{CacheLookup, SharedActivityCache};
use crate::config::Config;
use crate::error::{LedgerError, Result};
use crate::metrics::{
    CACHE_HITS, CACHE_INVALIDATIONS, CACHE_MISSES, CACHE_SETS, DEPOSITS_TOTAL,
    OPERATION_DURATION, WITHDRAWALS_TOTAL, WITHDRAWAL_REJECTIONS,
};
use crate::store::{LedgerStore, LedgerTx};
use crate::types::{
    ActivityQuery, ActivityRecord, DebitReceipt, DebitRequest, DepositRequest, GrantId,
    NewActivity, UserId,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use validator::Validate;

/// Fractional digits the store keeps for amounts
const AMOUNT_SCALE: u32 = 2;

/// Tunables for [`CreditService`]
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// TTL of populated activity pages
    pub cache_ttl: Duration,

    /// Deadline of one unit of work, including waiting for locks
    pub operation_timeout: Duration,

    pub max_credit_amount: Decimal,
    pub max_page_size: u32,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(600),
            operation_timeout: Duration::from_secs(10),
            max_credit_amount: Decimal::from(1_000_000_000u64),
            max_page_size: 1000,
        }
    }
}

impl ServiceSettings {
    pub fn from_config(config: &Config) -> std::result::Result<Self, String> {
        Ok(Self {
            cache_ttl: config.cache.ttl(),
            operation_timeout: config.ledger.operation_timeout(),
            max_credit_amount: config.ledger.max_credit_amount()?,
            max_page_size: config.ledger.max_page_size,
        })
    }
}

pub struct CreditService {
    store: Arc<dyn LedgerStore>,
    cache: SharedActivityCache,
    settings: ServiceSettings,
}

impl CreditService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        cache: SharedActivityCache,
        settings: ServiceSettings,
    ) -> Self {
        CreditService {
            store,
            cache,
            settings,
        }
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// Grant credit to a user. Returns the new grant id.
    pub async fn deposit(&self, request: DepositRequest) -> Result<GrantId> {
        let _timer = OPERATION_DURATION
            .with_label_values(&["deposit"])
            .start_timer();

        let now = Utc::now();
        self.validate_deposit(&request, now)?;

        let grant_id = self
            .with_deadline("deposit", self.deposit_tx(&request, now))
            .await?;

        DEPOSITS_TOTAL.inc();
        info!(
            user_id = %request.user_id,
            grant_id = %grant_id,
            amount = %request.amount,
            priority = request.priority,
            "Credit deposited"
        );

        self.invalidate(request.user_id).await;
        Ok(grant_id)
    }

    /// Debit a user across their spendable grants, highest priority first
    pub async fn withdraw(&self, request: DebitRequest) -> Result<DebitReceipt> {
        let _timer = OPERATION_DURATION
            .with_label_values(&["withdraw"])
            .start_timer();

        validate_amount(request.amount)?;

        let now = Utc::now();
        let result = self
            .with_deadline("withdraw", self.withdraw_tx(&request, now))
            .await;

        match &result {
            Ok(receipt) => {
                WITHDRAWALS_TOTAL.inc();
                info!(
                    user_id = %request.user_id,
                    amount = %request.amount,
                    grants = receipt.consumptions.len(),
                    "Credit debited"
                );
                self.invalidate(request.user_id).await;
            }
            Err(e) if e.is_business_rule() => {
                WITHDRAWAL_REJECTIONS.with_label_values(&[e.kind()]).inc();
                info!(user_id = %request.user_id, amount = %request.amount, reason = e.kind(), "Debit rejected");
            }
            Err(e) => {
                warn!(user_id = %request.user_id, error = %e, "Debit failed");
            }
        }

        result
    }

    /// Activity history, served from the cache when possible
    pub async fn list_transactions(
        &self,
        user_id: UserId,
        query: ActivityQuery,
    ) -> Result<Vec<ActivityRecord>> {
        let _timer = OPERATION_DURATION
            .with_label_values(&["list_transactions"])
            .start_timer();

        self.validate_query(&query)?;
        let signature = query.signature();

        let generation = match self.cache.get(user_id, &signature).await {
            Ok(CacheLookup::Hit(records)) => {
                CACHE_HITS.inc();
                debug!(user_id = %user_id, query = %signature, "Activity cache hit");
                return Ok(records);
            }
            Ok(CacheLookup::Miss { generation }) => {
                CACHE_MISSES.inc();
                debug!(user_id = %user_id, query = %signature, "Activity cache miss");
                Some(generation)
            }
            Err(e) => {
                CACHE_MISSES.inc();
                warn!(user_id = %user_id, error = %e, "Activity cache read failed, using store");
                None
            }
        };

        let records = self
            .with_deadline(
                "list_transactions",
                self.store.list_activity(user_id, &query),
            )
            .await?;

        if let Some(generation) = generation {
            match self
                .cache
                .set(user_id, &signature, generation, &records, self.settings.cache_ttl)
                .await
            {
                Ok(()) => CACHE_SETS.inc(),
                Err(e) => warn!(user_id = %user_id, error = %e, "Failed to populate activity cache"),
            }
        }

        Ok(records)
    }

    async fn deposit_tx(&self, request: &DepositRequest, now: DateTime<Utc>) -> Result<GrantId> {
        let mut tx = self.store.begin().await?;
        let outcome = apply_deposit(&mut *tx, request, now).await;
        finish(tx, outcome).await
    }

    async fn withdraw_tx(&self, request: &DebitRequest, now: DateTime<Utc>) -> Result<DebitReceipt> {
        let mut tx = self.store.begin().await?;
        let outcome = apply_withdraw(&mut *tx, request, now).await;
        finish(tx, outcome).await
    }

    /// Bound `work` by the operation timeout. Dropping the timed-out future
    /// drops its transaction, which rolls it back.
    async fn with_deadline<T, F>(&self, operation: &'static str, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.settings.operation_timeout;

        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout_ms = timeout.as_millis() as u64, "Ledger operation timed out");
                Err(LedgerError::Storage(format!(
                    "{} timed out after {}ms",
                    operation,
                    timeout.as_millis()
                )))
            }
        }
    }

    async fn invalidate(&self, user_id: UserId) {
        match self.cache.invalidate_user(user_id).await {
            Ok(()) => CACHE_INVALIDATIONS.inc(),
            Err(e) => warn!(user_id = %user_id, error = %e, "Failed to invalidate activity cache"),
        }
    }

    fn validate_deposit(&self, request: &DepositRequest, now: DateTime<Utc>) -> Result<()> {
        request
            .validate()
            .map_err(|e| LedgerError::Validation(e.to_string()))?;

        validate_amount(request.amount)?;

        if request.amount > self.settings.max_credit_amount {
            return Err(LedgerError::Validation(format!(
                "amount {} exceeds the maximum credit of {}",
                request.amount, self.settings.max_credit_amount
            )));
        }

        if request.expiry <= now {
            return Err(LedgerError::Validation(
                "expiry must be in the future".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_query(&self, query: &ActivityQuery) -> Result<()> {
        match query.limit {
            Some(0) => Err(LedgerError::Validation(
                "limit must be positive".to_string(),
            )),
            Some(limit) if limit > self.settings.max_page_size => Err(LedgerError::Validation(
                format!("limit must not exceed {}", self.settings.max_page_size),
            )),
            _ => Ok(()),
        }
    }
}

async fn apply_deposit(
    tx: &mut dyn LedgerTx,
    request: &DepositRequest,
    now: DateTime<Utc>,
) -> Result<GrantId> {
    if !tx.lock_user(request.user_id).await? {
        return Err(unknown_user(request.user_id));
    }

    let grant_id = tx.insert_grant(request, now).await?;
    tx.insert_activity(
        &NewActivity::credit(request.user_id, grant_id, request.amount),
        now,
    )
    .await?;

    Ok(grant_id)
}

async fn apply_withdraw(
    tx: &mut dyn LedgerTx,
    request: &DebitRequest,
    now: DateTime<Utc>,
) -> Result<DebitReceipt> {
    let user_id = request.user_id;

    if !tx.lock_user(user_id).await? {
        return Err(unknown_user(user_id));
    }

    let scan = tx.fetch_spendable_grants(user_id, now).await?;
    if scan.usable.is_empty() {
        return Err(if scan.expired_seen {
            LedgerError::AllCreditsExpired { user_id }
        } else {
            LedgerError::NoCreditHistory { user_id }
        });
    }

    let consumptions = match allocate(request.amount, &scan.usable) {
        Allocation::Feasible(consumptions) => consumptions,
        Allocation::Infeasible {
            requested,
            available,
        } => {
            return Err(LedgerError::InsufficientCredit {
                requested,
                available,
            })
        }
    };

    debug!(user_id = %user_id, plan = ?consumptions, "Debit allocated");

    for consumption in &consumptions {
        tx.update_grant_remaining(consumption.grant_id, consumption.remaining_after, now)
            .await?;
        tx.insert_activity(
            &NewActivity::debit(user_id, consumption.grant_id, consumption.consumed),
            now,
        )
        .await?;
    }

    Ok(DebitReceipt {
        user_id,
        amount: request.amount,
        consumptions,
    })
}

/// Commit on success, roll back otherwise. The original error wins over a
/// rollback failure.
async fn finish<T>(tx: Box<dyn LedgerTx>, outcome: Result<T>) -> Result<T> {
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                error!(error = %rollback_err, cause = %err, "Rollback failed");
            }
            Err(err)
        }
    }
}

fn validate_amount(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::Validation(
            "amount must be positive".to_string(),
        ));
    }

    if amount.normalize().scale() > AMOUNT_SCALE {
        return Err(LedgerError::Validation(format!(
            "amount {} has more than {} decimal places",
            amount, AMOUNT_SCALE
        )));
    }

    Ok(())
}

fn unknown_user(user_id: UserId) -> LedgerError {
    LedgerError::Validation(format!("unknown user {}", user_id))
}
