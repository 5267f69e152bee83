//! Core types for the credit ledger
//!
//! All types are designed for:
//! - Exact arithmetic (Decimal for money, never binary floating point)
//! - Direct row mapping (sqlx `FromRow` / transparent newtypes)
//! - JSON transport (serde)

use crate::allocator::Consumption;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;
use validator::Validate;

/// User identifier (owned by the external user registry)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    /// Create new user ID
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Random user ID
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Credit grant identifier (monotonic sequence)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct GrantId(pub i64);

impl fmt::Display for GrantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Activity record identifier (monotonic sequence)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct TransactionId(pub i64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One allocation of spendable amount for a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CreditGrant {
    pub user_id: UserId,
    pub grant_id: GrantId,

    /// Amount originally deposited
    pub deposited: Decimal,

    /// Amount still available for debits (never negative)
    pub remaining: Decimal,

    /// Free-form type tag supplied by the caller ("Refund", "Promo", ...)
    pub transaction_type: String,

    /// Higher priority grants are consumed first
    pub priority: i32,

    pub expiry: DateTime<Utc>,

    /// Set by the sweeper once `expiry` has passed; never reset
    pub expired: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CreditGrant {
    /// Whether the grant is excluded from debits because of its expiry.
    ///
    /// Covers both grants already flagged by the sweeper and grants whose
    /// expiry has passed but have not been swept yet.
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expired || self.expiry <= now
    }

    /// Whether a debit at `now` may draw from this grant
    pub fn is_spendable(&self, now: DateTime<Utc>) -> bool {
        !self.is_past_expiry(now) && self.remaining > Decimal::ZERO
    }
}

/// Immutable ledger entry for one grant-touching event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ActivityRecord {
    pub transaction_id: TransactionId,
    pub user_id: UserId,
    pub grant_id: GrantId,

    /// `true` for a deposit, `false` for a debit drawn from `grant_id`
    pub is_credit: bool,

    /// Always positive
    pub amount: Decimal,

    pub created_at: DateTime<Utc>,
}

/// Activity row about to be appended
#[derive(Debug, Clone, PartialEq)]
pub struct NewActivity {
    pub user_id: UserId,
    pub grant_id: GrantId,
    pub is_credit: bool,
    pub amount: Decimal,
}

impl NewActivity {
    pub fn credit(user_id: UserId, grant_id: GrantId, amount: Decimal) -> Self {
        Self {
            user_id,
            grant_id,
            is_credit: true,
            amount,
        }
    }

    pub fn debit(user_id: UserId, grant_id: GrantId, amount: Decimal) -> Self {
        Self {
            user_id,
            grant_id,
            is_credit: false,
            amount,
        }
    }
}

/// Credit deposit request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DepositRequest {
    #[serde(alias = "userid")]
    pub user_id: UserId,

    pub amount: Decimal,

    #[serde(alias = "transactiontype")]
    #[validate(length(min = 1, max = 32))]
    pub transaction_type: String,

    pub priority: i32,

    pub expiry: DateTime<Utc>,
}

/// Debit request (transient, never persisted)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebitRequest {
    #[serde(alias = "userid")]
    pub user_id: UserId,

    pub amount: Decimal,
}

/// Outcome of a committed debit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebitReceipt {
    pub user_id: UserId,
    pub amount: Decimal,

    /// One entry per grant actually drawn from, in consumption order
    pub consumptions: Vec<Consumption>,
}

/// Pagination for the activity history
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityQuery {
    pub limit: Option<u32>,

    #[serde(alias = "afterid")]
    pub after_id: Option<TransactionId>,
}

impl ActivityQuery {
    pub fn new(limit: Option<u32>, after_id: Option<TransactionId>) -> Self {
        Self { limit, after_id }
    }

    /// Canonical query signature used as the cache key suffix.
    ///
    /// Encodes both parameters, including their absence, so two differently
    /// paginated reads never share an entry.
    pub fn signature(&self) -> String {
        fn part<T: fmt::Display>(value: &Option<T>) -> String {
            value
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "-".to_string())
        }

        format!("limit={}&after_id={}", part(&self.limit), part(&self.after_id))
    }
}
