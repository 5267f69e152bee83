//! Credit Ledger
//!
//! Per-user credit grants that can be debited against, with an immutable
//! activity log sufficient to rebuild any user's balance history.
//!
//! # Architecture
//!
//! - **Allocator**: pure decision of which grants satisfy a debit
//! - **Store**: grants + append-only activity log behind atomic transactions
//! - **Service**: runs allocator and store inside one unit of work
//! - **Cache**: read-through activity cache, invalidated after every commit
//! - **Sweeper**: periodic job flagging grants past their expiry
//!
//! # Invariants
//!
//! - A grant's remaining amount is never negative
//! - An expired grant is never debited and never un-expired
//! - Per grant: Σ(credit records) − Σ(debit records) == remaining
//! - Activity records are never mutated or deleted

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod allocator;
pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod types;

// Re-exports
pub use allocator::{allocate, Allocation, Consumption};
pub use self::config::Config;
pub use error::{CacheError, LedgerError, Result};
pub use service::{CreditService, ServiceSettings};
pub use store::{LedgerStore, LedgerTx};
pub use sweeper::ExpirySweeper;
pub use types::{
    ActivityQuery, ActivityRecord, CreditGrant, DebitReceipt, DebitRequest, DepositRequest,
    GrantId, TransactionId, UserId,
};
