//! Postgres store integration tests
//!
//! Run with `DATABASE_URL` pointing at a scratch database:
//! `cargo test --test postgres_store_tests -- --ignored`

use chrono::{Duration as ChronoDuration, Utc};
use credit_ledger::cache::{MemoryActivityCache, SharedActivityCache};
use credit_ledger::store::{LedgerStore, PgLedgerStore};
use credit_ledger::sweeper::ExpirySweeper;
use credit_ledger::types::{DebitRequest, DepositRequest, UserId};
use credit_ledger::{ActivityQuery, CreditService, LedgerError, ServiceSettings};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;

async fn store() -> Arc<PgLedgerStore> {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("Failed to connect to database");

    let store = PgLedgerStore::from_pool(pool, 5000);
    store.ensure_schema().await.unwrap();
    Arc::new(store)
}

fn service(store: Arc<PgLedgerStore>) -> Arc<CreditService> {
    let cache: SharedActivityCache = Arc::new(MemoryActivityCache::new(100, "activity".to_string()));
    Arc::new(CreditService::new(store, cache, ServiceSettings::default()))
}

fn credit(user_id: UserId, amount: Decimal, priority: i32) -> DepositRequest {
    DepositRequest {
        user_id,
        amount,
        transaction_type: "Refund".to_string(),
        priority,
        expiry: Utc::now() + ChronoDuration::days(30),
    }
}

#[tokio::test]
#[ignore] // Requires database
async fn test_schema_is_idempotent() {
    let store = store().await;
    store.ensure_schema().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires database
async fn test_priority_spill_and_history() {
    let store = store().await;
    let service = service(store.clone());
    let user = UserId::random();
    store.register_user(user).await.unwrap();

    let high = service.deposit(credit(user, dec!(3), 10)).await.unwrap();
    let low = service.deposit(credit(user, dec!(4), 1)).await.unwrap();
    service
        .withdraw(DebitRequest {
            user_id: user,
            amount: dec!(5),
        })
        .await
        .unwrap();

    let grants = store.list_grants(user).await.unwrap();
    let remaining = |id| grants.iter().find(|g| g.grant_id == id).map(|g| g.remaining);
    assert_eq!(remaining(high), Some(dec!(0)));
    assert_eq!(remaining(low), Some(dec!(2)));

    let history = service
        .list_transactions(user, ActivityQuery::default())
        .await
        .unwrap();
    assert_eq!(history.len(), 4);
    assert!(history.windows(2).all(|w| w[0].transaction_id < w[1].transaction_id));
}

#[tokio::test]
#[ignore] // Requires database
async fn test_unknown_user_rejected() {
    let store = store().await;
    let service = service(store);

    let result = service.deposit(credit(UserId::random(), dec!(1), 1)).await;
    assert!(matches!(result, Err(LedgerError::Validation(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Requires database
async fn test_concurrent_withdrawals_serialize_on_user() {
    let store = store().await;
    let service = service(store.clone());
    let user = UserId::random();
    store.register_user(user).await.unwrap();
    service.deposit(credit(user, dec!(10), 1)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service
                .withdraw(DebitRequest {
                    user_id: user,
                    amount: dec!(1),
                })
                .await
                .is_ok()
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap() {
            succeeded += 1;
        }
    }

    assert_eq!(succeeded, 10);
    let grants = store.list_grants(user).await.unwrap();
    assert_eq!(grants[0].remaining, Decimal::ZERO);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_sweeper_flags_expired_grants() {
    let store = store().await;
    let user = UserId::random();
    store.register_user(user).await.unwrap();

    let mut request = credit(user, dec!(5), 1);
    request.expiry = Utc::now() - ChronoDuration::seconds(1);
    let mut tx = store.begin().await.unwrap();
    let grant_id = tx.insert_grant(&request, Utc::now()).await.unwrap();
    tx.commit().await.unwrap();

    let sweeper = ExpirySweeper::new(store.clone(), Duration::from_secs(60));
    let report = sweeper.sweep(Utc::now()).await.unwrap();
    assert!(report.expired.contains(&grant_id));

    let service = service(store.clone());
    let result = service
        .withdraw(DebitRequest {
            user_id: user,
            amount: dec!(1),
        })
        .await;
    assert!(matches!(result, Err(LedgerError::AllCreditsExpired { .. })));
}
