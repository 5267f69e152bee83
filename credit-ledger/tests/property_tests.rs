//! Property-based tests for ledger invariants
//!
//! - Allocation is feasible exactly when the request fits the balance
//! - A feasible allocation consumes exactly the requested amount
//! - Per grant: Σcredit − Σdebit == remaining, never above deposited

use chrono::{Duration as ChronoDuration, Utc};
use credit_ledger::cache::{MemoryActivityCache, SharedActivityCache};
use credit_ledger::store::{LedgerStore, MemoryLedgerStore};
use credit_ledger::types::{CreditGrant, DebitRequest, DepositRequest, GrantId, UserId};
use credit_ledger::{allocate, ActivityQuery, Allocation, CreditService, LedgerError, ServiceSettings};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

/// Strategy for generating valid amounts (positive, cent precision)
fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..100_000i64).prop_map(|cents| Decimal::new(cents, 2))
}

/// Strategy for grant remainders, including fully consumed grants
fn remaining_strategy() -> impl Strategy<Value = Decimal> {
    (0i64..100_000i64).prop_map(|cents| Decimal::new(cents, 2))
}

/// Grants in retrieval order: priority descending, id ascending
fn grants_strategy() -> impl Strategy<Value = Vec<CreditGrant>> {
    prop::collection::vec((remaining_strategy(), -5i32..5i32), 0..12).prop_map(|specs| {
        let now = Utc::now();
        let user_id = UserId::random();
        let mut grants: Vec<CreditGrant> = specs
            .into_iter()
            .enumerate()
            .map(|(i, (remaining, priority))| CreditGrant {
                user_id,
                grant_id: GrantId(i as i64 + 1),
                deposited: remaining.max(Decimal::new(1, 2)),
                remaining,
                transaction_type: "Promo".to_string(),
                priority,
                expiry: now + ChronoDuration::days(1),
                expired: false,
                created_at: now,
                updated_at: now,
            })
            .collect();
        grants.sort_by_key(|g| (std::cmp::Reverse(g.priority), g.grant_id));
        grants
    })
}

#[derive(Debug, Clone)]
enum Op {
    Deposit { amount: Decimal, priority: i32 },
    Withdraw { amount: Decimal },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (amount_strategy(), 0i32..4i32).prop_map(|(amount, priority)| Op::Deposit { amount, priority }),
        amount_strategy().prop_map(|amount| Op::Withdraw { amount }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Feasible iff requested ≤ Σremaining
    #[test]
    fn prop_feasibility_matches_balance(grants in grants_strategy(), requested in amount_strategy()) {
        let available: Decimal = grants.iter().map(|g| g.remaining).sum();
        let allocation = allocate(requested, &grants);

        prop_assert_eq!(allocation.is_feasible(), requested <= available);
        if let Allocation::Infeasible { requested: r, available: a } = allocation {
            prop_assert_eq!(r, requested);
            prop_assert_eq!(a, available);
        }
    }

    /// Feasible plans consume exactly the request, never overdraw, and
    /// never touch a grant with nothing left
    #[test]
    fn prop_allocation_conserves_amount(grants in grants_strategy(), requested in amount_strategy()) {
        if let Allocation::Feasible(consumptions) = allocate(requested, &grants) {
            let consumed: Decimal = consumptions.iter().map(|c| c.consumed).sum();
            prop_assert_eq!(consumed, requested);

            let before: Decimal = consumptions.iter().map(|c| c.remaining_before).sum();
            let after: Decimal = consumptions.iter().map(|c| c.remaining_after).sum();
            prop_assert_eq!(after, before - requested);

            for c in &consumptions {
                prop_assert!(c.consumed > Decimal::ZERO);
                prop_assert!(c.remaining_after >= Decimal::ZERO);
                prop_assert_eq!(c.remaining_after, c.remaining_before - c.consumed);
            }

            // Only the last grant touched may be left with something remaining
            if let Some((_, head)) = consumptions.split_last() {
                prop_assert!(head.iter().all(|c| c.remaining_after == Decimal::ZERO));
            }
        }
    }

    /// Every grant's activity replays to its remaining amount
    #[test]
    fn prop_activity_replays_to_remaining(ops in prop::collection::vec(op_strategy(), 1..25)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = Arc::new(MemoryLedgerStore::new());
            let cache: SharedActivityCache = Arc::new(MemoryActivityCache::new(100, "activity".to_string()));
            let service = CreditService::new(store.clone(), cache, ServiceSettings::default());
            let user = UserId::random();
            store.register_user(user).await;

            for op in ops {
                match op {
                    Op::Deposit { amount, priority } => {
                        service
                            .deposit(DepositRequest {
                                user_id: user,
                                amount,
                                transaction_type: "Promo".to_string(),
                                priority,
                                expiry: Utc::now() + ChronoDuration::days(1),
                            })
                            .await
                            .unwrap();
                    }
                    Op::Withdraw { amount } => {
                        match service.withdraw(DebitRequest { user_id: user, amount }).await {
                            Ok(receipt) => {
                                let consumed: Decimal = receipt.consumptions.iter().map(|c| c.consumed).sum();
                                prop_assert_eq!(consumed, amount);
                            }
                            Err(LedgerError::InsufficientCredit { .. })
                            | Err(LedgerError::NoCreditHistory { .. }) => {}
                            Err(e) => prop_assert!(false, "unexpected error: {:?}", e),
                        }
                    }
                }
            }

            let mut replayed: HashMap<GrantId, Decimal> = HashMap::new();
            for record in store.list_activity(user, &ActivityQuery::default()).await.unwrap() {
                prop_assert!(record.amount > Decimal::ZERO);
                let balance = replayed.entry(record.grant_id).or_insert(Decimal::ZERO);
                if record.is_credit {
                    *balance += record.amount;
                } else {
                    *balance -= record.amount;
                }
            }

            for grant in store.list_grants(user).await.unwrap() {
                prop_assert!(grant.remaining >= Decimal::ZERO);
                prop_assert!(grant.remaining <= grant.deposited);
                prop_assert_eq!(replayed.get(&grant.grant_id).copied(), Some(grant.remaining));
            }

            Ok(())
        })?;
    }
}
