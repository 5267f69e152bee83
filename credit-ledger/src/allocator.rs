//! Debit allocation
//!
//! Decides which grants satisfy a debit and by how much. Pure: no I/O, no
//! clock, no mutation of its inputs. Callers pass grants already filtered to
//! spendable (not expired) and ordered by priority descending, then grant id
//! ascending.

use crate::types::{CreditGrant, GrantId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Amount drawn from a single grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consumption {
    pub grant_id: GrantId,
    pub consumed: Decimal,
    pub remaining_before: Decimal,
    pub remaining_after: Decimal,
}

/// Allocation decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allocation {
    /// Consumptions in the order they were drawn; consumed amounts sum to
    /// the requested amount
    Feasible(Vec<Consumption>),

    /// Spendable credit does not cover the request. Nothing is consumed.
    Infeasible {
        requested: Decimal,
        available: Decimal,
    },
}

impl Allocation {
    pub fn is_feasible(&self) -> bool {
        matches!(self, Allocation::Feasible(_))
    }

    /// Consumptions of a feasible allocation, empty otherwise
    pub fn consumptions(&self) -> &[Consumption] {
        match self {
            Allocation::Feasible(consumptions) => consumptions,
            Allocation::Infeasible { .. } => &[],
        }
    }
}

/// Sum of positive remaining amounts
pub fn available_credit(grants: &[CreditGrant]) -> Decimal {
    grants
        .iter()
        .map(|g| g.remaining)
        .filter(|remaining| *remaining > Decimal::ZERO)
        .sum()
}

/// Walk `grants` in order, taking `min(remaining, still owed)` from each until
/// `requested` is covered.
///
/// Feasibility is decided up front from the total, so an infeasible request
/// never yields a partial plan. Grants with nothing remaining are skipped and
/// never appear in the result.
pub fn allocate(requested: Decimal, grants: &[CreditGrant]) -> Allocation {
    let available = available_credit(grants);
    if available < requested {
        return Allocation::Infeasible {
            requested,
            available,
        };
    }

    let mut owed = requested;
    let mut consumptions = Vec::new();

    for grant in grants {
        if owed <= Decimal::ZERO {
            break;
        }
        if grant.remaining <= Decimal::ZERO {
            continue;
        }

        let consumed = grant.remaining.min(owed);
        owed -= consumed;

        consumptions.push(Consumption {
            grant_id: grant.grant_id,
            consumed,
            remaining_before: grant.remaining,
            remaining_after: grant.remaining - consumed,
        });
    }

    Allocation::Feasible(consumptions)
}
