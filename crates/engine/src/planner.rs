//! Transaction planner.
//!
//! Pure functions that turn resolved Value snapshots and a request into a
//! [`TransactionPlan`]. Nothing here touches the database: planning reads the
//! snapshots it is given and the executor later checks, row by row, that
//! they are still current.

use chrono::{DateTime, Utc};

use crate::{
    commands::{InternalParty, StripeParty},
    eligibility::EligibilityPolicy,
    plan::TransactionPlan,
    rules::RuleEvaluator,
    steps::LightrailStep,
    transactions::TransactionType,
    values::Value,
};

pub mod attach;
pub mod checkout;
pub mod debit_credit;
pub mod initial_balance;
pub mod reversal;
pub mod transfer;

/// A party after resolution.
#[derive(Clone, Debug, PartialEq)]
pub enum ResolvedParty {
    Lightrail(Value),
    Stripe(StripeParty),
    Internal(InternalParty),
}

/// Everything a planner needs besides the parties themselves.
#[derive(Clone, Copy, Debug)]
pub struct PlanContext<'a> {
    pub transaction_id: &'a str,
    pub request_hash: &'a str,
    pub now: DateTime<Utc>,
    pub created_by: &'a str,
    pub metadata: Option<&'a serde_json::Value>,
    pub evaluator: &'a dyn RuleEvaluator,
    pub policy: EligibilityPolicy,
}

impl PlanContext<'_> {
    /// Empty plan that starts its own chain.
    pub(crate) fn plan(&self, transaction_type: TransactionType, currency: &str) -> TransactionPlan {
        TransactionPlan {
            id: self.transaction_id.to_string(),
            transaction_type,
            currency: currency.to_string(),
            steps: Vec::new(),
            totals: None,
            line_items: None,
            payment_sources: None,
            tax: None,
            pending_void_date: None,
            root_transaction_id: self.transaction_id.to_string(),
            chain: None,
            mutations: Vec::new(),
            request_hash: self.request_hash.to_string(),
            created_date: self.now,
            created_by: self.created_by.to_string(),
            metadata: self.metadata.cloned(),
        }
    }
}

/// Step applying the given changes to a Value snapshot.
///
/// Quantities the Value does not track stay `None`, except that a
/// rule-driven Value still records its `balance_change`.
pub(crate) fn value_step(
    value: &Value,
    balance_change: Option<i64>,
    uses_change: Option<i64>,
) -> LightrailStep {
    let (balance_before, balance_change, balance_after) = match value.balance {
        Some(before) => {
            let change = balance_change.unwrap_or(0);
            (Some(before), Some(change), Some(before + change))
        }
        None if value.balance_rule.is_some() => (None, balance_change, None),
        None => (None, None, None),
    };
    let (uses_before, uses_change, uses_after) = match value.uses_remaining {
        Some(before) => {
            let change = uses_change.unwrap_or(0);
            (Some(before), Some(change), Some(before + change))
        }
        None => (None, None, None),
    };
    LightrailStep {
        value_id: value.id.clone(),
        contact_id: value.contact_id.clone(),
        code: value.code(),
        balance_before,
        balance_after,
        balance_change,
        uses_remaining_before: uses_before,
        uses_remaining_after: uses_after,
        uses_remaining_change: uses_change,
        balance_rule: value.balance_rule.clone(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::rules::ExpressionRuleEvaluator;

    pub(crate) static EVALUATOR: ExpressionRuleEvaluator = ExpressionRuleEvaluator;

    pub(crate) fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_800_000_000, 0).unwrap()
    }

    pub(crate) fn ctx(transaction_id: &str) -> PlanContext<'_> {
        PlanContext {
            transaction_id,
            request_hash: "hash",
            now: now(),
            created_by: "tester",
            metadata: None,
            evaluator: &EVALUATOR,
            policy: EligibilityPolicy::default(),
        }
    }

    #[test]
    fn value_step_tracks_only_present_quantities() {
        let mut v = crate::values::tests::value("v1", Some(300));
        let step = value_step(&v, Some(-100), Some(-1));
        assert_eq!(step.balance_after, Some(200));
        assert_eq!(step.uses_remaining_change, None);

        v.uses_remaining = Some(2);
        let step = value_step(&v, None, Some(-1));
        assert_eq!(step.balance_change, Some(0));
        assert_eq!(step.uses_remaining_after, Some(1));
    }
}
