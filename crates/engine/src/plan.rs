//! In-memory transaction plans.
//!
//! A [`TransactionPlan`] is what the planner produces and the executor
//! commits: the transaction header, its steps in application order, and the
//! Value rows that must be created or changed alongside them. Plans are never
//! stored.

use chrono::{DateTime, Utc};

use crate::{
    EngineError, ResultEngine,
    commands::Party,
    contact_values::ContactValue,
    steps::{InternalStep, LightrailStep, StripeStep, TransactionStep},
    transactions::{LineItem, TaxOptions, Transaction, TransactionTotals, TransactionType},
    values::Value,
};

/// What to ask the charge gateway for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChargeOperation {
    Charge { source: String, pending: bool },
    Capture { charge_id: String },
    Refund { charge_id: String },
    Release { charge_id: String },
}

/// Card step before the gateway has been called.
///
/// `amount` follows [`StripeStep::amount`]: positive collects, negative gives
/// back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StripePlanStep {
    pub operation: ChargeOperation,
    pub amount: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanStep {
    Lightrail(LightrailStep),
    Stripe(StripePlanStep),
    Internal(InternalStep),
}

impl PlanStep {
    pub fn balance_change(&self) -> i64 {
        match self {
            Self::Lightrail(step) => step.balance_change.unwrap_or(0),
            Self::Stripe(step) => -step.amount,
            Self::Internal(step) => step.balance_change,
        }
    }

    /// The step as it would be stored, with a placeholder for card charges
    /// that have not happened.
    fn simulated(&self) -> TransactionStep {
        match self {
            Self::Lightrail(step) => TransactionStep::Lightrail(step.clone()),
            Self::Internal(step) => TransactionStep::Internal(step.clone()),
            Self::Stripe(step) => {
                let charge_id = match &step.operation {
                    ChargeOperation::Charge { source, .. } => source.clone(),
                    ChargeOperation::Capture { charge_id }
                    | ChargeOperation::Refund { charge_id }
                    | ChargeOperation::Release { charge_id } => charge_id.clone(),
                };
                TransactionStep::Stripe(StripeStep {
                    charge_id,
                    amount: step.amount,
                    charge: None,
                })
            }
        }
    }
}

/// Row changes that travel with a plan.
#[derive(Clone, Debug, PartialEq)]
pub enum ValueMutation {
    /// Insert a Value. Its balance and uses hold the *before* amounts of its
    /// step, which then brings them to their final amounts.
    Create(Value),
    /// Give an unowned Value to a contact.
    SetContact {
        value_id: String,
        contact_id: String,
    },
    /// Share a generic code with a contact.
    LinkContact(ContactValue),
}

/// Pointer from a superseded transaction to the plan's transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainUpdate {
    pub target_id: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransactionPlan {
    pub id: String,
    pub transaction_type: TransactionType,
    pub currency: String,
    pub steps: Vec<PlanStep>,
    pub totals: Option<TransactionTotals>,
    pub line_items: Option<Vec<LineItem>>,
    pub payment_sources: Option<Vec<Party>>,
    pub tax: Option<TaxOptions>,
    pub pending_void_date: Option<DateTime<Utc>>,
    pub root_transaction_id: String,
    pub chain: Option<ChainUpdate>,
    pub mutations: Vec<ValueMutation>,
    pub request_hash: String,
    pub created_date: DateTime<Utc>,
    pub created_by: String,
    pub metadata: Option<serde_json::Value>,
}

impl TransactionPlan {
    pub fn is_pending(&self) -> bool {
        self.pending_void_date.is_some()
    }

    pub fn lightrail_steps(&self) -> impl Iterator<Item = &LightrailStep> {
        self.steps.iter().filter_map(|step| match step {
            PlanStep::Lightrail(step) => Some(step),
            _ => None,
        })
    }

    /// Checks the arithmetic of every step and the conservation rules of the
    /// transaction type.
    pub fn validate(&self) -> ResultEngine<()> {
        for step in &self.steps {
            match step {
                PlanStep::Lightrail(step) => {
                    check_quantity(
                        &step.value_id,
                        "balance",
                        step.balance_before,
                        step.balance_change,
                        step.balance_after,
                    )?;
                    check_quantity(
                        &step.value_id,
                        "usesRemaining",
                        step.uses_remaining_before,
                        step.uses_remaining_change,
                        step.uses_remaining_after,
                    )?;
                }
                PlanStep::Internal(step) => {
                    if step.balance_before + step.balance_change != step.balance_after
                        || step.balance_after < 0
                    {
                        return Err(EngineError::InvariantViolation(format!(
                            "internal step {} does not add up",
                            step.internal_id
                        )));
                    }
                }
                PlanStep::Stripe(_) => {}
            }
        }

        let net: i64 = self.steps.iter().map(PlanStep::balance_change).sum();
        match self.transaction_type {
            TransactionType::Checkout => {
                let totals = self.totals.clone().unwrap_or_default();
                let paid = totals.discount_lightrail.unwrap_or(0)
                    + totals.paid_lightrail.unwrap_or(0)
                    + totals.paid_stripe.unwrap_or(0)
                    + totals.paid_internal.unwrap_or(0);
                if -net != paid {
                    return Err(EngineError::InvariantViolation(format!(
                        "checkout {} steps net {net}, totals paid {paid}",
                        self.id
                    )));
                }
            }
            TransactionType::Transfer if net != 0 => {
                return Err(EngineError::InvariantViolation(format!(
                    "transfer {} nets {net}",
                    self.id
                )));
            }
            TransactionType::Capture if self.lightrail_steps().next().is_some() => {
                return Err(EngineError::InvariantViolation(format!(
                    "capture {} carries lightrail steps",
                    self.id
                )));
            }
            _ => {}
        }
        Ok(())
    }

    fn header(&self, steps: Vec<TransactionStep>, simulated: bool) -> Transaction {
        Transaction {
            id: self.id.clone(),
            transaction_type: self.transaction_type,
            currency: self.currency.clone(),
            steps,
            totals: self.totals.clone(),
            line_items: self.line_items.clone(),
            payment_sources: self.payment_sources.clone(),
            tax: self.tax,
            pending: self.is_pending(),
            pending_void_date: self.pending_void_date,
            root_transaction_id: self.root_transaction_id.clone(),
            next_transaction_id: None,
            created_date: self.created_date,
            created_by: self.created_by.clone(),
            metadata: self.metadata.clone(),
            simulated,
        }
    }

    /// The transaction this plan would produce, without touching anything.
    pub fn simulate(&self) -> Transaction {
        let steps = self.steps.iter().map(PlanStep::simulated).collect();
        self.header(steps, true)
    }

    /// The transaction with card steps replaced by their gateway results, in
    /// plan order.
    pub(crate) fn realize(&self, mut charges: Vec<StripeStep>) -> ResultEngine<Transaction> {
        charges.reverse();
        let mut steps = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            steps.push(match step {
                PlanStep::Lightrail(step) => TransactionStep::Lightrail(step.clone()),
                PlanStep::Internal(step) => TransactionStep::Internal(step.clone()),
                PlanStep::Stripe(_) => TransactionStep::Stripe(charges.pop().ok_or_else(|| {
                    EngineError::InvariantViolation(format!(
                        "transaction {} is missing a card result",
                        self.id
                    ))
                })?),
            });
        }
        Ok(self.header(steps, false))
    }
}

fn check_quantity(
    value_id: &str,
    label: &str,
    before: Option<i64>,
    change: Option<i64>,
    after: Option<i64>,
) -> ResultEngine<()> {
    let consistent = match (before, change, after) {
        (Some(before), Some(change), Some(after)) => before + change == after && after >= 0,
        (None, None, None) | (None, Some(_), None) => true,
        _ => false,
    };
    if consistent {
        Ok(())
    } else {
        tracing::error!(value_id, label, ?before, ?change, ?after, "step does not add up");
        Err(EngineError::InvariantViolation(format!(
            "{label} step on value {value_id} does not add up"
        )))
    }
}
