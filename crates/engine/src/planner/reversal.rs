//! Void, reverse and capture: transactions that supersede another one.

use std::collections::HashMap;

use crate::{
    EngineError, ResultEngine,
    plan::{ChainUpdate, ChargeOperation, PlanStep, StripePlanStep, TransactionPlan},
    steps::{InternalStep, LightrailStep, TransactionStep},
    transactions::{Transaction, TransactionType},
    values::Value,
};

use super::PlanContext;

/// Error for acting on `target_id` once `successor` has superseded it.
pub(crate) fn superseded_error(target_id: &str, successor: TransactionType) -> EngineError {
    match successor {
        TransactionType::Void => EngineError::TransactionVoided(target_id.to_string()),
        TransactionType::Capture => EngineError::TransactionCaptured(target_id.to_string()),
        TransactionType::Reverse => EngineError::TransactionReversed(target_id.to_string()),
        other => EngineError::InvariantViolation(format!(
            "transaction {target_id} is superseded by a {} transaction",
            other.as_str()
        )),
    }
}

fn check_not_superseded(
    target: &Transaction,
    superseded_by: Option<TransactionType>,
) -> ResultEngine<()> {
    match superseded_by {
        None => Ok(()),
        Some(successor) => Err(superseded_error(&target.id, successor)),
    }
}

fn chained_plan(
    ctx: &PlanContext<'_>,
    transaction_type: TransactionType,
    target: &Transaction,
) -> TransactionPlan {
    let mut plan = ctx.plan(transaction_type, &target.currency);
    plan.root_transaction_id = target.root_transaction_id.clone();
    plan.chain = Some(ChainUpdate {
        target_id: target.id.clone(),
    });
    plan
}

fn invert_quantity(
    current: Option<i64>,
    original_change: Option<i64>,
    value_id: &str,
    insufficient: fn(String) -> EngineError,
) -> ResultEngine<(Option<i64>, Option<i64>, Option<i64>)> {
    let Some(original_change) = original_change else {
        return Ok((None, None, None));
    };
    let change = -original_change;
    match current {
        Some(before) => {
            let after = before + change;
            if after < 0 {
                return Err(insufficient(format!(
                    "undoing the change on value {value_id} would leave {after}"
                )));
            }
            Ok((Some(before), Some(change), Some(after)))
        }
        None => Ok((None, Some(change), None)),
    }
}

/// Undoes a lightrail step against the Value's current amounts.
///
/// The working copy is updated so a second step on the same Value starts
/// from the first one's result.
fn invert_lightrail(
    step: &LightrailStep,
    working: &mut HashMap<String, Value>,
    check_state: bool,
) -> ResultEngine<LightrailStep> {
    let value = working.get_mut(&step.value_id).ok_or_else(|| {
        EngineError::InvariantViolation(format!(
            "value {} of a committed step is missing",
            step.value_id
        ))
    })?;
    if check_state {
        if value.frozen {
            return Err(EngineError::ValueFrozen(value.id.clone()));
        }
        if value.canceled {
            return Err(EngineError::ValueCanceled(value.id.clone()));
        }
    }

    let (balance_before, balance_change, balance_after) = invert_quantity(
        value.balance,
        step.balance_change,
        &value.id,
        EngineError::InsufficientBalance,
    )?;
    let (uses_before, uses_change, uses_after) = invert_quantity(
        value.uses_remaining,
        step.uses_remaining_change,
        &value.id,
        EngineError::InsufficientUsesRemaining,
    )?;
    if balance_after.is_some() {
        value.balance = balance_after;
    }
    if uses_after.is_some() {
        value.uses_remaining = uses_after;
    }

    Ok(LightrailStep {
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
    })
}

fn invert_steps(
    target: &Transaction,
    current: &HashMap<String, Value>,
    check_state: bool,
    card: fn(String) -> ChargeOperation,
) -> ResultEngine<Vec<PlanStep>> {
    let mut working = current.clone();
    let mut steps = Vec::with_capacity(target.steps.len());
    for step in &target.steps {
        match step {
            TransactionStep::Lightrail(step) => {
                steps.push(PlanStep::Lightrail(invert_lightrail(
                    step,
                    &mut working,
                    check_state,
                )?));
            }
            TransactionStep::Internal(step) => steps.push(PlanStep::Internal(InternalStep {
                internal_id: step.internal_id.clone(),
                balance_before: step.balance_after,
                balance_after: step.balance_before,
                balance_change: -step.balance_change,
            })),
            TransactionStep::Stripe(step) if step.amount != 0 => {
                steps.push(PlanStep::Stripe(StripePlanStep {
                    operation: card(step.charge_id.clone()),
                    amount: -step.amount,
                }));
            }
            TransactionStep::Stripe(_) => {}
        }
    }
    Ok(steps)
}

/// Voids a pending transaction.
///
/// Steps are inverted against `current`, the Values as they are now. Beyond
/// keeping amounts non-negative no Value state is checked: a frozen or
/// canceled Value still gets its hold back.
pub fn plan_void(
    ctx: &PlanContext<'_>,
    target: &Transaction,
    superseded_by: Option<TransactionType>,
    current: &HashMap<String, Value>,
) -> ResultEngine<TransactionPlan> {
    if !target.pending {
        return Err(EngineError::TransactionNotPending(target.id.clone()));
    }
    check_not_superseded(target, superseded_by)?;

    let mut plan = chained_plan(ctx, TransactionType::Void, target);
    plan.steps = invert_steps(target, current, false, |charge_id| {
        ChargeOperation::Release { charge_id }
    })?;
    Ok(plan)
}

/// Reverses a completed transaction.
pub fn plan_reverse(
    ctx: &PlanContext<'_>,
    target: &Transaction,
    superseded_by: Option<TransactionType>,
    current: &HashMap<String, Value>,
) -> ResultEngine<TransactionPlan> {
    if matches!(superseded_by, Some(TransactionType::Reverse)) {
        return Err(EngineError::TransactionReversed(target.id.clone()));
    }
    if target.pending
        || matches!(
            target.transaction_type,
            TransactionType::Void | TransactionType::Reverse | TransactionType::Capture
        )
    {
        return Err(EngineError::TransactionNotReversible(target.id.clone()));
    }
    check_not_superseded(target, superseded_by)?;

    let mut plan = chained_plan(ctx, TransactionType::Reverse, target);
    plan.steps = invert_steps(target, current, true, |charge_id| ChargeOperation::Refund {
        charge_id,
    })?;
    Ok(plan)
}

/// Reverses a pending transaction that `capture` completed. The steps undone
/// are the original's; the reversal hangs off the capture, since the
/// original's successor slot already holds it.
pub fn plan_reverse_captured(
    ctx: &PlanContext<'_>,
    original: &Transaction,
    capture: &Transaction,
    capture_superseded_by: Option<TransactionType>,
    current: &HashMap<String, Value>,
) -> ResultEngine<TransactionPlan> {
    if !original.pending
        || capture.transaction_type != TransactionType::Capture
        || original.next_transaction_id.as_deref() != Some(capture.id.as_str())
    {
        return Err(EngineError::InvariantViolation(format!(
            "{} is not the capture of {}",
            capture.id, original.id
        )));
    }
    match capture_superseded_by {
        None => {}
        Some(TransactionType::Reverse) => {
            return Err(EngineError::TransactionReversed(original.id.clone()));
        }
        Some(successor) => return Err(superseded_error(&capture.id, successor)),
    }

    let mut plan = chained_plan(ctx, TransactionType::Reverse, capture);
    plan.steps = invert_steps(original, current, true, |charge_id| ChargeOperation::Refund {
        charge_id,
    })?;
    Ok(plan)
}

/// Captures a pending transaction. Lightrail amounts were taken when it was
/// created, so only card authorizations are captured.
pub fn plan_capture(
    ctx: &PlanContext<'_>,
    target: &Transaction,
    superseded_by: Option<TransactionType>,
) -> ResultEngine<TransactionPlan> {
    if !target.pending {
        return Err(EngineError::TransactionNotPending(target.id.clone()));
    }
    check_not_superseded(target, superseded_by)?;

    let mut plan = chained_plan(ctx, TransactionType::Capture, target);
    plan.steps = target
        .steps
        .iter()
        .filter_map(|step| match step {
            TransactionStep::Stripe(step) => Some(PlanStep::Stripe(StripePlanStep {
                operation: ChargeOperation::Capture {
                    charge_id: step.charge_id.clone(),
                },
                amount: 0,
            })),
            _ => None,
        })
        .collect();
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        planner::tests::{ctx, now},
        steps::StripeStep,
        values::tests::value,
    };

    fn committed(transaction_type: TransactionType, steps: Vec<TransactionStep>) -> Transaction {
        Transaction {
            id: "orig".to_string(),
            transaction_type,
            currency: "USD".to_string(),
            steps,
            totals: None,
            line_items: None,
            payment_sources: None,
            tax: None,
            pending: false,
            pending_void_date: None,
            root_transaction_id: "orig".to_string(),
            next_transaction_id: None,
            created_date: now(),
            created_by: "tester".to_string(),
            metadata: None,
            simulated: false,
        }
    }

    fn uses_step(value_id: &str, before: i64, change: i64) -> TransactionStep {
        TransactionStep::Lightrail(LightrailStep {
            value_id: value_id.to_string(),
            uses_remaining_before: Some(before),
            uses_remaining_change: Some(change),
            uses_remaining_after: Some(before + change),
            ..LightrailStep::default()
        })
    }

    fn current(values: &[(&str, Option<i64>, Option<i64>)]) -> HashMap<String, Value> {
        values
            .iter()
            .map(|(id, balance, uses)| {
                let mut v = value(id, *balance);
                v.uses_remaining = *uses;
                (id.to_string(), v)
            })
            .collect()
    }

    #[test]
    fn reverse_swaps_before_and_after() {
        let attach = committed(
            TransactionType::Attach,
            vec![uses_step("G", 10, -1), uses_step("D", 0, 1)],
        );
        let now_values = current(&[("G", None, Some(9)), ("D", None, Some(1))]);
        let plan = plan_reverse(&ctx("rev"), &attach, None, &now_values).unwrap();
        let steps: Vec<_> = plan.lightrail_steps().collect();
        assert_eq!(steps[0].uses_remaining_before, Some(9));
        assert_eq!(steps[0].uses_remaining_after, Some(10));
        assert_eq!(steps[0].uses_remaining_change, Some(1));
        assert_eq!(steps[1].uses_remaining_before, Some(1));
        assert_eq!(steps[1].uses_remaining_after, Some(0));
        assert_eq!(plan.chain.unwrap().target_id, "orig");
    }

    #[test]
    fn reverse_refuses_when_spent_since() {
        let credit = committed(TransactionType::Credit, vec![uses_step("D", 0, 1)]);
        let spent = current(&[("D", None, Some(0))]);
        let err = plan_reverse(&ctx("rev"), &credit, None, &spent).unwrap_err();
        assert_eq!(err.code(), "InsufficientUsesRemaining");
    }

    #[test]
    fn reverse_rules() {
        let debit = committed(TransactionType::Debit, vec![uses_step("D", 1, -1)]);
        let values = current(&[("D", None, Some(0))]);

        let err = plan_reverse(&ctx("r"), &debit, Some(TransactionType::Reverse), &values)
            .unwrap_err();
        assert_eq!(err.code(), "TransactionReversed");

        let void = committed(TransactionType::Void, vec![]);
        let err = plan_reverse(&ctx("r"), &void, None, &values).unwrap_err();
        assert_eq!(err.code(), "TransactionNotReversible");

        let mut frozen = values.clone();
        if let Some(v) = frozen.get_mut("D") {
            v.frozen = true;
        }
        let err = plan_reverse(&ctx("r"), &debit, None, &frozen).unwrap_err();
        assert_eq!(err.code(), "ValueFrozen");
    }

    #[test]
    fn reverse_of_captured_chains_from_capture() {
        let mut original = committed(
            TransactionType::Checkout,
            vec![
                uses_step("D", 1, -1),
                TransactionStep::Stripe(StripeStep {
                    charge_id: "ch_1".to_string(),
                    amount: 500,
                    charge: None,
                }),
            ],
        );
        original.pending = true;
        original.next_transaction_id = Some("cap".to_string());
        let mut capture = committed(TransactionType::Capture, vec![]);
        capture.id = "cap".to_string();
        let values = current(&[("D", None, Some(0))]);

        let err = plan_reverse(&ctx("r"), &original, Some(TransactionType::Capture), &values)
            .unwrap_err();
        assert_eq!(err.code(), "TransactionNotReversible");

        let plan = plan_reverse_captured(&ctx("r"), &original, &capture, None, &values).unwrap();
        assert_eq!(plan.chain.as_ref().unwrap().target_id, "cap");
        assert_eq!(plan.root_transaction_id, "orig");
        assert_eq!(
            plan.lightrail_steps().next().unwrap().uses_remaining_after,
            Some(1)
        );
        assert!(plan.steps.iter().any(|step| matches!(
            step,
            PlanStep::Stripe(StripePlanStep { operation: ChargeOperation::Refund { charge_id }, amount: -500 })
                if charge_id == "ch_1"
        )));

        let err = plan_reverse_captured(
            &ctx("r"),
            &original,
            &capture,
            Some(TransactionType::Reverse),
            &values,
        )
        .unwrap_err();
        assert_eq!(err.code(), "TransactionReversed");

        let unrelated = committed(TransactionType::Debit, vec![]);
        let err = plan_reverse_captured(&ctx("r"), &original, &unrelated, None, &values)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)), "{err:?}");
    }

    #[test]
    fn void_requires_pending_and_ignores_state() {
        let mut debit = committed(TransactionType::Debit, vec![uses_step("D", 1, -1)]);
        let mut values = current(&[("D", None, Some(0))]);
        if let Some(v) = values.get_mut("D") {
            v.canceled = true;
        }

        let err = plan_void(&ctx("v"), &debit, None, &values).unwrap_err();
        assert_eq!(err.code(), "TransactionNotPending");

        debit.pending = true;
        let plan = plan_void(&ctx("v"), &debit, None, &values).unwrap();
        assert_eq!(
            plan.lightrail_steps().next().unwrap().uses_remaining_after,
            Some(1)
        );

        let err = plan_void(&ctx("v"), &debit, Some(TransactionType::Capture), &values)
            .unwrap_err();
        assert_eq!(err.code(), "TransactionCaptured");
    }

    #[test]
    fn capture_only_touches_cards() {
        let mut pending = committed(
            TransactionType::Checkout,
            vec![
                uses_step("D", 1, -1),
                TransactionStep::Stripe(StripeStep {
                    charge_id: "ch_1".to_string(),
                    amount: 500,
                    charge: None,
                }),
            ],
        );
        pending.pending = true;
        let plan = plan_capture(&ctx("cap"), &pending, None).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert!(matches!(
            &plan.steps[0],
            PlanStep::Stripe(StripePlanStep { operation: ChargeOperation::Capture { charge_id }, .. })
                if charge_id == "ch_1"
        ));
        assert!(plan.validate().is_ok());
    }
}
