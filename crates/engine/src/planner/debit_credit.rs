//! Single Value debits and credits.

use chrono::{DateTime, Utc};

use crate::{
    EngineError, ResultEngine,
    commands::{CreditCmd, DebitCmd},
    eligibility::{EligibilityCheck, is_eligible},
    plan::{PlanStep, TransactionPlan},
    transactions::{TransactionTotals, TransactionType},
    values::Value,
};

use super::{PlanContext, value_step};

pub(crate) fn validate_amounts(amount: Option<i64>, uses: Option<i64>) -> ResultEngine<()> {
    if amount.is_none() && uses.is_none() {
        return Err(EngineError::InvalidRequest(
            "one of amount or uses is required".to_string(),
        ));
    }
    if amount.is_some_and(|a| a <= 0) {
        return Err(EngineError::InvalidRequest("amount must be > 0".to_string()));
    }
    if uses.is_some_and(|u| u <= 0) {
        return Err(EngineError::InvalidRequest("uses must be > 0".to_string()));
    }
    Ok(())
}

pub(crate) fn reject_rule_amount(value: &Value, amount: Option<i64>) -> ResultEngine<()> {
    if amount.is_some() && value.balance_rule.is_some() {
        return Err(EngineError::InvalidRequest(format!(
            "value {} has a balance rule and cannot move a fixed amount",
            value.id
        )));
    }
    Ok(())
}

/// Draws `amount` and/or `uses` from `value`.
///
/// With `allow_remainder` the debit takes what is available and the
/// shortfall is reported in `totals.remainder`; otherwise any shortfall fails
/// the whole debit.
pub fn plan_debit(
    ctx: &PlanContext<'_>,
    value: &Value,
    cmd: &DebitCmd,
    pending_void_date: Option<DateTime<Utc>>,
) -> ResultEngine<TransactionPlan> {
    validate_amounts(cmd.amount, cmd.uses)?;
    reject_rule_amount(value, cmd.amount)?;

    let state = EligibilityCheck::state(ctx.now, &cmd.currency, ctx.policy);
    is_eligible(value, &state)?;

    let (balance_draw, uses_draw) = if cmd.allow_remainder {
        (
            cmd.amount.map(|a| a.min(value.balance.unwrap_or(0))),
            cmd.uses.map(|u| value.uses_remaining.map_or(u, |have| u.min(have))),
        )
    } else {
        let mut check = state;
        if let Some(amount) = cmd.amount {
            check = check.balance_draw(amount);
        }
        if let Some(uses) = cmd.uses {
            check = check.uses_draw(uses);
        }
        is_eligible(value, &check)?;
        (cmd.amount, cmd.uses)
    };
    let remainder = cmd.amount.unwrap_or(0) - balance_draw.unwrap_or(0);

    let step = value_step(value, balance_draw.map(|a| -a), uses_draw.map(|u| -u));

    let mut plan = ctx.plan(TransactionType::Debit, &cmd.currency);
    plan.steps.push(PlanStep::Lightrail(step));
    plan.totals = Some(TransactionTotals::remainder_only(remainder));
    plan.pending_void_date = pending_void_date;
    Ok(plan)
}

/// Adds `amount` and/or `uses` to `value`.
pub fn plan_credit(
    ctx: &PlanContext<'_>,
    value: &Value,
    cmd: &CreditCmd,
) -> ResultEngine<TransactionPlan> {
    validate_amounts(cmd.amount, cmd.uses)?;
    reject_rule_amount(value, cmd.amount)?;
    if cmd.amount.is_some() && value.balance.is_none() {
        return Err(EngineError::InvalidRequest(format!(
            "value {} does not track a balance",
            value.id
        )));
    }
    if cmd.uses.is_some() && value.uses_remaining.is_none() {
        return Err(EngineError::InvalidRequest(format!(
            "value {} does not track uses",
            value.id
        )));
    }
    is_eligible(
        value,
        &EligibilityCheck::state(ctx.now, &cmd.currency, ctx.policy),
    )?;

    let mut plan = ctx.plan(TransactionType::Credit, &cmd.currency);
    plan.steps
        .push(PlanStep::Lightrail(value_step(value, cmd.amount, cmd.uses)));
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{commands::LightrailParty, planner::tests::ctx, values::tests::value};

    fn debit(amount: i64) -> DebitCmd {
        DebitCmd::new("d1", LightrailParty::value("v1"), "USD").amount(amount)
    }

    #[test]
    fn debit_draws_exact_amount() {
        let v = value("v1", Some(1000));
        let plan = plan_debit(&ctx("d1"), &v, &debit(400), None).unwrap();
        let step = plan.lightrail_steps().next().unwrap();
        assert_eq!(step.balance_change, Some(-400));
        assert_eq!(step.balance_after, Some(600));
        assert_eq!(plan.totals.unwrap().remainder, Some(0));
    }

    #[test]
    fn debit_without_remainder_fails_when_short() {
        let v = value("v1", Some(100));
        let err = plan_debit(&ctx("d1"), &v, &debit(400), None).unwrap_err();
        assert_eq!(err.code(), "InsufficientBalance");
    }

    #[test]
    fn debit_with_remainder_reports_shortfall() {
        let v = value("v1", Some(100));
        let plan = plan_debit(&ctx("d1"), &v, &debit(400).allow_remainder(), None).unwrap();
        let step = plan.lightrail_steps().next().unwrap();
        assert_eq!(step.balance_after, Some(0));
        assert_eq!(plan.totals.unwrap().remainder, Some(300));
    }

    #[test]
    fn debit_uses_only() {
        let mut v = value("v1", None);
        v.uses_remaining = Some(1);
        let cmd = DebitCmd::new("d1", LightrailParty::value("v1"), "USD").uses(1);
        let plan = plan_debit(&ctx("d1"), &v, &cmd, None).unwrap();
        let step = plan.lightrail_steps().next().unwrap();
        assert_eq!(step.uses_remaining_after, Some(0));

        v.uses_remaining = Some(0);
        let err = plan_debit(&ctx("d1"), &v, &cmd, None).unwrap_err();
        assert_eq!(err.code(), "InsufficientUsesRemaining");
    }

    #[test]
    fn frozen_value_cannot_be_debited_even_with_remainder() {
        let mut v = value("v1", Some(100));
        v.frozen = true;
        let err = plan_debit(&ctx("d1"), &v, &debit(10).allow_remainder(), None).unwrap_err();
        assert_eq!(err.code(), "ValueFrozen");
    }

    #[test]
    fn credit_rejects_rule_values_and_untracked_quantities() {
        let mut v = value("v1", None);
        v.balance_rule = Some(crate::rules::Rule::new("100"));
        let cmd = CreditCmd::new("c1", LightrailParty::value("v1"), "USD").amount(10);
        assert_eq!(
            plan_credit(&ctx("c1"), &v, &cmd).unwrap_err().code(),
            "InvalidRequest"
        );

        let v = value("v2", Some(0));
        let cmd = CreditCmd::new("c1", LightrailParty::value("v2"), "USD").uses(1);
        assert_eq!(
            plan_credit(&ctx("c1"), &v, &cmd).unwrap_err().code(),
            "InvalidRequest"
        );
    }

    #[test]
    fn credit_adds_amount() {
        let v = value("v1", Some(10));
        let cmd = CreditCmd::new("c1", LightrailParty::value("v1"), "USD").amount(90);
        let plan = plan_credit(&ctx("c1"), &v, &cmd).unwrap();
        assert_eq!(plan.lightrail_steps().next().unwrap().balance_after, Some(100));
    }
}
