//! Transfers between a source and a Value.

use chrono::{DateTime, Utc};

use crate::{
    EngineError, ResultEngine,
    commands::{StripeParty, TransferCmd},
    eligibility::{EligibilityCheck, is_eligible},
    plan::{ChargeOperation, PlanStep, StripePlanStep, TransactionPlan},
    transactions::{TransactionTotals, TransactionType},
    values::Value,
};

use super::{PlanContext, debit_credit::reject_rule_amount, value_step};

#[derive(Clone, Copy, Debug)]
pub enum TransferSource<'a> {
    Value(&'a Value),
    Stripe(&'a StripeParty),
}

/// Moves `cmd.amount` from `source` to `destination`. The two steps net to
/// zero.
pub fn plan_transfer(
    ctx: &PlanContext<'_>,
    source: TransferSource<'_>,
    destination: &Value,
    cmd: &TransferCmd,
    pending_void_date: Option<DateTime<Utc>>,
) -> ResultEngine<TransactionPlan> {
    if cmd.amount <= 0 {
        return Err(EngineError::InvalidRequest("amount must be > 0".to_string()));
    }
    reject_rule_amount(destination, Some(cmd.amount))?;
    if destination.balance.is_none() {
        return Err(EngineError::InvalidRequest(format!(
            "value {} does not track a balance",
            destination.id
        )));
    }
    let state = EligibilityCheck::state(ctx.now, &cmd.currency, ctx.policy);
    is_eligible(destination, &state)?;

    let (source_step, moved) = match source {
        TransferSource::Value(value) => {
            if value.id == destination.id {
                return Err(EngineError::InvalidRequest(
                    "source and destination must differ".to_string(),
                ));
            }
            reject_rule_amount(value, Some(cmd.amount))?;
            is_eligible(value, &state)?;
            let moved = if cmd.allow_remainder {
                cmd.amount.min(value.balance.unwrap_or(0))
            } else {
                is_eligible(value, &state.balance_draw(cmd.amount))?;
                cmd.amount
            };
            (
                PlanStep::Lightrail(value_step(value, Some(-moved), None)),
                moved,
            )
        }
        TransferSource::Stripe(card) => {
            let cap = card.max_amount.unwrap_or(cmd.amount);
            if cap < cmd.amount && !cmd.allow_remainder {
                return Err(EngineError::InsufficientBalance(format!(
                    "card source is capped at {cap}, {} requested",
                    cmd.amount
                )));
            }
            let moved = cmd.amount.min(cap).max(0);
            (
                PlanStep::Stripe(StripePlanStep {
                    operation: ChargeOperation::Charge {
                        source: card.source.clone(),
                        pending: pending_void_date.is_some(),
                    },
                    amount: moved,
                }),
                moved,
            )
        }
    };

    let mut plan = ctx.plan(TransactionType::Transfer, &cmd.currency);
    plan.steps.push(source_step);
    plan.steps
        .push(PlanStep::Lightrail(value_step(destination, Some(moved), None)));
    plan.totals = Some(TransactionTotals::remainder_only(cmd.amount - moved));
    plan.payment_sources = Some(vec![cmd.source.clone()]);
    plan.pending_void_date = pending_void_date;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        commands::{LightrailParty, Party},
        planner::tests::ctx,
        values::tests::value,
    };

    fn cmd(amount: i64) -> TransferCmd {
        TransferCmd::new(
            "t1",
            Party::Lightrail(LightrailParty::value("a")),
            LightrailParty::value("b"),
            "USD",
            amount,
        )
    }

    #[test]
    fn transfer_nets_to_zero() {
        let a = value("a", Some(500));
        let b = value("b", Some(20));
        let plan = plan_transfer(&ctx("t1"), TransferSource::Value(&a), &b, &cmd(200), None)
            .unwrap();
        let steps: Vec<_> = plan.lightrail_steps().collect();
        assert_eq!(steps[0].balance_after, Some(300));
        assert_eq!(steps[1].balance_after, Some(220));
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn transfer_requires_matching_currency() {
        let a = value("a", Some(500));
        let mut b = value("b", Some(0));
        b.currency = "CAD".to_string();
        let err = plan_transfer(&ctx("t1"), TransferSource::Value(&a), &b, &cmd(1), None)
            .unwrap_err();
        assert_eq!(err.code(), "WrongCurrency");
    }

    #[test]
    fn transfer_with_remainder_moves_what_is_available() {
        let a = value("a", Some(50));
        let b = value("b", Some(0));
        let plan = plan_transfer(
            &ctx("t1"),
            TransferSource::Value(&a),
            &b,
            &cmd(200).allow_remainder(),
            None,
        )
        .unwrap();
        assert_eq!(plan.totals.clone().unwrap().remainder, Some(150));
        assert!(plan.validate().is_ok());

        let err = plan_transfer(&ctx("t1"), TransferSource::Value(&a), &b, &cmd(200), None)
            .unwrap_err();
        assert_eq!(err.code(), "InsufficientBalance");
    }

    #[test]
    fn transfer_to_self_is_rejected() {
        let a = value("a", Some(50));
        let err = plan_transfer(&ctx("t1"), TransferSource::Value(&a), &a, &cmd(1), None)
            .unwrap_err();
        assert_eq!(err.code(), "InvalidRequest");
    }

    #[test]
    fn card_funded_transfer() {
        let card = StripeParty {
            source: "tok_visa".to_string(),
            max_amount: None,
        };
        let b = value("b", Some(0));
        let plan = plan_transfer(&ctx("t1"), TransferSource::Stripe(&card), &b, &cmd(700), None)
            .unwrap();
        assert!(plan.validate().is_ok());
        assert_eq!(plan.lightrail_steps().next().unwrap().balance_after, Some(700));
    }
}
