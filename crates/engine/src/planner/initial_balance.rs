//! Initial balance: the transaction that creates a Value.

use crate::{
    ResultEngine,
    plan::{PlanStep, TransactionPlan, ValueMutation},
    transactions::TransactionType,
    values::Value,
};

use super::{PlanContext, value_step};

/// Plans the creation of `value` with its balance and uses.
///
/// The Value row is inserted at zero and the single step raises it to the
/// requested amounts.
pub fn plan_initial_balance(ctx: &PlanContext<'_>, value: Value) -> ResultEngine<TransactionPlan> {
    value.validate()?;

    let mut seed = value.clone();
    seed.balance = value.balance.map(|_| 0);
    seed.uses_remaining = value.uses_remaining.map(|_| 0);

    let step = value_step(&seed, value.balance, value.uses_remaining);

    let mut plan = ctx.plan(TransactionType::InitialBalance, &value.currency);
    plan.steps.push(PlanStep::Lightrail(step));
    plan.mutations.push(ValueMutation::Create(seed));
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{planner::tests::ctx, values::tests::value};

    #[test]
    fn raises_a_zero_row_to_the_requested_amounts() {
        let mut v = value("gift-1", Some(5000));
        v.uses_remaining = Some(3);
        let plan = plan_initial_balance(&ctx("gift-1"), v).unwrap();

        let step = plan.lightrail_steps().next().unwrap();
        assert_eq!(step.balance_before, Some(0));
        assert_eq!(step.balance_after, Some(5000));
        assert_eq!(step.uses_remaining_after, Some(3));
        assert!(matches!(
            &plan.mutations[0],
            ValueMutation::Create(seed) if seed.balance == Some(0) && seed.uses_remaining == Some(0)
        ));
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn rule_driven_values_have_no_balance_step() {
        let mut v = value("promo", None);
        v.balance_rule = Some(crate::rules::Rule::new("500"));
        let plan = plan_initial_balance(&ctx("promo"), v).unwrap();
        let step = plan.lightrail_steps().next().unwrap();
        assert_eq!(step.balance_before, None);
        assert_eq!(step.balance_change, None);
        assert!(step.balance_rule.is_some());
    }
}
