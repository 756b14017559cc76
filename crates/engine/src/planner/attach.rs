//! Attaching Values to contacts and claiming generic codes.
//!
//! Three shapes, decided by the target:
//!
//! - a plain Value gets its `contact_id` set, once;
//! - a generic code without per-contact options is *shared*: the contact is
//!   linked to it and every linked contact spends from the same pool;
//! - a generic code with per-contact options (or an explicit
//!   `attach_generic_as_new_value`) is *claimed*: the allotment moves from the
//!   pool into a new Value owned by the contact.
//!
//! Both the link and the claimed Value use the id
//! `derived_value_id(generic, contact)`, so a second attach by the same
//! contact collides on the primary key and fails with
//! `ValueAlreadyAttached`.

use crate::{
    EngineError, ResultEngine,
    codes::derived_value_id,
    contact_values::ContactValue,
    eligibility::{EligibilityCheck, is_eligible},
    plan::{PlanStep, TransactionPlan, ValueMutation},
    transactions::TransactionType,
    values::Value,
};

use super::{PlanContext, value_step};

pub fn plan_attach(
    ctx: &PlanContext<'_>,
    contact_id: &str,
    target: &Value,
    attach_generic_as_new_value: bool,
) -> ResultEngine<TransactionPlan> {
    let state = EligibilityCheck::state(ctx.now, &target.currency, ctx.policy);
    let mut plan = ctx.plan(TransactionType::Attach, &target.currency);

    if !target.is_generic_code {
        if target.contact_id.is_some() {
            return Err(EngineError::ValueAlreadyAttached(target.id.clone()));
        }
        is_eligible(target, &state)?;
        let mut step = value_step(target, Some(0), Some(0));
        step.contact_id = Some(contact_id.to_string());
        plan.steps.push(PlanStep::Lightrail(step));
        plan.mutations.push(ValueMutation::SetContact {
            value_id: target.id.clone(),
            contact_id: contact_id.to_string(),
        });
        return Ok(plan);
    }

    let derived_id = derived_value_id(&target.id, contact_id);

    if target.per_contact().is_none() && !attach_generic_as_new_value {
        is_eligible(target, &state)?;
        let mut step = value_step(target, Some(0), Some(0));
        step.contact_id = Some(contact_id.to_string());
        plan.steps.push(PlanStep::Lightrail(step));
        plan.mutations.push(ValueMutation::LinkContact(ContactValue {
            id: derived_id,
            value_id: target.id.clone(),
            contact_id: contact_id.to_string(),
            created_date: ctx.now,
        }));
        return Ok(plan);
    }

    let per_contact = target.per_contact().cloned().unwrap_or_default();

    // Balance: a per-contact balance is drawn from the pool; otherwise the
    // claimed Value copies the generic balance (or rule) and the pool keeps
    // its balance.
    let (balance_allotment, balance_draw) = match (per_contact.balance, target.balance) {
        (Some(allotment), Some(_)) => (Some(allotment), Some(allotment)),
        (Some(allotment), None) => (Some(allotment), None),
        (None, Some(balance)) => (Some(balance), None),
        (None, None) => (None, None),
    };
    let (uses_allotment, uses_draw) = match (per_contact.uses_remaining, target.uses_remaining) {
        (Some(allotment), Some(_)) => (Some(allotment), Some(allotment)),
        (Some(allotment), None) => (Some(allotment), None),
        (None, Some(_)) => (Some(1), Some(1)),
        (None, None) => (None, None),
    };

    let mut check = state;
    if let Some(draw) = balance_draw {
        check = check.balance_draw(draw);
    }
    if let Some(draw) = uses_draw {
        check = check.uses_draw(draw);
    }
    is_eligible(target, &check)?;

    let claimed = Value {
        id: derived_id,
        currency: target.currency.clone(),
        balance: balance_allotment.map(|_| 0),
        uses_remaining: uses_allotment.map(|_| 0),
        program_id: target.program_id.clone(),
        is_generic_code: false,
        generic_code_options: None,
        code_hashed: None,
        code_last_four: None,
        contact_id: Some(contact_id.to_string()),
        attached_from_value_id: Some(target.id.clone()),
        active: target.active,
        frozen: false,
        canceled: false,
        pretax: target.pretax,
        discount: target.discount,
        discount_seller_liability: target.discount_seller_liability,
        balance_rule: if balance_allotment.is_none() {
            target.balance_rule.clone()
        } else {
            None
        },
        redemption_rule: target.redemption_rule.clone(),
        start_date: target.start_date,
        end_date: target.end_date,
        metadata: target.metadata.clone(),
        created_date: ctx.now,
        updated_date: ctx.now,
        created_by: ctx.created_by.to_string(),
    };

    let mut pool_step = value_step(
        target,
        Some(-balance_draw.unwrap_or(0)),
        Some(-uses_draw.unwrap_or(0)),
    );
    pool_step.contact_id = Some(contact_id.to_string());
    plan.steps.push(PlanStep::Lightrail(pool_step));
    plan.steps.push(PlanStep::Lightrail(value_step(
        &claimed,
        balance_allotment,
        uses_allotment,
    )));
    plan.mutations.push(ValueMutation::Create(claimed));
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        planner::tests::ctx,
        values::{GenericCodeOptions, PerContactOptions, tests::value},
    };

    fn generic(uses: Option<i64>, per_contact_uses: Option<i64>) -> Value {
        let mut g = value("G", None);
        g.is_generic_code = true;
        g.uses_remaining = uses;
        g.generic_code_options = per_contact_uses.map(|u| GenericCodeOptions {
            per_contact: PerContactOptions {
                balance: None,
                uses_remaining: Some(u),
            },
        });
        g
    }

    #[test]
    fn plain_value_gets_a_contact_once() {
        let v = value("v1", Some(100));
        let plan = plan_attach(&ctx("a1"), "C", &v, false).unwrap();
        assert!(matches!(
            &plan.mutations[0],
            ValueMutation::SetContact { contact_id, .. } if contact_id == "C"
        ));
        let step = plan.lightrail_steps().next().unwrap();
        assert_eq!(step.balance_change, Some(0));

        let mut owned = v;
        owned.contact_id = Some("other".to_string());
        let err = plan_attach(&ctx("a1"), "C", &owned, false).unwrap_err();
        assert_eq!(err.code(), "ValueAlreadyAttached");
    }

    #[test]
    fn shared_generic_links_the_contact() {
        let g = generic(Some(10), None);
        let plan = plan_attach(&ctx("a1"), "C", &g, false).unwrap();
        let ValueMutation::LinkContact(link) = &plan.mutations[0] else {
            panic!("expected a link");
        };
        assert_eq!(link.id, derived_value_id("G", "C"));
        let step = plan.lightrail_steps().next().unwrap();
        assert_eq!(step.uses_remaining_change, Some(0));
    }

    #[test]
    fn per_contact_claim_moves_the_allotment() {
        let g = generic(Some(10), Some(2));
        let plan = plan_attach(&ctx("a1"), "C", &g, false).unwrap();
        let steps: Vec<_> = plan.lightrail_steps().collect();
        assert_eq!(steps[0].uses_remaining_before, Some(10));
        assert_eq!(steps[0].uses_remaining_after, Some(8));
        assert_eq!(steps[1].value_id, derived_value_id("G", "C"));
        assert_eq!(steps[1].uses_remaining_before, Some(0));
        assert_eq!(steps[1].uses_remaining_after, Some(2));
        let ValueMutation::Create(claimed) = &plan.mutations[0] else {
            panic!("expected a new value");
        };
        assert_eq!(claimed.attached_from_value_id.as_deref(), Some("G"));
        assert_eq!(claimed.contact_id.as_deref(), Some("C"));
    }

    #[test]
    fn as_new_value_without_options_takes_one_use() {
        let g = generic(Some(10), None);
        let plan = plan_attach(&ctx("a1"), "C", &g, true).unwrap();
        let steps: Vec<_> = plan.lightrail_steps().collect();
        assert_eq!(steps[0].uses_remaining_after, Some(9));
        assert_eq!(steps[1].uses_remaining_after, Some(1));
    }

    #[test]
    fn claim_checks_the_pool() {
        let g = generic(Some(1), Some(2));
        let err = plan_attach(&ctx("a1"), "C", &g, false).unwrap_err();
        assert_eq!(err.code(), "InsufficientUsesRemaining");

        let mut frozen = generic(Some(10), Some(2));
        frozen.frozen = true;
        let err = plan_attach(&ctx("a1"), "C", &frozen, false).unwrap_err();
        assert_eq!(err.code(), "ValueFrozen");
    }
}
