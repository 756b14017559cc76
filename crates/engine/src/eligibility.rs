//! Eligibility of a Value to take part in a transaction.
//!
//! [`is_eligible`] is a pure function over a Value snapshot. Checks run in a
//! fixed order and the first failure wins, so the same snapshot always
//! produces the same error:
//!
//! 1. active (only with [`EligibilityPolicy::enforce_active`])
//! 2. frozen
//! 3. canceled
//! 4. validity window (`startDate` only with
//!    [`EligibilityPolicy::enforce_start_date`])
//! 5. currency
//! 6. balance draw
//! 7. use consumption

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EngineError, values::Value};

/// Which optional checks are enforced.
///
/// Both default to `false`: an inactive Value, or one whose `startDate` is in
/// the future, can still be transacted against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EligibilityPolicy {
    pub enforce_active: bool,
    pub enforce_start_date: bool,
}

/// The effect a transaction wants to have on a Value.
#[derive(Clone, Copy, Debug)]
pub struct EligibilityCheck<'a> {
    pub now: DateTime<Utc>,
    pub currency: &'a str,
    /// Minor units to draw from the balance, if any.
    pub balance_draw: Option<i64>,
    /// Amount a balance rule yields for this effect, for rule-driven Values.
    pub rule_amount: Option<i64>,
    /// Uses to consume, if any.
    pub uses_draw: Option<i64>,
    pub policy: EligibilityPolicy,
}

impl<'a> EligibilityCheck<'a> {
    /// State and currency checks only, no draw.
    pub fn state(now: DateTime<Utc>, currency: &'a str, policy: EligibilityPolicy) -> Self {
        Self {
            now,
            currency,
            balance_draw: None,
            rule_amount: None,
            uses_draw: None,
            policy,
        }
    }

    #[must_use]
    pub fn balance_draw(mut self, amount: i64) -> Self {
        self.balance_draw = Some(amount);
        self
    }

    #[must_use]
    pub fn rule_amount(mut self, amount: i64) -> Self {
        self.rule_amount = Some(amount);
        self
    }

    #[must_use]
    pub fn uses_draw(mut self, uses: i64) -> Self {
        self.uses_draw = Some(uses);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IneligibleReason {
    NotActive,
    Frozen,
    Canceled,
    Expired,
    NotStarted,
    WrongCurrency { expected: String, actual: String },
    InsufficientBalance { available: i64, requested: i64 },
    InsufficientUsesRemaining { available: i64, requested: i64 },
}

/// Why a Value cannot take part in a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ineligible {
    pub value_id: String,
    pub reason: IneligibleReason,
}

impl From<Ineligible> for EngineError {
    fn from(ineligible: Ineligible) -> Self {
        let id = ineligible.value_id;
        match ineligible.reason {
            IneligibleReason::NotActive => EngineError::ValueNotActive(id),
            IneligibleReason::Frozen => EngineError::ValueFrozen(id),
            IneligibleReason::Canceled => EngineError::ValueCanceled(id),
            IneligibleReason::Expired => EngineError::ValueExpired(id),
            IneligibleReason::NotStarted => EngineError::ValueNotStarted(id),
            IneligibleReason::WrongCurrency { expected, actual } => EngineError::WrongCurrency(
                format!("value {id} is in {actual}, transaction is in {expected}"),
            ),
            IneligibleReason::InsufficientBalance {
                available,
                requested,
            } => EngineError::InsufficientBalance(format!(
                "value {id} has {available}, {requested} requested"
            )),
            IneligibleReason::InsufficientUsesRemaining {
                available,
                requested,
            } => EngineError::InsufficientUsesRemaining(format!(
                "value {id} has {available} uses, {requested} requested"
            )),
        }
    }
}

pub fn is_eligible(value: &Value, check: &EligibilityCheck<'_>) -> Result<(), Ineligible> {
    let fail = |reason| {
        Err(Ineligible {
            value_id: value.id.clone(),
            reason,
        })
    };

    if check.policy.enforce_active && !value.active {
        return fail(IneligibleReason::NotActive);
    }
    if value.frozen {
        return fail(IneligibleReason::Frozen);
    }
    if value.canceled {
        return fail(IneligibleReason::Canceled);
    }
    if value.end_date.is_some_and(|end| check.now > end) {
        return fail(IneligibleReason::Expired);
    }
    if check.policy.enforce_start_date && value.start_date.is_some_and(|start| check.now < start)
    {
        return fail(IneligibleReason::NotStarted);
    }
    if value.currency != check.currency {
        return fail(IneligibleReason::WrongCurrency {
            expected: check.currency.to_string(),
            actual: value.currency.clone(),
        });
    }
    if let Some(requested) = check.balance_draw.filter(|a| *a > 0) {
        let available = match (value.balance, check.rule_amount) {
            (Some(balance), _) => balance,
            (None, Some(rule_amount)) => rule_amount,
            (None, None) => 0,
        };
        if available < requested {
            return fail(IneligibleReason::InsufficientBalance {
                available,
                requested,
            });
        }
    }
    if let Some(requested) = check.uses_draw.filter(|u| *u > 0)
        && let Some(available) = value.uses_remaining
        && available < requested
    {
        return fail(IneligibleReason::InsufficientUsesRemaining {
            available,
            requested,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::values::tests::value;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_800_000_000, 0).unwrap()
    }

    fn reason(value: &Value, check: &EligibilityCheck<'_>) -> Option<IneligibleReason> {
        is_eligible(value, check).err().map(|e| e.reason)
    }

    #[test]
    fn eligible_value_passes_every_check() {
        let v = value("v1", Some(500));
        let check = EligibilityCheck::state(now(), "USD", EligibilityPolicy::default())
            .balance_draw(500)
            .uses_draw(1);
        assert_eq!(is_eligible(&v, &check), Ok(()));
    }

    #[test]
    fn frozen_wins_over_canceled_and_expired() {
        let mut v = value("v1", Some(0));
        v.frozen = true;
        v.canceled = true;
        v.end_date = Some(now() - Duration::days(1));
        v.currency = "CAD".to_string();
        let check = EligibilityCheck::state(now(), "USD", EligibilityPolicy::default())
            .balance_draw(10);
        assert_eq!(reason(&v, &check), Some(IneligibleReason::Frozen));

        v.frozen = false;
        assert_eq!(reason(&v, &check), Some(IneligibleReason::Canceled));

        v.canceled = false;
        assert_eq!(reason(&v, &check), Some(IneligibleReason::Expired));
    }

    #[test]
    fn inactive_and_future_values_pass_by_default() {
        let mut v = value("v1", Some(100));
        v.active = false;
        v.start_date = Some(now() + Duration::days(3));
        let lenient = EligibilityCheck::state(now(), "USD", EligibilityPolicy::default());
        assert_eq!(is_eligible(&v, &lenient), Ok(()));

        let strict = EligibilityCheck::state(
            now(),
            "USD",
            EligibilityPolicy {
                enforce_active: true,
                enforce_start_date: true,
            },
        );
        assert_eq!(reason(&v, &strict), Some(IneligibleReason::NotActive));
        v.active = true;
        assert_eq!(reason(&v, &strict), Some(IneligibleReason::NotStarted));
    }

    #[test]
    fn currency_is_checked_before_balance() {
        let mut v = value("v1", Some(0));
        v.currency = "CAD".to_string();
        let check =
            EligibilityCheck::state(now(), "USD", EligibilityPolicy::default()).balance_draw(1);
        assert!(matches!(
            reason(&v, &check),
            Some(IneligibleReason::WrongCurrency { .. })
        ));
    }

    #[test]
    fn balance_and_uses_draws() {
        let mut v = value("v1", Some(100));
        v.uses_remaining = Some(0);
        let check =
            EligibilityCheck::state(now(), "USD", EligibilityPolicy::default()).balance_draw(101);
        assert_eq!(
            reason(&v, &check),
            Some(IneligibleReason::InsufficientBalance {
                available: 100,
                requested: 101
            })
        );

        let check = EligibilityCheck::state(now(), "USD", EligibilityPolicy::default())
            .balance_draw(100)
            .uses_draw(1);
        assert_eq!(
            reason(&v, &check),
            Some(IneligibleReason::InsufficientUsesRemaining {
                available: 0,
                requested: 1
            })
        );

        v.uses_remaining = None;
        assert_eq!(is_eligible(&v, &check), Ok(()));
    }

    #[test]
    fn rule_driven_values_use_the_evaluated_amount() {
        let v = value("v1", None);
        let check = EligibilityCheck::state(now(), "USD", EligibilityPolicy::default())
            .balance_draw(300)
            .rule_amount(250);
        assert!(matches!(
            reason(&v, &check),
            Some(IneligibleReason::InsufficientBalance { available: 250, .. })
        ));
    }

    #[test]
    fn converts_into_engine_error() {
        let err: EngineError = Ineligible {
            value_id: "v1".to_string(),
            reason: IneligibleReason::Canceled,
        }
        .into();
        assert_eq!(err.code(), "ValueCanceled");
    }
}
