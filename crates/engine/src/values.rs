//! The module contains the `Value` struct, a stored-value account.
//!
//! A Value holds a balance (minor units), a number of uses, or both. Balance
//! and uses only ever change through transaction steps; the other fields are
//! plain attributes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveValue, entity::prelude::*};
use serde::{Deserialize, Serialize};

use crate::{EngineError, ResultEngine, codes, rules::Rule};

/// Per-contact allotment of a generic code.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerContactOptions {
    pub balance: Option<i64>,
    pub uses_remaining: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericCodeOptions {
    pub per_contact: PerContactOptions,
}

/// How a Value relates to the contact that spends it.
///
/// The order of the variants is the allocation priority used by checkout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Ownership {
    /// Owned directly (created for, or attached to, the contact).
    Direct,
    /// Claimed from a generic code.
    AttachedFromGeneric,
    /// A generic code shared by every contact that attached it.
    SharedGeneric,
}

/// A stored-value account.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Value {
    pub id: String,
    pub currency: String,
    pub balance: Option<i64>,
    pub uses_remaining: Option<i64>,
    pub program_id: Option<String>,
    pub is_generic_code: bool,
    pub generic_code_options: Option<GenericCodeOptions>,
    /// Keyed lookup hash of the code; never leaves the engine.
    #[serde(skip)]
    pub code_hashed: Option<String>,
    pub code_last_four: Option<String>,
    pub contact_id: Option<String>,
    pub attached_from_value_id: Option<String>,
    pub active: bool,
    pub frozen: bool,
    pub canceled: bool,
    pub pretax: bool,
    pub discount: bool,
    pub discount_seller_liability: Option<Decimal>,
    pub balance_rule: Option<Rule>,
    pub redemption_rule: Option<Rule>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
    pub created_by: String,
}

impl Value {
    /// Masked code for display and step snapshots.
    #[must_use]
    pub fn code(&self) -> Option<String> {
        self.code_last_four.as_deref().map(codes::masked)
    }

    #[must_use]
    pub fn ownership(&self) -> Ownership {
        if self.is_generic_code {
            Ownership::SharedGeneric
        } else if self.attached_from_value_id.is_some() {
            Ownership::AttachedFromGeneric
        } else {
            Ownership::Direct
        }
    }

    /// Per-contact options, when the generic code defines any allotment.
    #[must_use]
    pub fn per_contact(&self) -> Option<&PerContactOptions> {
        self.generic_code_options
            .as_ref()
            .map(|o| &o.per_contact)
            .filter(|p| p.balance.is_some() || p.uses_remaining.is_some())
    }

    /// Checks the record invariants that do not depend on other rows.
    pub fn validate(&self) -> ResultEngine<()> {
        codes::validate_id(&self.id, "value")?;
        if self.balance.is_some_and(|b| b < 0) {
            return Err(EngineError::InvalidRequest(
                "balance must be >= 0".to_string(),
            ));
        }
        if self.uses_remaining.is_some_and(|u| u < 0) {
            return Err(EngineError::InvalidRequest(
                "usesRemaining must be >= 0".to_string(),
            ));
        }
        if self.balance.is_some() && self.balance_rule.is_some() {
            return Err(EngineError::InvalidRequest(
                "balance and balanceRule are mutually exclusive".to_string(),
            ));
        }
        if self.is_generic_code && self.contact_id.is_some() {
            return Err(EngineError::InvalidRequest(
                "a generic code cannot have a contactId".to_string(),
            ));
        }
        if self.generic_code_options.is_some() && !self.is_generic_code {
            return Err(EngineError::InvalidRequest(
                "genericCodeOptions requires isGenericCode".to_string(),
            ));
        }
        if let Some(per_contact) = self.per_contact() {
            if per_contact.balance.is_some_and(|b| b <= 0) {
                return Err(EngineError::InvalidRequest(
                    "perContact.balance must be > 0".to_string(),
                ));
            }
            if per_contact.uses_remaining.is_some_and(|u| u <= 0) {
                return Err(EngineError::InvalidRequest(
                    "perContact.usesRemaining must be > 0".to_string(),
                ));
            }
            if per_contact.balance.is_some() && self.balance_rule.is_some() {
                return Err(EngineError::InvalidRequest(
                    "perContact.balance cannot be combined with balanceRule".to_string(),
                ));
            }
        }
        if let Some(liability) = self.discount_seller_liability {
            if !self.discount {
                return Err(EngineError::InvalidRequest(
                    "discountSellerLiability requires discount".to_string(),
                ));
            }
            if liability < Decimal::ZERO || liability > Decimal::ONE {
                return Err(EngineError::InvalidRequest(
                    "discountSellerLiability must be between 0 and 1".to_string(),
                ));
            }
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date)
            && start > end
        {
            return Err(EngineError::InvalidRequest(
                "startDate must be <= endDate".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "values")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub tenant_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub currency: String,
    pub balance: Option<i64>,
    pub uses_remaining: Option<i64>,
    pub program_id: Option<String>,
    pub is_generic_code: bool,
    pub per_contact_balance: Option<i64>,
    pub per_contact_uses_remaining: Option<i64>,
    pub code_hashed: Option<String>,
    pub code_last_four: Option<String>,
    pub contact_id: Option<String>,
    pub attached_from_value_id: Option<String>,
    pub active: bool,
    pub frozen: bool,
    pub canceled: bool,
    pub pretax: bool,
    pub discount: bool,
    pub discount_seller_liability: Option<String>,
    pub balance_rule: Option<Json>,
    pub redemption_rule: Option<Json>,
    pub start_date: Option<DateTimeUtc>,
    pub end_date: Option<DateTimeUtc>,
    pub metadata: Option<Json>,
    pub created_date: DateTimeUtc,
    pub updated_date: DateTimeUtc,
    pub created_by: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

fn rule_to_json(rule: &Option<Rule>) -> ResultEngine<Option<Json>> {
    rule.as_ref()
        .map(|r| {
            serde_json::to_value(r)
                .map_err(|err| EngineError::InvalidRule(format!("unserializable rule: {err}")))
        })
        .transpose()
}

fn rule_from_json(json: Option<Json>, value_id: &str) -> ResultEngine<Option<Rule>> {
    json.map(|j| {
        serde_json::from_value(j).map_err(|_| {
            EngineError::InvariantViolation(format!("value {value_id} has a malformed rule"))
        })
    })
    .transpose()
}

impl ActiveModel {
    pub(crate) fn from_value(tenant_id: &str, value: &Value) -> ResultEngine<Self> {
        let per_contact = value
            .generic_code_options
            .as_ref()
            .map(|o| o.per_contact.clone())
            .unwrap_or_default();
        Ok(Self {
            tenant_id: ActiveValue::Set(tenant_id.to_string()),
            id: ActiveValue::Set(value.id.clone()),
            currency: ActiveValue::Set(value.currency.clone()),
            balance: ActiveValue::Set(value.balance),
            uses_remaining: ActiveValue::Set(value.uses_remaining),
            program_id: ActiveValue::Set(value.program_id.clone()),
            is_generic_code: ActiveValue::Set(value.is_generic_code),
            per_contact_balance: ActiveValue::Set(per_contact.balance),
            per_contact_uses_remaining: ActiveValue::Set(per_contact.uses_remaining),
            code_hashed: ActiveValue::Set(value.code_hashed.clone()),
            code_last_four: ActiveValue::Set(value.code_last_four.clone()),
            contact_id: ActiveValue::Set(value.contact_id.clone()),
            attached_from_value_id: ActiveValue::Set(value.attached_from_value_id.clone()),
            active: ActiveValue::Set(value.active),
            frozen: ActiveValue::Set(value.frozen),
            canceled: ActiveValue::Set(value.canceled),
            pretax: ActiveValue::Set(value.pretax),
            discount: ActiveValue::Set(value.discount),
            discount_seller_liability: ActiveValue::Set(
                value.discount_seller_liability.map(|d| d.to_string()),
            ),
            balance_rule: ActiveValue::Set(rule_to_json(&value.balance_rule)?),
            redemption_rule: ActiveValue::Set(rule_to_json(&value.redemption_rule)?),
            start_date: ActiveValue::Set(value.start_date),
            end_date: ActiveValue::Set(value.end_date),
            metadata: ActiveValue::Set(value.metadata.clone()),
            created_date: ActiveValue::Set(value.created_date),
            updated_date: ActiveValue::Set(value.updated_date),
            created_by: ActiveValue::Set(value.created_by.clone()),
        })
    }
}

impl TryFrom<Model> for Value {
    type Error = EngineError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        let generic_code_options = if model.per_contact_balance.is_some()
            || model.per_contact_uses_remaining.is_some()
        {
            Some(GenericCodeOptions {
                per_contact: PerContactOptions {
                    balance: model.per_contact_balance,
                    uses_remaining: model.per_contact_uses_remaining,
                },
            })
        } else {
            None
        };
        let discount_seller_liability = model
            .discount_seller_liability
            .as_deref()
            .map(|raw| {
                raw.parse::<Decimal>().map_err(|_| {
                    EngineError::InvariantViolation(format!(
                        "value {} has a malformed discountSellerLiability",
                        model.id
                    ))
                })
            })
            .transpose()?;
        let balance_rule = rule_from_json(model.balance_rule, &model.id)?;
        let redemption_rule = rule_from_json(model.redemption_rule, &model.id)?;

        Ok(Self {
            id: model.id,
            currency: model.currency,
            balance: model.balance,
            uses_remaining: model.uses_remaining,
            program_id: model.program_id,
            is_generic_code: model.is_generic_code,
            generic_code_options,
            code_hashed: model.code_hashed,
            code_last_four: model.code_last_four,
            contact_id: model.contact_id,
            attached_from_value_id: model.attached_from_value_id,
            active: model.active,
            frozen: model.frozen,
            canceled: model.canceled,
            pretax: model.pretax,
            discount: model.discount,
            discount_seller_liability,
            balance_rule,
            redemption_rule,
            start_date: model.start_date,
            end_date: model.end_date,
            metadata: model.metadata,
            created_date: model.created_date,
            updated_date: model.updated_date,
            created_by: model.created_by,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::TimeZone;

    use super::*;

    /// A plain USD value with the given balance, used across planner tests.
    pub(crate) fn value(id: &str, balance: Option<i64>) -> Value {
        let created = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        Value {
            id: id.to_string(),
            currency: "USD".to_string(),
            balance,
            uses_remaining: None,
            program_id: None,
            is_generic_code: false,
            generic_code_options: None,
            code_hashed: None,
            code_last_four: None,
            contact_id: None,
            attached_from_value_id: None,
            active: true,
            frozen: false,
            canceled: false,
            pretax: false,
            discount: false,
            discount_seller_liability: None,
            balance_rule: None,
            redemption_rule: None,
            start_date: None,
            end_date: None,
            metadata: None,
            created_date: created,
            updated_date: created,
            created_by: "tester".to_string(),
        }
    }

    #[test]
    fn validate_rejects_balance_with_rule() {
        let mut v = value("v1", Some(100));
        v.balance_rule = Some(Rule::new("500"));
        assert!(matches!(v.validate(), Err(EngineError::InvalidRequest(_))));
    }

    #[test]
    fn validate_rejects_generic_with_contact() {
        let mut v = value("v1", Some(100));
        v.is_generic_code = true;
        v.contact_id = Some("c1".to_string());
        assert!(v.validate().is_err());
    }

    #[test]
    fn ownership_orders_direct_first() {
        let direct = value("a", Some(1));
        let mut attached = value("b", Some(1));
        attached.attached_from_value_id = Some("g".to_string());
        let mut generic = value("c", Some(1));
        generic.is_generic_code = true;

        assert!(direct.ownership() < attached.ownership());
        assert!(attached.ownership() < generic.ownership());
    }

    #[test]
    fn model_round_trip_keeps_per_contact_options() {
        let mut v = value("g", Some(1000));
        v.is_generic_code = true;
        v.generic_code_options = Some(GenericCodeOptions {
            per_contact: PerContactOptions {
                balance: Some(250),
                uses_remaining: None,
            },
        });
        v.discount = true;
        v.discount_seller_liability = Some(Decimal::new(25, 2));

        let active = ActiveModel::from_value("t1", &v).unwrap();
        let model = Model {
            tenant_id: "t1".to_string(),
            id: active.id.unwrap(),
            currency: active.currency.unwrap(),
            balance: active.balance.unwrap(),
            uses_remaining: active.uses_remaining.unwrap(),
            program_id: active.program_id.unwrap(),
            is_generic_code: active.is_generic_code.unwrap(),
            per_contact_balance: active.per_contact_balance.unwrap(),
            per_contact_uses_remaining: active.per_contact_uses_remaining.unwrap(),
            code_hashed: active.code_hashed.unwrap(),
            code_last_four: active.code_last_four.unwrap(),
            contact_id: active.contact_id.unwrap(),
            attached_from_value_id: active.attached_from_value_id.unwrap(),
            active: active.active.unwrap(),
            frozen: active.frozen.unwrap(),
            canceled: active.canceled.unwrap(),
            pretax: active.pretax.unwrap(),
            discount: active.discount.unwrap(),
            discount_seller_liability: active.discount_seller_liability.unwrap(),
            balance_rule: active.balance_rule.unwrap(),
            redemption_rule: active.redemption_rule.unwrap(),
            start_date: active.start_date.unwrap(),
            end_date: active.end_date.unwrap(),
            metadata: active.metadata.unwrap(),
            created_date: active.created_date.unwrap(),
            updated_date: active.updated_date.unwrap(),
            created_by: active.created_by.unwrap(),
        };
        assert_eq!(Value::try_from(model).unwrap(), v);
    }
}
