//! Transaction steps.
//!
//! A step is one party's contribution to a transaction. The rail decides
//! which fields exist, so steps are a tagged enum rather than one record with
//! optional fields; the table stores all rails with a `rail` discriminator.

use chrono::{DateTime, Utc};
use sea_orm::{ActiveValue, entity::prelude::*};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EngineError, ResultEngine, rules::Rule};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rail", rename_all = "camelCase")]
pub enum TransactionStep {
    Lightrail(LightrailStep),
    Stripe(StripeStep),
    Internal(InternalStep),
}

/// Change to a stored Value.
///
/// Quantities the Value does not track are `None`. A rule-driven Value has no
/// balance, so only `balance_change` is set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightrailStep {
    pub value_id: String,
    pub contact_id: Option<String>,
    /// Masked code, `…ABCD`.
    pub code: Option<String>,
    pub balance_before: Option<i64>,
    pub balance_after: Option<i64>,
    pub balance_change: Option<i64>,
    pub uses_remaining_before: Option<i64>,
    pub uses_remaining_after: Option<i64>,
    pub uses_remaining_change: Option<i64>,
    pub balance_rule: Option<Rule>,
}

/// Card rail movement. A positive `amount` is money collected from the card,
/// a negative one is money given back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StripeStep {
    pub charge_id: String,
    pub amount: i64,
    pub charge: Option<serde_json::Value>,
}

/// Movement on a ledger the engine does not own.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalStep {
    pub internal_id: String,
    pub balance_before: i64,
    pub balance_after: i64,
    pub balance_change: i64,
}

impl TransactionStep {
    pub fn rail(&self) -> &'static str {
        match self {
            Self::Lightrail(_) => "lightrail",
            Self::Stripe(_) => "stripe",
            Self::Internal(_) => "internal",
        }
    }

    /// Signed change this step makes to the funds it draws on.
    ///
    /// Collecting from a card is a draw, so a stripe charge counts as
    /// `-amount`.
    pub fn balance_change(&self) -> i64 {
        match self {
            Self::Lightrail(step) => step.balance_change.unwrap_or(0),
            Self::Stripe(step) => -step.amount,
            Self::Internal(step) => step.balance_change,
        }
    }

    pub fn value_id(&self) -> Option<&str> {
        match self {
            Self::Lightrail(step) => Some(&step.value_id),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "transaction_steps")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub tenant_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub transaction_id: String,
    pub position: i32,
    pub rail: String,
    pub value_id: Option<String>,
    pub contact_id: Option<String>,
    pub code: Option<String>,
    pub balance_before: Option<i64>,
    pub balance_after: Option<i64>,
    pub balance_change: Option<i64>,
    pub uses_remaining_before: Option<i64>,
    pub uses_remaining_after: Option<i64>,
    pub uses_remaining_change: Option<i64>,
    pub balance_rule: Option<Json>,
    pub charge_id: Option<String>,
    pub charge: Option<Json>,
    pub internal_id: Option<String>,
    pub created_date: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::transactions::Entity",
        from = "(Column::TenantId, Column::TransactionId)",
        to = "(super::transactions::Column::TenantId, super::transactions::Column::Id)"
    )]
    Transaction,
}

impl Related<super::transactions::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Transaction.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl ActiveModel {
    pub(crate) fn from_step(
        tenant_id: &str,
        transaction_id: &str,
        position: usize,
        step: &TransactionStep,
        created_date: DateTime<Utc>,
    ) -> ResultEngine<Self> {
        let position = i32::try_from(position)
            .map_err(|_| EngineError::InvalidRequest("too many steps".to_string()))?;
        let mut model = Self {
            tenant_id: ActiveValue::Set(tenant_id.to_string()),
            id: ActiveValue::Set(Uuid::new_v4().to_string()),
            transaction_id: ActiveValue::Set(transaction_id.to_string()),
            position: ActiveValue::Set(position),
            rail: ActiveValue::Set(step.rail().to_string()),
            value_id: ActiveValue::Set(None),
            contact_id: ActiveValue::Set(None),
            code: ActiveValue::Set(None),
            balance_before: ActiveValue::Set(None),
            balance_after: ActiveValue::Set(None),
            balance_change: ActiveValue::Set(None),
            uses_remaining_before: ActiveValue::Set(None),
            uses_remaining_after: ActiveValue::Set(None),
            uses_remaining_change: ActiveValue::Set(None),
            balance_rule: ActiveValue::Set(None),
            charge_id: ActiveValue::Set(None),
            charge: ActiveValue::Set(None),
            internal_id: ActiveValue::Set(None),
            created_date: ActiveValue::Set(created_date),
        };
        match step {
            TransactionStep::Lightrail(step) => {
                let balance_rule = step
                    .balance_rule
                    .as_ref()
                    .map(serde_json::to_value)
                    .transpose()
                    .map_err(|err| EngineError::InvalidRule(err.to_string()))?;
                model.value_id = ActiveValue::Set(Some(step.value_id.clone()));
                model.contact_id = ActiveValue::Set(step.contact_id.clone());
                model.code = ActiveValue::Set(step.code.clone());
                model.balance_before = ActiveValue::Set(step.balance_before);
                model.balance_after = ActiveValue::Set(step.balance_after);
                model.balance_change = ActiveValue::Set(step.balance_change);
                model.uses_remaining_before = ActiveValue::Set(step.uses_remaining_before);
                model.uses_remaining_after = ActiveValue::Set(step.uses_remaining_after);
                model.uses_remaining_change = ActiveValue::Set(step.uses_remaining_change);
                model.balance_rule = ActiveValue::Set(balance_rule);
            }
            TransactionStep::Stripe(step) => {
                model.charge_id = ActiveValue::Set(Some(step.charge_id.clone()));
                model.balance_change = ActiveValue::Set(Some(step.amount));
                model.charge = ActiveValue::Set(step.charge.clone());
            }
            TransactionStep::Internal(step) => {
                model.internal_id = ActiveValue::Set(Some(step.internal_id.clone()));
                model.balance_before = ActiveValue::Set(Some(step.balance_before));
                model.balance_after = ActiveValue::Set(Some(step.balance_after));
                model.balance_change = ActiveValue::Set(Some(step.balance_change));
            }
        }
        Ok(model)
    }
}

fn missing(model: &Model, field: &str) -> EngineError {
    EngineError::InvariantViolation(format!(
        "{} step {} has no {field}",
        model.rail, model.id
    ))
}

impl TryFrom<Model> for TransactionStep {
    type Error = EngineError;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        match model.rail.as_str() {
            "lightrail" => {
                let value_id = model
                    .value_id
                    .clone()
                    .ok_or_else(|| missing(&model, "value_id"))?;
                let balance_rule = model
                    .balance_rule
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|_| {
                        EngineError::InvariantViolation(format!(
                            "step {} has a malformed balance rule",
                            model.id
                        ))
                    })?;
                Ok(Self::Lightrail(LightrailStep {
                    value_id,
                    contact_id: model.contact_id,
                    code: model.code,
                    balance_before: model.balance_before,
                    balance_after: model.balance_after,
                    balance_change: model.balance_change,
                    uses_remaining_before: model.uses_remaining_before,
                    uses_remaining_after: model.uses_remaining_after,
                    uses_remaining_change: model.uses_remaining_change,
                    balance_rule,
                }))
            }
            "stripe" => Ok(Self::Stripe(StripeStep {
                charge_id: model
                    .charge_id
                    .clone()
                    .ok_or_else(|| missing(&model, "charge_id"))?,
                amount: model
                    .balance_change
                    .ok_or_else(|| missing(&model, "amount"))?,
                charge: model.charge,
            })),
            "internal" => Ok(Self::Internal(InternalStep {
                internal_id: model
                    .internal_id
                    .clone()
                    .ok_or_else(|| missing(&model, "internal_id"))?,
                balance_before: model
                    .balance_before
                    .ok_or_else(|| missing(&model, "balance_before"))?,
                balance_after: model
                    .balance_after
                    .ok_or_else(|| missing(&model, "balance_after"))?,
                balance_change: model
                    .balance_change
                    .ok_or_else(|| missing(&model, "balance_change"))?,
            })),
            other => Err(EngineError::InvariantViolation(format!(
                "unknown step rail {other}"
            ))),
        }
    }
}
