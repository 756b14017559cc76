//! Transaction primitives.
//!
//! A `Transaction` is an immutable ledger event that changes Values through
//! one or more [`TransactionStep`]s. Once committed the only column that is
//! ever written again is `next_transaction_id`, the pointer to the void,
//! capture or reverse that superseded it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveValue, entity::prelude::*};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{EngineError, ResultEngine, commands::Party, steps::TransactionStep};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransactionType {
    InitialBalance,
    Credit,
    Debit,
    Checkout,
    Transfer,
    Attach,
    Void,
    Reverse,
    Capture,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InitialBalance => "initialBalance",
            Self::Credit => "credit",
            Self::Debit => "debit",
            Self::Checkout => "checkout",
            Self::Transfer => "transfer",
            Self::Attach => "attach",
            Self::Void => "void",
            Self::Reverse => "reverse",
            Self::Capture => "capture",
        }
    }
}

impl TryFrom<&str> for TransactionType {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "initialBalance" => Ok(Self::InitialBalance),
            "credit" => Ok(Self::Credit),
            "debit" => Ok(Self::Debit),
            "checkout" => Ok(Self::Checkout),
            "transfer" => Ok(Self::Transfer),
            "attach" => Ok(Self::Attach),
            "void" => Ok(Self::Void),
            "reverse" => Ok(Self::Reverse),
            "capture" => Ok(Self::Capture),
            other => Err(EngineError::InvalidRequest(format!(
                "invalid transaction type: {other}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaxRoundingMode {
    #[default]
    HalfEven,
    HalfUp,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxOptions {
    pub rounding_mode: TaxRoundingMode,
}

/// Per line amounts computed by checkout.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineTotal {
    pub subtotal: i64,
    pub taxable: i64,
    pub tax: i64,
    pub discount: i64,
    pub payable: i64,
    pub remainder: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seller_gross: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seller_discount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seller_net: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    pub unit_price: i64,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    /// Fraction, `0.05` for 5%.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_rate: Option<Decimal>,
    /// Share of the subtotal the marketplace keeps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marketplace_rate: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_total: Option<LineTotal>,
}

fn default_quantity() -> i64 {
    1
}

impl LineItem {
    pub fn new(unit_price: i64) -> Self {
        Self {
            unit_price,
            quantity: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn product(mut self, product_id: impl Into<String>) -> Self {
        self.product_id = Some(product_id.into());
        self
    }

    #[must_use]
    pub fn quantity(mut self, quantity: i64) -> Self {
        self.quantity = quantity;
        self
    }

    #[must_use]
    pub fn tax_rate(mut self, rate: Decimal) -> Self {
        self.tax_rate = Some(rate);
        self
    }

    #[must_use]
    pub fn marketplace_rate(mut self, rate: Decimal) -> Self {
        self.marketplace_rate = Some(rate);
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketplaceTotals {
    pub seller_gross: i64,
    pub seller_discount: i64,
    pub seller_net: i64,
}

/// Totals of a transaction. Which fields are set depends on the type: a
/// debit only reports `remainder`, a checkout reports everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionTotals {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtotal: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount_lightrail: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payable: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_lightrail: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_stripe: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_internal: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remainder: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marketplace: Option<MarketplaceTotals>,
}

impl TransactionTotals {
    pub fn remainder_only(remainder: i64) -> Self {
        Self {
            remainder: Some(remainder),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub transaction_type: TransactionType,
    pub currency: String,
    pub steps: Vec<TransactionStep>,
    pub totals: Option<TransactionTotals>,
    pub line_items: Option<Vec<LineItem>>,
    pub payment_sources: Option<Vec<Party>>,
    pub tax: Option<TaxOptions>,
    pub pending: bool,
    pub pending_void_date: Option<DateTime<Utc>>,
    pub root_transaction_id: String,
    pub next_transaction_id: Option<String>,
    pub created_date: DateTime<Utc>,
    pub created_by: String,
    pub metadata: Option<serde_json::Value>,
    /// Set on plans returned by `simulate`; never stored.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub simulated: bool,
}

impl Transaction {
    /// Lightrail steps touching `value_id`.
    pub fn steps_for_value<'a>(
        &'a self,
        value_id: &'a str,
    ) -> impl Iterator<Item = &'a crate::steps::LightrailStep> + 'a {
        self.steps.iter().filter_map(move |step| match step {
            TransactionStep::Lightrail(step) if step.value_id == value_id => Some(step),
            _ => None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "transactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub tenant_id: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub transaction_type: String,
    pub currency: String,
    pub totals: Option<Json>,
    pub line_items: Option<Json>,
    pub payment_sources: Option<Json>,
    pub tax: Option<Json>,
    pub pending: bool,
    pub pending_void_date: Option<DateTimeUtc>,
    pub root_transaction_id: String,
    pub next_transaction_id: Option<String>,
    pub request_hash: String,
    pub created_date: DateTimeUtc,
    pub created_by: String,
    pub metadata: Option<Json>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::steps::Entity")]
    Steps,
}

impl Related<super::steps::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Steps.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

fn to_json<T: Serialize>(value: Option<&T>, label: &str) -> ResultEngine<Option<Json>> {
    value
        .map(serde_json::to_value)
        .transpose()
        .map_err(|err| EngineError::InvalidRequest(format!("unserializable {label}: {err}")))
}

fn from_json<T: DeserializeOwned>(
    json: Option<Json>,
    label: &str,
    transaction_id: &str,
) -> ResultEngine<Option<T>> {
    json.map(serde_json::from_value)
        .transpose()
        .map_err(|_| {
            EngineError::InvariantViolation(format!(
                "transaction {transaction_id} has malformed {label}"
            ))
        })
}

impl ActiveModel {
    pub(crate) fn from_transaction(
        tenant_id: &str,
        tx: &Transaction,
        request_hash: &str,
    ) -> ResultEngine<Self> {
        Ok(Self {
            tenant_id: ActiveValue::Set(tenant_id.to_string()),
            id: ActiveValue::Set(tx.id.clone()),
            transaction_type: ActiveValue::Set(tx.transaction_type.as_str().to_string()),
            currency: ActiveValue::Set(tx.currency.clone()),
            totals: ActiveValue::Set(to_json(tx.totals.as_ref(), "totals")?),
            line_items: ActiveValue::Set(to_json(tx.line_items.as_ref(), "line items")?),
            payment_sources: ActiveValue::Set(to_json(
                tx.payment_sources.as_ref(),
                "payment sources",
            )?),
            tax: ActiveValue::Set(to_json(tx.tax.as_ref(), "tax options")?),
            pending: ActiveValue::Set(tx.pending),
            pending_void_date: ActiveValue::Set(tx.pending_void_date),
            root_transaction_id: ActiveValue::Set(tx.root_transaction_id.clone()),
            next_transaction_id: ActiveValue::Set(tx.next_transaction_id.clone()),
            request_hash: ActiveValue::Set(request_hash.to_string()),
            created_date: ActiveValue::Set(tx.created_date),
            created_by: ActiveValue::Set(tx.created_by.clone()),
            metadata: ActiveValue::Set(tx.metadata.clone()),
        })
    }
}

impl Transaction {
    /// Rebuilds a transaction from its row and its steps in position order.
    pub(crate) fn from_model(model: Model, steps: Vec<TransactionStep>) -> ResultEngine<Self> {
        let transaction_type = TransactionType::try_from(model.transaction_type.as_str())
            .map_err(|_| {
                EngineError::InvariantViolation(format!(
                    "transaction {} has unknown type {}",
                    model.id, model.transaction_type
                ))
            })?;
        Ok(Self {
            totals: from_json(model.totals, "totals", &model.id)?,
            line_items: from_json(model.line_items, "line items", &model.id)?,
            payment_sources: from_json(model.payment_sources, "payment sources", &model.id)?,
            tax: from_json(model.tax, "tax options", &model.id)?,
            id: model.id,
            transaction_type,
            currency: model.currency,
            steps,
            pending: model.pending,
            pending_void_date: model.pending_void_date,
            root_transaction_id: model.root_transaction_id,
            next_transaction_id: model.next_transaction_id,
            created_date: model.created_date,
            created_by: model.created_by,
            metadata: model.metadata,
            simulated: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_type_round_trips_through_str() {
        for kind in [
            TransactionType::InitialBalance,
            TransactionType::Checkout,
            TransactionType::Capture,
        ] {
            assert_eq!(TransactionType::try_from(kind.as_str()).unwrap(), kind);
        }
        assert!(TransactionType::try_from("refund").is_err());
    }

    #[test]
    fn line_item_defaults_quantity_to_one() {
        let item: LineItem =
            serde_json::from_value(serde_json::json!({ "unitPrice": 1000 })).unwrap();
        assert_eq!(item.quantity, 1);
        assert_eq!(item.unit_price, 1000);
    }

    #[test]
    fn tax_rounding_mode_uses_upper_case_names() {
        let json = serde_json::to_value(TaxOptions {
            rounding_mode: TaxRoundingMode::HalfUp,
        })
        .unwrap();
        assert_eq!(json["roundingMode"], "HALF_UP");
    }
}
