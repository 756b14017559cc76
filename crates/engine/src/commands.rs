//! Command structs for engine operations.
//!
//! Every command is `Serialize`: its JSON form, tagged with the operation
//! kind, is hashed and stored with the transaction so a replay of the same
//! request can be told apart from a different request reusing an id.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    EngineError, ResultEngine,
    rules::Rule,
    transactions::{LineItem, TaxOptions},
    values::GenericCodeOptions,
};

/// A Value named by id, by code, or every Value of a contact.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightrailParty {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartyTarget<'a> {
    ValueId(&'a str),
    Code(&'a str),
    Contact(&'a str),
}

impl LightrailParty {
    pub fn value(value_id: impl Into<String>) -> Self {
        Self {
            value_id: Some(value_id.into()),
            ..Self::default()
        }
    }

    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            ..Self::default()
        }
    }

    pub fn contact(contact_id: impl Into<String>) -> Self {
        Self {
            contact_id: Some(contact_id.into()),
            ..Self::default()
        }
    }

    /// Exactly one of `value_id`, `code`, `contact_id` must be set.
    pub fn target(&self) -> ResultEngine<PartyTarget<'_>> {
        match (&self.value_id, &self.code, &self.contact_id) {
            (Some(id), None, None) => Ok(PartyTarget::ValueId(id)),
            (None, Some(code), None) => Ok(PartyTarget::Code(code)),
            (None, None, Some(contact)) => Ok(PartyTarget::Contact(contact)),
            _ => Err(EngineError::InvalidRequest(
                "a lightrail party needs exactly one of valueId, code, contactId".to_string(),
            )),
        }
    }
}

/// Card source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StripeParty {
    pub source: String,
    /// Most this source may be charged; the last uncapped source takes the
    /// rest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<i64>,
}

/// Balance held on a ledger outside the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalParty {
    pub internal_id: String,
    pub balance: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rail", rename_all = "camelCase")]
pub enum Party {
    Lightrail(LightrailParty),
    Stripe(StripeParty),
    Internal(InternalParty),
}

/// `true` holds with the default window, a date holds until then.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PendingSpec {
    Flag(bool),
    Until(DateTime<Utc>),
}

/// Create a Value with its initial balance transaction.
///
/// The initial balance transaction shares the Value's id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateValueCmd {
    pub id: String,
    pub currency: String,
    pub balance: Option<i64>,
    pub uses_remaining: Option<i64>,
    pub program_id: Option<String>,
    pub is_generic_code: bool,
    pub generic_code_options: Option<GenericCodeOptions>,
    pub code: Option<String>,
    pub contact_id: Option<String>,
    pub active: bool,
    pub frozen: bool,
    pub pretax: bool,
    pub discount: bool,
    pub discount_seller_liability: Option<Decimal>,
    pub balance_rule: Option<Rule>,
    pub redemption_rule: Option<Rule>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

impl CreateValueCmd {
    #[must_use]
    pub fn new(id: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            currency: currency.into(),
            balance: None,
            uses_remaining: None,
            program_id: None,
            is_generic_code: false,
            generic_code_options: None,
            code: None,
            contact_id: None,
            active: true,
            frozen: false,
            pretax: false,
            discount: false,
            discount_seller_liability: None,
            balance_rule: None,
            redemption_rule: None,
            start_date: None,
            end_date: None,
            metadata: None,
        }
    }

    #[must_use]
    pub fn balance(mut self, balance: i64) -> Self {
        self.balance = Some(balance);
        self
    }

    #[must_use]
    pub fn uses_remaining(mut self, uses: i64) -> Self {
        self.uses_remaining = Some(uses);
        self
    }

    #[must_use]
    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn contact_id(mut self, contact_id: impl Into<String>) -> Self {
        self.contact_id = Some(contact_id.into());
        self
    }

    #[must_use]
    pub fn generic(mut self, options: Option<GenericCodeOptions>) -> Self {
        self.is_generic_code = true;
        self.generic_code_options = options;
        self
    }

    #[must_use]
    pub fn pretax(mut self) -> Self {
        self.pretax = true;
        self
    }

    #[must_use]
    pub fn discount(mut self, seller_liability: Option<Decimal>) -> Self {
        self.discount = true;
        self.discount_seller_liability = seller_liability;
        self
    }

    #[must_use]
    pub fn balance_rule(mut self, rule: Rule) -> Self {
        self.balance_rule = Some(rule);
        self
    }

    #[must_use]
    pub fn redemption_rule(mut self, rule: Rule) -> Self {
        self.redemption_rule = Some(rule);
        self
    }

    #[must_use]
    pub fn end_date(mut self, end_date: DateTime<Utc>) -> Self {
        self.end_date = Some(end_date);
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Non-monetary changes to a Value. `None` leaves a field unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateValueCmd {
    pub active: Option<bool>,
    pub frozen: Option<bool>,
    pub canceled: Option<bool>,
    pub pretax: Option<bool>,
    pub discount: Option<bool>,
    pub discount_seller_liability: Option<Decimal>,
    pub balance_rule: Option<Rule>,
    pub redemption_rule: Option<Rule>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub program_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl UpdateValueCmd {
    #[must_use]
    pub fn frozen(mut self, frozen: bool) -> Self {
        self.frozen = Some(frozen);
        self
    }

    #[must_use]
    pub fn canceled(mut self, canceled: bool) -> Self {
        self.canceled = Some(canceled);
        self
    }

    #[must_use]
    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    #[must_use]
    pub fn end_date(mut self, end_date: DateTime<Utc>) -> Self {
        self.end_date = Some(end_date);
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditCmd {
    pub id: String,
    pub destination: LightrailParty,
    pub currency: String,
    pub amount: Option<i64>,
    pub uses: Option<i64>,
    pub simulate: bool,
    pub metadata: Option<serde_json::Value>,
}

impl CreditCmd {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        destination: LightrailParty,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            destination,
            currency: currency.into(),
            amount: None,
            uses: None,
            simulate: false,
            metadata: None,
        }
    }

    #[must_use]
    pub fn amount(mut self, amount: i64) -> Self {
        self.amount = Some(amount);
        self
    }

    #[must_use]
    pub fn uses(mut self, uses: i64) -> Self {
        self.uses = Some(uses);
        self
    }

    #[must_use]
    pub fn simulate(mut self) -> Self {
        self.simulate = true;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebitCmd {
    pub id: String,
    pub source: LightrailParty,
    pub currency: String,
    pub amount: Option<i64>,
    pub uses: Option<i64>,
    pub allow_remainder: bool,
    pub simulate: bool,
    pub pending: Option<PendingSpec>,
    pub metadata: Option<serde_json::Value>,
}

impl DebitCmd {
    #[must_use]
    pub fn new(id: impl Into<String>, source: LightrailParty, currency: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source,
            currency: currency.into(),
            amount: None,
            uses: None,
            allow_remainder: false,
            simulate: false,
            pending: None,
            metadata: None,
        }
    }

    #[must_use]
    pub fn amount(mut self, amount: i64) -> Self {
        self.amount = Some(amount);
        self
    }

    #[must_use]
    pub fn uses(mut self, uses: i64) -> Self {
        self.uses = Some(uses);
        self
    }

    #[must_use]
    pub fn allow_remainder(mut self) -> Self {
        self.allow_remainder = true;
        self
    }

    #[must_use]
    pub fn simulate(mut self) -> Self {
        self.simulate = true;
        self
    }

    #[must_use]
    pub fn pending(mut self, pending: PendingSpec) -> Self {
        self.pending = Some(pending);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferCmd {
    pub id: String,
    /// Lightrail Value or card.
    pub source: Party,
    pub destination: LightrailParty,
    pub currency: String,
    pub amount: i64,
    pub allow_remainder: bool,
    pub simulate: bool,
    pub pending: Option<PendingSpec>,
    pub metadata: Option<serde_json::Value>,
}

impl TransferCmd {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        source: Party,
        destination: LightrailParty,
        currency: impl Into<String>,
        amount: i64,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            destination,
            currency: currency.into(),
            amount,
            allow_remainder: false,
            simulate: false,
            pending: None,
            metadata: None,
        }
    }

    #[must_use]
    pub fn allow_remainder(mut self) -> Self {
        self.allow_remainder = true;
        self
    }

    #[must_use]
    pub fn simulate(mut self) -> Self {
        self.simulate = true;
        self
    }

    #[must_use]
    pub fn pending(mut self, pending: PendingSpec) -> Self {
        self.pending = Some(pending);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutCmd {
    pub id: String,
    pub currency: String,
    pub line_items: Vec<LineItem>,
    pub sources: Vec<Party>,
    pub allow_remainder: bool,
    pub simulate: bool,
    pub pending: Option<PendingSpec>,
    pub tax: Option<TaxOptions>,
    /// Keep steps for Values that end up contributing nothing.
    pub include_zero_balance: bool,
    /// Resolve contact Values that have no uses left.
    pub include_zero_uses_remaining: bool,
    pub metadata: Option<serde_json::Value>,
}

impl CheckoutCmd {
    #[must_use]
    pub fn new(id: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            currency: currency.into(),
            line_items: Vec::new(),
            sources: Vec::new(),
            allow_remainder: false,
            simulate: false,
            pending: None,
            tax: None,
            include_zero_balance: false,
            include_zero_uses_remaining: false,
            metadata: None,
        }
    }

    #[must_use]
    pub fn line_item(mut self, item: LineItem) -> Self {
        self.line_items.push(item);
        self
    }

    #[must_use]
    pub fn source(mut self, party: Party) -> Self {
        self.sources.push(party);
        self
    }

    #[must_use]
    pub fn allow_remainder(mut self) -> Self {
        self.allow_remainder = true;
        self
    }

    #[must_use]
    pub fn simulate(mut self) -> Self {
        self.simulate = true;
        self
    }

    #[must_use]
    pub fn pending(mut self, pending: PendingSpec) -> Self {
        self.pending = Some(pending);
        self
    }

    #[must_use]
    pub fn tax(mut self, tax: TaxOptions) -> Self {
        self.tax = Some(tax);
        self
    }

    #[must_use]
    pub fn include_zero_balance(mut self) -> Self {
        self.include_zero_balance = true;
        self
    }
}

/// Attach a Value, or claim a generic code, for a contact.
///
/// Without an `id` a fresh transaction id is generated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachCmd {
    pub id: Option<String>,
    pub contact_id: String,
    pub value: LightrailParty,
    pub attach_generic_as_new_value: bool,
}

impl AttachCmd {
    #[must_use]
    pub fn new(contact_id: impl Into<String>, value: LightrailParty) -> Self {
        Self {
            id: None,
            contact_id: contact_id.into(),
            value,
            attach_generic_as_new_value: false,
        }
    }

    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn as_new_value(mut self) -> Self {
        self.attach_generic_as_new_value = true;
        self
    }
}

/// Void, reverse or capture an earlier transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainCmd {
    pub id: String,
    pub target_id: String,
    pub metadata: Option<serde_json::Value>,
}

impl ChainCmd {
    #[must_use]
    pub fn new(id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target_id: target_id.into(),
            metadata: None,
        }
    }

    #[must_use]
    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

pub type VoidCmd = ChainCmd;
pub type ReverseCmd = ChainCmd;
pub type CaptureCmd = ChainCmd;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn party_target_requires_exactly_one_selector() {
        assert_eq!(
            LightrailParty::value("v1").target().unwrap(),
            PartyTarget::ValueId("v1")
        );
        let both = LightrailParty {
            value_id: Some("v1".to_string()),
            code: Some("CODE".to_string()),
            contact_id: None,
        };
        assert!(both.target().is_err());
        assert!(LightrailParty::default().target().is_err());
    }

    #[test]
    fn party_json_shape() {
        let party: Party = serde_json::from_value(serde_json::json!({
            "rail": "lightrail",
            "valueId": "A"
        }))
        .unwrap();
        assert_eq!(party, Party::Lightrail(LightrailParty::value("A")));

        let pending: PendingSpec = serde_json::from_value(serde_json::json!(true)).unwrap();
        assert_eq!(pending, PendingSpec::Flag(true));
    }
}
