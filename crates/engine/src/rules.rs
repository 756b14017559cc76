//! Balance and redemption rules.
//!
//! A Value may carry a `balanceRule` (a formula producing the amount it can
//! contribute to a line item) and a `redemptionRule` (a predicate deciding
//! whether it applies to a line item at all). Rules are evaluated through the
//! [`RuleEvaluator`] trait so the planner never depends on a particular
//! language; [`ExpressionRuleEvaluator`] is the default.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::EngineError;

pub mod expression;

pub use expression::ExpressionRuleEvaluator;

/// A formula stored on a Value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub rule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl Rule {
    pub fn new(rule: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            explanation: None,
        }
    }

    #[must_use]
    pub fn explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },
    #[error("type error: {0}")]
    Type(String),
    #[error("unknown function {0}")]
    UnknownFunction(String),
    #[error("division by zero")]
    DivisionByZero,
}

impl From<RuleError> for EngineError {
    fn from(err: RuleError) -> Self {
        EngineError::InvalidRule(err.to_string())
    }
}

/// JSON document a rule is evaluated against.
///
/// Shape:
///
/// ```json
/// {
///   "currentLineItem": { "...": "line item with lineTotal" },
///   "lineItems": [ ],
///   "totals": { },
///   "value": { "balanceChange": 0, "metadata": { } },
///   "metadata": { }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuleContext(serde_json::Value);

impl RuleContext {
    pub fn new(
        current_line_item: serde_json::Value,
        line_items: serde_json::Value,
        totals: serde_json::Value,
        value_balance_change: i64,
        value_metadata: Option<&serde_json::Value>,
        transaction_metadata: Option<&serde_json::Value>,
    ) -> Self {
        Self(json!({
            "currentLineItem": current_line_item,
            "lineItems": line_items,
            "totals": totals,
            "value": {
                "balanceChange": value_balance_change,
                "metadata": value_metadata.cloned().unwrap_or_else(|| json!({})),
            },
            "metadata": transaction_metadata.cloned().unwrap_or_else(|| json!({})),
        }))
    }

    /// Context with no line item, used outside checkout (debits, claims).
    pub fn without_line_item(
        value_metadata: Option<&serde_json::Value>,
        transaction_metadata: Option<&serde_json::Value>,
    ) -> Self {
        Self::new(
            json!({}),
            json!([]),
            json!({}),
            0,
            value_metadata,
            transaction_metadata,
        )
    }

    pub fn from_json(document: serde_json::Value) -> Self {
        Self(document)
    }

    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }
}

/// Evaluates Value rules against a transaction context.
pub trait RuleEvaluator: Send + Sync + fmt::Debug {
    /// Parses the rule without evaluating it.
    fn check(&self, rule: &Rule) -> Result<(), RuleError>;

    /// Amount (minor units, never negative) a balance rule yields.
    fn evaluate_balance(&self, rule: &Rule, context: &RuleContext) -> Result<i64, RuleError>;

    /// Whether a redemption rule allows the Value to apply.
    fn evaluate_redeemable(&self, rule: &Rule, context: &RuleContext)
    -> Result<bool, RuleError>;
}
