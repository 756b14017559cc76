//! Card rail collaborator.
//!
//! The engine never talks to a payment processor itself. Stripe steps are
//! realized through a [`ChargeGateway`]; the result is stored opaquely on the
//! step.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::ResultEngine;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeRequest {
    pub transaction_id: String,
    /// Tokenized card or customer reference.
    pub source: String,
    pub amount: i64,
    pub currency: String,
    /// Authorize only; funds are captured or released later.
    pub pending: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeResult {
    pub charge_id: String,
    pub charge: serde_json::Value,
}

#[async_trait]
pub trait ChargeGateway: Send + Sync + fmt::Debug {
    async fn charge(&self, request: &ChargeRequest) -> ResultEngine<ChargeResult>;

    /// Captures a charge authorized with `pending: true`.
    async fn capture(&self, charge_id: &str) -> ResultEngine<ChargeResult>;

    async fn refund(&self, charge_id: &str, amount: i64) -> ResultEngine<ChargeResult>;

    /// Releases an uncaptured authorization.
    async fn release(&self, charge_id: &str) -> ResultEngine<ChargeResult>;
}

/// Gateway that accepts everything and derives charge ids from the request.
///
/// Suitable for tests and deployments without a card rail.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassThroughChargeGateway;

#[async_trait]
impl ChargeGateway for PassThroughChargeGateway {
    async fn charge(&self, request: &ChargeRequest) -> ResultEngine<ChargeResult> {
        let charge_id = format!("ch_{}_{}", request.transaction_id, request.source);
        Ok(ChargeResult {
            charge: json!({
                "id": charge_id,
                "object": "charge",
                "amount": request.amount,
                "currency": request.currency,
                "captured": !request.pending,
            }),
            charge_id,
        })
    }

    async fn capture(&self, charge_id: &str) -> ResultEngine<ChargeResult> {
        Ok(ChargeResult {
            charge_id: charge_id.to_string(),
            charge: json!({ "id": charge_id, "object": "charge", "captured": true }),
        })
    }

    async fn refund(&self, charge_id: &str, amount: i64) -> ResultEngine<ChargeResult> {
        Ok(ChargeResult {
            charge_id: charge_id.to_string(),
            charge: json!({
                "id": format!("re_{charge_id}"),
                "object": "refund",
                "charge": charge_id,
                "amount": amount,
            }),
        })
    }

    async fn release(&self, charge_id: &str) -> ResultEngine<ChargeResult> {
        Ok(ChargeResult {
            charge_id: charge_id.to_string(),
            charge: json!({
                "id": format!("re_{charge_id}"),
                "object": "refund",
                "charge": charge_id,
                "reason": "uncaptured",
            }),
        })
    }
}
