use std::collections::HashMap;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sea_orm::{
    Condition, ConnectionTrait, QueryFilter, QueryOrder, QuerySelect, QueryTrait,
    TransactionTrait, prelude::*,
};

use crate::{
    EngineError, ResultEngine,
    auth::Principal,
    steps::{self, TransactionStep},
    transactions::{self, Transaction, TransactionType},
};

use super::super::{Engine, with_tx};

/// Filters for listing transactions.
///
/// `created_from` is inclusive and `created_to` is exclusive
/// (`[from, to)`), both in UTC.
#[derive(Clone, Debug, Default)]
pub struct TransactionListFilter {
    /// If present, acts as an allow-list of types to return.
    pub types: Option<Vec<TransactionType>>,
    /// Only transactions with a step on this Value.
    pub value_id: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    /// Only pending transactions that were neither voided nor captured.
    pub pending_only: bool,
}

fn validate_list_filter(filter: &TransactionListFilter, limit: u64) -> ResultEngine<()> {
    if limit == 0 {
        return Err(EngineError::InvalidRequest(
            "limit must be > 0".to_string(),
        ));
    }
    if let (Some(from), Some(to)) = (filter.created_from, filter.created_to)
        && from >= to
    {
        return Err(EngineError::InvalidRequest(
            "invalid range: from must be < to".to_string(),
        ));
    }
    if filter.types.as_ref().is_some_and(|t| t.is_empty()) {
        return Err(EngineError::InvalidRequest(
            "types must not be empty".to_string(),
        ));
    }
    Ok(())
}

trait ApplyTxFilters: QueryFilter + Sized {
    fn apply_tx_filters(self, tenant_id: &str, filter: &TransactionListFilter) -> Self;
}

impl<T> ApplyTxFilters for T
where
    T: QueryFilter + Sized,
{
    fn apply_tx_filters(mut self, tenant_id: &str, filter: &TransactionListFilter) -> Self {
        if let Some(from) = filter.created_from {
            self = self.filter(transactions::Column::CreatedDate.gte(from));
        }
        if let Some(to) = filter.created_to {
            self = self.filter(transactions::Column::CreatedDate.lt(to));
        }
        if let Some(types) = &filter.types {
            let types: Vec<String> = types.iter().map(|t| t.as_str().to_string()).collect();
            self = self.filter(transactions::Column::TransactionType.is_in(types));
        }
        if filter.pending_only {
            self = self
                .filter(transactions::Column::Pending.eq(true))
                .filter(transactions::Column::NextTransactionId.is_null());
        }
        if let Some(value_id) = &filter.value_id {
            self = self.filter(
                transactions::Column::Id.in_subquery(
                    steps::Entity::find()
                        .select_only()
                        .column(steps::Column::TransactionId)
                        .filter(steps::Column::TenantId.eq(tenant_id))
                        .filter(steps::Column::ValueId.eq(value_id.clone()))
                        .into_query(),
                ),
            );
        }
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct TransactionsCursor {
    created_date: DateTime<Utc>,
    transaction_id: String,
}

impl TransactionsCursor {
    fn encode(&self) -> ResultEngine<String> {
        let bytes = serde_json::to_vec(self)
            .map_err(|_| EngineError::InvalidCursor("invalid transactions cursor".to_string()))?;
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    fn decode(input: &str) -> ResultEngine<Self> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(input.as_bytes())
            .map_err(|_| EngineError::InvalidCursor("invalid transactions cursor".to_string()))?;
        serde_json::from_slice::<Self>(&bytes)
            .map_err(|_| EngineError::InvalidCursor("invalid transactions cursor".to_string()))
    }
}

/// One transaction flattened for reporting: how much each rail moved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRow {
    pub id: String,
    pub transaction_type: TransactionType,
    pub currency: String,
    pub created_date: DateTime<Utc>,
    pub pending: bool,
    /// Net balance change over lightrail steps.
    pub lightrail: i64,
    /// Collected from cards; refunds are negative.
    pub stripe: i64,
    pub internal: i64,
    pub remainder: i64,
    pub value_ids: Vec<String>,
    pub metadata: Option<serde_json::Value>,
}

impl From<&Transaction> for ReportRow {
    fn from(tx: &Transaction) -> Self {
        let mut row = Self {
            id: tx.id.clone(),
            transaction_type: tx.transaction_type,
            currency: tx.currency.clone(),
            created_date: tx.created_date,
            pending: tx.pending,
            lightrail: 0,
            stripe: 0,
            internal: 0,
            remainder: tx
                .totals
                .as_ref()
                .and_then(|t| t.remainder)
                .unwrap_or(0),
            value_ids: Vec::new(),
            metadata: tx.metadata.clone(),
        };
        for step in &tx.steps {
            match step {
                TransactionStep::Lightrail(step) => {
                    row.lightrail += step.balance_change.unwrap_or(0);
                    row.value_ids.push(step.value_id.clone());
                }
                TransactionStep::Stripe(step) => row.stripe += step.amount,
                TransactionStep::Internal(step) => row.internal += step.balance_change,
            }
        }
        row
    }
}

async fn load_steps<C: ConnectionTrait>(
    conn: &C,
    tenant_id: &str,
    transaction_ids: Vec<String>,
) -> ResultEngine<HashMap<String, Vec<TransactionStep>>> {
    let mut out: HashMap<String, Vec<TransactionStep>> = HashMap::new();
    if transaction_ids.is_empty() {
        return Ok(out);
    }
    let models = steps::Entity::find()
        .filter(steps::Column::TenantId.eq(tenant_id))
        .filter(steps::Column::TransactionId.is_in(transaction_ids))
        .order_by_asc(steps::Column::TransactionId)
        .order_by_asc(steps::Column::Position)
        .all(conn)
        .await?;
    for model in models {
        let transaction_id = model.transaction_id.clone();
        out.entry(transaction_id)
            .or_default()
            .push(TransactionStep::try_from(model)?);
    }
    Ok(out)
}

impl Engine {
    /// Loads a transaction with its steps, along with the hash of the request
    /// that produced it.
    pub(crate) async fn load_transaction<C: ConnectionTrait>(
        &self,
        conn: &C,
        tenant_id: &str,
        id: &str,
    ) -> ResultEngine<Option<(Transaction, String)>> {
        let Some(model) = transactions::Entity::find_by_id((tenant_id.to_string(), id.to_string()))
            .one(conn)
            .await?
        else {
            return Ok(None);
        };
        let mut by_transaction = load_steps(conn, tenant_id, vec![model.id.clone()]).await?;
        let request_hash = model.request_hash.clone();
        let tx_steps = by_transaction.remove(&model.id).unwrap_or_default();
        Ok(Some((Transaction::from_model(model, tx_steps)?, request_hash)))
    }

    /// Returns a transaction with its steps.
    pub async fn get_transaction(
        &self,
        principal: &Principal,
        id: &str,
    ) -> ResultEngine<Transaction> {
        self.load_transaction(&self.database, &principal.tenant_id, id)
            .await?
            .map(|(tx, _)| tx)
            .ok_or_else(|| EngineError::TransactionNotFound(id.to_string()))
    }

    /// Lists transactions with cursor-based pagination.
    ///
    /// Pagination is newest → older by `(created_date DESC, id DESC)`.
    pub async fn list_transactions(
        &self,
        principal: &Principal,
        limit: u64,
        cursor: Option<&str>,
        filter: &TransactionListFilter,
    ) -> ResultEngine<(Vec<Transaction>, Option<String>)> {
        validate_list_filter(filter, limit)?;
        let tenant_id = principal.tenant_id.as_str();

        with_tx!(self, |db_tx| {
            let limit_plus_one = limit.saturating_add(1);
            let mut query = transactions::Entity::find()
                .filter(transactions::Column::TenantId.eq(tenant_id))
                .order_by_desc(transactions::Column::CreatedDate)
                .order_by_desc(transactions::Column::Id)
                .limit(limit_plus_one);

            if let Some(cursor) = cursor {
                let cursor = TransactionsCursor::decode(cursor)?;
                query = query.filter(
                    Condition::any()
                        .add(transactions::Column::CreatedDate.lt(cursor.created_date))
                        .add(
                            Condition::all()
                                .add(transactions::Column::CreatedDate.eq(cursor.created_date))
                                .add(transactions::Column::Id.lt(cursor.transaction_id)),
                        ),
                );
            }
            query = query.apply_tx_filters(tenant_id, filter);

            let models: Vec<transactions::Model> = query.all(&db_tx).await?;
            let has_more = models.len() > limit as usize;
            let models: Vec<_> = models.into_iter().take(limit as usize).collect();

            let ids = models.iter().map(|m| m.id.clone()).collect();
            let mut by_transaction = load_steps(&db_tx, tenant_id, ids).await?;
            let mut out = Vec::with_capacity(models.len());
            for model in models {
                let tx_steps = by_transaction.remove(&model.id).unwrap_or_default();
                out.push(Transaction::from_model(model, tx_steps)?);
            }

            let next_cursor = if has_more {
                out.last()
                    .map(|tx| TransactionsCursor {
                        created_date: tx.created_date,
                        transaction_id: tx.id.clone(),
                    })
                    .map(|c| c.encode())
                    .transpose()?
            } else {
                None
            };

            Ok((out, next_cursor))
        })
    }

    /// Same page as [`Engine::list_transactions`], one report row per
    /// transaction.
    pub async fn transaction_report(
        &self,
        principal: &Principal,
        limit: u64,
        cursor: Option<&str>,
        filter: &TransactionListFilter,
    ) -> ResultEngine<(Vec<ReportRow>, Option<String>)> {
        let (page, next) = self
            .list_transactions(principal, limit, cursor, filter)
            .await?;
        Ok((page.iter().map(ReportRow::from).collect(), next))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::steps::{LightrailStep, StripeStep};

    #[test]
    fn cursor_round_trip_and_garbage() {
        let cursor = TransactionsCursor {
            created_date: Utc.timestamp_opt(1_800_000_000, 0).unwrap(),
            transaction_id: "tx-1".to_string(),
        };
        let decoded = TransactionsCursor::decode(&cursor.encode().unwrap()).unwrap();
        assert_eq!(decoded.transaction_id, "tx-1");
        assert!(matches!(
            TransactionsCursor::decode("not a cursor"),
            Err(EngineError::InvalidCursor(_))
        ));
    }

    #[test]
    fn filter_validation() {
        let filter = TransactionListFilter {
            types: Some(vec![]),
            ..TransactionListFilter::default()
        };
        assert!(validate_list_filter(&filter, 10).is_err());
        assert!(validate_list_filter(&TransactionListFilter::default(), 0).is_err());
    }

    #[test]
    fn report_row_sums_each_rail() {
        let tx = Transaction {
            id: "co-1".to_string(),
            transaction_type: TransactionType::Checkout,
            currency: "USD".to_string(),
            steps: vec![
                TransactionStep::Lightrail(LightrailStep {
                    value_id: "gift".to_string(),
                    balance_before: Some(300),
                    balance_change: Some(-300),
                    balance_after: Some(0),
                    ..LightrailStep::default()
                }),
                TransactionStep::Stripe(StripeStep {
                    charge_id: "ch_1".to_string(),
                    amount: 700,
                    charge: None,
                }),
            ],
            totals: None,
            line_items: None,
            payment_sources: None,
            tax: None,
            pending: false,
            pending_void_date: None,
            root_transaction_id: "co-1".to_string(),
            next_transaction_id: None,
            created_date: Utc.timestamp_opt(1_800_000_000, 0).unwrap(),
            created_by: "tester".to_string(),
            metadata: None,
            simulated: false,
        };
        let row = ReportRow::from(&tx);
        assert_eq!(row.lightrail, -300);
        assert_eq!(row.stripe, 700);
        assert_eq!(row.internal, 0);
        assert_eq!(row.value_ids, ["gift"]);
    }
}
