//! Voids pending transactions whose void date has passed.

use sea_orm::{Condition, QueryFilter, QueryOrder, QuerySelect, prelude::*};
use serde::Serialize;

use crate::{
    ResultEngine,
    auth::{Principal, SCOPE_TRANSACTIONS_VOID},
    clock::Deadline,
    codes::void_transaction_id,
    commands::ChainCmd,
    transactions::{self, Transaction},
};

use super::Engine;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepBatchReport {
    pub fetched: usize,
    pub processed: usize,
    pub failed: usize,
    /// Work was left undone because the deadline got too close.
    pub remaining_budget_exceeded: bool,
}

impl SweepBatchReport {
    fn absorb(&mut self, batch: SweepBatchReport) {
        self.fetched += batch.fetched;
        self.processed += batch.processed;
        self.failed += batch.failed;
        self.remaining_budget_exceeded |= batch.remaining_budget_exceeded;
    }
}

/// Sort key of the last transaction a batch fetched. The next batch starts
/// strictly after it, so items that keep failing are not fetched again.
#[derive(Clone, Debug, PartialEq, Eq)]
struct SweepCursor {
    pending_void_date: DateTimeUtc,
    tenant_id: String,
    id: String,
}

impl SweepCursor {
    fn of(model: &transactions::Model) -> Option<Self> {
        Some(Self {
            pending_void_date: model.pending_void_date?,
            tenant_id: model.tenant_id.clone(),
            id: model.id.clone(),
        })
    }

    /// `(pending_void_date, tenant_id, id) > cursor`.
    fn after(&self) -> Condition {
        use transactions::Column;
        Condition::any()
            .add(Column::PendingVoidDate.gt(self.pending_void_date))
            .add(
                Condition::all()
                    .add(Column::PendingVoidDate.eq(self.pending_void_date))
                    .add(Column::TenantId.gt(self.tenant_id.as_str())),
            )
            .add(
                Condition::all()
                    .add(Column::PendingVoidDate.eq(self.pending_void_date))
                    .add(Column::TenantId.eq(self.tenant_id.as_str()))
                    .add(Column::Id.gt(self.id.as_str())),
            )
    }
}

impl Engine {
    /// Voids up to `limit` expired pending transactions, oldest void date
    /// first, across all tenants.
    ///
    /// A failing item is logged and counted and the batch moves on. The batch
    /// stops before an item once less than the configured safety margin is
    /// left before `deadline`.
    pub async fn process_expired_pending_batch(
        &self,
        limit: u64,
        deadline: Deadline,
    ) -> ResultEngine<SweepBatchReport> {
        let (report, _) = self.expired_pending_batch(limit, deadline, None).await?;
        Ok(report)
    }

    async fn expired_pending_batch(
        &self,
        limit: u64,
        deadline: Deadline,
        after: Option<&SweepCursor>,
    ) -> ResultEngine<(SweepBatchReport, Option<SweepCursor>)> {
        let margin = self.config.sweeper.safety_margin;
        let mut report = SweepBatchReport::default();
        if !deadline.has_at_least(self.clock.as_ref(), margin) {
            report.remaining_budget_exceeded = true;
            return Ok((report, None));
        }

        let now = self.clock.now();
        let mut query = transactions::Entity::find()
            .filter(transactions::Column::Pending.eq(true))
            .filter(transactions::Column::NextTransactionId.is_null())
            .filter(transactions::Column::PendingVoidDate.lt(now));
        if let Some(cursor) = after {
            query = query.filter(cursor.after());
        }
        let expired = query
            .order_by_asc(transactions::Column::PendingVoidDate)
            .order_by_asc(transactions::Column::TenantId)
            .order_by_asc(transactions::Column::Id)
            .limit(limit)
            .all(&self.database)
            .await?;
        report.fetched = expired.len();
        let cursor = expired.last().and_then(SweepCursor::of);

        for model in expired {
            if !deadline.has_at_least(self.clock.as_ref(), margin) {
                report.remaining_budget_exceeded = true;
                break;
            }
            let principal = Principal::service(model.tenant_id.clone(), &[SCOPE_TRANSACTIONS_VOID]);
            match self.void_expired(&principal, &model.id).await {
                Ok(void) => {
                    report.processed += 1;
                    tracing::debug!(
                        tenant_id = %model.tenant_id,
                        transaction_id = %model.id,
                        void_id = %void.id,
                        "expired pending transaction voided"
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(
                        tenant_id = %model.tenant_id,
                        transaction_id = %model.id,
                        "failed to void expired pending transaction: {err}"
                    );
                }
            }
        }

        tracing::info!(
            fetched = report.fetched,
            processed = report.processed,
            failed = report.failed,
            budget_exceeded = report.remaining_budget_exceeded,
            "pending expiry batch finished"
        );
        Ok((report, cursor))
    }

    async fn void_expired(
        &self,
        principal: &Principal,
        transaction_id: &str,
    ) -> ResultEngine<Transaction> {
        principal.require_scope(SCOPE_TRANSACTIONS_VOID)?;
        let cmd = ChainCmd::new(void_transaction_id(transaction_id), transaction_id)
            .metadata(serde_json::json!({ "reason": "pendingVoidDateExpired" }));
        self.void(principal, &cmd).await
    }

    /// Runs batches of the configured size until one comes back short or
    /// time runs out. Each batch resumes after the last row of the previous
    /// one, so failed items are left for the next sweep.
    pub async fn sweep_expired_pending(&self, deadline: Deadline) -> ResultEngine<SweepBatchReport> {
        let limit = self.config.sweeper.batch_size;
        let mut total = SweepBatchReport::default();
        let mut cursor = None;
        loop {
            let (batch, last) = self
                .expired_pending_batch(limit, deadline, cursor.as_ref())
                .await?;
            total.absorb(batch);
            if batch.remaining_budget_exceeded || (batch.fetched as u64) < limit {
                break;
            }
            let Some(last) = last else {
                break;
            };
            cursor = Some(last);
        }
        Ok(total)
    }
}
