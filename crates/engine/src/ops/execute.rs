//! Commits transaction plans.
//!
//! Everything a plan touches is written inside one database transaction.
//! Value rows are changed with conditional updates on the amounts the plan
//! was computed from, so a plan built from a stale snapshot fails with
//! `ValueModified` instead of overwriting a concurrent change.

use sea_orm::{
    ActiveModelTrait, ConnectionTrait, DatabaseTransaction, QueryFilter, TransactionTrait,
    prelude::*, sea_query::Expr,
};

use crate::{
    EngineError, ResultEngine,
    auth::Principal,
    contact_values,
    gateway::ChargeRequest,
    plan::{ChargeOperation, PlanStep, StripePlanStep, TransactionPlan, ValueMutation},
    planner::reversal::superseded_error,
    steps::{self, LightrailStep, StripeStep},
    transactions::{self, Transaction, TransactionType},
    values::{self, Value},
};

use super::{Engine, unique_violation, with_tx};

/// Card charge made while executing a plan, undone if the plan fails.
#[derive(Debug)]
struct Charged {
    charge_id: String,
    amount: i64,
    pending: bool,
}

impl Engine {
    /// Commits `plan` and returns the stored transaction.
    ///
    /// If a transaction with the plan's id already exists, the stored one is
    /// returned when it came from the same request and the call fails
    /// otherwise.
    pub(crate) async fn execute(
        &self,
        principal: &Principal,
        plan: &TransactionPlan,
    ) -> ResultEngine<Transaction> {
        plan.validate()?;
        let tenant_id = principal.tenant_id.as_str();

        let mut charged = Vec::new();
        match self.commit_plan(tenant_id, plan, &mut charged).await {
            Ok(()) => {
                tracing::info!(
                    tenant_id,
                    transaction_id = %plan.id,
                    transaction_type = plan.transaction_type.as_str(),
                    steps = plan.steps.len(),
                    pending = plan.is_pending(),
                    "transaction committed"
                );
                self.load_transaction(&self.database, tenant_id, &plan.id)
                    .await?
                    .map(|(tx, _)| tx)
                    .ok_or_else(|| {
                        EngineError::InvariantViolation(format!(
                            "transaction {} missing after commit",
                            plan.id
                        ))
                    })
            }
            Err(err) => {
                self.undo_charges(plan, &charged).await;
                if matches!(err, EngineError::TransactionIdExists(_))
                    && let Some(tx) = self
                        .replay(tenant_id, &plan.id, &plan.request_hash, plan.transaction_type)
                        .await?
                {
                    return Ok(tx);
                }
                if err.is_retryable() {
                    tracing::warn!(transaction_id = %plan.id, "transaction lost a race: {err}");
                }
                Err(err)
            }
        }
    }

    /// The committed transaction `id` when it was produced by the request
    /// hashing to `request_hash`.
    ///
    /// A different request under the same id fails with
    /// `TransactionIdExists`, or `ValueIdExists` for Value creation.
    pub(crate) async fn replay(
        &self,
        tenant_id: &str,
        id: &str,
        request_hash: &str,
        transaction_type: TransactionType,
    ) -> ResultEngine<Option<Transaction>> {
        let Some((tx, stored_hash)) = self.load_transaction(&self.database, tenant_id, id).await?
        else {
            return Ok(None);
        };
        if stored_hash == request_hash {
            tracing::info!(tenant_id, transaction_id = id, "replaying committed transaction");
            return Ok(Some(tx));
        }
        Err(match transaction_type {
            TransactionType::InitialBalance => EngineError::ValueIdExists(id.to_string()),
            _ => EngineError::TransactionIdExists(id.to_string()),
        })
    }

    async fn commit_plan(
        &self,
        tenant_id: &str,
        plan: &TransactionPlan,
        charged: &mut Vec<Charged>,
    ) -> ResultEngine<()> {
        with_tx!(self, |db_tx| {
            self.apply_plan(&db_tx, tenant_id, plan, charged).await
        })
    }

    async fn apply_plan(
        &self,
        db_tx: &DatabaseTransaction,
        tenant_id: &str,
        plan: &TransactionPlan,
        charged: &mut Vec<Charged>,
    ) -> ResultEngine<()> {
        let header = transactions::ActiveModel::from_transaction(
            tenant_id,
            &plan.simulate(),
            &plan.request_hash,
        )?;
        if let Err(err) = header.insert(db_tx).await {
            if unique_violation(&err).is_some() {
                return Err(EngineError::TransactionIdExists(plan.id.clone()));
            }
            return Err(err.into());
        }

        for mutation in &plan.mutations {
            if let ValueMutation::Create(value) = mutation {
                self.insert_value(db_tx, tenant_id, plan.transaction_type, value)
                    .await?;
            }
        }

        for step in plan.lightrail_steps() {
            self.apply_value_step(db_tx, tenant_id, step, plan).await?;
        }

        let mut card_steps = Vec::new();
        for step in &plan.steps {
            if let PlanStep::Stripe(step) = step {
                card_steps.push(self.apply_card_step(plan, step, charged).await?);
            }
        }

        for mutation in &plan.mutations {
            match mutation {
                ValueMutation::Create(_) => {}
                ValueMutation::SetContact {
                    value_id,
                    contact_id,
                } => {
                    let result = values::Entity::update_many()
                        .col_expr(values::Column::ContactId, Expr::value(contact_id.clone()))
                        .col_expr(values::Column::UpdatedDate, Expr::value(plan.created_date))
                        .filter(values::Column::TenantId.eq(tenant_id))
                        .filter(values::Column::Id.eq(value_id.clone()))
                        .filter(values::Column::ContactId.is_null())
                        .exec(db_tx)
                        .await?;
                    if result.rows_affected == 0 {
                        return Err(EngineError::ValueAlreadyAttached(value_id.clone()));
                    }
                }
                ValueMutation::LinkContact(link) => {
                    if let Err(err) = contact_values::ActiveModel::from_link(tenant_id, link)
                        .insert(db_tx)
                        .await
                    {
                        if unique_violation(&err).is_some() {
                            return Err(EngineError::ValueAlreadyAttached(link.value_id.clone()));
                        }
                        return Err(err.into());
                    }
                }
            }
        }

        let tx = plan.realize(card_steps)?;
        for (position, step) in tx.steps.iter().enumerate() {
            steps::ActiveModel::from_step(tenant_id, &tx.id, position, step, tx.created_date)?
                .insert(db_tx)
                .await?;
        }

        if let Some(chain) = &plan.chain {
            let result = transactions::Entity::update_many()
                .col_expr(
                    transactions::Column::NextTransactionId,
                    Expr::value(plan.id.clone()),
                )
                .filter(transactions::Column::TenantId.eq(tenant_id))
                .filter(transactions::Column::Id.eq(chain.target_id.clone()))
                .filter(transactions::Column::NextTransactionId.is_null())
                .exec(db_tx)
                .await?;
            if result.rows_affected == 0 {
                return Err(self
                    .chain_conflict(db_tx, tenant_id, &chain.target_id)
                    .await?);
            }
        }
        Ok(())
    }

    async fn insert_value(
        &self,
        db_tx: &DatabaseTransaction,
        tenant_id: &str,
        transaction_type: TransactionType,
        value: &Value,
    ) -> ResultEngine<()> {
        let Err(err) = values::ActiveModel::from_value(tenant_id, value)?
            .insert(db_tx)
            .await
        else {
            return Ok(());
        };
        let Some(message) = unique_violation(&err) else {
            return Err(err.into());
        };
        Err(match transaction_type {
            TransactionType::Attach => EngineError::ValueAlreadyAttached(value.id.clone()),
            _ if message.contains("code_hashed") => EngineError::ValueCodeExists,
            _ => EngineError::ValueIdExists(value.id.clone()),
        })
    }

    /// `UPDATE values SET ... WHERE balance IS <before> AND uses_remaining IS <before>`.
    async fn apply_value_step(
        &self,
        db_tx: &DatabaseTransaction,
        tenant_id: &str,
        step: &LightrailStep,
        plan: &TransactionPlan,
    ) -> ResultEngine<()> {
        let mut update = values::Entity::update_many()
            .col_expr(values::Column::UpdatedDate, Expr::value(plan.created_date))
            .filter(values::Column::TenantId.eq(tenant_id))
            .filter(values::Column::Id.eq(step.value_id.clone()));
        update = match (step.balance_before, step.balance_after) {
            (Some(before), Some(after)) => update
                .col_expr(values::Column::Balance, Expr::value(after))
                .filter(values::Column::Balance.eq(before)),
            _ => update.filter(values::Column::Balance.is_null()),
        };
        update = match (step.uses_remaining_before, step.uses_remaining_after) {
            (Some(before), Some(after)) => update
                .col_expr(values::Column::UsesRemaining, Expr::value(after))
                .filter(values::Column::UsesRemaining.eq(before)),
            _ => update.filter(values::Column::UsesRemaining.is_null()),
        };

        if update.exec(db_tx).await?.rows_affected == 1 {
            return Ok(());
        }
        match self.find_value(db_tx, tenant_id, &step.value_id).await? {
            None => Err(EngineError::InvariantViolation(format!(
                "value {} of transaction {} does not exist",
                step.value_id, plan.id
            ))),
            Some(_) => Err(EngineError::ValueModified(step.value_id.clone())),
        }
    }

    async fn apply_card_step(
        &self,
        plan: &TransactionPlan,
        step: &StripePlanStep,
        charged: &mut Vec<Charged>,
    ) -> ResultEngine<StripeStep> {
        let (charge_id, result) = match &step.operation {
            ChargeOperation::Charge { source, pending } => {
                let result = self
                    .gateway
                    .charge(&ChargeRequest {
                        transaction_id: plan.id.clone(),
                        source: source.clone(),
                        amount: step.amount,
                        currency: plan.currency.clone(),
                        pending: *pending,
                    })
                    .await?;
                charged.push(Charged {
                    charge_id: result.charge_id.clone(),
                    amount: step.amount,
                    pending: *pending,
                });
                (result.charge_id.clone(), result)
            }
            ChargeOperation::Capture { charge_id } => {
                (charge_id.clone(), self.gateway.capture(charge_id).await?)
            }
            ChargeOperation::Refund { charge_id } => (
                charge_id.clone(),
                self.gateway.refund(charge_id, -step.amount).await?,
            ),
            ChargeOperation::Release { charge_id } => {
                (charge_id.clone(), self.gateway.release(charge_id).await?)
            }
        };
        Ok(StripeStep {
            charge_id,
            amount: step.amount,
            charge: Some(result.charge),
        })
    }

    async fn undo_charges(&self, plan: &TransactionPlan, charged: &[Charged]) {
        for charge in charged {
            let undone = if charge.pending {
                self.gateway.release(&charge.charge_id).await
            } else {
                self.gateway.refund(&charge.charge_id, charge.amount).await
            };
            if let Err(err) = undone {
                tracing::error!(
                    transaction_id = %plan.id,
                    charge_id = %charge.charge_id,
                    "failed to undo card charge: {err}"
                );
            }
        }
    }

    /// Why the chain pointer of `target_id` could not be written.
    async fn chain_conflict<C: ConnectionTrait>(
        &self,
        conn: &C,
        tenant_id: &str,
        target_id: &str,
    ) -> ResultEngine<EngineError> {
        let target = transactions::Entity::find_by_id((tenant_id.to_string(), target_id.to_string()))
            .one(conn)
            .await?;
        let Some(next_id) = target.and_then(|t| t.next_transaction_id) else {
            return Ok(EngineError::TransactionNotFound(target_id.to_string()));
        };
        let successor = transactions::Entity::find_by_id((tenant_id.to_string(), next_id.clone()))
            .one(conn)
            .await?
            .ok_or_else(|| {
                EngineError::InvariantViolation(format!(
                    "transaction {target_id} points to missing {next_id}"
                ))
            })?;
        let successor_type = TransactionType::try_from(successor.transaction_type.as_str())
            .map_err(|_| {
                EngineError::InvariantViolation(format!(
                    "transaction {next_id} has unknown type {}",
                    successor.transaction_type
                ))
            })?;
        Ok(superseded_error(target_id, successor_type))
    }
}
