use std::collections::HashMap;

use uuid::Uuid;

use crate::{
    EngineError, ResultEngine,
    auth::Principal,
    codes::{request_hash, validate_id},
    commands::{AttachCmd, ChainCmd, CheckoutCmd, CreditCmd, DebitCmd, Party, TransferCmd},
    plan::TransactionPlan,
    planner::{
        attach::plan_attach,
        checkout::plan_checkout,
        debit_credit::{plan_credit, plan_debit},
        reversal::{plan_capture, plan_reverse, plan_reverse_captured, plan_void},
        transfer::{TransferSource, plan_transfer},
    },
    transactions::{Transaction, TransactionType},
    values::Value,
};

use super::{Engine, ResolveOptions};

mod list;

pub use list::{ReportRow, TransactionListFilter};

impl Engine {
    /// A committed transaction with this id and request, if there is one.
    async fn precheck(
        &self,
        principal: &Principal,
        id: &str,
        request_hash: &str,
        transaction_type: TransactionType,
        simulate: bool,
    ) -> ResultEngine<Option<Transaction>> {
        validate_id(id, "transaction")?;
        if simulate {
            return Ok(None);
        }
        self.replay(&principal.tenant_id, id, request_hash, transaction_type)
            .await
    }

    async fn finish(
        &self,
        principal: &Principal,
        plan: TransactionPlan,
        simulate: bool,
    ) -> ResultEngine<Transaction> {
        if simulate {
            return Ok(plan.simulate());
        }
        self.execute(principal, &plan).await
    }

    /// Adds balance and/or uses to a Value.
    pub async fn credit(&self, principal: &Principal, cmd: &CreditCmd) -> ResultEngine<Transaction> {
        let hash = request_hash(TransactionType::Credit.as_str(), cmd)?;
        if let Some(tx) = self
            .precheck(principal, &cmd.id, &hash, TransactionType::Credit, cmd.simulate)
            .await?
        {
            return Ok(tx);
        }
        let mut cmd = cmd.clone();
        cmd.currency = self
            .require_currency(&self.database, &principal.tenant_id, &cmd.currency)
            .await?
            .code;

        let value = self
            .resolve_value(&self.database, principal, &cmd.destination)
            .await?;
        let now = self.clock.now();
        let ctx = self.plan_context(principal, &cmd.id, &hash, cmd.metadata.as_ref(), now);
        let plan = plan_credit(&ctx, &value, &cmd)?;
        self.finish(principal, plan, cmd.simulate).await
    }

    /// Draws balance and/or uses from a Value.
    pub async fn debit(&self, principal: &Principal, cmd: &DebitCmd) -> ResultEngine<Transaction> {
        let hash = request_hash(TransactionType::Debit.as_str(), cmd)?;
        if let Some(tx) = self
            .precheck(principal, &cmd.id, &hash, TransactionType::Debit, cmd.simulate)
            .await?
        {
            return Ok(tx);
        }
        let mut cmd = cmd.clone();
        cmd.currency = self
            .require_currency(&self.database, &principal.tenant_id, &cmd.currency)
            .await?
            .code;

        let value = self
            .resolve_value(&self.database, principal, &cmd.source)
            .await?;
        let now = self.clock.now();
        let pending_void_date = self.pending_void_date(cmd.pending, now)?;
        let ctx = self.plan_context(principal, &cmd.id, &hash, cmd.metadata.as_ref(), now);
        let plan = plan_debit(&ctx, &value, &cmd, pending_void_date)?;
        self.finish(principal, plan, cmd.simulate).await
    }

    /// Moves balance from a Value or a card into another Value.
    pub async fn transfer(
        &self,
        principal: &Principal,
        cmd: &TransferCmd,
    ) -> ResultEngine<Transaction> {
        let hash = request_hash(TransactionType::Transfer.as_str(), cmd)?;
        if let Some(tx) = self
            .precheck(principal, &cmd.id, &hash, TransactionType::Transfer, cmd.simulate)
            .await?
        {
            return Ok(tx);
        }
        let mut cmd = cmd.clone();
        cmd.currency = self
            .require_currency(&self.database, &principal.tenant_id, &cmd.currency)
            .await?
            .code;

        let destination = self
            .resolve_value(&self.database, principal, &cmd.destination)
            .await?;
        let source_value;
        let source = match &cmd.source {
            Party::Lightrail(party) => {
                source_value = self.resolve_value(&self.database, principal, party).await?;
                TransferSource::Value(&source_value)
            }
            Party::Stripe(card) => TransferSource::Stripe(card),
            Party::Internal(_) => {
                return Err(EngineError::InvalidRequest(
                    "internal sources cannot fund a transfer".to_string(),
                ));
            }
        };

        let now = self.clock.now();
        let pending_void_date = self.pending_void_date(cmd.pending, now)?;
        let ctx = self.plan_context(principal, &cmd.id, &hash, cmd.metadata.as_ref(), now);
        let plan = plan_transfer(&ctx, source, &destination, &cmd, pending_void_date)?;
        self.finish(principal, plan, cmd.simulate).await
    }

    /// Pays for line items from the request's sources.
    pub async fn checkout(
        &self,
        principal: &Principal,
        cmd: &CheckoutCmd,
    ) -> ResultEngine<Transaction> {
        let hash = request_hash(TransactionType::Checkout.as_str(), cmd)?;
        if let Some(tx) = self
            .precheck(principal, &cmd.id, &hash, TransactionType::Checkout, cmd.simulate)
            .await?
        {
            return Ok(tx);
        }
        let mut cmd = cmd.clone();
        cmd.currency = self
            .require_currency(&self.database, &principal.tenant_id, &cmd.currency)
            .await?
            .code;

        let parties = self
            .resolve_parties(
                principal,
                &cmd.sources,
                &cmd.currency,
                ResolveOptions {
                    include_zero_balance: cmd.include_zero_balance,
                    include_zero_uses_remaining: cmd.include_zero_uses_remaining,
                },
            )
            .await?;
        let now = self.clock.now();
        let pending_void_date = self.pending_void_date(cmd.pending, now)?;
        let ctx = self.plan_context(principal, &cmd.id, &hash, cmd.metadata.as_ref(), now);
        let plan = plan_checkout(&ctx, &cmd, &parties, pending_void_date)?;
        self.finish(principal, plan, cmd.simulate).await
    }

    /// Attaches a Value, or a generic code, to a contact.
    pub async fn attach(&self, principal: &Principal, cmd: &AttachCmd) -> ResultEngine<Transaction> {
        let mut cmd = cmd.clone();
        let id = cmd
            .id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        let hash = request_hash(TransactionType::Attach.as_str(), &cmd)?;
        if let Some(tx) = self
            .precheck(principal, &id, &hash, TransactionType::Attach, false)
            .await?
        {
            return Ok(tx);
        }

        if !principal.can_act_for_contact(&cmd.contact_id) {
            return Err(EngineError::Forbidden(format!(
                "cannot act for contact {}",
                cmd.contact_id
            )));
        }
        self.require_contact(&self.database, &principal.tenant_id, &cmd.contact_id)
            .await?;

        // Unowned Values are attachable by whoever holds their code or id.
        let lookup = Principal {
            contact_id: None,
            ..principal.clone()
        };
        let target = self
            .resolve_value(&self.database, &lookup, &cmd.value)
            .await?;

        let now = self.clock.now();
        let ctx = self.plan_context(principal, &id, &hash, None, now);
        let plan = plan_attach(
            &ctx,
            &cmd.contact_id,
            &target,
            cmd.attach_generic_as_new_value,
        )?;
        self.execute(principal, &plan).await
    }

    /// Voids a pending transaction, releasing what it holds.
    pub async fn void(&self, principal: &Principal, cmd: &ChainCmd) -> ResultEngine<Transaction> {
        self.chain(principal, cmd, TransactionType::Void).await
    }

    /// Reverses a completed transaction.
    pub async fn reverse(&self, principal: &Principal, cmd: &ChainCmd) -> ResultEngine<Transaction> {
        self.chain(principal, cmd, TransactionType::Reverse).await
    }

    /// Completes a pending transaction.
    pub async fn capture(&self, principal: &Principal, cmd: &ChainCmd) -> ResultEngine<Transaction> {
        self.chain(principal, cmd, TransactionType::Capture).await
    }

    async fn chain(
        &self,
        principal: &Principal,
        cmd: &ChainCmd,
        transaction_type: TransactionType,
    ) -> ResultEngine<Transaction> {
        let hash = request_hash(transaction_type.as_str(), cmd)?;
        if let Some(tx) = self
            .precheck(principal, &cmd.id, &hash, transaction_type, false)
            .await?
        {
            return Ok(tx);
        }

        let tenant_id = principal.tenant_id.as_str();
        let (target, _) = self
            .load_transaction(&self.database, tenant_id, &cmd.target_id)
            .await?
            .ok_or_else(|| EngineError::TransactionNotFound(cmd.target_id.clone()))?;
        let superseded_by = self.successor_type(tenant_id, &target).await?;

        let now = self.clock.now();
        let ctx = self.plan_context(principal, &cmd.id, &hash, cmd.metadata.as_ref(), now);
        let plan = match transaction_type {
            TransactionType::Void => {
                let current = self.current_values(tenant_id, &target).await?;
                plan_void(&ctx, &target, superseded_by, &current)?
            }
            TransactionType::Reverse if target.transaction_type == TransactionType::Capture => {
                let original = self
                    .chain_neighbour(tenant_id, &target.root_transaction_id, &target.id)
                    .await?;
                let current = self.current_values(tenant_id, &original).await?;
                plan_reverse_captured(&ctx, &original, &target, superseded_by, &current)?
            }
            TransactionType::Reverse
                if target.pending && superseded_by == Some(TransactionType::Capture) =>
            {
                let capture_id = target.next_transaction_id.as_deref().unwrap_or_default();
                let capture = self
                    .chain_neighbour(tenant_id, capture_id, &target.id)
                    .await?;
                let capture_superseded_by = self.successor_type(tenant_id, &capture).await?;
                let current = self.current_values(tenant_id, &target).await?;
                plan_reverse_captured(&ctx, &target, &capture, capture_superseded_by, &current)?
            }
            TransactionType::Reverse => {
                let current = self.current_values(tenant_id, &target).await?;
                plan_reverse(&ctx, &target, superseded_by, &current)?
            }
            TransactionType::Capture => plan_capture(&ctx, &target, superseded_by)?,
            other => {
                return Err(EngineError::InvariantViolation(format!(
                    "{} does not supersede transactions",
                    other.as_str()
                )));
            }
        };
        self.execute(principal, &plan).await
    }

    /// Type of the transaction that superseded `target`, if any.
    async fn successor_type(
        &self,
        tenant_id: &str,
        target: &Transaction,
    ) -> ResultEngine<Option<TransactionType>> {
        let Some(next_id) = target.next_transaction_id.as_deref() else {
            return Ok(None);
        };
        let (successor, _) = self
            .load_transaction(&self.database, tenant_id, next_id)
            .await?
            .ok_or_else(|| {
                EngineError::InvariantViolation(format!(
                    "transaction {} points to missing {next_id}",
                    target.id
                ))
            })?;
        Ok(Some(successor.transaction_type))
    }

    /// Loads `id`, which the chain of `from_id` says must exist.
    async fn chain_neighbour(
        &self,
        tenant_id: &str,
        id: &str,
        from_id: &str,
    ) -> ResultEngine<Transaction> {
        self.load_transaction(&self.database, tenant_id, id)
            .await?
            .map(|(tx, _)| tx)
            .ok_or_else(|| {
                EngineError::InvariantViolation(format!(
                    "transaction {from_id} points to missing {id}"
                ))
            })
    }

    /// Current rows of every Value the transaction stepped on.
    async fn current_values(
        &self,
        tenant_id: &str,
        target: &Transaction,
    ) -> ResultEngine<HashMap<String, Value>> {
        let mut current = HashMap::new();
        for value_id in target.steps.iter().filter_map(|s| s.value_id()) {
            if current.contains_key(value_id) {
                continue;
            }
            if let Some(value) = self.find_value(&self.database, tenant_id, value_id).await? {
                current.insert(value_id.to_string(), value);
            }
        }
        Ok(current)
    }
}
