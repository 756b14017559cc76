use sea_orm::{
    ActiveModelTrait, Condition, ConnectionTrait, IntoActiveModel, QueryFilter,
    TransactionTrait, prelude::*,
};

use crate::{
    Currency, EngineError, ResultEngine,
    auth::Principal,
    codes::{last_four, normalize_code, request_hash},
    commands::{CreateValueCmd, LightrailParty, UpdateValueCmd},
    contact_values, contacts, currency,
    planner::initial_balance::plan_initial_balance,
    rules::Rule,
    steps,
    transactions::{self, TransactionType},
    values::{self, Value},
};

use super::{Engine, resolve::sort_values, with_tx};

impl Engine {
    pub(crate) async fn require_currency<C: ConnectionTrait>(
        &self,
        conn: &C,
        tenant_id: &str,
        code: &str,
    ) -> ResultEngine<Currency> {
        let code = currency::normalize_code(code)?;
        currency::Entity::find_by_id((tenant_id.to_string(), code.clone()))
            .one(conn)
            .await?
            .ok_or(EngineError::CurrencyNotFound(code))?
            .try_into()
    }

    pub(crate) async fn require_contact<C: ConnectionTrait>(
        &self,
        conn: &C,
        tenant_id: &str,
        contact_id: &str,
    ) -> ResultEngine<()> {
        contacts::Entity::find_by_id((tenant_id.to_string(), contact_id.to_string()))
            .one(conn)
            .await?
            .ok_or_else(|| EngineError::ContactNotFound(contact_id.to_string()))?;
        Ok(())
    }

    fn check_rules(&self, rules: [Option<&Rule>; 2]) -> ResultEngine<()> {
        for rule in rules.into_iter().flatten() {
            self.evaluator.check(rule)?;
        }
        Ok(())
    }

    /// Creates a Value through its initial balance transaction, which shares
    /// the Value's id.
    ///
    /// Repeating the same request returns the Value created the first time.
    pub async fn create_value(
        &self,
        principal: &Principal,
        cmd: &CreateValueCmd,
    ) -> ResultEngine<Value> {
        let hash = request_hash(TransactionType::InitialBalance.as_str(), cmd)?;
        let tenant_id = principal.tenant_id.as_str();
        if self
            .replay(tenant_id, &cmd.id, &hash, TransactionType::InitialBalance)
            .await?
            .is_some()
        {
            return self.get_value(principal, &cmd.id).await;
        }

        let currency = self
            .require_currency(&self.database, tenant_id, &cmd.currency)
            .await?;
        if let Some(contact_id) = &cmd.contact_id {
            if !principal.can_act_for_contact(contact_id) {
                return Err(EngineError::Forbidden(format!(
                    "cannot act for contact {contact_id}"
                )));
            }
            self.require_contact(&self.database, tenant_id, contact_id)
                .await?;
        }
        self.check_rules([cmd.balance_rule.as_ref(), cmd.redemption_rule.as_ref()])?;

        let (code_hashed, code_last_four) = match &cmd.code {
            Some(code) => {
                let normalized = normalize_code(code)?;
                (
                    Some(self.code_hasher.hash(&normalized)?),
                    Some(last_four(&normalized)),
                )
            }
            None => (None, None),
        };

        let now = self.clock.now();
        let value = Value {
            id: cmd.id.clone(),
            currency: currency.code,
            balance: cmd.balance,
            uses_remaining: cmd.uses_remaining,
            program_id: cmd.program_id.clone(),
            is_generic_code: cmd.is_generic_code,
            generic_code_options: cmd.generic_code_options.clone(),
            code_hashed,
            code_last_four,
            contact_id: cmd.contact_id.clone(),
            attached_from_value_id: None,
            active: cmd.active,
            frozen: cmd.frozen,
            canceled: false,
            pretax: cmd.pretax,
            discount: cmd.discount,
            discount_seller_liability: cmd.discount_seller_liability,
            balance_rule: cmd.balance_rule.clone(),
            redemption_rule: cmd.redemption_rule.clone(),
            start_date: cmd.start_date,
            end_date: cmd.end_date,
            metadata: cmd.metadata.clone(),
            created_date: now,
            updated_date: now,
            created_by: principal.user_id.clone(),
        };

        let ctx = self.plan_context(principal, &cmd.id, &hash, None, now);
        let plan = plan_initial_balance(&ctx, value)?;
        self.execute(principal, &plan).await?;
        self.get_value(principal, &cmd.id).await
    }

    pub async fn get_value(&self, principal: &Principal, id: &str) -> ResultEngine<Value> {
        self.resolve_value(&self.database, principal, &LightrailParty::value(id))
            .await
    }

    pub async fn get_value_by_code(
        &self,
        principal: &Principal,
        code: &str,
    ) -> ResultEngine<Value> {
        self.resolve_value(&self.database, principal, &LightrailParty::code(code))
            .await
    }

    /// Changes the non-monetary attributes of a Value. Balance and uses only
    /// move through transactions.
    pub async fn update_value(
        &self,
        principal: &Principal,
        id: &str,
        cmd: &UpdateValueCmd,
    ) -> ResultEngine<Value> {
        self.check_rules([cmd.balance_rule.as_ref(), cmd.redemption_rule.as_ref()])?;
        let tenant_id = principal.tenant_id.as_str();
        let now = self.clock.now();

        with_tx!(self, |db_tx| {
            let value = self
                .resolve_value(&db_tx, principal, &LightrailParty::value(id))
                .await?;
            let model = values::Entity::find_by_id((tenant_id.to_string(), id.to_string()))
                .one(&db_tx)
                .await?
                .ok_or_else(|| EngineError::ValueNotFound(id.to_string()))?;

            if value.canceled && cmd.canceled == Some(false) {
                return Err(EngineError::InvalidRequest(format!(
                    "value {id} is canceled and cannot be restored"
                )));
            }
            let mut updated = value;
            if let Some(active) = cmd.active {
                updated.active = active;
            }
            if let Some(frozen) = cmd.frozen {
                updated.frozen = frozen;
            }
            if let Some(canceled) = cmd.canceled {
                updated.canceled = canceled;
            }
            if let Some(pretax) = cmd.pretax {
                updated.pretax = pretax;
            }
            if let Some(discount) = cmd.discount {
                updated.discount = discount;
            }
            if let Some(liability) = cmd.discount_seller_liability {
                updated.discount_seller_liability = Some(liability);
            }
            if let Some(rule) = &cmd.balance_rule {
                updated.balance_rule = Some(rule.clone());
            }
            if let Some(rule) = &cmd.redemption_rule {
                updated.redemption_rule = Some(rule.clone());
            }
            if let Some(start_date) = cmd.start_date {
                updated.start_date = Some(start_date);
            }
            if let Some(end_date) = cmd.end_date {
                updated.end_date = Some(end_date);
            }
            if let Some(program_id) = &cmd.program_id {
                updated.program_id = Some(program_id.clone());
            }
            if let Some(metadata) = &cmd.metadata {
                updated.metadata = Some(metadata.clone());
            }
            updated.updated_date = now;
            updated.validate()?;

            let full = values::ActiveModel::from_value(tenant_id, &updated)?;
            let mut row = model.into_active_model();
            row.active = full.active;
            row.frozen = full.frozen;
            row.canceled = full.canceled;
            row.pretax = full.pretax;
            row.discount = full.discount;
            row.discount_seller_liability = full.discount_seller_liability;
            row.balance_rule = full.balance_rule;
            row.redemption_rule = full.redemption_rule;
            row.start_date = full.start_date;
            row.end_date = full.end_date;
            row.program_id = full.program_id;
            row.metadata = full.metadata;
            row.updated_date = full.updated_date;
            Value::try_from(row.update(&db_tx).await?)
        })
    }

    /// Deletes a Value no transaction has touched besides its own initial
    /// balance, which is deleted with it.
    pub async fn delete_value(&self, principal: &Principal, id: &str) -> ResultEngine<()> {
        let tenant_id = principal.tenant_id.as_str();
        with_tx!(self, |db_tx| {
            self.resolve_value(&db_tx, principal, &LightrailParty::value(id))
                .await?;

            let referencing: Vec<String> = steps::Entity::find()
                .filter(steps::Column::TenantId.eq(tenant_id))
                .filter(steps::Column::ValueId.eq(id))
                .all(&db_tx)
                .await?
                .into_iter()
                .map(|step| step.transaction_id)
                .collect();
            if referencing.iter().any(|tx_id| tx_id != id) {
                return Err(EngineError::ValueInUse(id.to_string()));
            }
            let initial_balance =
                transactions::Entity::find_by_id((tenant_id.to_string(), id.to_string()))
                    .one(&db_tx)
                    .await?;
            if initial_balance.is_some_and(|tx| {
                tx.transaction_type != TransactionType::InitialBalance.as_str()
                    || tx.next_transaction_id.is_some()
            }) {
                return Err(EngineError::ValueInUse(id.to_string()));
            }

            steps::Entity::delete_many()
                .filter(steps::Column::TenantId.eq(tenant_id))
                .filter(steps::Column::TransactionId.eq(id))
                .exec(&db_tx)
                .await?;
            transactions::Entity::delete_many()
                .filter(transactions::Column::TenantId.eq(tenant_id))
                .filter(transactions::Column::Id.eq(id))
                .exec(&db_tx)
                .await?;
            contact_values::Entity::delete_many()
                .filter(contact_values::Column::TenantId.eq(tenant_id))
                .filter(contact_values::Column::ValueId.eq(id))
                .exec(&db_tx)
                .await?;
            values::Entity::delete_many()
                .filter(values::Column::TenantId.eq(tenant_id))
                .filter(values::Column::Id.eq(id))
                .exec(&db_tx)
                .await?;
            tracing::info!(tenant_id, value_id = id, "value deleted");
            Ok(())
        })
    }

    /// Values a contact owns or shares through generic codes, in
    /// application order.
    pub async fn list_contact_values(
        &self,
        principal: &Principal,
        contact_id: &str,
    ) -> ResultEngine<Vec<Value>> {
        if !principal.can_act_for_contact(contact_id) {
            return Err(EngineError::Forbidden(format!(
                "cannot act for contact {contact_id}"
            )));
        }
        let tenant_id = principal.tenant_id.as_str();
        self.require_contact(&self.database, tenant_id, contact_id)
            .await?;

        let linked: Vec<String> = contact_values::Entity::find()
            .filter(contact_values::Column::TenantId.eq(tenant_id))
            .filter(contact_values::Column::ContactId.eq(contact_id))
            .all(&self.database)
            .await?
            .into_iter()
            .map(|link| link.value_id)
            .collect();
        let models = values::Entity::find()
            .filter(values::Column::TenantId.eq(tenant_id))
            .filter(
                Condition::any()
                    .add(values::Column::ContactId.eq(contact_id))
                    .add(values::Column::Id.is_in(linked)),
            )
            .all(&self.database)
            .await?;

        let mut out = models
            .into_iter()
            .map(Value::try_from)
            .collect::<ResultEngine<Vec<_>>>()?;
        sort_values(&mut out);
        Ok(out)
    }
}
