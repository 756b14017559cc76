//! Party resolution: request parties to Value snapshots.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, QueryFilter, prelude::*};

use crate::{
    EngineError, ResultEngine,
    auth::Principal,
    codes::normalize_code,
    commands::{LightrailParty, Party, PartyTarget},
    contact_values,
    eligibility::{EligibilityCheck, is_eligible},
    planner::ResolvedParty,
    values::{self, Value},
};

use super::Engine;

/// Filters applied to Values found through a contact.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    pub include_zero_balance: bool,
    pub include_zero_uses_remaining: bool,
}

/// Order in which Values are applied: pretax first, then discounts, then
/// by ownership, soonest expiry (open-ended last), oldest, and finally id.
pub(crate) fn sort_values(values: &mut [Value]) {
    values.sort_by(|a, b| {
        (!a.pretax)
            .cmp(&!b.pretax)
            .then((!a.discount).cmp(&!b.discount))
            .then(a.ownership().cmp(&b.ownership()))
            .then((a.end_date.is_none(), a.end_date).cmp(&(b.end_date.is_none(), b.end_date)))
            .then(a.created_date.cmp(&b.created_date))
            .then(a.id.cmp(&b.id))
    });
}

/// Contact-scoped principals only see their own Values and generic codes.
fn visible_to(principal: &Principal, value: &Value) -> bool {
    match principal.contact_id.as_deref() {
        None => true,
        Some(own) => value.is_generic_code || value.contact_id.as_deref() == Some(own),
    }
}

impl Engine {
    pub(crate) async fn find_value<C: ConnectionTrait>(
        &self,
        conn: &C,
        tenant_id: &str,
        value_id: &str,
    ) -> ResultEngine<Option<Value>> {
        values::Entity::find_by_id((tenant_id.to_string(), value_id.to_string()))
            .one(conn)
            .await?
            .map(Value::try_from)
            .transpose()
    }

    async fn find_value_by_code<C: ConnectionTrait>(
        &self,
        conn: &C,
        tenant_id: &str,
        code: &str,
    ) -> ResultEngine<Option<Value>> {
        let hashed = self.code_hasher.hash(&normalize_code(code)?)?;
        values::Entity::find()
            .filter(values::Column::TenantId.eq(tenant_id.to_string()))
            .filter(values::Column::CodeHashed.eq(hashed))
            .one(conn)
            .await?
            .map(Value::try_from)
            .transpose()
    }

    /// Resolves a party that must name exactly one Value.
    pub(crate) async fn resolve_value<C: ConnectionTrait>(
        &self,
        conn: &C,
        principal: &Principal,
        party: &LightrailParty,
    ) -> ResultEngine<Value> {
        let (value, label) = match party.target()? {
            PartyTarget::ValueId(id) => (
                self.find_value(conn, &principal.tenant_id, id).await?,
                id.to_string(),
            ),
            PartyTarget::Code(code) => (
                self.find_value_by_code(conn, &principal.tenant_id, code)
                    .await?,
                "by code".to_string(),
            ),
            PartyTarget::Contact(_) => {
                return Err(EngineError::InvalidRequest(
                    "a contact can only be used as a checkout source".to_string(),
                ));
            }
        };
        value
            .filter(|value| visible_to(principal, value))
            .ok_or(EngineError::ValueNotFound(label))
    }

    /// Every Value a contact can spend: the ones it owns and the generic
    /// codes linked to it, keeping only those usable right now.
    async fn resolve_contact<C: ConnectionTrait>(
        &self,
        conn: &C,
        principal: &Principal,
        contact_id: &str,
        currency: &str,
        now: DateTime<Utc>,
        options: ResolveOptions,
    ) -> ResultEngine<Vec<Value>> {
        if !principal.can_act_for_contact(contact_id) {
            return Err(EngineError::Forbidden(format!(
                "cannot act for contact {contact_id}"
            )));
        }
        let tenant_id = principal.tenant_id.clone();
        self.require_contact(conn, &tenant_id, contact_id).await?;

        let mut models = values::Entity::find()
            .filter(values::Column::TenantId.eq(tenant_id.clone()))
            .filter(values::Column::ContactId.eq(contact_id.to_string()))
            .all(conn)
            .await?;

        let linked: Vec<String> = contact_values::Entity::find()
            .filter(contact_values::Column::TenantId.eq(tenant_id.clone()))
            .filter(contact_values::Column::ContactId.eq(contact_id.to_string()))
            .all(conn)
            .await?
            .into_iter()
            .map(|link| link.value_id)
            .collect();
        if !linked.is_empty() {
            models.extend(
                values::Entity::find()
                    .filter(values::Column::TenantId.eq(tenant_id))
                    .filter(values::Column::Id.is_in(linked))
                    .all(conn)
                    .await?,
            );
        }

        let state = EligibilityCheck::state(now, currency, self.config.eligibility);
        let mut out = Vec::with_capacity(models.len());
        for model in models {
            let value = Value::try_from(model)?;
            if is_eligible(&value, &state).is_err() {
                continue;
            }
            if !options.include_zero_balance && value.balance == Some(0) {
                continue;
            }
            if !options.include_zero_uses_remaining && value.uses_remaining == Some(0) {
                continue;
            }
            out.push(value);
        }
        Ok(out)
    }

    /// Resolves request parties to snapshots.
    ///
    /// Lightrail Values come first, deduplicated by id (first occurrence
    /// kept) and in application order; card and internal parties follow in
    /// request order. Values named by id or code are returned whatever their
    /// state, the planner decides what to do with them.
    pub async fn resolve_parties(
        &self,
        principal: &Principal,
        parties: &[Party],
        currency: &str,
        options: ResolveOptions,
    ) -> ResultEngine<Vec<ResolvedParty>> {
        let now = self.clock.now();
        let mut seen = HashSet::new();
        let mut values = Vec::new();
        let mut others = Vec::new();

        for party in parties {
            match party {
                Party::Lightrail(party) => {
                    let found = match party.target()? {
                        PartyTarget::Contact(contact_id) => {
                            self.resolve_contact(
                                &self.database,
                                principal,
                                contact_id,
                                currency,
                                now,
                                options,
                            )
                            .await?
                        }
                        _ => vec![self.resolve_value(&self.database, principal, party).await?],
                    };
                    for value in found {
                        if seen.insert(value.id.clone()) {
                            values.push(value);
                        }
                    }
                }
                Party::Stripe(card) => others.push(ResolvedParty::Stripe(card.clone())),
                Party::Internal(internal) => {
                    others.push(ResolvedParty::Internal(internal.clone()));
                }
            }
        }

        sort_values(&mut values);
        tracing::debug!(
            values = values.len(),
            others = others.len(),
            "resolved transaction parties"
        );
        Ok(values
            .into_iter()
            .map(ResolvedParty::Lightrail)
            .chain(others)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::values::tests::value;

    #[test]
    fn values_sort_by_application_order() {
        let mut plain = value("plain", Some(10));
        plain.end_date = Some(Utc.timestamp_opt(1_900_000_000, 0).unwrap());
        let open_ended = value("open", Some(10));
        let mut pretax = value("pretax", Some(10));
        pretax.pretax = true;
        let mut discount = value("discount", Some(10));
        discount.discount = true;
        let mut generic = value("generic", Some(10));
        generic.is_generic_code = true;
        let mut claimed = value("claimed", Some(10));
        claimed.attached_from_value_id = Some("generic".to_string());

        let mut values = vec![
            generic,
            open_ended,
            claimed,
            plain,
            discount,
            pretax,
        ];
        sort_values(&mut values);
        let ids: Vec<_> = values.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(
            ids,
            ["pretax", "discount", "plain", "open", "claimed", "generic"]
        );
    }

    #[test]
    fn contact_principals_see_own_and_generic_values() {
        let principal = Principal::new("t1", "u1").contact("c1");
        let mut own = value("own", Some(1));
        own.contact_id = Some("c1".to_string());
        let mut other = value("other", Some(1));
        other.contact_id = Some("c2".to_string());
        let mut generic = value("generic", Some(1));
        generic.is_generic_code = true;

        assert!(visible_to(&principal, &own));
        assert!(!visible_to(&principal, &other));
        assert!(visible_to(&principal, &generic));
        assert!(visible_to(&Principal::new("t1", "u1"), &other));
    }
}
