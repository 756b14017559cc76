//! Caller identity as handed over by the auth layer.

use serde::{Deserialize, Serialize};

use crate::{EngineError, ResultEngine};

/// Scope required to void a transaction on someone else's behalf.
pub const SCOPE_TRANSACTIONS_VOID: &str = "transactions:void";

/// An authenticated caller.
///
/// Badge issuance and scope checks for user requests happen before the engine
/// is invoked. A principal with `contact_id` set is contact-scoped: it can
/// only reach its own contact and the Values it owns, plus generic codes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub tenant_id: String,
    pub user_id: String,
    pub contact_id: Option<String>,
    pub scopes: Vec<String>,
}

impl Principal {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            contact_id: None,
            scopes: Vec::new(),
        }
    }

    /// Internal identity with exactly the given scopes.
    pub fn service(tenant_id: impl Into<String>, scopes: &[&str]) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: "service:sweeper".to_string(),
            contact_id: None,
            scopes: scopes.iter().map(ToString::to_string).collect(),
        }
    }

    #[must_use]
    pub fn contact(mut self, contact_id: impl Into<String>) -> Self {
        self.contact_id = Some(contact_id.into());
        self
    }

    #[must_use]
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.push(scope.into());
        self
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    pub fn require_scope(&self, scope: &str) -> ResultEngine<()> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(EngineError::Forbidden(format!("missing scope {scope}")))
        }
    }

    /// `false` when a contact-scoped principal asks for another contact.
    pub fn can_act_for_contact(&self, contact_id: &str) -> bool {
        self.contact_id.as_deref().is_none_or(|own| own == contact_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_principal_carries_only_its_scopes() {
        let p = Principal::service("t1", &[SCOPE_TRANSACTIONS_VOID]);
        assert!(p.require_scope(SCOPE_TRANSACTIONS_VOID).is_ok());
        assert!(matches!(
            p.require_scope("values:write"),
            Err(EngineError::Forbidden(_))
        ));
    }

    #[test]
    fn contact_scoping() {
        let p = Principal::new("t1", "u1").contact("c1");
        assert!(p.can_act_for_contact("c1"));
        assert!(!p.can_act_for_contact("c2"));
        assert!(Principal::new("t1", "u1").can_act_for_contact("c2"));
    }
}
