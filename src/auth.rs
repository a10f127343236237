//! Dispensing authorization.
//!
//! Every mutating entry point runs [`authorize`] first: the actor must hold
//! the Barman role and have a positive dispenser server number. A failure
//! here happens before any catalog lookup, gateway call or ledger write.

use serde::{Deserialize, Serialize};

use crate::error::AuthError;
use crate::ledger::LedgerActor;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Staff roles known to the dispenser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// May send and reverse dispenser credits.
    Barman,
    Cashier,
    Manager,
}

/// Employee record as provided by staff management.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmployeeProfile {
    pub employee_ref: String,
    pub name: String,
    /// Dispenser channel; zero or absent means unassigned.
    pub server_no: Option<u32>,
    pub is_barman: bool,
}

/// The acting user of an entry point, passed explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorContext {
    pub user_ref: String,
    pub user_name: String,
    pub employee_ref: Option<String>,
    pub roles: Vec<Role>,
    pub server_no: Option<u32>,
}

impl ActorContext {
    pub fn new(user_ref: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_ref: user_ref.into(),
            user_name: user_name.into(),
            employee_ref: None,
            roles: Vec::new(),
            server_no: None,
        }
    }

    /// Shorthand for a barman operating channel `server_no`.
    pub fn barman(user_ref: impl Into<String>, server_no: u32) -> Self {
        let user_ref = user_ref.into();
        Self {
            user_name: user_ref.clone(),
            user_ref,
            employee_ref: None,
            roles: vec![Role::Barman],
            server_no: Some(server_no),
        }
    }

    /// Build the actor for a user linked to an employee. An employee with a
    /// positive server number is a barman even without the explicit flag.
    pub fn from_employee(user_ref: impl Into<String>, employee: &EmployeeProfile) -> Self {
        let server_no = employee.server_no.filter(|n| *n > 0);
        let mut roles = Vec::new();
        if employee.is_barman || server_no.is_some() {
            roles.push(Role::Barman);
        }
        Self {
            user_ref: user_ref.into(),
            user_name: employee.name.clone(),
            employee_ref: Some(employee.employee_ref.clone()).filter(|e| !e.is_empty()),
            roles,
            server_no,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        if !self.roles.contains(&role) {
            self.roles.push(role);
        }
        self
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Identity stored on ledger records written on this actor's behalf.
    pub fn ledger_actor(&self) -> LedgerActor {
        LedgerActor {
            user_ref: self.user_ref.clone(),
            employee_ref: self.employee_ref.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

pub fn ensure_can_dispense(actor: &ActorContext) -> Result<(), AuthError> {
    if actor.has_role(Role::Barman) {
        Ok(())
    } else {
        Err(AuthError::Forbidden {
            user: actor.user_ref.clone(),
        })
    }
}

/// Device identity of the actor. Requires the Barman role.
pub fn resolve_server_no(actor: &ActorContext) -> Result<u32, AuthError> {
    ensure_can_dispense(actor)?;
    actor
        .server_no
        .filter(|n| *n > 0)
        .ok_or_else(|| AuthError::MissingServerAssignment {
            user: actor.user_ref.clone(),
        })
}

/// Role check plus server number, the precondition of every credit operation.
pub fn authorize(actor: &ActorContext) -> Result<u32, AuthError> {
    resolve_server_no(actor)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barman_with_server_no() {
        let actor = ActorContext::barman("u1", 3);
        assert!(ensure_can_dispense(&actor).is_ok());
        assert_eq!(authorize(&actor), Ok(3));
    }

    #[test]
    fn test_non_barman_is_forbidden() {
        let actor = ActorContext::new("u2", "Cashier").with_role(Role::Cashier);
        assert_eq!(
            authorize(&actor),
            Err(AuthError::Forbidden { user: "u2".into() })
        );
    }

    #[test]
    fn test_barman_without_server_no() {
        let mut actor = ActorContext::new("u3", "New hire").with_role(Role::Barman);
        assert_eq!(
            resolve_server_no(&actor),
            Err(AuthError::MissingServerAssignment { user: "u3".into() })
        );
        actor.server_no = Some(0);
        assert!(matches!(
            resolve_server_no(&actor),
            Err(AuthError::MissingServerAssignment { .. })
        ));
    }

    #[test]
    fn test_from_employee_server_no_implies_barman() {
        let employee = EmployeeProfile {
            employee_ref: "emp-7".into(),
            name: "Sam".into(),
            server_no: Some(4),
            is_barman: false,
        };
        let actor = ActorContext::from_employee("u7", &employee);
        assert!(actor.has_role(Role::Barman));
        assert_eq!(actor.employee_ref.as_deref(), Some("emp-7"));
        assert_eq!(authorize(&actor), Ok(4));

        let unassigned = EmployeeProfile {
            server_no: Some(0),
            ..employee.clone()
        };
        let actor = ActorContext::from_employee("u7", &unassigned);
        assert!(!actor.has_role(Role::Barman));

        let flagged = EmployeeProfile {
            server_no: None,
            is_barman: true,
            ..employee
        };
        let actor = ActorContext::from_employee("u7", &flagged);
        assert!(matches!(
            authorize(&actor),
            Err(AuthError::MissingServerAssignment { .. })
        ));
    }
}
