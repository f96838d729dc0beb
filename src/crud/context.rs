//! Per-call context threaded through the CRUD engine

use serde::{Deserialize, Serialize};

/// Whether the authorization gate applies to a call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Authorization {
    #[default]
    Enforced,
    /// System writes such as change log entries
    Bypassed,
}

/// Who is calling, and how.
///
/// A context is cheap to clone; cascades derive a nested copy with
/// [`CallContext::cascade`] rather than threading flags through every call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    pub user: String,
    pub session_id: Option<String>,
    /// Node serving the caller, recorded on locks
    pub node_id: String,
    pub authorization: Authorization,
    pub is_super_user: bool,
    /// Issued by a cascade on behalf of a parent record
    pub cascade: bool,
    /// Issued by a trigger handler inside an enclosing request
    pub triggering: bool,
}

impl CallContext {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Self::default()
        }
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn super_user(mut self, is_super_user: bool) -> Self {
        self.is_super_user = is_super_user;
        self
    }

    /// Copy for a nested request issued by a trigger handler
    pub fn nested(&self) -> Self {
        Self {
            triggering: true,
            ..self.clone()
        }
    }

    /// Copy for a cascaded child write
    pub fn cascade(&self) -> Self {
        Self {
            cascade: true,
            ..self.clone()
        }
    }

    /// Copy that skips the authorization gate
    pub fn bypassed(&self) -> Self {
        Self {
            authorization: Authorization::Bypassed,
            ..self.clone()
        }
    }

    /// Whether grants must be checked for this call
    pub fn checks_authorization(&self) -> bool {
        self.authorization == Authorization::Enforced && !self.is_super_user
    }

    /// Whether feather-level restrictions (child, read-only) apply
    pub fn is_privileged(&self) -> bool {
        self.is_super_user || self.authorization == Authorization::Bypassed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_contexts_keep_identity() {
        let ctx = CallContext::new("ann").session("s1").node("n1");
        let child = ctx.cascade();
        assert!(child.cascade);
        assert_eq!(child.user, "ann");
        assert_eq!(child.session_id.as_deref(), Some("s1"));
        assert!(!ctx.cascade);

        assert!(ctx.checks_authorization());
        assert!(!ctx.bypassed().checks_authorization());
        assert!(!ctx.clone().super_user(true).checks_authorization());
        assert!(ctx.nested().triggering);
    }
}
