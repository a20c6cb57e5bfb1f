//! Permission module (external collaborator, spec §6): consulted in Phase 2
//! for every SUBMIT before a job is admitted.
//!
//! The real authorization backend (roles, ACLs, an external service call)
//! is out of scope for the core scheduler — spec §1 excludes "permission
//! evaluation" itself — but the *contract* Phase 2 calls through is part of
//! the core, so it's modeled as a trait the same way `StateMachine` is:
//! a build-time collaborator, not a runtime plugin.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionError {
    Denied,
}

impl std::fmt::Display for PermissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "permission denied")
    }
}

/// `can(action, requester, resource, kind) -> void|raises PermissionError`.
pub trait PermissionChecker: Send + Sync {
    fn can(&self, action: &str, requester: &str, resource: &str, mode: crate::model::Mode) -> Result<(), PermissionError>;
}

/// Default collaborator: every request is authorized. Swapped out by
/// deployments that need real enforcement; the scheduler core only depends
/// on the trait.
pub struct AllowAll;

impl PermissionChecker for AllowAll {
    fn can(&self, _action: &str, _requester: &str, _resource: &str, _mode: crate::model::Mode) -> Result<(), PermissionError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Mode;

    struct DenyAll;
    impl PermissionChecker for DenyAll {
        fn can(&self, _action: &str, _requester: &str, _resource: &str, _mode: Mode) -> Result<(), PermissionError> {
            Err(PermissionError::Denied)
        }
    }

    #[test]
    fn allow_all_never_denies() {
        assert!(AllowAll.can("submit", "alice", "sys1", Mode::Exclusive).is_ok());
    }

    #[test]
    fn deny_all_always_denies() {
        assert!(DenyAll.can("submit", "alice", "sys1", Mode::Shared).is_err());
    }
}
