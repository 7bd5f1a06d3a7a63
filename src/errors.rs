//! Typed error hierarchy for Mission Control.
//!
//! Store functions return `anyhow::Result` and raise a [`ControlError`]
//! wherever the caller needs to tell failures apart (missing entity vs.
//! dangling reference vs. infrastructure). The HTTP layer downcasts to pick
//! a status code. Gateway failures have their own enum in
//! `control::gateway`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Task {id} not found")]
    TaskNotFound { id: String },

    #[error("Agent {id} not found")]
    AgentNotFound { id: String },

    #[error("Conversation {id} not found")]
    ConversationNotFound { id: String },

    #[error("Workspace {id} not found")]
    WorkspaceNotFound { id: String },

    #[error("Gateway {id} not found")]
    GatewayNotFound { id: String },

    #[error("War room run {id} not found")]
    RunNotFound { id: String },

    /// A request referenced another entity that does not exist.
    #[error("Unknown {kind} '{id}'")]
    UnknownReference { kind: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid task status '{0}'")]
    InvalidStatus(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl ControlError {
    /// True for the "primary entity is missing" family.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::TaskNotFound { .. }
                | Self::AgentNotFound { .. }
                | Self::ConversationNotFound { .. }
                | Self::WorkspaceNotFound { .. }
                | Self::GatewayNotFound { .. }
                | Self::RunNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_not_found_carries_id() {
        let err = ControlError::TaskNotFound { id: "t-42".into() };
        assert!(err.to_string().contains("t-42"));
        assert!(err.is_not_found());
    }

    #[test]
    fn unknown_reference_is_not_a_not_found() {
        let err = ControlError::UnknownReference {
            kind: "agent",
            id: "a1".into(),
        };
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "Unknown agent 'a1'");
    }

    #[test]
    fn control_error_survives_anyhow_roundtrip() {
        let err: anyhow::Error = ControlError::RunNotFound { id: "r1".into() }.into();
        let back = err.downcast_ref::<ControlError>().expect("downcast");
        assert!(matches!(back, ControlError::RunNotFound { .. }));
    }

    #[test]
    fn lock_poisoned_is_matchable() {
        let err = ControlError::LockPoisoned;
        assert!(matches!(err, ControlError::LockPoisoned));
    }

    #[test]
    fn implements_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ControlError::Config("PORT".into()));
    }
}
