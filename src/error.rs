use thiserror::Error;

use crate::workflow::types::{ProposalState, WorkflowAction};

/// Errors surfaced by every workflow operation.
///
/// Cloneable so one failure can be handed to every caller waiting on the
/// same in-flight idempotency key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid transition: {from} -> {to} via {action}")]
    InvalidTransition {
        from: ProposalState,
        to: ProposalState,
        action: WorkflowAction,
    },

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("Validation failed: {reason}")]
    Validation { reason: String },

    #[error("Write conflict after {attempts} attempt(s): {message}")]
    TransientConflict { attempts: u32, message: String },

    #[error("Proposal {proposal_id} was modified concurrently")]
    ConcurrentModification { proposal_id: String },

    #[error("Proposal {proposal_id} is paused but has no recorded pre-pause state")]
    MissingPrePauseState { proposal_id: String },

    #[error("In-flight operation for key {key} was abandoned before completing")]
    InFlightAbandoned { key: String },

    #[error("Store error: {message}")]
    Store { message: String },
}

impl WorkflowError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn permission_denied(reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            reason: reason.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Only serialization failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientConflict { .. })
    }
}

/// Errors raised by store backends.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("serialization conflict: {0}")]
    Conflict(String),

    #[error("proposal {proposal_id} is no longer in state {expected}")]
    StaleState {
        proposal_id: String,
        expected: ProposalState,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{0}")]
    Backend(String),
}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(message) => WorkflowError::TransientConflict {
                attempts: 1,
                message,
            },
            StoreError::StaleState { proposal_id, .. } => {
                WorkflowError::ConcurrentModification { proposal_id }
            }
            StoreError::NotFound { entity, id } => WorkflowError::NotFound { entity, id },
            StoreError::Backend(message) => WorkflowError::Store { message },
        }
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            // SQLite BUSY / LOCKED (incl. extended codes) and PostgreSQL
            // serialization_failure / deadlock_detected.
            let code = db_err.code();
            let transient = matches!(
                code.as_deref(),
                Some("5") | Some("6") | Some("261") | Some("517") | Some("40001") | Some("40P01")
            ) || db_err.message().contains("database is locked");
            if transient {
                return StoreError::Conflict(db_err.message().to_string());
            }
        }
        StoreError::Backend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_are_transient() {
        let conflict: WorkflowError = StoreError::Conflict("busy".into()).into();
        assert!(conflict.is_transient());

        let stale: WorkflowError = StoreError::StaleState {
            proposal_id: "p1".into(),
            expected: ProposalState::Draft,
        }
        .into();
        assert!(!stale.is_transient());
        assert!(matches!(stale, WorkflowError::ConcurrentModification { .. }));

        assert!(!WorkflowError::validation("short").is_transient());
        assert!(!WorkflowError::not_found("Proposal", "p1").is_transient());
    }

    #[test]
    fn display_names_the_edge() {
        let err = WorkflowError::InvalidTransition {
            from: ProposalState::Draft,
            to: ProposalState::Approved,
            action: WorkflowAction::Approve,
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition: DRAFT -> APPROVED via APPROVE"
        );
    }
}
