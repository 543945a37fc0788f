use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use super::registry;
use super::types::{Actor, Proposal, ProposalState, WorkflowAction};
use crate::error::WorkflowError;
use crate::observability::workflow_metrics;
use crate::store::ProposalStore;

/// Actions only the proposal owner may take.
pub const OWNER_ONLY_ACTIONS: &[WorkflowAction] = &[
    WorkflowAction::Submit,
    WorkflowAction::Withdraw,
    WorkflowAction::Resubmit,
    WorkflowAction::Cancel,
    WorkflowAction::SubmitAcceptance,
];

/// Actions refused outright once a proposal is terminal.
pub const TERMINAL_BLOCKED_ACTIONS: &[WorkflowAction] = &[
    WorkflowAction::Approve,
    WorkflowAction::Return,
    WorkflowAction::Submit,
    WorkflowAction::Accept,
];

pub const MIN_RETURN_REASON_LEN: usize = 10;

/// Approves or rejects an attempted transition.
#[derive(Clone)]
pub struct WorkflowValidator {
    store: Arc<dyn ProposalStore>,
}

impl WorkflowValidator {
    pub fn new(store: Arc<dyn ProposalStore>) -> Self {
        Self { store }
    }

    /// Fetches the proposal and runs every check against it.
    ///
    /// Returns the proposal as read so the caller validates and commits the same snapshot.
    pub async fn validate(
        &self,
        proposal_id: &str,
        target: ProposalState,
        action: WorkflowAction,
        actor: &Actor,
    ) -> Result<Proposal, WorkflowError> {
        let proposal = self
            .store
            .find_proposal(proposal_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("Proposal", proposal_id))?;

        if let Err(err) = check_transition(&proposal, target, action, actor) {
            workflow_metrics().record_validation_rejection();
            debug!(
                proposal_id,
                from = %proposal.state,
                to = %target,
                action = %action,
                "Transition rejected: {}",
                err
            );
            return Err(err);
        }
        Ok(proposal)
    }
}

/// The synchronous part of validation, in check order.
pub fn check_transition(
    proposal: &Proposal,
    target: ProposalState,
    action: WorkflowAction,
    actor: &Actor,
) -> Result<(), WorkflowError> {
    let invalid = || WorkflowError::InvalidTransition {
        from: proposal.state,
        to: target,
        action,
    };

    if !registry::is_valid_transition(proposal.state, target, action) {
        return Err(invalid());
    }

    if let Some(roles) = registry::allowed_roles(proposal.state, target, action) {
        if !roles.contains(&actor.role) {
            return Err(WorkflowError::permission_denied(format!(
                "Role {} may not perform {} from {}",
                actor.role, action, proposal.state
            )));
        }
    }

    if OWNER_ONLY_ACTIONS.contains(&action) && proposal.owner_id != actor.user_id {
        return Err(WorkflowError::permission_denied(format!(
            "Only the proposal owner may perform {action}"
        )));
    }

    if TERMINAL_BLOCKED_ACTIONS.contains(&action) && registry::is_terminal(proposal.state) {
        return Err(invalid());
    }

    Ok(())
}

/// A return must say why, in at least a sentence.
pub fn validate_return_reason(reason: &str) -> Result<(), WorkflowError> {
    let trimmed = reason.trim();
    if trimmed.is_empty() {
        return Err(WorkflowError::validation("A return reason is required"));
    }
    if trimmed.chars().count() < MIN_RETURN_REASON_LEN {
        return Err(WorkflowError::validation(format!(
            "Return reason must be at least {MIN_RETURN_REASON_LEN} characters"
        )));
    }
    Ok(())
}

pub fn validate_revision_sections(sections: &[String], required: bool) -> Result<(), WorkflowError> {
    if required && sections.is_empty() {
        return Err(WorkflowError::validation(
            "At least one section must be marked for revision",
        ));
    }
    if sections.iter().any(|s| s.trim().is_empty()) {
        return Err(WorkflowError::validation("Revision section ids must not be blank"));
    }
    Ok(())
}

/// Sections marked as revised must all have been requested by the return.
pub fn validate_revised_sections(requested: &[String], revised: &[String]) -> Result<(), WorkflowError> {
    let unexpected: Vec<&str> = revised
        .iter()
        .filter(|section| !requested.contains(section))
        .map(String::as_str)
        .collect();
    if !unexpected.is_empty() {
        return Err(WorkflowError::validation(format!(
            "Sections were not requested for revision: {}",
            unexpected.join(", ")
        )));
    }
    Ok(())
}

pub fn validate_pause_request(
    reason: &str,
    expected_resume_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(), WorkflowError> {
    if reason.trim().is_empty() {
        return Err(WorkflowError::validation("A pause reason is required"));
    }
    if let Some(resume_at) = expected_resume_at {
        if resume_at <= now {
            return Err(WorkflowError::validation(
                "Expected resume date must be in the future",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::workflow::types::Role;
    use chrono::Duration;

    fn proposal(state: ProposalState) -> Proposal {
        let mut p = Proposal::draft("p1", "DT-1", "Title", "owner", "F1", Utc::now());
        p.state = state;
        p
    }

    #[test]
    fn missing_proposal_is_not_found() {
        let validator = WorkflowValidator::new(Arc::new(MemoryStore::new()));
        tokio_test::block_on(async {
            let err = validator
                .validate(
                    "nope",
                    ProposalState::FacultyReview,
                    WorkflowAction::Submit,
                    &Actor::new("owner", Role::GiangVien),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, WorkflowError::NotFound { .. }));
        });
    }

    #[tokio::test]
    async fn valid_submit_returns_the_snapshot() {
        let store = Arc::new(MemoryStore::new());
        store.insert_proposal(&proposal(ProposalState::Draft)).await.unwrap();
        let validator = WorkflowValidator::new(store);

        let snapshot = validator
            .validate(
                "p1",
                ProposalState::FacultyReview,
                WorkflowAction::Submit,
                &Actor::new("owner", Role::GiangVien),
            )
            .await
            .unwrap();
        assert_eq!(snapshot.state, ProposalState::Draft);
    }

    #[test]
    fn unknown_edge_is_invalid() {
        let err = check_transition(
            &proposal(ProposalState::Draft),
            ProposalState::Approved,
            WorkflowAction::Approve,
            &Actor::new("x", Role::Admin),
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
    }

    #[test]
    fn wrong_role_is_denied() {
        let err = check_transition(
            &proposal(ProposalState::FacultyReview),
            ProposalState::SchoolSelectionReview,
            WorkflowAction::Approve,
            &Actor::new("owner", Role::GiangVien),
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::PermissionDenied { .. }));
    }

    #[test]
    fn non_owner_cannot_submit() {
        let err = check_transition(
            &proposal(ProposalState::Draft),
            ProposalState::FacultyReview,
            WorkflowAction::Submit,
            &Actor::new("someone-else", Role::GiangVien),
        )
        .unwrap_err();
        assert!(matches!(err, WorkflowError::PermissionDenied { .. }));
    }

    #[test]
    fn terminal_states_reject_every_action() {
        for &state in registry::TERMINAL_STATES {
            for &action in WorkflowAction::ALL {
                for &target in ProposalState::ALL {
                    let result = check_transition(
                        &proposal(state),
                        target,
                        action,
                        &Actor::new("owner", Role::Admin),
                    );
                    assert!(
                        matches!(result, Err(WorkflowError::InvalidTransition { .. })),
                        "{state} {action} {target}"
                    );
                }
            }
        }
    }

    #[test]
    fn return_reason_rules() {
        assert!(validate_return_reason("   ").is_err());
        assert!(validate_return_reason("too short").is_err());
        assert!(validate_return_reason("Budget table is missing").is_ok());
    }

    #[test]
    fn revision_section_rules() {
        let requested = vec!["SEC_BUDGET".to_string(), "SEC_METHOD".to_string()];
        assert!(validate_revision_sections(&[], true).is_err());
        assert!(validate_revision_sections(&[], false).is_ok());
        assert!(validate_revision_sections(&[" ".to_string()], false).is_err());
        assert!(validate_revised_sections(&requested, &["SEC_BUDGET".to_string()]).is_ok());
        assert!(validate_revised_sections(&requested, &["SEC_TEAM".to_string()]).is_err());
    }

    #[test]
    fn pause_request_rules() {
        let now = Utc::now();
        assert!(validate_pause_request("", None, now).is_err());
        assert!(validate_pause_request("Funding review", Some(now - Duration::days(1)), now).is_err());
        assert!(validate_pause_request("Funding review", Some(now + Duration::days(7)), now).is_ok());
    }
}
