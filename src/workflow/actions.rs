//! Named workflow actions.
//!
//! Each method fixes the edge, SLA policy and holder rule for one step of the
//! proposal lifecycle and hands off to the [`TransitionExecutor`].

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;

use super::executor::{
    PauseRequest, ReturnRequest, ResubmitRequest, SlaPolicy, TransitionExecutor, TransitionOptions,
};
use super::holder::HolderAssignment;
use super::types::{
    Idempotent, ProposalState, RejectReasonCode, ReturnReasonCode, TransitionContext,
    TransitionOutcome, WorkflowAction,
};
use crate::error::WorkflowError;

type ActionResult = Result<Idempotent<TransitionOutcome>, WorkflowError>;

/// Why a proposal is being sent back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnDetails {
    pub reason: String,
    pub reason_code: Option<ReturnReasonCode>,
    pub revision_sections: Vec<String>,
}

impl ReturnDetails {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            reason_code: None,
            revision_sections: Vec::new(),
        }
    }

    pub fn with_code(mut self, code: ReturnReasonCode) -> Self {
        self.reason_code = Some(code);
        self
    }

    pub fn with_sections<I, S>(mut self, sections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.revision_sections = sections.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Clone)]
pub struct WorkflowActions {
    executor: Arc<TransitionExecutor>,
}

impl WorkflowActions {
    pub fn new(executor: Arc<TransitionExecutor>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &TransitionExecutor {
        &self.executor
    }

    fn window(&self) -> SlaPolicy {
        self.executor.sla_settings().window()
    }

    async fn step(
        &self,
        proposal_id: &str,
        target: ProposalState,
        action: WorkflowAction,
        ctx: &TransitionContext,
        options: TransitionOptions,
    ) -> ActionResult {
        self.executor
            .execute_transition(proposal_id, target, action, ctx, options)
            .await
    }

    async fn send_back(
        &self,
        proposal_id: &str,
        ctx: &TransitionContext,
        return_target_state: ProposalState,
        return_target_holder_unit: Option<String>,
        details: ReturnDetails,
    ) -> ActionResult {
        let request = ReturnRequest {
            return_target_state,
            return_target_holder_unit,
            reason: details.reason,
            reason_code: details.reason_code,
            revision_sections: details.revision_sections,
        };
        self.executor.execute_return(proposal_id, ctx, request).await
    }

    /// Draft to faculty review, starting the faculty's review window.
    pub async fn submit(&self, proposal_id: &str, ctx: &TransitionContext) -> ActionResult {
        let options = TransitionOptions::default().with_sla(self.window());
        self.step(
            proposal_id,
            ProposalState::FacultyReview,
            WorkflowAction::Submit,
            ctx,
            options,
        )
        .await
    }

    pub async fn approve_faculty(&self, proposal_id: &str, ctx: &TransitionContext) -> ActionResult {
        let options = TransitionOptions::default().with_sla(self.window());
        self.step(
            proposal_id,
            ProposalState::SchoolSelectionReview,
            WorkflowAction::Approve,
            ctx,
            options,
        )
        .await
    }

    pub async fn return_faculty(
        &self,
        proposal_id: &str,
        ctx: &TransitionContext,
        details: ReturnDetails,
    ) -> ActionResult {
        let proposal = self.executor.find_proposal(proposal_id).await?;
        let unit = Some(proposal.faculty_id);
        self.send_back(proposal_id, ctx, ProposalState::FacultyReview, unit, details)
            .await
    }

    /// Back from changes requested to the stage that returned the proposal.
    pub async fn resubmit(
        &self,
        proposal_id: &str,
        ctx: &TransitionContext,
        request: ResubmitRequest,
    ) -> ActionResult {
        self.executor.execute_resubmit(proposal_id, ctx, request).await
    }

    /// Hands the proposal to a council and its secretary.
    pub async fn assign_council(
        &self,
        proposal_id: &str,
        ctx: &TransitionContext,
        council_id: &str,
        secretary_id: Option<&str>,
    ) -> ActionResult {
        let options = TransitionOptions::default()
            .with_sla(self.window())
            .with_holder(HolderAssignment::new(
                Some(council_id.to_string()),
                secretary_id.map(str::to_string),
            ))
            .with_metadata(json!({
                "councilId": council_id,
                "secretaryId": secretary_id,
            }));
        self.step(
            proposal_id,
            ProposalState::OutlineCouncilReview,
            WorkflowAction::AssignCouncil,
            ctx,
            options,
        )
        .await
    }

    pub async fn approve_council(&self, proposal_id: &str, ctx: &TransitionContext) -> ActionResult {
        self.step(
            proposal_id,
            ProposalState::Approved,
            WorkflowAction::Approve,
            ctx,
            TransitionOptions::default(),
        )
        .await
    }

    pub async fn return_council(
        &self,
        proposal_id: &str,
        ctx: &TransitionContext,
        details: ReturnDetails,
    ) -> ActionResult {
        let proposal = self.executor.find_proposal(proposal_id).await?;
        self.send_back(
            proposal_id,
            ctx,
            ProposalState::OutlineCouncilReview,
            proposal.holder_unit,
            details,
        )
        .await
    }

    pub async fn start_project(&self, proposal_id: &str, ctx: &TransitionContext) -> ActionResult {
        self.step(
            proposal_id,
            ProposalState::InProgress,
            WorkflowAction::StartProject,
            ctx,
            TransitionOptions::default(),
        )
        .await
    }

    pub async fn submit_acceptance(&self, proposal_id: &str, ctx: &TransitionContext) -> ActionResult {
        let options = TransitionOptions::default().with_sla(self.window());
        self.step(
            proposal_id,
            ProposalState::FacultyAcceptanceReview,
            WorkflowAction::SubmitAcceptance,
            ctx,
            options,
        )
        .await
    }

    pub async fn accept_faculty(&self, proposal_id: &str, ctx: &TransitionContext) -> ActionResult {
        let options = TransitionOptions::default().with_sla(self.window());
        self.step(
            proposal_id,
            ProposalState::SchoolAcceptanceReview,
            WorkflowAction::FacultyAccept,
            ctx,
            options,
        )
        .await
    }

    pub async fn return_faculty_acceptance(
        &self,
        proposal_id: &str,
        ctx: &TransitionContext,
        details: ReturnDetails,
    ) -> ActionResult {
        let proposal = self.executor.find_proposal(proposal_id).await?;
        let unit = Some(proposal.faculty_id);
        self.send_back(
            proposal_id,
            ctx,
            ProposalState::FacultyAcceptanceReview,
            unit,
            details,
        )
        .await
    }

    /// School acceptance; handover is coordinated by the central office.
    pub async fn accept_school(&self, proposal_id: &str, ctx: &TransitionContext) -> ActionResult {
        let office = self.executor.resolver().central_office_unit().to_string();
        let options = TransitionOptions::default().with_holder(HolderAssignment::unit(office));
        self.step(
            proposal_id,
            ProposalState::Handover,
            WorkflowAction::Accept,
            ctx,
            options,
        )
        .await
    }

    pub async fn return_school(
        &self,
        proposal_id: &str,
        ctx: &TransitionContext,
        details: ReturnDetails,
    ) -> ActionResult {
        let office = self.executor.resolver().central_office_unit().to_string();
        self.send_back(
            proposal_id,
            ctx,
            ProposalState::SchoolAcceptanceReview,
            Some(office),
            details,
        )
        .await
    }

    pub async fn complete_handover(&self, proposal_id: &str, ctx: &TransitionContext) -> ActionResult {
        self.step(
            proposal_id,
            ProposalState::Completed,
            WorkflowAction::HandoverComplete,
            ctx,
            TransitionOptions::default(),
        )
        .await
    }

    pub async fn finalize(&self, proposal_id: &str, ctx: &TransitionContext) -> ActionResult {
        self.step(
            proposal_id,
            ProposalState::Completed,
            WorkflowAction::Finalize,
            ctx,
            TransitionOptions::default(),
        )
        .await
    }

    pub async fn cancel(
        &self,
        proposal_id: &str,
        ctx: &TransitionContext,
        reason: Option<&str>,
    ) -> ActionResult {
        self.step(
            proposal_id,
            ProposalState::Cancelled,
            WorkflowAction::Cancel,
            ctx,
            with_optional_comment(reason),
        )
        .await
    }

    pub async fn withdraw(
        &self,
        proposal_id: &str,
        ctx: &TransitionContext,
        reason: Option<&str>,
    ) -> ActionResult {
        self.step(
            proposal_id,
            ProposalState::Withdrawn,
            WorkflowAction::Withdraw,
            ctx,
            with_optional_comment(reason),
        )
        .await
    }

    /// Terminal rejection. The rejecting actor's unit holds the proposal.
    pub async fn reject(
        &self,
        proposal_id: &str,
        ctx: &TransitionContext,
        reason_code: RejectReasonCode,
        comment: &str,
    ) -> ActionResult {
        if comment.trim().is_empty() {
            return Err(WorkflowError::validation("A rejection comment is required"));
        }
        let options = TransitionOptions::default()
            .with_reason_code(reason_code.as_str())
            .with_comment(comment);
        self.step(
            proposal_id,
            ProposalState::Rejected,
            WorkflowAction::Reject,
            ctx,
            options,
        )
        .await
    }

    pub async fn pause(
        &self,
        proposal_id: &str,
        ctx: &TransitionContext,
        reason: &str,
        expected_resume_at: Option<DateTime<Utc>>,
    ) -> ActionResult {
        let request = PauseRequest {
            reason: reason.to_string(),
            expected_resume_at,
        };
        self.executor.execute_pause(proposal_id, ctx, request).await
    }

    pub async fn resume(
        &self,
        proposal_id: &str,
        ctx: &TransitionContext,
        comment: Option<&str>,
    ) -> ActionResult {
        self.executor
            .execute_resume(proposal_id, ctx, comment.map(str::to_string))
            .await
    }
}

fn with_optional_comment(reason: Option<&str>) -> TransitionOptions {
    match reason.map(str::trim).filter(|r| !r.is_empty()) {
        Some(reason) => TransitionOptions::default().with_comment(reason),
        None => TransitionOptions::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditDispatcher, MemoryAuditSink};
    use crate::calendar::{BusinessCalendar, SystemClock};
    use crate::store::{MemoryStore, ProposalStore};
    use crate::workflow::executor::ExecutorSettings;
    use crate::workflow::types::{Actor, Proposal, Role};
    use std::time::Duration;

    async fn actions_with(state: ProposalState) -> WorkflowActions {
        let store = MemoryStore::new();
        let mut proposal = Proposal::draft("p1", "DT-001", "Title", "owner", "F1", Utc::now());
        proposal.state = state;
        store.insert_proposal(&proposal).await.unwrap();
        let executor = TransitionExecutor::new(
            Arc::new(store),
            Arc::new(BusinessCalendar::default()),
            Arc::new(SystemClock),
            Arc::new(AuditDispatcher::new(
                Arc::new(MemoryAuditSink::new()),
                Duration::from_secs(1),
            )),
            ExecutorSettings::default(),
        );
        WorkflowActions::new(Arc::new(executor))
    }

    #[tokio::test]
    async fn assign_council_sets_council_holder() {
        let actions = actions_with(ProposalState::SchoolSelectionReview).await;
        let ctx = TransitionContext::new(Actor::new("office", Role::PhongKhcn));

        let outcome = actions
            .assign_council("p1", &ctx, "COUNCIL-7", Some("secretary-1"))
            .await
            .unwrap()
            .data;

        assert_eq!(outcome.current_state, ProposalState::OutlineCouncilReview);
        assert_eq!(outcome.holder_unit.as_deref(), Some("COUNCIL-7"));
        assert_eq!(outcome.holder_user.as_deref(), Some("secretary-1"));
        assert!(outcome.proposal.sla_deadline.is_some());
    }

    #[tokio::test]
    async fn reject_records_reason_code_and_actor_holder() {
        let actions = actions_with(ProposalState::FacultyReview).await;
        let ctx = TransitionContext::new(Actor::new("manager", Role::QuanLyKhoa).with_faculty("F1"));

        let outcome = actions
            .reject("p1", &ctx, RejectReasonCode::NotFeasible, "Scope cannot be delivered")
            .await
            .unwrap()
            .data;

        assert_eq!(outcome.current_state, ProposalState::Rejected);
        assert_eq!(outcome.log_entry.reason_code.as_deref(), Some("NOT_FEASIBLE"));
        assert_eq!(outcome.holder_unit.as_deref(), Some("F1"));
        assert_eq!(outcome.holder_user.as_deref(), Some("manager"));
    }

    #[tokio::test]
    async fn short_return_reason_is_refused() {
        let actions = actions_with(ProposalState::FacultyReview).await;
        let ctx = TransitionContext::new(Actor::new("manager", Role::QuanLyKhoa).with_faculty("F1"));

        let err = actions
            .return_faculty("p1", &ctx, ReturnDetails::new("fix it"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { .. }));
    }

    #[tokio::test]
    async fn faculty_returns_target_the_proposal_faculty() {
        let reviewer =
            TransitionContext::new(Actor::new("manager", Role::QuanLyKhoa).with_faculty("FAC-OTHER"));
        let details = || ReturnDetails::new("The budget table is missing totals");

        let actions = actions_with(ProposalState::FacultyReview).await;
        let outcome = actions.return_faculty("p1", &reviewer, details()).await.unwrap().data;
        assert_eq!(outcome.log_entry.return_target_holder_unit.as_deref(), Some("F1"));

        let actions = actions_with(ProposalState::FacultyAcceptanceReview).await;
        let outcome = actions
            .return_faculty_acceptance("p1", &reviewer, details())
            .await
            .unwrap()
            .data;
        assert_eq!(outcome.log_entry.return_target_holder_unit.as_deref(), Some("F1"));
        assert_eq!(
            outcome.log_entry.return_target_state,
            Some(ProposalState::FacultyAcceptanceReview)
        );
    }

    #[tokio::test]
    async fn finalize_from_handover_completes() {
        let actions = actions_with(ProposalState::Handover).await;
        let ctx = TransitionContext::new(Actor::new("office", Role::PhongKhcn));

        let outcome = actions.finalize("p1", &ctx).await.unwrap().data;
        assert_eq!(outcome.current_state, ProposalState::Completed);
        assert_eq!(outcome.holder_unit, None);
    }
}
