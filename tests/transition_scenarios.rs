//! End-to-end transition scenarios against the in-process store.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use proposal_flow::audit::{ActorFacts, AuditError, AuditSink, MemoryAuditSink, TransitionFacts};
use proposal_flow::workflow::{ResubmitRequest, ReturnDetails, ReturnReasonCode};
use proposal_flow::{
    workflow_metrics, Actor, ManualClock, MemoryStore, NewProposal, ProposalState, Role,
    TransitionContext, WorkflowAction, WorkflowConfig, WorkflowEngine, WorkflowError,
};
use std::sync::Arc;

const FACULTY: &str = "FAC-IT";
const OWNER: &str = "lecturer-1";

/// Thursday 2024-01-04 10:00 at UTC+7.
fn thursday_morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 4, 3, 0, 0).unwrap()
}

/// 17:00 at UTC+7 on the given day.
fn local_cutoff(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 10, 0, 0).unwrap()
}

struct Harness {
    engine: Arc<WorkflowEngine>,
    store: MemoryStore,
    clock: Arc<ManualClock>,
    audit: Arc<MemoryAuditSink>,
}

impl Harness {
    fn new() -> Self {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(thursday_morning()));
        let audit = Arc::new(MemoryAuditSink::new());
        let engine = WorkflowEngine::with_parts(
            WorkflowConfig::default(),
            Arc::new(store.clone()),
            clock.clone(),
            audit.clone(),
        );
        Self {
            engine: Arc::new(engine),
            store,
            clock,
            audit,
        }
    }

    async fn draft(&self) -> String {
        self.engine
            .create_proposal(NewProposal {
                code: "DT-2024-017".into(),
                title: "Edge inference for crop monitoring".into(),
                owner_id: OWNER.into(),
                faculty_id: FACULTY.into(),
            })
            .await
            .unwrap()
            .id
    }
}

fn owner() -> TransitionContext {
    TransitionContext::new(Actor::new(OWNER, Role::GiangVien).with_faculty(FACULTY))
}

fn manager() -> TransitionContext {
    TransitionContext::new(Actor::new("manager-1", Role::QuanLyKhoa).with_faculty(FACULTY))
}

fn office() -> TransitionContext {
    TransitionContext::new(Actor::new("office-1", Role::PhongKhcn))
}

fn council_secretary() -> TransitionContext {
    TransitionContext::new(Actor::new("secretary-1", Role::ThuKyHoiDong))
}

#[tokio::test]
async fn submit_moves_draft_to_faculty_review_with_deadline() {
    let h = Harness::new();
    let id = h.draft().await;

    let result = h.engine.actions().submit(&id, &owner()).await.unwrap();
    assert!(!result.is_cached);

    let outcome = result.data;
    assert_eq!(outcome.previous_state, ProposalState::Draft);
    assert_eq!(outcome.current_state, ProposalState::FacultyReview);
    assert_eq!(outcome.holder_unit.as_deref(), Some(FACULTY));
    assert_eq!(outcome.holder_user, None);
    assert_eq!(outcome.proposal.sla_start_date, Some(thursday_morning()));
    // Thu, Fri, Mon
    assert_eq!(outcome.proposal.sla_deadline, Some(local_cutoff(2024, 1, 8)));
    assert_eq!(outcome.log_entry.action, WorkflowAction::Submit);

    let stored = h.engine.find_proposal(&id).await.unwrap();
    assert_eq!(stored, outcome.proposal);
}

#[tokio::test]
async fn same_key_replays_the_first_result() {
    let h = Harness::new();
    let id = h.draft().await;
    let ctx = owner().with_idempotency_key("0b7f3c0e-3a8e-4c57-9e3c-5d1c2f0a9b11");

    let first = h.engine.actions().submit(&id, &ctx).await.unwrap();
    let second = h.engine.actions().submit(&id, &ctx).await.unwrap();

    assert!(!first.is_cached);
    assert!(second.is_cached);
    assert_eq!(first.data, second.data);
    assert_eq!(h.store.log_count(&id).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_approvals_with_one_key_commit_once() {
    let h = Harness::new();
    let id = h.draft().await;
    h.engine.actions().submit(&id, &owner()).await.unwrap();

    let ctx = manager().with_idempotency_key("5f0c6d2a-8b7e-4f1a-a3d4-9c2b1e0f7a66");
    let handles: Vec<_> = (0..10)
        .map(|_| {
            let engine = h.engine.clone();
            let ctx = ctx.clone();
            let id = id.clone();
            tokio::spawn(async move { engine.actions().approve_faculty(&id, &ctx).await })
        })
        .collect();

    let mut fresh = 0;
    let mut replayed = 0;
    let mut log_ids = Vec::new();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        if result.is_cached {
            replayed += 1;
        } else {
            fresh += 1;
        }
        assert_eq!(result.data.current_state, ProposalState::SchoolSelectionReview);
        log_ids.push(result.data.log_entry.id);
    }

    assert_eq!(fresh, 1);
    assert_eq!(replayed, 9);
    log_ids.dedup();
    assert_eq!(log_ids.len(), 1);
    // submit + one approval
    assert_eq!(h.store.log_count(&id).await, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_distinct_requests_leave_one_winner() {
    let h = Harness::new();
    let id = h.draft().await;
    h.engine.actions().submit(&id, &owner()).await.unwrap();

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let engine = h.engine.clone();
            let ctx = manager().with_request_id(format!("req-{i}"));
            let ctx = TransitionContext {
                idempotency_key: Some(format!("approve-attempt-{i}")),
                ..ctx
            };
            let id = id.clone();
            tokio::spawn(async move { engine.actions().approve_faculty(&id, &ctx).await })
        })
        .collect();

    let mut wins = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => wins += 1,
            Err(err) => assert!(
                matches!(
                    err,
                    WorkflowError::InvalidTransition { .. } | WorkflowError::ConcurrentModification { .. }
                ),
                "unexpected error: {err}"
            ),
        }
    }

    assert_eq!(wins, 1);
    assert_eq!(h.store.log_count(&id).await, 2);
}

#[tokio::test]
async fn resume_extends_deadline_by_time_paused() {
    let h = Harness::new();
    let id = h.draft().await;
    h.engine.actions().submit(&id, &owner()).await.unwrap();
    let approved = h
        .engine
        .actions()
        .approve_faculty(&id, &manager())
        .await
        .unwrap()
        .data;
    let start = approved.proposal.sla_start_date;
    assert_eq!(approved.proposal.sla_deadline, Some(local_cutoff(2024, 1, 8)));

    let paused = h
        .engine
        .actions()
        .pause(&id, &office(), "Budget committee review", None)
        .await
        .unwrap()
        .data;
    assert_eq!(paused.current_state, ProposalState::Paused);
    assert_eq!(paused.proposal.sla_deadline, Some(local_cutoff(2024, 1, 8)));
    assert_eq!(
        paused.proposal.pre_pause_state,
        Some(ProposalState::SchoolSelectionReview)
    );

    h.clock.advance(Duration::days(3));
    let resumed = h
        .engine
        .actions()
        .resume(&id, &office(), Some("Budget confirmed"))
        .await
        .unwrap()
        .data;

    assert_eq!(resumed.current_state, ProposalState::SchoolSelectionReview);
    assert_eq!(resumed.holder_unit.as_deref(), Some("PHONG_KHCN"));
    assert_eq!(resumed.proposal.sla_start_date, start);
    assert_eq!(resumed.proposal.sla_deadline, Some(local_cutoff(2024, 1, 11)));
    assert_eq!(resumed.proposal.pre_pause_state, None);
    assert_eq!(resumed.proposal.paused_at, None);
}

#[tokio::test]
async fn terminal_proposals_refuse_every_action() {
    let h = Harness::new();
    let id = h.draft().await;
    let cancelled = h
        .engine
        .actions()
        .cancel(&id, &owner(), Some("Superseded by a joint proposal"))
        .await
        .unwrap()
        .data;
    assert_eq!(cancelled.current_state, ProposalState::Cancelled);

    let actions = h.engine.actions();
    let attempts = vec![
        actions.submit(&id, &owner()).await,
        actions.approve_faculty(&id, &manager()).await,
        actions.withdraw(&id, &owner(), None).await,
        actions.pause(&id, &office(), "Hold", None).await,
        actions.resume(&id, &office(), None).await,
        actions.finalize(&id, &office()).await,
    ];
    for attempt in attempts {
        assert!(
            matches!(attempt, Err(WorkflowError::InvalidTransition { .. })),
            "{attempt:?}"
        );
    }

    assert_eq!(h.engine.find_proposal(&id).await.unwrap().state, ProposalState::Cancelled);
    assert_eq!(h.store.log_count(&id).await, 1);
}

#[tokio::test]
async fn faculty_return_and_resubmit_round_trip() {
    let h = Harness::new();
    let id = h.draft().await;
    h.engine.actions().submit(&id, &owner()).await.unwrap();

    let returned = h
        .engine
        .actions()
        .return_faculty(
            &id,
            &manager(),
            ReturnDetails::new("Budget table does not match the work plan")
                .with_code(ReturnReasonCode::UnreasonableBudget)
                .with_sections(["SEC_BUDGET", "SEC_METHOD"]),
        )
        .await
        .unwrap()
        .data;

    assert_eq!(returned.current_state, ProposalState::ChangesRequested);
    assert_eq!(returned.holder_unit.as_deref(), Some(FACULTY));
    assert_eq!(returned.holder_user.as_deref(), Some(OWNER));
    assert_eq!(
        returned.log_entry.return_target_state,
        Some(ProposalState::FacultyReview)
    );
    assert_eq!(
        returned.log_entry.reason_code.as_deref(),
        Some("KINH_PHI_KHONG_HOP_LE")
    );
    let comment: serde_json::Value =
        serde_json::from_str(returned.log_entry.comment.as_deref().unwrap()).unwrap();
    assert_eq!(comment["revisionSections"][0], "SEC_BUDGET");

    let err = h
        .engine
        .actions()
        .resubmit(
            &id,
            &owner(),
            ResubmitRequest {
                revised_sections: vec!["SEC_TEAM".into()],
                comment: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Validation { .. }));

    let resubmitted = h
        .engine
        .actions()
        .resubmit(
            &id,
            &owner(),
            ResubmitRequest {
                revised_sections: vec!["SEC_BUDGET".into()],
                comment: Some("Budget aligned with the work plan".into()),
            },
        )
        .await
        .unwrap()
        .data;

    assert_eq!(resubmitted.current_state, ProposalState::FacultyReview);
    assert_eq!(resubmitted.holder_unit.as_deref(), Some(FACULTY));
    assert_eq!(resubmitted.holder_user.as_deref(), Some("manager-1"));
    assert_eq!(
        resubmitted.log_entry.metadata.as_ref().unwrap()["returnLogId"],
        returned.log_entry.id.as_str()
    );
}

#[tokio::test]
async fn council_return_resubmits_to_the_council() {
    let h = Harness::new();
    let id = h.draft().await;
    let actions = h.engine.actions();
    actions.submit(&id, &owner()).await.unwrap();
    actions.approve_faculty(&id, &manager()).await.unwrap();
    actions
        .assign_council(&id, &office(), "COUNCIL-1", Some("secretary-1"))
        .await
        .unwrap();

    let returned = actions
        .return_council(
            &id,
            &council_secretary(),
            ReturnDetails::new("Clarify the expected publications").with_sections(["SEC_OUTPUT"]),
        )
        .await
        .unwrap()
        .data;
    assert_eq!(
        returned.log_entry.return_target_holder_unit.as_deref(),
        Some("COUNCIL-1")
    );

    let resubmitted = actions
        .resubmit(
            &id,
            &owner(),
            ResubmitRequest {
                revised_sections: vec!["SEC_OUTPUT".into()],
                comment: None,
            },
        )
        .await
        .unwrap()
        .data;
    assert_eq!(resubmitted.current_state, ProposalState::OutlineCouncilReview);
    assert_eq!(resubmitted.holder_unit.as_deref(), Some("COUNCIL-1"));
    assert_eq!(resubmitted.holder_user.as_deref(), Some("secretary-1"));
}

#[tokio::test]
async fn full_lifecycle_reaches_completed() {
    let h = Harness::new();
    let id = h.draft().await;
    let a = h.engine.actions();

    a.submit(&id, &owner()).await.unwrap();
    a.approve_faculty(&id, &manager()).await.unwrap();
    a.assign_council(&id, &office(), "COUNCIL-1", Some("secretary-1"))
        .await
        .unwrap();
    let approved = a.approve_council(&id, &council_secretary()).await.unwrap().data;
    assert_eq!(approved.holder_user.as_deref(), Some(OWNER));

    a.start_project(&id, &owner()).await.unwrap();
    a.submit_acceptance(&id, &owner()).await.unwrap();
    a.accept_faculty(&id, &manager()).await.unwrap();
    let handover = a.accept_school(&id, &office()).await.unwrap().data;
    assert_eq!(handover.current_state, ProposalState::Handover);
    assert_eq!(handover.holder_unit.as_deref(), Some("PHONG_KHCN"));

    let done = a.complete_handover(&id, &office()).await.unwrap().data;
    assert_eq!(done.current_state, ProposalState::Completed);
    assert_eq!(done.holder_unit, None);
    assert_eq!(done.holder_user, None);

    let history = h.engine.history(&id).await.unwrap();
    let trail: Vec<ProposalState> = history.iter().map(|e| e.to_state).collect();
    assert_eq!(
        trail,
        vec![
            ProposalState::FacultyReview,
            ProposalState::SchoolSelectionReview,
            ProposalState::OutlineCouncilReview,
            ProposalState::Approved,
            ProposalState::InProgress,
            ProposalState::FacultyAcceptanceReview,
            ProposalState::SchoolAcceptanceReview,
            ProposalState::Handover,
            ProposalState::Completed,
        ]
    );
}

#[tokio::test]
async fn wrong_role_is_denied_without_writes() {
    let h = Harness::new();
    let id = h.draft().await;
    h.engine.actions().submit(&id, &owner()).await.unwrap();

    let err = h
        .engine
        .actions()
        .approve_faculty(&id, &owner())
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::PermissionDenied { .. }));
    assert_eq!(h.store.log_count(&id).await, 1);
}

#[tokio::test(start_paused = true)]
async fn commit_conflicts_are_retried() {
    let h = Harness::new();
    let id = h.draft().await;
    h.store.fail_next_commits(2);

    let outcome = h.engine.actions().submit(&id, &owner()).await.unwrap().data;

    assert_eq!(outcome.current_state, ProposalState::FacultyReview);
    assert_eq!(h.store.log_count(&id).await, 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_surface_a_transient_conflict() {
    let h = Harness::new();
    let id = h.draft().await;
    h.store.fail_next_commits(3);

    let err = h.engine.actions().submit(&id, &owner()).await.unwrap_err();

    assert!(matches!(err, WorkflowError::TransientConflict { attempts: 3, .. }));
    assert!(err.is_transient());
    assert_eq!(h.engine.find_proposal(&id).await.unwrap().state, ProposalState::Draft);
    assert_eq!(h.store.log_count(&id).await, 0);
}

#[tokio::test]
async fn committed_transitions_are_audited() {
    let h = Harness::new();
    let id = h.draft().await;
    let outcome = h
        .engine
        .actions()
        .submit(&id, &owner().with_request_id("req-42"))
        .await
        .unwrap()
        .data;

    assert_eq!(h.engine.audit().drain().await, 0);
    let events = h.audit.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, "PROPOSAL_SUBMIT");
    assert_eq!(events[0].entity_id, id);
    assert_eq!(events[0].request_id.as_deref(), Some("req-42"));
    assert_eq!(events[0].metadata["logEntryId"], outcome.log_entry.id.as_str());
}

struct UnavailableSink;

#[async_trait]
impl AuditSink for UnavailableSink {
    async fn log_transition(
        &self,
        _transition: &TransitionFacts,
        _actor: &ActorFacts,
    ) -> Result<(), AuditError> {
        Err(AuditError::Unavailable("audit database offline".into()))
    }
}

#[tokio::test]
async fn audit_failure_does_not_undo_the_transition() {
    let store = MemoryStore::new();
    let engine = WorkflowEngine::with_parts(
        WorkflowConfig::default(),
        Arc::new(store.clone()),
        Arc::new(ManualClock::new(thursday_morning())),
        Arc::new(UnavailableSink),
    );
    let id = engine
        .create_proposal(NewProposal {
            code: "DT-2024-018".into(),
            title: "Audit resilience".into(),
            owner_id: OWNER.into(),
            faculty_id: FACULTY.into(),
        })
        .await
        .unwrap()
        .id;
    let failures_before = workflow_metrics().get_stats().audit_failures;

    let outcome = engine.actions().submit(&id, &owner()).await.unwrap().data;
    engine.audit().drain().await;

    assert_eq!(outcome.current_state, ProposalState::FacultyReview);
    assert_eq!(store.log_count(&id).await, 1);
    assert!(workflow_metrics().get_stats().audit_failures > failures_before);
}
