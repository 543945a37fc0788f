//! The transition engine.
//!
//! Every state change goes through [`TransitionExecutor`]: idempotency
//! coordination, validation against a fresh snapshot, holder and deadline
//! computation, one atomic write of the proposal plus its log entry, and a
//! background audit record.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, Instrument};

use super::holder::{HolderAssignment, HolderResolver};
use super::types::{
    Idempotent, Proposal, ProposalState, ReturnReasonCode, TransitionContext, TransitionOutcome,
    WorkflowAction, WorkflowLogEntry,
};
use super::validator::{
    validate_pause_request, validate_return_reason, validate_revised_sections,
    validate_revision_sections, WorkflowValidator,
};
use crate::audit::{ActorFacts, AuditDispatcher, TransitionFacts};
use crate::calendar::{Clock, DeadlineCalculator};
use crate::error::WorkflowError;
use crate::idempotency::IdempotencyCoordinator;
use crate::observability::{workflow_metrics, OperationTimer};
use crate::store::{
    LogFilter, NewLogEntry, PauseTracking, ProposalStore, ProposalUpdate, RetryPolicy, SlaUpdate,
    TransactionOrchestrator, UpdateWithLog,
};
use crate::telemetry::create_transition_span;

/// How a transition treats the proposal's SLA columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SlaPolicy {
    /// Start a new review window ending `business_days` out at the cutoff hour.
    Window { business_days: u32, cutoff_hour: u32 },
    /// Record the start with no deadline.
    #[default]
    Open,
    /// Leave both columns as they are.
    Preserve,
}

/// Per-call inputs to the generic executor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionOptions {
    pub sla: SlaPolicy,
    /// Replaces the resolver's holder for this transition.
    pub holder_override: Option<HolderAssignment>,
    pub reason_code: Option<String>,
    pub comment: Option<String>,
    pub metadata: Option<Value>,
}

impl TransitionOptions {
    pub fn with_sla(mut self, sla: SlaPolicy) -> Self {
        self.sla = sla;
        self
    }

    pub fn with_holder(mut self, holder: HolderAssignment) -> Self {
        self.holder_override = Some(holder);
        self
    }

    pub fn with_reason_code(mut self, code: impl Into<String>) -> Self {
        self.reason_code = Some(code.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A send-back for revisions, remembering where the proposal should resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnRequest {
    pub return_target_state: ProposalState,
    pub return_target_holder_unit: Option<String>,
    pub reason: String,
    pub reason_code: Option<ReturnReasonCode>,
    pub revision_sections: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResubmitRequest {
    pub revised_sections: Vec<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PauseRequest {
    pub reason: String,
    pub expected_resume_at: Option<DateTime<Utc>>,
}

/// Default review window applied by the action facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaSettings {
    pub business_days: u32,
    pub cutoff_hour: u32,
}

impl Default for SlaSettings {
    fn default() -> Self {
        Self {
            business_days: 3,
            cutoff_hour: 17,
        }
    }
}

impl SlaSettings {
    pub fn window(&self) -> SlaPolicy {
        SlaPolicy::Window {
            business_days: self.business_days,
            cutoff_hour: self.cutoff_hour,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub central_office_unit: String,
    pub retry: RetryPolicy,
    pub completed_retention: Option<Duration>,
    pub sla: SlaSettings,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            central_office_unit: super::holder::DEFAULT_CENTRAL_OFFICE_UNIT.to_string(),
            retry: RetryPolicy::default(),
            completed_retention: Some(Duration::from_secs(300)),
            sla: SlaSettings::default(),
        }
    }
}

/// Everything decided before the write.
struct TransitionPlan {
    target: ProposalState,
    action: WorkflowAction,
    holder: HolderAssignment,
    sla: SlaUpdate,
    pause: PauseTracking,
    return_target_state: Option<ProposalState>,
    return_target_holder_unit: Option<String>,
    reason_code: Option<String>,
    comment: Option<String>,
    metadata: Option<Value>,
}

/// Serializes state-mutating work per proposal within this process.
#[derive(Default)]
struct ProposalLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProposalLocks {
    async fn acquire(&self, proposal_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(proposal_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

pub struct TransitionExecutor {
    store: Arc<dyn ProposalStore>,
    validator: WorkflowValidator,
    resolver: HolderResolver,
    coordinator: IdempotencyCoordinator<TransitionOutcome>,
    orchestrator: TransactionOrchestrator,
    calendar: Arc<dyn DeadlineCalculator>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditDispatcher>,
    locks: ProposalLocks,
    sla: SlaSettings,
}

impl TransitionExecutor {
    pub fn new(
        store: Arc<dyn ProposalStore>,
        calendar: Arc<dyn DeadlineCalculator>,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditDispatcher>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            validator: WorkflowValidator::new(store.clone()),
            resolver: HolderResolver::new(settings.central_office_unit),
            coordinator: IdempotencyCoordinator::new(settings.completed_retention),
            orchestrator: TransactionOrchestrator::new(store.clone(), settings.retry),
            store,
            calendar,
            clock,
            audit,
            locks: ProposalLocks::default(),
            sla: settings.sla,
        }
    }

    pub fn resolver(&self) -> &HolderResolver {
        &self.resolver
    }

    pub fn coordinator(&self) -> &IdempotencyCoordinator<TransitionOutcome> {
        &self.coordinator
    }

    pub fn orchestrator(&self) -> &TransactionOrchestrator {
        &self.orchestrator
    }

    pub fn sla_settings(&self) -> SlaSettings {
        self.sla
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn find_proposal(&self, proposal_id: &str) -> Result<Proposal, WorkflowError> {
        self.store
            .find_proposal(proposal_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("Proposal", proposal_id))
    }

    /// Generic entry point for every transition.
    pub async fn execute_transition(
        &self,
        proposal_id: &str,
        target: ProposalState,
        action: WorkflowAction,
        ctx: &TransitionContext,
        options: TransitionOptions,
    ) -> Result<Idempotent<TransitionOutcome>, WorkflowError> {
        let current = self.find_proposal(proposal_id).await?;
        let key = idempotency_key(ctx, action, &current, target);

        self.run(&key, proposal_id, target, action, ctx, move |snapshot| async move {
            self.plan(&snapshot, target, action, ctx, options)
        })
        .await
    }

    /// Sends a proposal back for changes and records where it should resume.
    pub async fn execute_return(
        &self,
        proposal_id: &str,
        ctx: &TransitionContext,
        request: ReturnRequest,
    ) -> Result<Idempotent<TransitionOutcome>, WorkflowError> {
        validate_return_reason(&request.reason)?;
        validate_revision_sections(&request.revision_sections, false)?;

        let target = ProposalState::ChangesRequested;
        let action = WorkflowAction::Return;
        let current = self.find_proposal(proposal_id).await?;
        let key = idempotency_key(ctx, action, &current, target);

        self.run(&key, proposal_id, target, action, ctx, move |snapshot| async move {
            let body = json!({
                "reason": request.reason,
                "revisionSections": request.revision_sections,
            });
            let metadata = json!({
                "returnTargetState": request.return_target_state,
                "returnTargetHolderUnit": request.return_target_holder_unit,
                "reason": request.reason,
                "revisionSections": request.revision_sections,
            });
            let options = TransitionOptions {
                sla: SlaPolicy::Open,
                holder_override: None,
                reason_code: request.reason_code.map(|c| c.as_str().to_string()),
                comment: Some(body.to_string()),
                metadata: Some(metadata),
            };
            let mut plan = self.plan(&snapshot, target, action, ctx, options)?;
            plan.return_target_state = Some(request.return_target_state);
            plan.return_target_holder_unit = request.return_target_holder_unit;
            Ok(plan)
        })
        .await
    }

    /// Sends a changes-requested proposal back to the stage that returned it.
    pub async fn execute_resubmit(
        &self,
        proposal_id: &str,
        ctx: &TransitionContext,
        request: ResubmitRequest,
    ) -> Result<Idempotent<TransitionOutcome>, WorkflowError> {
        let action = WorkflowAction::Resubmit;
        let current = self.find_proposal(proposal_id).await?;
        let return_log = self.latest_return_log(proposal_id).await?;
        let target = match return_target(&return_log) {
            Ok(target) => target,
            Err(err) => return self.replay_or_fail(ctx, err).await,
        };
        let key = idempotency_key(ctx, action, &current, target);

        self.run(&key, proposal_id, target, action, ctx, move |snapshot| async move {
            // Re-read under the proposal lock; a newer return may have landed.
            let return_log = self.latest_return_log(proposal_id).await?;
            if return_target(&return_log)? != target {
                return Err(WorkflowError::ConcurrentModification {
                    proposal_id: proposal_id.to_string(),
                });
            }
            validate_revised_sections(&requested_sections(&return_log), &request.revised_sections)?;

            let holder = HolderAssignment::new(
                return_holder_unit(&return_log).or_else(|| {
                    self.resolver
                        .resolve(target, &snapshot, None, None)
                        .holder_unit
                }),
                Some(return_log.actor_id.clone()),
            );
            let options = TransitionOptions {
                sla: self.sla.window(),
                holder_override: Some(holder),
                reason_code: None,
                comment: request.comment,
                metadata: Some(json!({
                    "returnLogId": return_log.id,
                    "revisedSections": request.revised_sections,
                })),
            };
            self.plan(&snapshot, target, action, ctx, options)
        })
        .await
    }

    /// Pauses a proposal, remembering its state and holder and keeping its SLA.
    pub async fn execute_pause(
        &self,
        proposal_id: &str,
        ctx: &TransitionContext,
        request: PauseRequest,
    ) -> Result<Idempotent<TransitionOutcome>, WorkflowError> {
        validate_pause_request(&request.reason, request.expected_resume_at, self.clock.now())?;

        let comment = match request.expected_resume_at {
            Some(at) => format!("Paused: {} (expected resume: {})", request.reason, at.date_naive()),
            None => format!("Paused: {}", request.reason),
        };
        let options = TransitionOptions {
            sla: SlaPolicy::Preserve,
            holder_override: Some(HolderAssignment::unit(self.resolver.central_office_unit())),
            reason_code: None,
            comment: Some(comment),
            metadata: Some(json!({
                "reason": request.reason,
                "expectedResumeAt": request.expected_resume_at,
            })),
        };
        self.execute_transition(
            proposal_id,
            ProposalState::Paused,
            WorkflowAction::Pause,
            ctx,
            options,
        )
        .await
    }

    /// Resumes a paused proposal into its pre-pause state.
    ///
    /// The deadline moves out by exactly the time spent paused.
    pub async fn execute_resume(
        &self,
        proposal_id: &str,
        ctx: &TransitionContext,
        comment: Option<String>,
    ) -> Result<Idempotent<TransitionOutcome>, WorkflowError> {
        let action = WorkflowAction::Resume;
        let current = self.find_proposal(proposal_id).await?;
        let target = match resume_target(&current) {
            Ok(target) => target,
            Err(err) => return self.replay_or_fail(ctx, err).await,
        };
        let key = idempotency_key(ctx, action, &current, target);

        self.run(&key, proposal_id, target, action, ctx, move |snapshot| async move {
            if snapshot.pre_pause_state != Some(target) {
                return Err(WorkflowError::ConcurrentModification {
                    proposal_id: proposal_id.to_string(),
                });
            }
            let resumed_at = self.clock.now();
            let sla = match (snapshot.paused_at, snapshot.sla_deadline) {
                (Some(paused_at), Some(deadline)) => SlaUpdate::Set {
                    start: snapshot.sla_start_date,
                    deadline: Some(deadline + (resumed_at - paused_at)),
                },
                _ => SlaUpdate::Keep,
            };

            Ok(TransitionPlan {
                target,
                action,
                holder: HolderAssignment::new(
                    snapshot.pre_pause_holder_unit.clone(),
                    snapshot.pre_pause_holder_user.clone(),
                ),
                sla,
                pause: PauseTracking::Clear,
                return_target_state: None,
                return_target_holder_unit: None,
                reason_code: None,
                comment,
                metadata: Some(json!({
                    "pausedAt": snapshot.paused_at,
                    "resumedAt": resumed_at,
                })),
            })
        })
        .await
    }

    /// Serves a retried client key its recorded outcome, or waits for the
    /// in-flight one, once the proposal has moved past the pre-check.
    async fn replay_or_fail(
        &self,
        ctx: &TransitionContext,
        err: WorkflowError,
    ) -> Result<Idempotent<TransitionOutcome>, WorkflowError> {
        let Some(key) = ctx.idempotency_key.as_deref() else {
            return Err(err);
        };
        let result = self
            .coordinator
            .set_if_absent(key, || async move { Err(err) })
            .await?;
        workflow_metrics().record_idempotent_replay();
        Ok(result)
    }

    /// Coordinates, locks, validates, plans and commits one transition.
    async fn run<F, Fut>(
        &self,
        key: &str,
        proposal_id: &str,
        target: ProposalState,
        action: WorkflowAction,
        ctx: &TransitionContext,
        build: F,
    ) -> Result<Idempotent<TransitionOutcome>, WorkflowError>
    where
        F: FnOnce(Proposal) -> Fut,
        Fut: Future<Output = Result<TransitionPlan, WorkflowError>>,
    {
        let span = create_transition_span(action, proposal_id, ctx.request_id.as_deref());
        let result = self
            .coordinator
            .set_if_absent(key, || async move {
                let timer = OperationTimer::new(action.as_str());
                let _guard = self.locks.acquire(proposal_id).await;
                let snapshot = self
                    .validator
                    .validate(proposal_id, target, action, &ctx.actor)
                    .await?;
                let plan = build(snapshot.clone()).await?;
                let outcome = self.commit(&snapshot, plan, ctx).await?;
                timer.finish();
                Ok(outcome)
            })
            .instrument(span)
            .await?;

        if result.is_cached {
            workflow_metrics().record_idempotent_replay();
        }
        Ok(result)
    }

    fn plan(
        &self,
        proposal: &Proposal,
        target: ProposalState,
        action: WorkflowAction,
        ctx: &TransitionContext,
        options: TransitionOptions,
    ) -> Result<TransitionPlan, WorkflowError> {
        let holder = options.holder_override.unwrap_or_else(|| {
            self.resolver.resolve(
                target,
                proposal,
                Some(&ctx.actor.user_id),
                ctx.actor.faculty_id.as_deref(),
            )
        });

        let pausing = target == ProposalState::Paused;
        let sla = if pausing {
            SlaUpdate::Keep
        } else {
            self.sla_update(options.sla)
        };
        let pause = if pausing {
            PauseTracking::Set {
                pre_pause_state: proposal.state,
                pre_pause_holder_unit: proposal.holder_unit.clone(),
                pre_pause_holder_user: proposal.holder_user.clone(),
                paused_at: self.clock.now(),
            }
        } else {
            PauseTracking::Keep
        };

        Ok(TransitionPlan {
            target,
            action,
            holder,
            sla,
            pause,
            return_target_state: None,
            return_target_holder_unit: None,
            reason_code: options.reason_code,
            comment: options.comment,
            metadata: options.metadata,
        })
    }

    fn sla_update(&self, policy: SlaPolicy) -> SlaUpdate {
        let now = self.clock.now();
        match policy {
            SlaPolicy::Window {
                business_days,
                cutoff_hour,
            } => SlaUpdate::Set {
                start: Some(now),
                deadline: Some(self.calendar.deadline_with_cutoff(now, business_days, cutoff_hour)),
            },
            SlaPolicy::Open => SlaUpdate::Set {
                start: Some(now),
                deadline: None,
            },
            SlaPolicy::Preserve => SlaUpdate::Keep,
        }
    }

    async fn commit(
        &self,
        snapshot: &Proposal,
        plan: TransitionPlan,
        ctx: &TransitionContext,
    ) -> Result<TransitionOutcome, WorkflowError> {
        let now = self.clock.now();
        let params = UpdateWithLog {
            proposal_id: snapshot.id.clone(),
            update: ProposalUpdate {
                expected_state: snapshot.state,
                state: plan.target,
                holder_unit: plan.holder.holder_unit,
                holder_user: plan.holder.holder_user,
                sla: plan.sla,
                pause: plan.pause,
                updated_at: now,
            },
            log: NewLogEntry {
                proposal_id: snapshot.id.clone(),
                action: plan.action,
                from_state: snapshot.state,
                to_state: plan.target,
                actor_id: ctx.actor.user_id.clone(),
                actor_name: ctx.actor.name().to_string(),
                return_target_state: plan.return_target_state,
                return_target_holder_unit: plan.return_target_holder_unit,
                reason_code: plan.reason_code,
                comment: plan.comment,
                metadata: plan.metadata,
                timestamp: now,
            },
        };

        let (proposal, log_entry) = self.orchestrator.update_entity_with_log(params).await?;
        workflow_metrics().record_transition();
        info!(
            proposal_id = %proposal.id,
            action = %log_entry.action,
            from = %log_entry.from_state,
            to = %log_entry.to_state,
            holder_unit = ?proposal.holder_unit,
            "Transition committed"
        );

        self.audit
            .dispatch(transition_facts(&proposal, &log_entry), actor_facts(ctx));

        Ok(TransitionOutcome {
            previous_state: log_entry.from_state,
            current_state: proposal.state,
            holder_unit: proposal.holder_unit.clone(),
            holder_user: proposal.holder_user.clone(),
            proposal,
            log_entry,
        })
    }

    async fn latest_return_log(&self, proposal_id: &str) -> Result<WorkflowLogEntry, WorkflowError> {
        let filter = LogFilter::for_proposal(proposal_id).action(WorkflowAction::Return);
        self.store
            .find_latest_log_entry(&filter)
            .await?
            .ok_or_else(|| WorkflowError::not_found("Return log", proposal_id))
    }
}

/// Client key if given, otherwise one tied to the proposal version the caller saw.
fn idempotency_key(
    ctx: &TransitionContext,
    action: WorkflowAction,
    proposal: &Proposal,
    target: ProposalState,
) -> String {
    match &ctx.idempotency_key {
        Some(key) => key.clone(),
        None => format!(
            "{}:{}:{}:v{}",
            action,
            proposal.id,
            target,
            proposal.updated_at.timestamp_micros()
        ),
    }
}

fn metadata_str<'a>(entry: &'a WorkflowLogEntry, field: &str) -> Option<&'a str> {
    entry.metadata.as_ref()?.get(field)?.as_str()
}

fn return_target(entry: &WorkflowLogEntry) -> Result<ProposalState, WorkflowError> {
    entry
        .return_target_state
        .or_else(|| metadata_str(entry, "returnTargetState")?.parse().ok())
        .ok_or_else(|| {
            WorkflowError::validation(format!(
                "Return log {} does not record a return target",
                entry.id
            ))
        })
}

fn resume_target(proposal: &Proposal) -> Result<ProposalState, WorkflowError> {
    match proposal.pre_pause_state {
        Some(state) if proposal.state == ProposalState::Paused => Ok(state),
        None if proposal.state == ProposalState::Paused => Err(WorkflowError::MissingPrePauseState {
            proposal_id: proposal.id.clone(),
        }),
        _ => Err(WorkflowError::InvalidTransition {
            from: proposal.state,
            to: ProposalState::Paused,
            action: WorkflowAction::Resume,
        }),
    }
}

fn return_holder_unit(entry: &WorkflowLogEntry) -> Option<String> {
    entry
        .return_target_holder_unit
        .clone()
        .or_else(|| metadata_str(entry, "returnTargetHolderUnit").map(str::to_string))
}

/// Sections the return asked to revise, from metadata or the JSON comment.
fn requested_sections(entry: &WorkflowLogEntry) -> Vec<String> {
    let from_value = |value: &Value| -> Option<Vec<String>> {
        let sections = value.get("revisionSections")?.as_array()?;
        Some(
            sections
                .iter()
                .filter_map(|s| s.as_str().map(str::to_string))
                .collect(),
        )
    };
    entry
        .metadata
        .as_ref()
        .and_then(from_value)
        .or_else(|| {
            let comment: Value = serde_json::from_str(entry.comment.as_deref()?).ok()?;
            from_value(&comment)
        })
        .unwrap_or_default()
}

fn transition_facts(proposal: &Proposal, entry: &WorkflowLogEntry) -> TransitionFacts {
    TransitionFacts {
        proposal_id: proposal.id.clone(),
        proposal_code: proposal.code.clone(),
        action: entry.action,
        from_state: entry.from_state,
        to_state: entry.to_state,
        holder_unit: proposal.holder_unit.clone(),
        holder_user: proposal.holder_user.clone(),
        sla_start_date: proposal.sla_start_date,
        sla_deadline: proposal.sla_deadline,
        return_target_state: entry.return_target_state,
        return_target_holder_unit: entry.return_target_holder_unit.clone(),
        reason: entry.comment.clone(),
        log_entry_id: entry.id.clone(),
    }
}

fn actor_facts(ctx: &TransitionContext) -> ActorFacts {
    ActorFacts {
        user_id: ctx.actor.user_id.clone(),
        display_name: ctx.actor.display_name.clone(),
        role: ctx.actor.role,
        faculty_id: ctx.actor.faculty_id.clone(),
        ip_address: ctx.ip_address.clone(),
        user_agent: ctx.user_agent.clone(),
        request_id: ctx.request_id.clone(),
    }
}
