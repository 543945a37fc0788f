//! Audit trail delivery.
//!
//! A committed transition is final; audit delivery happens on a background
//! task and its failures are logged, never returned to the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use crate::observability::workflow_metrics;
use crate::workflow::types::{ProposalState, Role, WorkflowAction};

/// What changed in a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionFacts {
    pub proposal_id: String,
    pub proposal_code: String,
    pub action: WorkflowAction,
    pub from_state: ProposalState,
    pub to_state: ProposalState,
    pub holder_unit: Option<String>,
    pub holder_user: Option<String>,
    pub sla_start_date: Option<DateTime<Utc>>,
    pub sla_deadline: Option<DateTime<Utc>>,
    pub return_target_state: Option<ProposalState>,
    pub return_target_holder_unit: Option<String>,
    pub reason: Option<String>,
    pub log_entry_id: String,
}

/// Who caused it, and from where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorFacts {
    pub user_id: String,
    pub display_name: Option<String>,
    pub role: Role,
    pub faculty_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
}

/// The record handed to an audit backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub action: String,
    pub actor_user_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub metadata: serde_json::Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn from_facts(transition: &TransitionFacts, actor: &ActorFacts) -> Self {
        let mut metadata = serde_json::Map::new();
        metadata.insert("proposalCode".into(), transition.proposal_code.clone().into());
        metadata.insert("fromState".into(), transition.from_state.as_str().into());
        metadata.insert("toState".into(), transition.to_state.as_str().into());
        metadata.insert("holderUnit".into(), transition.holder_unit.clone().into());
        metadata.insert("logEntryId".into(), transition.log_entry_id.clone().into());
        if let Some(user) = &transition.holder_user {
            metadata.insert("holderUser".into(), user.clone().into());
        }
        if let Some(start) = transition.sla_start_date {
            metadata.insert("slaStartDate".into(), start.to_rfc3339().into());
        }
        if let Some(deadline) = transition.sla_deadline {
            metadata.insert("slaDeadline".into(), deadline.to_rfc3339().into());
        }
        if let Some(target) = transition.return_target_state {
            metadata.insert("returnTargetState".into(), target.as_str().into());
        }
        if let Some(unit) = &transition.return_target_holder_unit {
            metadata.insert("returnTargetHolderUnit".into(), unit.clone().into());
        }
        if let Some(reason) = &transition.reason {
            metadata.insert("reason".into(), reason.clone().into());
        }

        Self {
            action: format!("PROPOSAL_{}", transition.action),
            actor_user_id: actor.user_id.clone(),
            entity_type: "Proposal".to_string(),
            entity_id: transition.proposal_id.clone(),
            metadata: serde_json::Value::Object(metadata),
            ip_address: actor.ip_address.clone(),
            user_agent: actor.user_agent.clone(),
            request_id: actor.request_id.clone(),
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuditError {
    #[error("Audit backend unavailable: {0}")]
    Unavailable(String),
    #[error("Audit event rejected: {0}")]
    Rejected(String),
}

/// Destination for transition audit records.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_transition(
        &self,
        transition: &TransitionFacts,
        actor: &ActorFacts,
    ) -> Result<(), AuditError>;
}

/// Writes audit events to the structured log under the `audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn log_transition(
        &self,
        transition: &TransitionFacts,
        actor: &ActorFacts,
    ) -> Result<(), AuditError> {
        let event = AuditEvent::from_facts(transition, actor);
        let payload = serde_json::to_string(&event).map_err(|e| AuditError::Rejected(e.to_string()))?;
        info!(target: "audit", entity_id = %event.entity_id, action = %event.action, event = %payload, "Audit event");
        Ok(())
    }
}

/// Keeps audit events in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn log_transition(
        &self,
        transition: &TransitionFacts,
        actor: &ActorFacts,
    ) -> Result<(), AuditError> {
        let event = AuditEvent::from_facts(transition, actor);
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }
}

/// Retries a flaky sink with exponential backoff and a little jitter.
pub struct RetryingAuditSink {
    inner: Arc<dyn AuditSink>,
    max_retries: u32,
    base_delay: Duration,
}

impl RetryingAuditSink {
    pub fn new(inner: Arc<dyn AuditSink>, max_retries: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            max_retries: max_retries.max(1),
            base_delay,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let jitter_ms = (self.base_delay.as_millis() as u64) / 4;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        backoff + Duration::from_millis(jitter)
    }
}

#[async_trait]
impl AuditSink for RetryingAuditSink {
    async fn log_transition(
        &self,
        transition: &TransitionFacts,
        actor: &ActorFacts,
    ) -> Result<(), AuditError> {
        let mut attempt = 1;
        loop {
            match self.inner.log_transition(transition, actor).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.max_retries => {
                    let delay = self.delay(attempt);
                    warn!(
                        proposal_id = %transition.proposal_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Audit write failed, retrying: {}",
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Runs audit writes on background tasks owned by the dispatcher.
pub struct AuditDispatcher {
    sink: Arc<dyn AuditSink>,
    tasks: Mutex<JoinSet<()>>,
    drain_timeout: Duration,
}

impl AuditDispatcher {
    pub fn new(sink: Arc<dyn AuditSink>, drain_timeout: Duration) -> Self {
        Self {
            sink,
            tasks: Mutex::new(JoinSet::new()),
            drain_timeout,
        }
    }

    /// Fire-and-forget. Must be called from within a tokio runtime.
    pub fn dispatch(&self, transition: TransitionFacts, actor: ActorFacts) {
        let sink = self.sink.clone();
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            if let Err(err) = sink.log_transition(&transition, &actor).await {
                workflow_metrics().record_audit_failure();
                error!(
                    proposal_id = %transition.proposal_id,
                    action = %transition.action,
                    "Failed to record audit event: {}",
                    err
                );
            }
        });
    }

    pub fn pending(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Waits for in-flight audit writes, up to the drain timeout. Returns how many were abandoned.
    pub async fn drain(&self) -> usize {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        match drained {
            Ok(()) => 0,
            Err(_) => {
                let abandoned = tasks.len();
                warn!(abandoned, "Timed out draining audit tasks");
                tasks.abort_all();
                abandoned
            }
        }
    }
}
