//! Wires configuration, storage, calendar, clock and audit into a running engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::audit::{AuditDispatcher, AuditSink, RetryingAuditSink, TracingAuditSink};
use crate::calendar::{BusinessCalendar, Clock, DeadlineCalculator, SystemClock};
use crate::config::WorkflowConfig;
use crate::error::WorkflowError;
use crate::idempotency::ResponseCache;
use crate::store::{MemoryStore, ProposalStore, RetryPolicy};
use crate::workflow::{
    ExecutorSettings, Proposal, Role, SlaSettings, TransitionExecutor, WorkflowActions,
    WorkflowLogEntry,
};

/// Fields a caller supplies to open a new draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProposal {
    pub code: String,
    pub title: String,
    pub owner_id: String,
    pub faculty_id: String,
}

/// Result of a health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub store_ok: bool,
    pub store_error: Option<String>,
    pub pending_audit_records: usize,
    pub cached_responses: usize,
    pub in_flight_transitions: usize,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.store_ok
    }
}

pub struct WorkflowEngine {
    config: WorkflowConfig,
    store: Arc<dyn ProposalStore>,
    clock: Arc<dyn Clock>,
    calendar: Arc<BusinessCalendar>,
    audit: Arc<AuditDispatcher>,
    executor: Arc<TransitionExecutor>,
    actions: WorkflowActions,
    responses: ResponseCache,
}

impl WorkflowEngine {
    /// Engine over `store` with the system clock and logging audit sink.
    pub fn new(config: WorkflowConfig, store: Arc<dyn ProposalStore>) -> Self {
        let sink: Arc<dyn AuditSink> = Arc::new(RetryingAuditSink::new(
            Arc::new(TracingAuditSink),
            config.audit.max_retries,
            config.audit.base_retry_delay(),
        ));
        Self::with_parts(config, store, Arc::new(SystemClock), sink)
    }

    /// Engine with every collaborator supplied by the caller.
    pub fn with_parts(
        config: WorkflowConfig,
        store: Arc<dyn ProposalStore>,
        clock: Arc<dyn Clock>,
        audit_sink: Arc<dyn AuditSink>,
    ) -> Self {
        let calendar = Arc::new(BusinessCalendar::new(
            config.calendar.utc_offset_hours,
            config.calendar.holidays.iter().copied(),
        ));
        let audit = Arc::new(AuditDispatcher::new(audit_sink, config.audit.drain_timeout()));

        let settings = ExecutorSettings {
            central_office_unit: config.central_office_unit.clone(),
            retry: RetryPolicy {
                max_attempts: config.transactions.max_attempts,
                base_backoff: config.transactions.base_backoff(),
            },
            completed_retention: config.idempotency.completed_retention(),
            sla: SlaSettings {
                business_days: config.sla.business_days,
                cutoff_hour: config.sla.cutoff_hour,
            },
        };
        let deadlines: Arc<dyn DeadlineCalculator> = calendar.clone();
        let executor = Arc::new(TransitionExecutor::new(
            store.clone(),
            deadlines,
            clock.clone(),
            audit.clone(),
            settings,
        ));
        let responses = ResponseCache::new(
            config.idempotency.response_ttl(),
            config.idempotency.max_cached_responses,
        );

        Self {
            actions: WorkflowActions::new(executor.clone()),
            config,
            store,
            clock,
            calendar,
            audit,
            executor,
            responses,
        }
    }

    /// Engine over the configured database, or an in-process store when none is configured.
    pub async fn connect(config: WorkflowConfig) -> Result<Self, WorkflowError> {
        let store = open_store(&config).await?;
        Ok(Self::new(config, store))
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn actions(&self) -> &WorkflowActions {
        &self.actions
    }

    pub fn executor(&self) -> &TransitionExecutor {
        &self.executor
    }

    pub fn store(&self) -> &Arc<dyn ProposalStore> {
        &self.store
    }

    pub fn calendar(&self) -> &BusinessCalendar {
        &self.calendar
    }

    pub fn audit(&self) -> &AuditDispatcher {
        &self.audit
    }

    pub fn responses(&self) -> &ResponseCache {
        &self.responses
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Opens a draft owned by `owner_id`.
    pub async fn create_proposal(&self, new: NewProposal) -> Result<Proposal, WorkflowError> {
        if new.code.trim().is_empty() || new.title.trim().is_empty() {
            return Err(WorkflowError::validation("Proposal code and title are required"));
        }
        let proposal = Proposal::draft(
            Uuid::new_v4().to_string(),
            new.code,
            new.title,
            new.owner_id,
            new.faculty_id,
            self.clock.now(),
        );
        self.store.insert_proposal(&proposal).await?;
        info!(proposal_id = %proposal.id, code = %proposal.code, "Proposal created");
        Ok(proposal)
    }

    pub async fn find_proposal(&self, proposal_id: &str) -> Result<Proposal, WorkflowError> {
        self.executor.find_proposal(proposal_id).await
    }

    /// Transition log of a proposal, oldest first.
    pub async fn history(&self, proposal_id: &str) -> Result<Vec<WorkflowLogEntry>, WorkflowError> {
        Ok(self.store.list_log_entries(proposal_id).await?)
    }

    /// Whether a user may act on the proposal as it currently stands.
    pub async fn can_user_act(
        &self,
        proposal_id: &str,
        user_id: &str,
        user_faculty_id: Option<&str>,
        role: Role,
    ) -> Result<bool, WorkflowError> {
        let proposal = self.find_proposal(proposal_id).await?;
        Ok(self
            .executor
            .resolver()
            .can_user_act(&proposal, user_id, user_faculty_id, role))
    }

    pub async fn health_check(&self) -> HealthReport {
        let store = self.executor.orchestrator().health_check().await;
        HealthReport {
            store_ok: store.is_ok(),
            store_error: store.err().map(|e| e.to_string()),
            pending_audit_records: self.audit.pending(),
            cached_responses: self.responses.size().await,
            in_flight_transitions: self.executor.coordinator().stats().pending,
        }
    }
}

#[cfg(feature = "database")]
async fn open_store(config: &WorkflowConfig) -> Result<Arc<dyn ProposalStore>, WorkflowError> {
    match &config.database {
        Some(db) => {
            info!("Initializing database at {}", db.url);
            let store =
                crate::store::SqliteStore::connect(&db.url, db.max_connections, db.auto_migrate)
                    .await?;
            Ok(Arc::new(store))
        }
        None => {
            info!("Database not configured, using in-process store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[cfg(not(feature = "database"))]
async fn open_store(config: &WorkflowConfig) -> Result<Arc<dyn ProposalStore>, WorkflowError> {
    if config.database.is_some() {
        tracing::warn!("Database feature not enabled, using in-process store");
    }
    Ok(Arc::new(MemoryStore::new()))
}
