//! Transactional store contracts and backends.
//!
//! The workflow core never talks to a database directly. It reads through
//! [`ProposalStore`] and writes only inside a [`StoreTransaction`].

pub mod memory;
#[cfg(feature = "database")]
pub mod sqlite;
pub mod transaction;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::workflow::types::{Proposal, ProposalState, WorkflowAction, WorkflowLogEntry};

pub use memory::MemoryStore;
#[cfg(feature = "database")]
pub use sqlite::SqliteStore;
pub use transaction::{RetryPolicy, TransactionOrchestrator, TxFuture, UpdateWithLog};

/// Selects log entries for a proposal, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub proposal_id: String,
    pub action: Option<WorkflowAction>,
    pub to_state: Option<ProposalState>,
}

impl LogFilter {
    pub fn for_proposal(proposal_id: impl Into<String>) -> Self {
        Self {
            proposal_id: proposal_id.into(),
            action: None,
            to_state: None,
        }
    }

    pub fn action(mut self, action: WorkflowAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn to_state(mut self, state: ProposalState) -> Self {
        self.to_state = Some(state);
        self
    }

    pub fn matches(&self, entry: &WorkflowLogEntry) -> bool {
        entry.proposal_id == self.proposal_id
            && self.action.map_or(true, |a| a == entry.action)
            && self.to_state.map_or(true, |s| s == entry.to_state)
    }
}

/// What happens to the SLA columns on a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlaUpdate {
    Keep,
    Set {
        start: Option<DateTime<Utc>>,
        deadline: Option<DateTime<Utc>>,
    },
}

/// What happens to the pause-tracking columns on a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseTracking {
    Keep,
    Set {
        pre_pause_state: ProposalState,
        pre_pause_holder_unit: Option<String>,
        pre_pause_holder_user: Option<String>,
        paused_at: DateTime<Utc>,
    },
    Clear,
}

/// Conditional update of one proposal row.
///
/// Applied only while the row is still in `expected_state`; otherwise the
/// backend reports [`StoreError::StaleState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalUpdate {
    pub expected_state: ProposalState,
    pub state: ProposalState,
    pub holder_unit: Option<String>,
    pub holder_user: Option<String>,
    pub sla: SlaUpdate,
    pub pause: PauseTracking,
    pub updated_at: DateTime<Utc>,
}

impl ProposalUpdate {
    /// Applies the update to an in-memory copy of the row.
    pub fn apply_to(&self, proposal: &mut Proposal) {
        proposal.state = self.state;
        proposal.holder_unit = self.holder_unit.clone();
        proposal.holder_user = self.holder_user.clone();
        if let SlaUpdate::Set { start, deadline } = &self.sla {
            proposal.sla_start_date = *start;
            proposal.sla_deadline = *deadline;
        }
        match &self.pause {
            PauseTracking::Keep => {}
            PauseTracking::Set {
                pre_pause_state,
                pre_pause_holder_unit,
                pre_pause_holder_user,
                paused_at,
            } => {
                proposal.pre_pause_state = Some(*pre_pause_state);
                proposal.pre_pause_holder_unit = pre_pause_holder_unit.clone();
                proposal.pre_pause_holder_user = pre_pause_holder_user.clone();
                proposal.paused_at = Some(*paused_at);
            }
            PauseTracking::Clear => {
                proposal.pre_pause_state = None;
                proposal.pre_pause_holder_unit = None;
                proposal.pre_pause_holder_user = None;
                proposal.paused_at = None;
            }
        }
        proposal.updated_at = self.updated_at;
    }
}

/// Fields of a log entry before the store assigns its identity.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub proposal_id: String,
    pub action: WorkflowAction,
    pub from_state: ProposalState,
    pub to_state: ProposalState,
    pub actor_id: String,
    pub actor_name: String,
    pub return_target_state: Option<ProposalState>,
    pub return_target_holder_unit: Option<String>,
    pub reason_code: Option<String>,
    pub comment: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl NewLogEntry {
    pub fn into_entry(self, id: String) -> WorkflowLogEntry {
        WorkflowLogEntry {
            id,
            proposal_id: self.proposal_id,
            action: self.action,
            from_state: self.from_state,
            to_state: self.to_state,
            actor_id: self.actor_id,
            actor_name: self.actor_name,
            return_target_state: self.return_target_state,
            return_target_holder_unit: self.return_target_holder_unit,
            reason_code: self.reason_code,
            comment: self.comment,
            metadata: self.metadata,
            timestamp: self.timestamp,
        }
    }
}

/// Read access plus the ability to open transactions.
#[async_trait]
pub trait ProposalStore: Send + Sync {
    async fn find_proposal(&self, id: &str) -> Result<Option<Proposal>, StoreError>;

    async fn find_latest_log_entry(
        &self,
        filter: &LogFilter,
    ) -> Result<Option<WorkflowLogEntry>, StoreError>;

    /// Full history, oldest first.
    async fn list_log_entries(&self, proposal_id: &str) -> Result<Vec<WorkflowLogEntry>, StoreError>;

    /// Registers a new draft. Creation belongs to the proposal CRUD layer, not the workflow.
    async fn insert_proposal(&self, proposal: &Proposal) -> Result<(), StoreError>;

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn close(&self) {}
}

/// One atomic unit of work. Dropped without commit means rolled back.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn update_proposal(
        &mut self,
        id: &str,
        update: &ProposalUpdate,
    ) -> Result<Proposal, StoreError>;

    async fn create_log_entry(&mut self, entry: NewLogEntry) -> Result<WorkflowLogEntry, StoreError>;

    async fn find_latest_log_entry(
        &mut self,
        filter: &LogFilter,
    ) -> Result<Option<WorkflowLogEntry>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
