use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::{LogFilter, NewLogEntry, ProposalStore, ProposalUpdate, StoreTransaction};
use crate::error::StoreError;
use crate::workflow::types::{Proposal, WorkflowLogEntry};

#[derive(Debug, Default)]
struct Tables {
    proposals: HashMap<String, Proposal>,
    logs: Vec<WorkflowLogEntry>,
}

impl Tables {
    fn latest_log(&self, filter: &LogFilter) -> Option<WorkflowLogEntry> {
        self.logs
            .iter()
            .filter(|entry| filter.matches(entry))
            .max_by_key(|entry| entry.timestamp)
            .cloned()
    }
}

/// In-process store with serializable transactions.
///
/// A transaction holds the table lock from `begin` until commit or rollback
/// and stages its writes, so readers never observe a partial transition.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    failing_commits: Arc<AtomicU32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits fail with a serialization conflict.
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    pub async fn proposal_count(&self) -> usize {
        self.tables.lock().await.proposals.len()
    }

    pub async fn log_count(&self, proposal_id: &str) -> usize {
        self.tables
            .lock()
            .await
            .logs
            .iter()
            .filter(|entry| entry.proposal_id == proposal_id)
            .count()
    }
}

#[async_trait]
impl ProposalStore for MemoryStore {
    async fn find_proposal(&self, id: &str) -> Result<Option<Proposal>, StoreError> {
        Ok(self.tables.lock().await.proposals.get(id).cloned())
    }

    async fn find_latest_log_entry(
        &self,
        filter: &LogFilter,
    ) -> Result<Option<WorkflowLogEntry>, StoreError> {
        Ok(self.tables.lock().await.latest_log(filter))
    }

    async fn list_log_entries(&self, proposal_id: &str) -> Result<Vec<WorkflowLogEntry>, StoreError> {
        let tables = self.tables.lock().await;
        let mut entries: Vec<WorkflowLogEntry> = tables
            .logs
            .iter()
            .filter(|entry| entry.proposal_id == proposal_id)
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.timestamp);
        Ok(entries)
    }

    async fn insert_proposal(&self, proposal: &Proposal) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.proposals.contains_key(&proposal.id) {
            return Err(StoreError::Backend(format!(
                "proposal {} already exists",
                proposal.id
            )));
        }
        tables.proposals.insert(proposal.id.clone(), proposal.clone());
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let guard = self.tables.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            guard,
            staged_proposals: HashMap::new(),
            staged_logs: Vec::new(),
            failing_commits: self.failing_commits.clone(),
        }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    staged_proposals: HashMap<String, Proposal>,
    staged_logs: Vec<WorkflowLogEntry>,
    failing_commits: Arc<AtomicU32>,
}

impl MemoryTransaction {
    fn current(&self, id: &str) -> Option<&Proposal> {
        self.staged_proposals
            .get(id)
            .or_else(|| self.guard.proposals.get(id))
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn update_proposal(
        &mut self,
        id: &str,
        update: &ProposalUpdate,
    ) -> Result<Proposal, StoreError> {
        let mut proposal = self
            .current(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "Proposal",
                id: id.to_string(),
            })?;

        if proposal.state != update.expected_state {
            return Err(StoreError::StaleState {
                proposal_id: id.to_string(),
                expected: update.expected_state,
            });
        }

        update.apply_to(&mut proposal);
        self.staged_proposals.insert(id.to_string(), proposal.clone());
        Ok(proposal)
    }

    async fn create_log_entry(&mut self, entry: NewLogEntry) -> Result<WorkflowLogEntry, StoreError> {
        let entry = entry.into_entry(Uuid::new_v4().to_string());
        self.staged_logs.push(entry.clone());
        Ok(entry)
    }

    async fn find_latest_log_entry(
        &mut self,
        filter: &LogFilter,
    ) -> Result<Option<WorkflowLogEntry>, StoreError> {
        let staged = self
            .staged_logs
            .iter()
            .filter(|entry| filter.matches(entry))
            .max_by_key(|entry| entry.timestamp)
            .cloned();
        Ok(staged.or_else(|| self.guard.latest_log(filter)))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let injected = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Conflict(
                "could not serialize access due to concurrent update".to_string(),
            ));
        }

        let MemoryTransaction {
            mut guard,
            staged_proposals,
            staged_logs,
            ..
        } = *self;
        debug!(
            proposals = staged_proposals.len(),
            logs = staged_logs.len(),
            "Committing memory transaction"
        );
        guard.proposals.extend(staged_proposals);
        guard.logs.extend(staged_logs);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{PauseTracking, SlaUpdate};
    use crate::workflow::types::{ProposalState, WorkflowAction};
    use chrono::Utc;

    fn update(expected: ProposalState, to: ProposalState) -> ProposalUpdate {
        ProposalUpdate {
            expected_state: expected,
            state: to,
            holder_unit: Some("F1".into()),
            holder_user: None,
            sla: SlaUpdate::Keep,
            pause: PauseTracking::Keep,
            updated_at: Utc::now(),
        }
    }

    fn log(proposal_id: &str) -> NewLogEntry {
        NewLogEntry {
            proposal_id: proposal_id.into(),
            action: WorkflowAction::Submit,
            from_state: ProposalState::Draft,
            to_state: ProposalState::FacultyReview,
            actor_id: "u1".into(),
            actor_name: "u1".into(),
            return_target_state: None,
            return_target_holder_unit: None,
            reason_code: None,
            comment: None,
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn uncommitted_writes_are_discarded() {
        let store = MemoryStore::new();
        let p = Proposal::draft("p1", "C1", "T", "u1", "F1", Utc::now());
        store.insert_proposal(&p).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.update_proposal("p1", &update(ProposalState::Draft, ProposalState::FacultyReview))
            .await
            .unwrap();
        tx.create_log_entry(log("p1")).await.unwrap();
        drop(tx);

        let stored = store.find_proposal("p1").await.unwrap().unwrap();
        assert_eq!(stored.state, ProposalState::Draft);
        assert_eq!(store.log_count("p1").await, 0);
    }

    #[tokio::test]
    async fn commit_publishes_both_writes() {
        let store = MemoryStore::new();
        let p = Proposal::draft("p1", "C1", "T", "u1", "F1", Utc::now());
        store.insert_proposal(&p).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.update_proposal("p1", &update(ProposalState::Draft, ProposalState::FacultyReview))
            .await
            .unwrap();
        tx.create_log_entry(log("p1")).await.unwrap();
        tx.commit().await.unwrap();

        let stored = store.find_proposal("p1").await.unwrap().unwrap();
        assert_eq!(stored.state, ProposalState::FacultyReview);
        assert_eq!(stored.holder_unit.as_deref(), Some("F1"));
        assert_eq!(store.log_count("p1").await, 1);
    }

    #[tokio::test]
    async fn stale_state_is_rejected() {
        let store = MemoryStore::new();
        let p = Proposal::draft("p1", "C1", "T", "u1", "F1", Utc::now());
        store.insert_proposal(&p).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = tx
            .update_proposal("p1", &update(ProposalState::FacultyReview, ProposalState::Approved))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleState { .. }));
    }

    #[tokio::test]
    async fn injected_conflicts_fail_commit() {
        let store = MemoryStore::new();
        store.fail_next_commits(1);

        let tx = store.begin().await.unwrap();
        assert!(matches!(tx.commit().await, Err(StoreError::Conflict(_))));

        let tx = store.begin().await.unwrap();
        assert!(tx.commit().await.is_ok());
    }
}
