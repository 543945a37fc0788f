use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{NewLogEntry, ProposalStore, ProposalUpdate, StoreTransaction};
use crate::error::WorkflowError;
use crate::observability::workflow_metrics;
use crate::workflow::types::{Proposal, WorkflowLogEntry};

/// Future returned by a unit of work borrowing the open transaction.
pub type TxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, WorkflowError>> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// The two writes of a committed transition.
#[derive(Debug, Clone)]
pub struct UpdateWithLog {
    pub proposal_id: String,
    pub update: ProposalUpdate,
    pub log: NewLogEntry,
}

/// Runs units of work atomically against the store.
#[derive(Clone)]
pub struct TransactionOrchestrator {
    store: Arc<dyn ProposalStore>,
    policy: RetryPolicy,
}

impl TransactionOrchestrator {
    pub fn new(store: Arc<dyn ProposalStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Runs `work` inside one transaction; commits on success, rolls back on error.
    pub async fn execute<T, F>(&self, work: F) -> Result<T, WorkflowError>
    where
        T: Send,
        F: for<'a> FnOnce(&'a mut dyn StoreTransaction) -> TxFuture<'a, T>,
    {
        let mut tx = self.store.begin().await?;
        match work(&mut *tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("Rollback failed after {}: {}", err, rollback_err);
                }
                Err(err)
            }
        }
    }

    /// Like [`execute`](Self::execute), retrying serialization conflicts with
    /// exponential backoff. Any other error is returned immediately.
    pub async fn execute_with_retry<T, F>(
        &self,
        mut work: F,
        max_attempts: u32,
    ) -> Result<T, WorkflowError>
    where
        T: Send,
        F: for<'a> FnMut(&'a mut dyn StoreTransaction) -> TxFuture<'a, T>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.execute(&mut work).await {
                Ok(value) => return Ok(value),
                Err(WorkflowError::TransientConflict { message, .. }) if attempt < max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    workflow_metrics().record_transient_retry();
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Serialization conflict, retrying: {}",
                        message
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(WorkflowError::TransientConflict { message, .. }) => {
                    return Err(WorkflowError::TransientConflict {
                        attempts: attempt,
                        message,
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Updates the proposal and appends its log entry in one transaction.
    ///
    /// This is the only path through which a proposal's state changes.
    pub async fn update_entity_with_log(
        &self,
        params: UpdateWithLog,
    ) -> Result<(Proposal, WorkflowLogEntry), WorkflowError> {
        debug!(
            proposal_id = %params.proposal_id,
            from = %params.update.expected_state,
            to = %params.update.state,
            "Updating proposal with log entry"
        );
        self.execute_with_retry(
            move |tx| {
                let params = params.clone();
                Box::pin(async move {
                    let proposal = tx
                        .update_proposal(&params.proposal_id, &params.update)
                        .await?;
                    let entry = tx.create_log_entry(params.log).await?;
                    Ok((proposal, entry))
                })
            },
            self.policy.max_attempts,
        )
        .await
    }

    pub async fn health_check(&self) -> Result<(), WorkflowError> {
        self.store.ping().await.map_err(WorkflowError::from)
    }
}
