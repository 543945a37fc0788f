use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::WorkflowError;
use crate::workflow::types::Idempotent;

type Outcome<T> = Option<Result<T, WorkflowError>>;

enum Slot<T> {
    Pending(watch::Receiver<Outcome<T>>),
    Done { value: T, completed_at: Instant },
}

enum Claim<T> {
    Replay(T),
    Await(watch::Receiver<Outcome<T>>),
    Lead(watch::Sender<Outcome<T>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub completed: usize,
    pub pending: usize,
}

/// Runs at most one unit of work per key at a time and replays its result.
///
/// The check for an existing entry and the registration of a new pending
/// entry happen under one lock, so concurrent callers with the same key
/// always converge on a single execution. Failures are handed to every
/// waiter but never retained.
///
/// Process-scoped: a multi-instance deployment needs a shared store with
/// conditional-set semantics behind the same API.
pub struct IdempotencyCoordinator<T> {
    slots: Arc<Mutex<HashMap<String, Slot<T>>>>,
    retention: Option<Duration>,
}

impl<T> Clone for IdempotencyCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            retention: self.retention,
        }
    }
}

impl<T> Default for IdempotencyCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(None)
    }
}

impl<T> IdempotencyCoordinator<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// `retention` bounds how long completed results are replayed; `None` keeps them until deleted.
    pub fn new(retention: Option<Duration>) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot<T>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_live(&self, completed_at: Instant) -> bool {
        self.retention
            .map_or(true, |retention| completed_at.elapsed() < retention)
    }

    fn claim(&self, key: &str) -> Claim<T> {
        let mut slots = self.lock();
        match slots.get(key) {
            Some(Slot::Done {
                value,
                completed_at,
            }) if self.is_live(*completed_at) => return Claim::Replay(value.clone()),
            Some(Slot::Pending(rx)) => return Claim::Await(rx.clone()),
            _ => {}
        }
        // Expired results would otherwise pile up under one-shot keys.
        if self.retention.is_some() {
            slots.retain(|_, slot| match slot {
                Slot::Done { completed_at, .. } => self.is_live(*completed_at),
                Slot::Pending(_) => true,
            });
        }
        let (tx, rx) = watch::channel(None);
        slots.insert(key.to_string(), Slot::Pending(rx));
        Claim::Lead(tx)
    }

    /// Returns the completed result for `key`, awaits the in-flight one, or
    /// runs `work` as the single leader.
    pub async fn set_if_absent<F, Fut>(&self, key: &str, work: F) -> Result<Idempotent<T>, WorkflowError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, WorkflowError>>,
    {
        match self.claim(key) {
            Claim::Replay(value) => {
                debug!(key, "Replaying completed result");
                Ok(Idempotent::replayed(value))
            }
            Claim::Await(mut rx) => {
                debug!(key, "Awaiting in-flight operation");
                let outcome = match rx.wait_for(Option::is_some).await {
                    Ok(outcome) => (*outcome).clone(),
                    Err(_) => None,
                };
                match outcome {
                    Some(result) => result.map(Idempotent::replayed),
                    None => Err(WorkflowError::InFlightAbandoned {
                        key: key.to_string(),
                    }),
                }
            }
            Claim::Lead(tx) => {
                let mut guard = PendingGuard {
                    slots: &self.slots,
                    key,
                    armed: true,
                };
                let result = work().await;
                {
                    let mut slots = self.lock();
                    match &result {
                        Ok(value) => {
                            slots.insert(
                                key.to_string(),
                                Slot::Done {
                                    value: value.clone(),
                                    completed_at: Instant::now(),
                                },
                            );
                        }
                        Err(err) => {
                            debug!(key, "Operation failed, not caching: {}", err);
                            slots.remove(key);
                        }
                    }
                }
                guard.armed = false;
                tx.send_replace(Some(result.clone()));
                result.map(Idempotent::fresh)
            }
        }
    }

    /// Completed result for `key`, if retained.
    pub fn get(&self, key: &str) -> Option<T> {
        match self.lock().get(key) {
            Some(Slot::Done {
                value,
                completed_at,
            }) if self.is_live(*completed_at) => Some(value.clone()),
            _ => None,
        }
    }

    /// Whether `key` is pending or has a retained result.
    pub fn contains(&self, key: &str) -> bool {
        match self.lock().get(key) {
            Some(Slot::Pending(_)) => true,
            Some(Slot::Done { completed_at, .. }) => self.is_live(*completed_at),
            None => false,
        }
    }

    /// Forgets a completed result. Pending operations are left alone.
    pub fn delete(&self, key: &str) -> bool {
        let mut slots = self.lock();
        if matches!(slots.get(key), Some(Slot::Done { .. })) {
            slots.remove(key);
            return true;
        }
        false
    }

    /// Drops every completed result and evicts expired ones.
    pub fn clear(&self) {
        self.lock()
            .retain(|_, slot| matches!(slot, Slot::Pending(_)));
    }

    pub fn stats(&self) -> CoordinatorStats {
        let slots = self.lock();
        let pending = slots
            .values()
            .filter(|slot| matches!(slot, Slot::Pending(_)))
            .count();
        let completed = slots
            .values()
            .filter(|slot| matches!(slot, Slot::Done { completed_at, .. } if self.is_live(*completed_at)))
            .count();
        CoordinatorStats { completed, pending }
    }
}

/// Removes the pending entry if the leader is dropped before finishing.
struct PendingGuard<'a, T> {
    slots: &'a Mutex<HashMap<String, Slot<T>>>,
    key: &'a str,
    armed: bool,
}

impl<T> Drop for PendingGuard<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(key = self.key, "In-flight operation dropped before completion");
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(slots.get(self.key), Some(Slot::Pending(_))) {
            slots.remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let coordinator = IdempotencyCoordinator::<u32>::default();
        let executions = Arc::new(AtomicU32::new(0));

        let calls = (0..10).map(|_| {
            let coordinator = coordinator.clone();
            let executions = executions.clone();
            async move {
                coordinator
                    .set_if_absent("k1", || async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(executions.fetch_add(1, Ordering::SeqCst) + 41)
                    })
                    .await
            }
        });
        let results = join_all(calls).await;

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        let results: Vec<_> = results.into_iter().map(Result::unwrap).collect();
        assert!(results.iter().all(|r| r.data == 41));
        assert_eq!(results.iter().filter(|r| !r.is_cached).count(), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let coordinator = IdempotencyCoordinator::<u32>::default();

        let err = coordinator
            .set_if_absent("k1", || async { Err(WorkflowError::validation("nope")) })
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { .. }));
        assert!(!coordinator.contains("k1"));

        let retried = coordinator
            .set_if_absent("k1", || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(retried, Idempotent::fresh(7));
    }

    #[tokio::test]
    async fn waiters_receive_the_leader_error() {
        let coordinator = IdempotencyCoordinator::<u32>::default();
        let executions = Arc::new(AtomicU32::new(0));

        let calls = (0..3).map(|_| {
            let coordinator = coordinator.clone();
            let executions = executions.clone();
            async move {
                coordinator
                    .set_if_absent("k1", || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err::<u32, _>(WorkflowError::permission_denied("role"))
                    })
                    .await
            }
        });

        for result in join_all(calls).await {
            assert!(matches!(result, Err(WorkflowError::PermissionDenied { .. })));
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_results_expire_after_retention() {
        let coordinator = IdempotencyCoordinator::<u32>::new(Some(Duration::from_secs(60)));
        coordinator.set_if_absent("k1", || async { Ok(1) }).await.unwrap();

        let replay = coordinator.set_if_absent("k1", || async { Ok(2) }).await.unwrap();
        assert_eq!(replay, Idempotent::replayed(1));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(coordinator.get("k1"), None);
        let rerun = coordinator.set_if_absent("k1", || async { Ok(2) }).await.unwrap();
        assert_eq!(rerun, Idempotent::fresh(2));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_results_are_swept_on_new_keys() {
        let coordinator = IdempotencyCoordinator::<u32>::new(Some(Duration::from_secs(60)));
        for i in 0..1000u32 {
            coordinator
                .set_if_absent(&format!("key-{i}"), || async move { Ok(i) })
                .await
                .unwrap();
        }
        assert_eq!(coordinator.lock().len(), 1000);

        tokio::time::advance(Duration::from_secs(3600)).await;
        coordinator.set_if_absent("fresh", || async { Ok(1) }).await.unwrap();

        assert_eq!(coordinator.stats().completed, 1);
        assert_eq!(coordinator.lock().len(), 1);
    }

    #[tokio::test]
    async fn abandoned_leader_releases_waiters() {
        let coordinator = IdempotencyCoordinator::<u32>::default();

        let leader = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .set_if_absent("k1", || std::future::pending::<Result<u32, WorkflowError>>())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coordinator.stats().pending, 1);

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.set_if_absent("k1", || async { Ok(5) }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.abort();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(WorkflowError::InFlightAbandoned { .. })));
        assert!(!coordinator.contains("k1"));
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let coordinator = IdempotencyCoordinator::<u32>::default();
        coordinator.set_if_absent("a", || async { Ok(1) }).await.unwrap();
        coordinator.set_if_absent("b", || async { Ok(2) }).await.unwrap();
        assert_eq!(coordinator.stats(), CoordinatorStats { completed: 2, pending: 0 });

        assert!(coordinator.delete("a"));
        assert!(!coordinator.delete("a"));
        coordinator.clear();
        assert_eq!(coordinator.stats().completed, 0);
    }
}
