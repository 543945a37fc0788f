use serde::Serialize;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::engine::WorkflowEngine;
use crate::observability::workflow_metrics;

/// What a graceful shutdown left behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub abandoned_audit_records: usize,
    pub store_closed: bool,
}

/// Graceful shutdown coordinator for the workflow engine
pub struct ShutdownCoordinator<'a> {
    engine: &'a WorkflowEngine,
    close_timeout: Duration,
}

impl<'a> ShutdownCoordinator<'a> {
    pub fn new(engine: &'a WorkflowEngine) -> Self {
        Self {
            engine,
            close_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    /// Perform graceful shutdown operations
    pub async fn shutdown_all_services(self) -> ShutdownReport {
        info!("Initiating graceful shutdown of the workflow engine...");

        // Audit records are queued after commit; give them a chance to land.
        let abandoned_audit_records = self.engine.audit().drain().await;
        if abandoned_audit_records > 0 {
            warn!(
                abandoned_audit_records,
                "Some audit records were not written before shutdown"
            );
        } else {
            info!("Audit queue drained");
        }

        self.engine.executor().coordinator().clear();
        self.engine.responses().clear().await;
        info!("Idempotency caches cleared");

        // Log final counters
        workflow_metrics().log_stats();

        let store_closed = timeout(self.close_timeout, self.engine.store().close())
            .await
            .is_ok();
        if !store_closed {
            warn!("Timeout waiting for the store to close");
        }

        info!("Graceful shutdown completed");
        ShutdownReport {
            abandoned_audit_records,
            store_closed,
        }
    }
}
