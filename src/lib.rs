// proposal-flow - multi-party approval workflows for research proposals
// This exposes the core components for embedding and testing

pub mod audit;
pub mod calendar;
pub mod config;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod observability;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod workflow;

// Re-export key types for easy access
pub use audit::{AuditDispatcher, AuditEvent, AuditSink, MemoryAuditSink, RetryingAuditSink, TracingAuditSink};
pub use calendar::{BusinessCalendar, Clock, DeadlineCalculator, ManualClock, SystemClock};
pub use config::{config, init_config, WorkflowConfig};
pub use engine::{HealthReport, NewProposal, WorkflowEngine};
pub use error::{StoreError, WorkflowError};
pub use idempotency::{IdempotencyCoordinator, ResponseCache};
pub use observability::{workflow_metrics, OperationTimer, WorkflowMetrics};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
pub use store::{MemoryStore, ProposalStore, TransactionOrchestrator};
#[cfg(feature = "database")]
pub use store::SqliteStore;
pub use telemetry::{create_transition_span, generate_correlation_id, init_telemetry, shutdown_telemetry};
pub use workflow::{
    Actor, Idempotent, Proposal, ProposalState, Role, TransitionContext, TransitionOutcome,
    WorkflowAction, WorkflowActions, WorkflowLogEntry,
};
