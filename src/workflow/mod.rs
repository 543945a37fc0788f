//! Proposal workflow: states, the edge table, holder rules, validation and
//! the transition engine.

pub mod actions;
pub mod executor;
pub mod holder;
pub mod registry;
pub mod types;
pub mod validator;

pub use actions::{ReturnDetails, WorkflowActions};
pub use executor::{
    ExecutorSettings, PauseRequest, ResubmitRequest, ReturnRequest, SlaPolicy, SlaSettings,
    TransitionExecutor, TransitionOptions,
};
pub use holder::{HolderAssignment, HolderResolver};
pub use registry::Transition;
pub use types::{
    Actor, Idempotent, Proposal, ProposalState, RejectReasonCode, ReturnReasonCode, Role,
    TransitionContext, TransitionOutcome, WorkflowAction, WorkflowLogEntry,
};
pub use validator::WorkflowValidator;
