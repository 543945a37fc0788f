use clap::{Parser, Subcommand, ValueEnum};
use chrono::{DateTime, Utc};
use proposal_flow::workflow::{ProposalState, WorkflowAction};

pub mod commands;

#[derive(Parser)]
#[command(name = "proposal-flow")]
#[command(about = "Multi-party approval workflow engine for research proposals")]
#[command(long_about = "proposal-flow moves research proposals through faculty, school and council review \
                       with idempotent transitions, business-day SLA deadlines and an append-only audit trail. \
                       Start with 'proposal-flow demo' to watch a proposal travel through review.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the legal workflow edges
    Edges {
        /// Only edges leaving this state
        #[arg(long, help = "Filter by source state, e.g. FACULTY_REVIEW")]
        from: Option<ProposalState>,
        /// Only edges taken by this action
        #[arg(long, help = "Filter by action, e.g. APPROVE")]
        action: Option<WorkflowAction>,
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Compute an SLA deadline in business days
    Deadline {
        /// Start of the review window (RFC 3339); defaults to now
        #[arg(long, help = "Window start, e.g. 2024-01-04T10:00:00+07:00")]
        start: Option<DateTime<Utc>>,
        /// Business days in the window; defaults to the configured value
        #[arg(long)]
        days: Option<u32>,
        /// Local cutoff hour; defaults to the configured value
        #[arg(long)]
        cutoff: Option<u32>,
    },
    /// Show who would hold a proposal entering a state
    Holder {
        #[arg(long, help = "Target state, e.g. CHANGES_REQUESTED")]
        state: ProposalState,
        #[arg(long, help = "Faculty the proposal belongs to")]
        faculty: String,
        #[arg(long, help = "User id of the proposal owner")]
        owner: String,
        /// Acting user, used for terminal states
        #[arg(long)]
        actor: Option<String>,
        /// Acting user's unit, used for terminal states
        #[arg(long)]
        actor_unit: Option<String>,
    },
    /// Check configuration and store connectivity
    Doctor {
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Run a sample proposal through review and print its timeline as JSON
    Demo,
}
