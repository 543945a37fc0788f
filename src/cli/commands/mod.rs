use anyhow::Result;
use proposal_flow::config::{config, WorkflowConfig};

pub mod deadline;
pub mod demo;
pub mod doctor;
pub mod edges;
pub mod holder;

#[allow(async_fn_in_trait)]
pub trait Command {
    async fn execute(&self) -> Result<()>;
}

/// Owned copy of the global configuration.
pub fn load_config() -> Result<WorkflowConfig> {
    Ok(config()?.clone())
}

pub async fn show_how_to_get_started() -> Result<()> {
    println!("📑 proposal-flow - research proposal approval workflows");
    println!();
    println!("To get started:");
    println!("  🧭 proposal-flow edges      # List legal transitions");
    println!("  ⏰ proposal-flow deadline   # Compute an SLA deadline");
    println!("  🏷️  proposal-flow holder     # See who holds a proposal in a state");
    println!("  🩺 proposal-flow doctor     # Check configuration and storage");
    println!("  🎬 proposal-flow demo       # Walk a sample proposal through review");
    println!();
    println!("💡 Start with 'proposal-flow demo' to see a full review round trip!");
    Ok(())
}
