use anyhow::Result;
use chrono::Utc;
use proposal_flow::workflow::{HolderResolver, Proposal, ProposalState};

use super::{load_config, Command};

pub struct HolderCommand {
    pub state: ProposalState,
    pub faculty: String,
    pub owner: String,
    pub actor: Option<String>,
    pub actor_unit: Option<String>,
}

impl Command for HolderCommand {
    async fn execute(&self) -> Result<()> {
        let config = load_config()?;
        let resolver = HolderResolver::new(config.central_office_unit);
        let proposal = Proposal::draft(
            "preview",
            "PREVIEW",
            "Holder preview",
            self.owner.as_str(),
            self.faculty.as_str(),
            Utc::now(),
        );

        let holder = resolver.resolve(
            self.state,
            &proposal,
            self.actor.as_deref(),
            self.actor_unit.as_deref(),
        );
        let label =
            resolver.display_label(holder.holder_unit.as_deref(), holder.holder_user.as_deref());

        println!("🏷️  HOLDER ON ENTERING {}:", self.state);
        println!("   Unit:  {}", holder.holder_unit.as_deref().unwrap_or("-"));
        println!("   User:  {}", holder.holder_user.as_deref().unwrap_or("-"));
        println!("   Label: {label}");
        if self.state == ProposalState::OutlineCouncilReview {
            println!("   💡 Council review keeps the holder set by the assigning action");
        }
        Ok(())
    }
}
