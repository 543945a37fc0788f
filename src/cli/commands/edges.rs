use anyhow::Result;
use proposal_flow::workflow::registry::{self, Transition};
use proposal_flow::workflow::{ProposalState, WorkflowAction};
use serde::Serialize;

use super::Command;
use crate::cli::OutputFormat;

pub struct EdgesCommand {
    pub from: Option<ProposalState>,
    pub action: Option<WorkflowAction>,
    pub format: OutputFormat,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EdgeView {
    from: ProposalState,
    action: WorkflowAction,
    to: ProposalState,
    allowed_roles: Option<Vec<String>>,
}

impl From<&Transition> for EdgeView {
    fn from(t: &Transition) -> Self {
        Self {
            from: t.from,
            action: t.action,
            to: t.to,
            allowed_roles: t
                .allowed_roles
                .map(|roles| roles.iter().map(|r| r.as_str().to_string()).collect()),
        }
    }
}

impl EdgesCommand {
    fn matching(&self) -> Vec<&'static Transition> {
        registry::transitions()
            .iter()
            .filter(|t| self.from.map_or(true, |from| t.from == from))
            .filter(|t| self.action.map_or(true, |action| t.action == action))
            .collect()
    }
}

impl Command for EdgesCommand {
    async fn execute(&self) -> Result<()> {
        let edges = self.matching();

        if self.format == OutputFormat::Json {
            let views: Vec<EdgeView> = edges.iter().map(|t| EdgeView::from(*t)).collect();
            println!("{}", serde_json::to_string_pretty(&views)?);
            return Ok(());
        }

        if edges.is_empty() {
            println!("📋 No edges match the given filters");
            return Ok(());
        }

        println!("🧭 WORKFLOW EDGES ({}):", edges.len());
        for t in &edges {
            let roles = match t.allowed_roles {
                Some(roles) => roles
                    .iter()
                    .map(|r| r.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                None => "any role".to_string(),
            };
            println!("   {} --{}--> {}   [{}]", t.from, t.action, t.to, roles);
        }
        Ok(())
    }
}
