use anyhow::Result;
use clap::Parser;
use proposal_flow::config::WorkflowConfig;
use proposal_flow::telemetry::{init_telemetry, shutdown_telemetry};

mod cli;

use cli::commands::deadline::DeadlineCommand;
use cli::commands::demo::DemoCommand;
use cli::commands::doctor::DoctorCommand;
use cli::commands::edges::EdgesCommand;
use cli::commands::holder::HolderCommand;
use cli::commands::{show_how_to_get_started, Command};
use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load .env before anything reads PROPOSAL_FLOW__* variables
    let _ = WorkflowConfig::load_env_file();
    let observability = proposal_flow::config::config()
        .map(|c| c.observability.clone())
        .unwrap_or_default();
    init_telemetry(&observability)?;

    let result = tokio::runtime::Runtime::new()?.block_on(async {
        match cli.command {
            // Default behavior: no subcommand - explain the available commands
            None => show_how_to_get_started().await,
            Some(Commands::Edges {
                from,
                action,
                format,
            }) => EdgesCommand { from, action, format }.execute().await,
            Some(Commands::Deadline { start, days, cutoff }) => {
                DeadlineCommand { start, days, cutoff }.execute().await
            }
            Some(Commands::Holder {
                state,
                faculty,
                owner,
                actor,
                actor_unit,
            }) => {
                HolderCommand {
                    state,
                    faculty,
                    owner,
                    actor,
                    actor_unit,
                }
                .execute()
                .await
            }
            Some(Commands::Doctor { format }) => DoctorCommand { format }.execute().await,
            Some(Commands::Demo) => DemoCommand.execute().await,
        }
    });

    shutdown_telemetry();
    result
}
