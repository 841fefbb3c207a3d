//! Gantry operator CLI entrypoint.

use clap::Parser;
use std::path::PathBuf;

mod commands;
mod config;
mod handlers;
mod logging;
mod permissions;

use commands::{AgentCommands, Commands, EventCommands, TaskCommands};
use config::CliConfig;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(author, version, about = "Gantry build control command-line interface", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./gantry.yaml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref())?;
    logging::init(config.log_format);

    match cli.command {
        Commands::Migrate => handlers::migrate(&config).await?,
        Commands::Task { command } => match command {
            TaskCommands::Retry(target) => handlers::retry_task(&config, target, false).await?,
            TaskCommands::Skip(target) => handlers::retry_task(&config, target, true).await?,
        },
        Commands::Agent { command } => match command {
            AgentCommands::Generate {
                project,
                user,
                os,
                zone,
            } => handlers::generate_agent(&config, project, user, os, zone).await?,
            AgentCommands::Import {
                project,
                user,
                agent,
            } => handlers::import_agent(&config, project, user, agent).await?,
            AgentCommands::Delete {
                project,
                user,
                node,
            } => handlers::delete_agent(&config, project, user, node).await?,
            AgentCommands::UpgradeCheck {
                project,
                agent,
                secret,
                tag,
            } => handlers::upgrade_check(&config, project, agent, secret, tag).await?,
            AgentCommands::CheckLiveness { project, agent } => {
                handlers::check_liveness(&config, project, agent).await?
            }
        },
        Commands::Events { command } => match command {
            EventCommands::Watch { pattern } => handlers::watch_events(&config, &pattern).await?,
        },
        Commands::Config => handlers::show_config(&config)?,
    }

    Ok(())
}
