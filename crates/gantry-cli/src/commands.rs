//! CLI command definitions.

use clap::{Args, Subcommand, ValueEnum};
use gantry_core::agent::Os;

#[derive(Subcommand)]
pub enum Commands {
    /// Apply database migrations
    Migrate,

    /// Retry or skip failed tasks
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Manage third-party build agents
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },

    /// Inspect the event stream
    Events {
        #[command(subcommand)]
        command: EventCommands,
    },

    /// Show the effective configuration
    Config,
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Run a failed or cancelled task again
    Retry(TaskTarget),

    /// Mark a failed task as skipped and let the job continue
    Skip(TaskTarget),
}

#[derive(Args)]
pub struct TaskTarget {
    #[arg(long)]
    pub project: String,

    /// Build ID
    #[arg(long)]
    pub build: String,

    /// Task ID or step ID
    #[arg(long)]
    pub task: String,

    /// Attempt being looked at
    #[arg(long, default_value_t = 1)]
    pub execute_count: u32,

    /// Acting user
    #[arg(long)]
    pub user: String,
}

#[derive(Subcommand)]
pub enum AgentCommands {
    /// Create an agent and print its install link
    Generate {
        #[arg(long)]
        project: String,

        #[arg(long)]
        user: String,

        #[arg(long, value_enum, default_value_t = OsArg::Linux)]
        os: OsArg,

        /// Zone whose gateway the agent talks to
        #[arg(long)]
        zone: Option<String>,
    },

    /// Import a reporting agent as a build node
    Import {
        #[arg(long)]
        project: String,

        #[arg(long)]
        user: String,

        /// Agent ID
        #[arg(long)]
        agent: String,
    },

    /// Delete a node and its agent
    Delete {
        #[arg(long)]
        project: String,

        #[arg(long)]
        user: String,

        /// Node ID
        #[arg(long)]
        node: String,
    },

    /// Check whether an agent should upgrade
    UpgradeCheck {
        #[arg(long)]
        project: String,

        #[arg(long)]
        agent: String,

        #[arg(long)]
        secret: String,

        /// Digest of the package the agent runs
        #[arg(long)]
        tag: String,
    },

    /// Mark an agent offline if its heartbeat expired
    CheckLiveness {
        #[arg(long)]
        project: String,

        #[arg(long)]
        agent: String,
    },
}

#[derive(Subcommand)]
pub enum EventCommands {
    /// Print events as they arrive
    Watch {
        /// Subject pattern
        #[arg(default_value = ">")]
        pattern: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OsArg {
    Linux,
    Macos,
    Windows,
}

impl From<OsArg> for Os {
    fn from(os: OsArg) -> Self {
        match os {
            OsArg::Linux => Os::Linux,
            OsArg::Macos => Os::Macos,
            OsArg::Windows => Os::Windows,
        }
    }
}
