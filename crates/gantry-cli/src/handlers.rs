//! Command handlers.

use crate::commands::{OsArg, TaskTarget};
use crate::config::CliConfig;
use crate::permissions::StaticPermissions;
use anyhow::{bail, Context, Result};
use console::style;
use futures::StreamExt;
use gantry_cache::NatsKv;
use gantry_core::ids::{AgentId, BuildId, NodeId, ProjectId};
use gantry_db::Database;
use gantry_engine::{
    AgentLifecycleManager, ContainerLocks, LocalPackageSource, RetryCoordinator, RetryRequest,
};
use gantry_nats::NatsEventBus;
use std::sync::Arc;
use tracing::info;

/// Connected adapters shared by the handlers.
struct Services {
    db: Database,
    bus: Arc<NatsEventBus>,
    cache: Arc<NatsKv>,
}

impl Services {
    async fn connect(config: &CliConfig) -> Result<Self> {
        let db = Database::connect(&config.database_url, config.max_connections)
            .await
            .context("Failed to connect to PostgreSQL")?;
        let bus = NatsEventBus::connect_with_config(config.nats())
            .await
            .context("Failed to connect to NATS")?;
        let cache = NatsKv::open(bus.jetstream(), &config.kv_bucket)
            .await
            .context("Failed to open KV bucket")?;
        Ok(Self {
            db,
            bus: Arc::new(bus),
            cache: Arc::new(cache),
        })
    }

    fn agent_manager(&self, config: &CliConfig) -> Result<AgentLifecycleManager> {
        Ok(AgentLifecycleManager::new(
            Arc::new(self.db.agents()),
            self.cache.clone(),
            Arc::new(StaticPermissions::new(config.operators.clone())),
            self.bus.clone(),
            Arc::new(LocalPackageSource::new(
                &config.packages.dir,
                &config.packages.agent_version,
                &config.packages.worker_version,
            )),
            config.cipher()?,
            config.engine.agents.clone(),
        ))
    }
}

pub async fn migrate(config: &CliConfig) -> Result<()> {
    let db = Database::connect(&config.database_url, 1)
        .await
        .context("Failed to connect to PostgreSQL")?;
    db.migrate().await.context("Migration failed")?;
    println!("{} Database is up to date", style("✓").green());
    Ok(())
}

pub async fn retry_task(config: &CliConfig, target: TaskTarget, skip: bool) -> Result<()> {
    let build_id: BuildId = target.build.parse().context("Invalid build ID")?;
    let services = Services::connect(config).await?;
    let coordinator = RetryCoordinator::new(
        Arc::new(services.db.build_records()),
        Arc::new(StaticPermissions::new(config.operators.clone())),
        services.bus.clone(),
        ContainerLocks::new(services.cache.clone(), &config.engine.retry),
    );

    let request = RetryRequest {
        project_id: ProjectId::new(target.project),
        build_id,
        task_id: target.task,
        execute_count: target.execute_count,
        skip,
        user_id: target.user,
    };
    let Some(outcome) = coordinator.retry(&request).await? else {
        bail!("Task {} not found in build {}", request.task_id, build_id);
    };

    let verb = if outcome.skipped { "Skipped" } else { "Retrying" };
    println!(
        "{} {} task {} (attempt {})",
        style("✓").green(),
        verb,
        outcome.task_id,
        outcome.execute_count
    );
    if skip && !outcome.skipped {
        println!(
            "{} {} may not skip this task, it was retried instead",
            style("!").yellow(),
            request.user_id
        );
    }
    Ok(())
}

pub async fn generate_agent(
    config: &CliConfig,
    project: String,
    user: String,
    os: OsArg,
    zone: Option<String>,
) -> Result<()> {
    let services = Services::connect(config).await?;
    let manager = services.agent_manager(config)?;
    let link = manager
        .generate_agent(&user, &ProjectId::new(project), os.into(), zone.as_deref())
        .await?;
    println!("{} Agent {}", style("✓").green(), link.agent_id);
    println!("{}", link.link);
    Ok(())
}

pub async fn import_agent(config: &CliConfig, project: String, user: String, agent: String) -> Result<()> {
    let agent_id: AgentId = agent.parse().context("Invalid agent ID")?;
    let services = Services::connect(config).await?;
    let node = services
        .agent_manager(config)?
        .import_agent(&user, &ProjectId::new(project), agent_id)
        .await?;
    println!(
        "{} Imported as node {} ({}, {})",
        style("✓").green(),
        node.node_string_id,
        node.id,
        node.ip
    );
    Ok(())
}

pub async fn delete_agent(config: &CliConfig, project: String, user: String, node: String) -> Result<()> {
    let node_id: NodeId = node.parse().context("Invalid node ID")?;
    let services = Services::connect(config).await?;
    services
        .agent_manager(config)?
        .delete_agent(&user, &ProjectId::new(project), node_id)
        .await?;
    println!("{} Node {} deleted", style("✓").green(), node_id);
    Ok(())
}

pub async fn upgrade_check(
    config: &CliConfig,
    project: String,
    agent: String,
    secret: String,
    tag: String,
) -> Result<()> {
    let agent_id: AgentId = agent.parse().context("Invalid agent ID")?;
    let services = Services::connect(config).await?;
    let check = services
        .agent_manager(config)?
        .check_upgrade(&ProjectId::new(project), agent_id, &secret, &tag)
        .await?;
    println!(
        "{}",
        serde_json::json!({ "status": check.status.as_str(), "upgrade": check.upgrade })
    );
    Ok(())
}

pub async fn check_liveness(config: &CliConfig, project: String, agent: String) -> Result<()> {
    let agent_id: AgentId = agent.parse().context("Invalid agent ID")?;
    let services = Services::connect(config).await?;
    let status = services
        .agent_manager(config)?
        .check_liveness(&ProjectId::new(project), agent_id)
        .await?;
    println!("{status}");
    Ok(())
}

pub async fn watch_events(config: &CliConfig, pattern: &str) -> Result<()> {
    let bus = NatsEventBus::connect_with_config(config.nats())
        .await
        .context("Failed to connect to NATS")?;
    let mut events = gantry_core::ports::EventBus::subscribe(&bus, pattern).await?;
    info!(pattern, "Watching events");

    while let Some(event) = events.next().await {
        match event {
            Ok(event) => println!("{} {}", style(event.subject()).cyan(), serde_json::to_string(&event)?),
            Err(e) => eprintln!("{} {e}", style("!").yellow()),
        }
    }
    Ok(())
}

pub fn show_config(config: &CliConfig) -> Result<()> {
    print!("{}", config.to_redacted_yaml()?);
    Ok(())
}
