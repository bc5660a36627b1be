mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use slot_saga::config::SlotSagaConfig;
use slot_saga::events::TracingEventSink;
use slot_saga::saga::{SagaCoordinator, SagaResult, ScheduleItem};
use slot_saga::state_machine::{InMemoryRotationStore, JsonFileRotationStore, RotationStore};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "slot_saga=debug" } else { "slot_saga=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => SlotSagaConfig::load_from(path)?,
        None => SlotSagaConfig::load()?,
    };
    if let Some(ms) = cli.step_timeout_ms {
        config.saga.step_timeout_ms = ms;
    }

    match cli.command {
        Command::Run { creator, file } => run(config, &creator, &file).await,
        Command::Demo => demo(config).await,
    }
}

async fn run(config: SlotSagaConfig, creator: &str, file: &Path) -> Result<()> {
    let items = ScheduleItem::load_list(file)
        .with_context(|| format!("failed to load schedule items from {}", file.display()))?;

    let store: Arc<dyn RotationStore> = Arc::new(JsonFileRotationStore::new(config.store_path()));
    let coordinator = build_coordinator(config, store)?;
    let result = coordinator.execute(creator, items).await;
    print_result(&result)
}

async fn demo(config: SlotSagaConfig) -> Result<()> {
    let coordinator = build_coordinator(config, Arc::new(InMemoryRotationStore::new()))?;
    let day = Utc::now().date_naive();
    let items = demo_schedule(day)?;

    info!(%day, items = items.len(), "running demo schedule");
    let first = coordinator.execute("demo-creator", items.clone()).await;
    print_result(&first)?;

    info!("running the identical request again");
    let second = coordinator.execute("demo-creator", items).await;
    print_result(&second)?;

    println!("{}", serde_json::to_string_pretty(&coordinator.breakers().stats())?);
    Ok(())
}

fn build_coordinator(config: SlotSagaConfig, store: Arc<dyn RotationStore>) -> Result<SagaCoordinator> {
    let validator = Arc::new(config.structural_validator()?);
    SagaCoordinator::new(config, store, validator, Arc::new(TracingEventSink))
}

fn demo_schedule(day: NaiveDate) -> Result<Vec<ScheduleItem>> {
    let at = |h, m| {
        day.and_hms_opt(h, m, 0)
            .with_context(|| format!("invalid demo time {h:02}:{m:02}"))
    };
    Ok(vec![
        ScheduleItem::ppv("morning-ppv", at(10, 0)?),
        ScheduleItem::new("lunch-text", at(13, 0)?, "text"),
        ScheduleItem::ppv("evening-ppv", at(19, 30)?),
        ScheduleItem::ppv("late-ppv", at(22, 15)?),
    ])
}

fn print_result(result: &SagaResult) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(())
}
