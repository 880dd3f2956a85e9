//! tierstate demo runner
//!
//! Starts several pipelines over shared in-memory tiers and a shared
//! transport, then drives creates, saves, cross-process loads, replication
//! and eviction through them.
//!
//! ```text
//!   pipeline 0 ──save──▶ topic ──▶ pipeline 1..N   (resident copies merge)
//!        │                               │
//!        └────────▶ shared tiers ◀───────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use futures::future::try_join_all;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tierstate::adapters::{InMemoryBackingStore, InMemoryDistributedCache, InMemoryTransport};
use tierstate::config::{parse_duration, PipelineConfig, TypeSection};
use tierstate::{EntityType, Error, LoadStrategy, Pipeline, Result};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tierstate - tiered entity state across cooperating processes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file (a single `player` type is used when absent)
    #[arg(long, env = "TIERSTATE_CONFIG")]
    config: Option<PathBuf>,

    /// Number of cooperating pipelines to start
    #[arg(long, env = "TIERSTATE_PROCESSES", default_value = "2")]
    processes: usize,

    /// Entities to create in the first pipeline
    #[arg(long, env = "TIERSTATE_ENTITIES", default_value = "100")]
    entities: usize,

    /// Override the sweep interval (e.g. "30s", "5m")
    #[arg(long, env = "TIERSTATE_SWEEP_INTERVAL")]
    sweep_interval: Option<String>,

    /// Keep the pipelines running until Ctrl-C
    #[arg(long)]
    serve: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting tierstate");
    info!("  Processes: {}", args.processes);
    info!("  Entities: {}", args.entities);

    if args.processes == 0 {
        return Err(Error::Config("at least one process is required".to_string()));
    }

    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => default_config(),
    };
    if let Some(interval) = &args.sweep_interval {
        parse_duration(interval)?;
        config.process.sweep_interval = interval.clone();
    }
    let entity_type = config
        .types
        .first()
        .map(|t| EntityType::new(t.name.clone()))
        .ok_or_else(|| Error::Config("no entity types configured".to_string()))?;

    // Shared collaborators stand in for the network services
    let settings = config.process_settings()?;
    let backing = Arc::new(InMemoryBackingStore::new());
    let distributed = Arc::new(InMemoryDistributedCache::with_default_expiry(
        settings.distributed_default_expiry,
    ));
    let transport = Arc::new(InMemoryTransport::new());

    let mut pipelines = Vec::with_capacity(args.processes);
    for _ in 0..args.processes {
        let pipeline = tierstate::PipelineBuilder::from_config(&config)?
            .backing_store(backing.clone())
            .distributed_cache(distributed.clone())
            .transport(transport.clone())
            .build()
            .await?;
        pipeline.start_sweeper();
        pipelines.push(pipeline);
    }
    info!("Pipelines ready");

    if let Err(e) = run_demo(&pipelines, &entity_type, args.entities).await {
        error!("Demo failed: {}", e);
    }

    if args.serve {
        info!("Serving until Ctrl-C");
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
        }
    }

    for pipeline in &pipelines {
        pipeline.shutdown().await;
        match serde_json::to_string(&pipeline.metrics()) {
            Ok(metrics) => info!(sender_id = %pipeline.sender_id(), %metrics, "Final metrics"),
            Err(e) => warn!("Failed to encode metrics: {}", e),
        }
    }

    let stats = backing.stats();
    info!(
        objects = stats.object_count,
        reads = stats.reads,
        writes = stats.writes,
        "Backing store totals"
    );
    info!("tierstate shutdown complete");
    Ok(())
}

fn default_config() -> PipelineConfig {
    let mut player = TypeSection::new("player");
    player.ttl = Some("5m".to_string());
    PipelineConfig {
        types: vec![player],
        ..PipelineConfig::default()
    }
}

async fn run_demo(pipelines: &[Pipeline], entity_type: &EntityType, count: usize) -> Result<()> {
    let Some((writer, readers)) = pipelines.split_first() else {
        return Ok(());
    };

    // Create and save in the first process
    let started = Instant::now();
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let entity = writer.create(entity_type)?;
        entity.set("score", i as u64);
        writer.save_and_wait(&entity).await?;
        ids.push(entity.id());
    }
    info!(count, elapsed = ?started.elapsed(), "Created entities");

    // Load concurrently from every other process
    for reader in readers {
        let loads = ids
            .iter()
            .map(|id| reader.load(entity_type, *id, LoadStrategy::Pipeline, false));
        let loaded = try_join_all(loads).await?;
        let found = loaded.iter().filter(|e| e.is_some()).count();
        info!(sender_id = %reader.sender_id(), found, "Loaded entities");
    }

    // Update from the last process; residents elsewhere merge the change
    if let (Some(last), Some(first_id)) = (readers.last(), ids.first()) {
        if let Some(entity) = last
            .load(entity_type, *first_id, LoadStrategy::LocalOnly, false)
            .await?
        {
            entity.set("score", 1_000_000u64);
            last.save_and_wait(&entity).await?;
            let seen = writer
                .local()
                .get(entity_type, *first_id)
                .and_then(|e| e.get("score"));
            info!(entity_id = %first_id, ?seen, "Replicated update");
        }
    }

    // Force an eviction pass as if an hour had gone by
    for pipeline in pipelines {
        let report = pipeline
            .sweeper()
            .sweep_at(Instant::now() + std::time::Duration::from_secs(3600))
            .await;
        info!(
            sender_id = %pipeline.sender_id(),
            evicted = report.evicted,
            failed = report.failed,
            "Sweep"
        );
    }

    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
