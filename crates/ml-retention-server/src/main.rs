//! ML retention server
//!
//! Runs the retention scheduler against Postgres and exposes the ops HTTP
//! surface. One-off commands run or seed policies and exit.

mod config;
mod error;
mod routes;
mod server;
mod state;

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::server::start_server;
use crate::state::AppState;
use clap::{Parser, Subcommand};
use ml_retention::{CacheEngine, EngineConfig};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "ml-retention-server", about = "ML cache retention service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the ops API and run the retention scheduler (default)
    Serve {
        /// Keep every tier in process memory instead of Postgres
        #[arg(long)]
        in_memory: bool,
    },
    /// Run every enabled policy once and exit
    RunPolicies {
        /// Only count candidates
        #[arg(long)]
        dry_run: bool,
    },
    /// Install the default policy set and exit
    SeedPolicies,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::from_env();

    let env_filter = EnvFilter::from_default_env()
        .add_directive("ml_retention=info".parse()?)
        .add_directive("ml_retention_server=info".parse()?);

    // JSON output for Cloud Logging when LOG_FORMAT=json
    if config.log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    let engine_config = EngineConfig::from_env();

    match cli.command.unwrap_or(Command::Serve { in_memory: false }) {
        Command::Serve { in_memory } => serve(config, engine_config, in_memory).await,
        Command::RunPolicies { dry_run } => {
            let engine = connect(&config, engine_config).await?;
            run_policies(&engine, dry_run).await
        }
        Command::SeedPolicies => {
            let engine = connect(&config, engine_config).await?;
            let inserted = engine.retention().seed_defaults().await?;
            info!(inserted, "Default policies seeded");
            Ok(())
        }
    }
}

/// Connect, migrate, and build a Postgres-backed engine
async fn connect(config: &ServerConfig, engine_config: EngineConfig) -> Result<CacheEngine> {
    let database_url = config.database_url.as_deref().ok_or_else(|| {
        ServerError::Config("DATABASE_URL or DB_HOST environment variable is required".to_string())
    })?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(engine_config.storage_timeout)
        .connect(database_url)
        .await?;
    ml_retention_db::migrate::migrate(&pool).await?;

    Ok(CacheEngine::postgres(pool, engine_config))
}

async fn serve(config: ServerConfig, engine_config: EngineConfig, in_memory: bool) -> Result<()> {
    let engine = if in_memory {
        warn!("Running with in-memory tiers; nothing survives a restart");
        CacheEngine::in_memory(engine_config)
    } else {
        connect(&config, engine_config).await?
    };
    let engine = Arc::new(engine);

    engine.retention().seed_defaults().await?;
    let scheduler = engine.start_scheduler();

    info!(port = config.port, in_memory, "Starting ml-retention-server");
    let served = start_server(
        AppState {
            engine: engine.clone(),
        },
        config.port,
        &config.cors_origins,
        shutdown_signal(),
    )
    .await;

    scheduler.shutdown().await;
    served?;
    info!("Shut down cleanly");
    Ok(())
}

async fn run_policies(engine: &CacheEngine, dry_run: bool) -> Result<()> {
    let policies = engine.retention().list_policies().await?;
    let mut failed = 0;

    for policy in policies.iter().filter(|p| p.enabled) {
        match engine
            .retention()
            .run_policy(&policy.policy_id, dry_run)
            .await
        {
            Ok(execution) => info!(
                policy_id = %execution.policy_id,
                matched = execution.records_matched,
                evicted = execution.records_affected,
                space_freed_mb = execution.space_freed_mb,
                dry_run,
                "Policy run"
            ),
            Err(e) => {
                failed += 1;
                error!(policy_id = %policy.policy_id, error = %e, "Policy run failed");
            }
        }
    }

    if let Err(e) = engine.metrics().flush().await {
        warn!(error = %e, "Metrics flush failed");
    }
    info!(failed, "Policy run complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
