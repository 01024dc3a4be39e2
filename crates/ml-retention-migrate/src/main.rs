//! Runs the retention schema migrations against `DATABASE_URL` and exits.

use sqlx::postgres::PgPoolOptions;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ml_retention_migrate=info,ml_retention_db=info"));

    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        error!("DATABASE_URL environment variable is required");
        return ExitCode::FAILURE;
    };

    let pool = match PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&database_url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return ExitCode::FAILURE;
        }
    };

    match ml_retention_db::migrate::migrate(&pool).await {
        Ok(()) => {
            info!("Migrations applied");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Migration failed");
            ExitCode::FAILURE
        }
    }
}
