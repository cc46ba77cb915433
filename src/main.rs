//! Resource Kit - Main entry point.
//!
//! Runs schema migrations and health checks against the configured resources.

use clap::Parser;
use resource_kit::config::{Cli, Command};
use resource_kit::{Cache, Context, Database, KitResult, Migrator};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

async fn migrate(ctx: &Context, cli: &Cli) -> KitResult<()> {
    let migrator = Migrator::connect(ctx, cli.migrator_config(), &cli.retry_config()).await?;

    let result = match cli.command {
        Command::Version => migrator.version(ctx).await.map(|(version, dirty)| {
            if dirty {
                println!("{} (dirty)", version);
            } else {
                println!("{}", version);
            }
        }),
        Command::Assert { version } => migrator.assert(ctx, version).await,
        Command::Apply { version } => migrator.apply(ctx, version).await,
        Command::Rollback { version } => migrator.rollback(ctx, version).await,
        Command::Health => Ok(()),
    };

    let closed = migrator.close(&Context::background()).await;
    result.and(closed)
}

async fn health(ctx: &Context, cli: &Cli) -> KitResult<()> {
    let retry = cli.retry_config();

    let database = Database::connect(ctx, cli.database_config(), &retry).await?;
    let mut result = database.health(ctx).await;
    if result.is_ok() {
        info!(database = %database.config().target(), "Database is healthy");
    }

    if let Some(config) = cli.cache_config() {
        match Cache::connect(ctx, config, &retry).await {
            Ok(cache) => {
                let checked = cache.health(ctx).await;
                if checked.is_ok() {
                    info!(cache = %cache.config().target(), "Cache is healthy");
                }
                result = result.and(checked);
                result = result.and(cache.close(&Context::background()).await);
            }
            Err(e) => result = result.and(Err(e)),
        }
    }

    result.and(database.close(&Context::background()).await)
}

#[tokio::main]
async fn main() {
    // Parse configuration from command line and environment
    let cli = Cli::parse();

    // Initialize logging
    init_tracing(&cli);

    info!(command = ?cli.command, "Starting resource-kit v{}", env!("CARGO_PKG_VERSION"));

    let ctx = Context::background().with_timeout(cli.timeout_duration());
    let result = match cli.command {
        Command::Health => health(&ctx, &cli).await,
        _ => migrate(&ctx, &cli).await,
    };

    if let Err(e) = result {
        error!(error = %e, kind = ?e.kind(), "Command failed");
        std::process::exit(1);
    }
}
