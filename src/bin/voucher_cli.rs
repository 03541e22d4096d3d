use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use engage_vouchers::{
    config::{self, AppConfig},
    db,
    events::{self, EventSender},
    notifications::NotificationHub,
    AppState,
};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "voucher-cli", about = "Operate the Engage voucher pipeline", version)]
struct Cli {
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Retry one failed order by id or external order id
    Recover {
        order: String,
    },
    /// Sweep every failed order that still has attempts left
    RecoverAll,
    /// Check that Amilon accepts the configured credentials
    AmilonCheck,
    /// Pull retailers and products from Amilon into the local catalogue
    SyncCatalog,
}

#[derive(Serialize)]
struct RecoverOutput {
    order_id: Uuid,
    external_order_id: String,
    status: String,
    recovery_attempts: i32,
    last_error: Option<String>,
}

#[derive(Serialize)]
struct AmilonCheckOutput {
    provider: &'static str,
    api_version: &'static str,
    healthy: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config().context("failed to load configuration")?;
    config::init_tracing(cfg.log_level(), cfg.log_json);

    let state = build_state(cfg).await?;

    match cli.command {
        Commands::Recover { order } => recover_one(&state, &order, cli.json).await?,
        Commands::RecoverAll => recover_all(&state, cli.json).await?,
        Commands::AmilonCheck => amilon_check(&state, cli.json).await?,
        Commands::SyncCatalog => sync_catalog(&state, cli.json).await?,
    }

    Ok(())
}

async fn build_state(cfg: AppConfig) -> Result<AppState> {
    let pool = db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to the database")?;
    if cfg.auto_migrate {
        db::run_migrations(&pool)
            .await
            .context("failed to run migrations")?;
    }

    let (tx, rx) = mpsc::channel(cfg.event_channel_capacity);
    tokio::spawn(events::process_events(rx));

    let notifications = NotificationHub::new(cfg.notification_channel_capacity);
    Ok(AppState::new(
        Arc::new(pool),
        cfg,
        EventSender::new(tx),
        notifications,
    ))
}

async fn recover_one(state: &AppState, identifier: &str, json: bool) -> Result<()> {
    let order = state
        .services
        .recovery
        .recover_for_user(identifier, Uuid::nil(), true)
        .await
        .with_context(|| format!("failed to recover order {identifier}"))?;

    let output = RecoverOutput {
        order_id: order.id,
        external_order_id: order.external_order_id,
        status: order.status.to_string(),
        recovery_attempts: order.recovery_attempts,
        last_error: order.last_error,
    };

    if json {
        print_json(&output)?;
    } else {
        println!(
            "{} ({}) -> {} after {} attempt(s)",
            output.order_id, output.external_order_id, output.status, output.recovery_attempts
        );
        if let Some(error) = &output.last_error {
            println!("last error: {error}");
        }
    }
    Ok(())
}

async fn recover_all(state: &AppState, json: bool) -> Result<()> {
    let summary = state
        .services
        .recovery
        .recover_all()
        .await
        .context("recovery sweep failed")?;

    if json {
        print_json(&summary)?;
    } else {
        println!(
            "processed {}, recovered {}, still failing {}, cancelled {}",
            summary.processed, summary.recovered, summary.failed, summary.cancelled
        );
    }
    Ok(())
}

async fn amilon_check(state: &AppState, json: bool) -> Result<()> {
    let orders = &state.services.amilon_orders;
    let output = AmilonCheckOutput {
        provider: orders.provider_name(),
        api_version: orders.api_version(),
        healthy: orders.is_healthy().await,
    };

    if json {
        print_json(&output)?;
    } else if output.healthy {
        println!("{} {}: credentials accepted", output.provider, output.api_version);
    } else {
        println!("{} {}: unable to obtain an access token", output.provider, output.api_version);
    }

    if !output.healthy {
        anyhow::bail!("Amilon health check failed");
    }
    Ok(())
}

async fn sync_catalog(state: &AppState, json: bool) -> Result<()> {
    let summary = state
        .services
        .catalog
        .sync()
        .await
        .context("catalogue sync failed")?;

    if json {
        print_json(&summary)?;
    } else {
        println!(
            "synced {} merchant(s), {} product(s)",
            summary.merchants, summary.products
        );
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
