//! Order Sync Engine binary entry point.
//!
//! Loads `.env`, initializes tracing, builds the process-wide `EngineConfig`
//! once (spec.md §9 "Global state"), then dispatches to one of three modes:
//! a single-order sync, the batch runner over a marketplace date window, or
//! the long-running ERP projector worker pool. Grounded on the teacher's
//! `edge-server/src/main.rs` (`dotenvy::dotenv()`, logger init before
//! anything else logs, `tokio::select!` against `ctrl_c` for graceful
//! shutdown), generalized from one long-lived server to three CLI modes.

mod batch;
mod config;
mod decomposer;
mod eventlog;
mod marketplace;
mod notifier;
mod order;
mod orchestrator;
mod projector;
mod snapshot;
mod stream;
mod tracing_ctx;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use config::EngineConfig;
use eventlog::SqliteEventStore;
use marketplace::{DateWindow, HttpMarketplaceAdapter, MarketplaceAdapter};
use notifier::{LogNotifier, Notifier, Severity, WebhookNotifier};
use orchestrator::SyncOrchestrator;
use projector::{HttpErpAdapter, Projector, ProjectorConfig};
use shared::ids::OrderId;
use snapshot::{HybridStrategy, SnapshotStore};
use std::sync::Arc;
use std::time::Duration;
use stream::RedisHandoffStream;
use tokio_util::sync::CancellationToken;

/// Picks between the two `Notifier` impls at startup based on whether a
/// webhook URL is configured — one generic slot, chosen once, rather than a
/// trait object (the orchestrator is generic over `N: Notifier`).
enum AnyNotifier {
    Webhook(WebhookNotifier),
    Log(LogNotifier),
}

#[async_trait::async_trait]
impl Notifier for AnyNotifier {
    fn min_severity(&self) -> Severity {
        match self {
            AnyNotifier::Webhook(n) => n.min_severity(),
            AnyNotifier::Log(n) => n.min_severity(),
        }
    }

    async fn notify(&self, message: &str, severity: Severity) {
        match self {
            AnyNotifier::Webhook(n) => n.notify(message, severity).await,
            AnyNotifier::Log(n) => n.notify(message, severity).await,
        }
    }
}

fn print_banner() {
    println!(
        r#"
   ___          __         _____
  / _ \_______ / /__ ____ / ___/_ _____  ____
 / // / __/ -_) / -_) __// /__/ // / _ \/ __/
/____/_/  \__/_/\__/_/   \___/\_, /_//_/\__/
                             /___/
    "#
    );
}

#[derive(Parser)]
#[command(name = "sync-engine", about = "Marketplace order financial reconciliation engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sync every order posted in a date window, then drain the projector once.
    Batch {
        /// Inclusive lower bound, RFC3339 (e.g. 2026-07-01T00:00:00Z).
        #[arg(long)]
        posted_after: DateTime<Utc>,
        /// Exclusive upper bound, RFC3339. Defaults to now; clamped to
        /// `now - 2m` regardless.
        #[arg(long)]
        posted_before: Option<DateTime<Utc>>,
        /// Extract and validate without appending events or publishing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Sync a single order by id.
    Sync {
        #[arg(long)]
        order_id: String,
        #[arg(long)]
        buyer_email: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the ERP projector worker pool until Ctrl-C.
    Projector,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_ctx::init_tracing(&std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()));
    print_banner();

    let cli = Cli::parse();
    let config = EngineConfig::from_env()?;
    tracing::info!(environment = %config.environment, "order sync engine starting");

    let event_store = Arc::new(SqliteEventStore::connect(&config.database_url).await?);
    let snapshot_store = Arc::new(SnapshotStore::connect(&config.database_url).await?);
    let snapshot_strategy = Arc::new(HybridStrategy::new(
        config.snapshot_event_interval,
        Duration::from_secs(config.snapshot_time_interval_minutes * 60),
    ));
    let stream = Arc::new(
        RedisHandoffStream::connect(
            &config.redis_url,
            config.stream_name.clone(),
            config.consumer_group.clone(),
            format!("sync-engine-{}", std::process::id()),
            config.stream_retention,
        )
        .await?,
    );
    let notifier = build_notifier(&config);
    let fee_table = Arc::new(config.fee_table.clone());

    let shutdown = CancellationToken::new();

    match cli.command {
        Command::Sync { order_id, buyer_email, dry_run } => {
            let marketplace = HttpMarketplaceAdapter::new(config.marketplace_base_url.clone(), config.marketplace_api_key.clone().unwrap_or_default());
            let order_id = OrderId::new(order_id)?;
            let raw = marketplace.fetch_financial_events(&order_id).await?;

            let orchestrator = SyncOrchestrator::new(
                event_store,
                snapshot_store,
                snapshot_strategy,
                stream,
                notifier,
                fee_table,
                config.money_tolerance,
            );
            let result = orchestrator.sync(order_id, &raw, buyer_email, dry_run, shutdown).await;
            tracing::info!(success = result.success, principal = ?result.principal, "sync finished");
            if !result.success {
                std::process::exit(1);
            }
        }
        Command::Batch { posted_after, posted_before, dry_run } => {
            let marketplace = HttpMarketplaceAdapter::new(config.marketplace_base_url.clone(), config.marketplace_api_key.clone().unwrap_or_default());
            let window = DateWindow::new(posted_after, posted_before.unwrap_or_else(Utc::now))?;

            let orchestrator = SyncOrchestrator::new(
                event_store.clone(),
                snapshot_store,
                snapshot_strategy,
                stream.clone(),
                notifier,
                fee_table,
                config.money_tolerance,
            );

            let erp = build_erp_adapter(&config)?;
            let projector = Projector::new(
                stream,
                event_store,
                erp,
                ProjectorConfig {
                    journal_id: config.erp_journal_id,
                    warehouse_id: config.erp_warehouse_id,
                    generic_partner_name: config.generic_partner_name.clone(),
                    workers: config.projector_workers,
                },
            );

            let summary = batch::run_batch(&marketplace, &orchestrator, &projector, window, dry_run, shutdown).await;
            tracing::info!(
                total = summary.total,
                succeeded = summary.succeeded,
                failed = summary.failed,
                invoices_created = summary.invoices_created,
                invoices_failed = summary.invoices_failed,
                "batch run complete"
            );
            std::process::exit(summary.exit_code());
        }
        Command::Projector => {
            let erp = build_erp_adapter(&config)?;
            let projector = Arc::new(Projector::new(
                stream,
                event_store,
                erp,
                ProjectorConfig {
                    journal_id: config.erp_journal_id,
                    warehouse_id: config.erp_warehouse_id,
                    generic_partner_name: config.generic_partner_name.clone(),
                    workers: config.projector_workers,
                },
            ));

            let token = shutdown.clone();
            tokio::select! {
                _ = projector.run(shutdown) => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("ctrl-c received, shutting down projector");
                    token.cancel();
                }
            }
        }
    }

    Ok(())
}

fn build_notifier(config: &EngineConfig) -> Arc<AnyNotifier> {
    match &config.notifier_webhook_url {
        Some(url) => Arc::new(AnyNotifier::Webhook(WebhookNotifier::new(url.clone(), Severity::new(config.notifier_min_severity)))),
        None => Arc::new(AnyNotifier::Log(LogNotifier::new(Severity::new(config.notifier_min_severity)))),
    }
}

fn build_erp_adapter(config: &EngineConfig) -> anyhow::Result<Arc<HttpErpAdapter>> {
    match (&config.erp_endpoint, &config.erp_username, &config.erp_password) {
        (Some(endpoint), Some(username), Some(password)) => {
            Ok(Arc::new(HttpErpAdapter::new(endpoint.clone(), username.clone(), password.clone())))
        }
        _ => anyhow::bail!("ERP_ENDPOINT, ERP_USERNAME, and ERP_PASSWORD must all be set to run the projector"),
    }
}
