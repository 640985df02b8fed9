use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

use cifra::app::ReconcileService;
use cifra::config::{Config, DEFAULT_CONFIG_PATH};
use cifra::infra::{build_mailer, build_object_store, build_payment_gateway, build_storage};
use cifra::server::{start_server, AppState};

#[derive(Parser)]
#[command(name = "cifra")]
#[command(about = "Cifra marketplace: payment fulfillment, downloads and seller API")]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API with the background outbox dispatcher
    Serve {
        /// Overrides server.port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Send every pending notification once and exit
    DrainOutbox,
    /// Re-verify stale pending orders with the payment gateway
    Reconcile,
    /// Register a seller account
    CreateSeller {
        #[arg(long)]
        email: String,
        #[arg(long)]
        name: String,
    },
}

fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let storage = build_storage(config).context("opening the ledger")?;
    let payments = build_payment_gateway(config).context("configuring the payment gateway")?;
    let objects = build_object_store(config).context("configuring object storage")?;
    let mailer = build_mailer(config).context("configuring email delivery")?;
    Ok(AppState::new(config, storage, payments, objects, mailer))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = cifra::logging::init_logging();
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    cifra::metrics::init_metrics();
    let state = build_state(&config)?;

    match cli.command {
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.server.port);
            let dispatcher = state.notifications.clone();
            let interval = Duration::from_secs(config.outbox.poll_interval_seconds.max(1));
            tokio::spawn(dispatcher.run(interval, config.outbox.batch_size));
            info!("Outbox dispatcher polling every {:?}", interval);

            if let Err(e) = start_server(state, port).await {
                error!("Server stopped: {}", e);
                return Err(e.into());
            }
        }
        Commands::DrainOutbox => {
            println!("📬 Draining notification outbox...");
            let mut total = (0, 0, 0);
            loop {
                let report = state
                    .notifications
                    .dispatch_pending(config.outbox.batch_size)
                    .await?;
                total.0 += report.sent;
                total.1 += report.failed;
                total.2 += report.abandoned;
                // Failed messages stay pending, so stop once a pass delivers nothing.
                if report.sent == 0 {
                    break;
                }
            }
            println!("\n📊 Outbox results:");
            println!("   Sent: {}", total.0);
            println!("   Failed (will retry): {}", total.1);
            println!("   Abandoned: {}", total.2);
        }
        Commands::Reconcile => {
            println!("🔄 Reconciling pending orders...");
            let service = ReconcileService::new(state.storage.clone(), state.fulfillment.clone());
            let min_age = chrono::Duration::minutes(config.reconcile.min_pending_age_minutes);
            let report = service.reconcile_pending(min_age).await?;
            // No worker runs in this process, so deliver the receipts here.
            let delivery = state
                .notifications
                .dispatch_pending(config.outbox.batch_size)
                .await?;
            println!("\n📊 Reconcile results:");
            println!("   Checked: {}", report.checked);
            println!("   Fulfilled: {}", report.fulfilled);
            println!("   Canceled: {}", report.canceled);
            println!("   Failed: {}", report.failed);
            println!("   Still pending: {}", report.still_pending);
            println!("   Emails sent: {}", delivery.sent);
            if report.errors > 0 {
                println!("\n⚠️  {} orders could not be checked, see logs", report.errors);
            }
        }
        Commands::CreateSeller { email, name } => {
            let seller = state.catalog.create_seller(&email, &name).await?;
            println!("✅ Seller created");
            println!("   ID: {}", seller.id);
            println!("   Email: {}", seller.email);
            println!("   Name: {}", seller.display_name);
        }
    }

    Ok(())
}
