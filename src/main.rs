//! `hotelscan` binary.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `hotelscan serve` | HTTP triggers plus the background scheduler loop |
//! | `hotelscan resume` | Run a single resume cycle and exit |
//! | `hotelscan create-scan` | Create a scan over all active hotels |
//! | `hotelscan cancel <id>` | Cancel a queued or running scan |
//! | `hotelscan add-hotel` | Register a hotel and its source reference |
//! | `hotelscan report <id>` | Print event metrics for a scan |
//!
//! Configuration comes from the environment (and `.env`); see `config.rs`.

use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use hotelscan::{NewScan, ScrapingContext, metrics, orchestrator::CreatedScan, server};
use log::{LevelFilter, error, info};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "hotelscan", version, about = "Resumable hotel availability scanner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API and run the scheduler until interrupted.
    Serve {
        /// Overrides BIND_ADDR.
        #[arg(long)]
        bind: Option<String>,
        /// Only serve HTTP; resume cycles must be triggered externally.
        #[arg(long)]
        no_scheduler: bool,
    },
    /// Run one resume cycle.
    Resume,
    /// Create a scan and run its first batch.
    CreateScan {
        /// First check-in date (YYYY-MM-DD).
        #[arg(long)]
        base_check_in: NaiveDate,
        #[arg(long)]
        days: u32,
        #[arg(long, default_value_t = 1)]
        stay_nights: u32,
        #[arg(long, default_value_t = 2)]
        adults: u32,
    },
    Cancel {
        scan_id: Uuid,
    },
    AddHotel {
        #[arg(long)]
        name: String,
        /// Path relative to SOURCE_BASE_URL, or an absolute listing URL.
        #[arg(long)]
        source_ref: String,
    },
    /// Print aggregates, top failure reasons and health alerts for a scan.
    Report {
        scan_id: Uuid,
    },
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli.command).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands) -> anyhow::Result<()> {
    let ctx = Arc::new(ScrapingContext::new().await?);
    match command {
        Commands::Serve { bind, no_scheduler } => {
            let bind = bind.unwrap_or_else(|| ctx.env.bind_addr.clone());
            let listener = tokio::net::TcpListener::bind(&bind).await?;

            let shutdown = ctx.shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutting down");
                    shutdown.cancel();
                }
            });

            let scheduler = (!no_scheduler).then(|| {
                let orchestrator = ctx.orchestrator.clone();
                let shutdown = ctx.shutdown.clone();
                tokio::spawn(async move { orchestrator.run_scheduler(shutdown).await })
            });
            server::run_server(ctx.clone(), listener).await?;
            if let Some(scheduler) = scheduler {
                scheduler.await?;
            }
        }
        Commands::Resume => {
            let outcome = ctx.orchestrator.resume_once().await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::CreateScan {
            base_check_in,
            days,
            stay_nights,
            adults,
        } => {
            let params = NewScan {
                base_check_in,
                days,
                stay_nights,
                adults,
            };
            let scan = ctx.orchestrator.create_scan(&params).await?;
            println!("{}", serde_json::to_string_pretty(&CreatedScan::from(&scan))?);
            // A one-shot process cannot leave the kick running in the background.
            ctx.orchestrator.kick_first_batch(scan.id).await?;
        }
        Commands::Cancel { scan_id } => {
            let scan = ctx.orchestrator.cancel(scan_id).await?;
            println!("{}", serde_json::to_string_pretty(&scan)?);
        }
        Commands::AddHotel { name, source_ref } => {
            let hotel = ctx.store.add_hotel(&name, &source_ref).await?;
            println!("{}", serde_json::to_string_pretty(&hotel)?);
        }
        Commands::Report { scan_id } => {
            ctx.orchestrator.get_scan(scan_id).await?;
            let report = metrics::scan_report(ctx.events.as_ref(), scan_id, &ctx.health).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
