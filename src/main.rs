mod api;
mod audit;
mod bootstrap;
mod config;
mod error;
mod jobs;
mod ledger;
mod middleware;
mod payout;
mod reconciliation;
mod revenue;
mod server;
mod sources;
mod vault;

use chrono::Utc;
use std::str::FromStr;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::jobs::{MonthlyTrigger, TriggerConfig};
use crate::ledger::models::RevenueMonth;

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,revenue_engine=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[derive(Debug, PartialEq)]
enum Command {
    /// Serve HTTP and run the monthly trigger
    Serve,
    /// Run one verification job and exit
    RunOnce(Option<String>),
}

fn parse_command(args: &[String]) -> Result<Command, String> {
    match args {
        [] => Ok(Command::Serve),
        [cmd] if cmd == "serve" => Ok(Command::Serve),
        [cmd] if cmd == "run-once" => Ok(Command::RunOnce(None)),
        [cmd, month] if cmd == "run-once" => Ok(Command::RunOnce(Some(month.clone()))),
        _ => Err(format!(
            "usage: revenue-engine [serve | run-once [YYYY-MM]] (got: {})",
            args.join(" ")
        )),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting revenue verification engine");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_command(&args)?;
    let config = crate::config::Config::from_env()?;

    // Ctrl-C stops new deals from starting and drains the HTTP server
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    let state = bootstrap::initialize_app_state(&config, shutdown_rx.clone()).await?;

    match command {
        Command::RunOnce(month) => {
            let month = match month {
                Some(month) => RevenueMonth::from_str(&month)?,
                None => RevenueMonth::previous_to(Utc::now().date_naive()),
            };
            let summary = state.job.run(month, shutdown_rx).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Serve => {
            let trigger = MonthlyTrigger::new(
                TriggerConfig {
                    enabled: config.scheduler_enabled,
                    run_day: config.job_run_day,
                    run_hour: config.job_run_hour,
                },
                state.job.clone(),
                shutdown_rx.clone(),
            );
            let trigger_handle = trigger.start();

            let app = server::create_app(state, &config.cors_origins()).await;
            server::run_server(app, &config.bind_address, shutdown_rx).await?;

            if let Some(handle) = trigger_handle {
                let _ = handle.await;
            }
        }
    }

    info!("👋 Revenue verification engine stopped");
    Ok(())
}
