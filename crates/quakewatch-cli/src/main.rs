use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quakewatch_storage::{connect_pool, run_migrations};
use quakewatch_sync::{pipeline_from_config, SyncConfig};
use quakewatch_web::AppState;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "quakewatch")]
#[command(about = "Seismic event monitor: poll, store and alert on new earthquakes")]
struct Cli {
    /// Directory holding quakewatch.yaml, if any.
    #[arg(long, global = true, default_value = ".")]
    workspace_root: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the source now and store any new events.
    Fetch,
    /// Check the source for changes once, or keep checking with --daemon.
    Monitor {
        #[arg(long)]
        daemon: bool,
    },
    /// Send the alert for a stored event, regardless of magnitude.
    Notify {
        event_id: i64,
        /// Extra destination; repeat for several numbers.
        #[arg(long = "phone")]
        phones: Vec<String>,
        /// Also send to every registered and configured recipient.
        #[arg(long)]
        all: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Run the read API (and the fetch scheduler when enabled).
    Serve,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,quakewatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::load(&cli.workspace_root)?;

    match cli.command.unwrap_or(Commands::Fetch) {
        Commands::Fetch => {
            let pipeline = pipeline_from_config(config).await?;
            let summary = pipeline.run_once().await?;
            if summary.source_unavailable {
                println!("Source unavailable, no update.");
            }
            println!(
                "Earthquake data updated: {} new earthquakes added (candidates={} duplicates={} rejected={} failed={})",
                summary.new_events(),
                summary.ingest.candidates,
                summary.ingest.duplicates,
                summary.rejected_rows,
                summary.ingest.failed,
            );
        }
        Commands::Monitor { daemon } => {
            let interval = Duration::from_millis(config.monitor_interval_ms);
            let pipeline = pipeline_from_config(config).await?;
            if !daemon {
                report_check(pipeline.check_for_updates().await);
                return Ok(ExitCode::SUCCESS);
            }

            println!("Starting earthquake monitoring daemon...");
            println!("Press Ctrl+C to stop");
            loop {
                report_check(pipeline.check_for_updates().await);
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = tokio::signal::ctrl_c() => {
                        info!("monitor stopped");
                        break;
                    }
                }
            }
        }
        Commands::Notify {
            event_id,
            phones,
            all,
        } => {
            let pipeline = pipeline_from_config(config).await?;
            let Some(manual) = pipeline.notify_event(event_id, &phones, all).await? else {
                eprintln!("Earthquake with ID {event_id} not found");
                return Ok(ExitCode::FAILURE);
            };

            println!(
                "Sent notifications about earthquake {} (magnitude {})",
                manual.event.id, manual.event.magnitude
            );
            for outcome in &manual.dispatch.outcomes {
                match &outcome.error {
                    None => println!("  - {}: sent", outcome.destination),
                    Some(err) => println!("  - {}: failed ({err})", outcome.destination),
                }
            }
            println!("Notification summary:");
            println!("  - Successful: {}", manual.dispatch.succeeded);
            println!("  - Failed: {}", manual.dispatch.failed);
            if manual.dispatch.attempted == 0 {
                println!("No recipients selected; pass --phone or --all.");
            }
            if manual.dispatch.all_failed() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Migrate => {
            let pool = connect_pool(&config.database_url).await?;
            run_migrations(&pool).await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let port = config.web_port;
            let pipeline = Arc::new(pipeline_from_config(config).await?);
            let scheduler = pipeline.maybe_build_scheduler().await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting scheduler")?;
                info!(cron = %pipeline.config().fetch_cron, "fetch scheduler started");
            }
            quakewatch_web::serve(AppState::new(pipeline), port).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn report_check(changed: bool) {
    if changed {
        println!("New earthquake data detected and processed!");
    } else {
        println!("No new earthquake data detected.");
    }
}
