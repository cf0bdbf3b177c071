//! pg-tablesync CLI - staged bulk-merge synchronization of PostgreSQL tables.

use clap::{Parser, Subcommand};
use pg_tablesync::{Config, JobRunner, SyncError};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "pg-tablesync")]
#[command(about = "Staged bulk-merge synchronization of PostgreSQL tables")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the synchronization job
    Run,

    /// Validate the configuration and mappings against the live schema
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), SyncError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(SyncError::Config)?;

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run => {
            let cancel = setup_signal_handler();
            let runner = JobRunner::new(config).await?;
            let result = runner.run(Some(cancel)).await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                println!("\nSync completed!");
                println!("  Run ID: {}", result.run_id);
                println!("  Duration: {:.2}s", result.duration_seconds);
                println!("  Tables: {}", result.tables.len());
                println!(
                    "  Rows: {} staged, {} affected, {} deleted",
                    result.rows_staged, result.rows_affected, result.rows_deleted
                );
                for table in &result.tables {
                    println!(
                        "    {} -> {}: {} staged, {} affected, {} deleted{}",
                        table.source_table,
                        table.destination_table,
                        table.staged,
                        table.affected,
                        table.deleted,
                        if table.rejected > 0 {
                            format!(" ({} rejected)", table.rejected)
                        } else {
                            String::new()
                        }
                    );
                }
            }
        }

        Commands::Validate => {
            let runner = JobRunner::new(config).await?;
            runner.check().await?;
            println!("Configuration and mappings are valid");
        }
    }

    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Cancellation is coarse: a signal flips the flag, the orchestrator aborts
/// at the next phase boundary and rolls back.
#[cfg(unix)]
fn setup_signal_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    let tx_int = tx.clone();
    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT handler");
        sigint.recv().await;
        eprintln!("\nReceived SIGINT. Aborting job and rolling back...");
        let _ = tx_int.send(true);
    });

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");
        sigterm.recv().await;
        eprintln!("\nReceived SIGTERM. Aborting job and rolling back...");
        let _ = tx.send(true);
    });

    rx
}

#[cfg(not(unix))]
fn setup_signal_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Aborting job and rolling back...");
            let _ = tx.send(true);
        }
    });

    rx
}
