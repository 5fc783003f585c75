//! mssql-decrypt CLI - migrate SQL Server encrypted columns to plain columns.

use clap::{Parser, Subcommand};
use mssql_decrypt::error::EXIT_TABLE_FAILURE;
use mssql_decrypt::typemap::{declare_nullable, declare_type};
use mssql_decrypt::{Config, DecryptError, Orchestrator};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mssql-decrypt")]
#[command(about = "Migrate SQL Server encrypted columns into plain columns")]
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
    /// Migrate every encrypted column
    Run {
        /// Only these tables (comma-separated, schema.table or table)
        #[arg(long, value_delimiter = ',')]
        tables: Option<Vec<String>>,

        /// Override number of tables migrated at once
        #[arg(long)]
        workers: Option<usize>,

        /// Override rows per batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Dry run: validate and show plan without changing any table
        #[arg(long)]
        dry_run: bool,
    },

    /// List encrypted columns and their planned declarations
    Discover {
        /// Only these tables (comma-separated, schema.table or table)
        #[arg(long, value_delimiter = ',')]
        tables: Option<Vec<String>>,
    },

    /// Test the database connection
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, DecryptError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    // Overrides go in first so auto-tuning sizes the pool for them.
    apply_overrides(&mut config, &cli.command);
    let config = config.with_auto_tuning();
    config.validate()?;

    match cli.command {
        Commands::Run { dry_run, .. } => {
            let filter = config.migration.table_filter()?;

            let orchestrator = Orchestrator::connect(&config).await?;

            if dry_run {
                let report = orchestrator.plan(filter.as_ref()).await?;
                if cli.output_json {
                    println!("{}", report.to_json()?);
                } else {
                    println!("\nDry run: {} tables", report.tables.len());
                    for table in &report.tables {
                        println!("\n  {}", table.table);
                        if let Some(ref err) = table.error {
                            println!("    Cannot migrate: {}", err);
                        }
                        for step in &table.steps {
                            println!("    - {}", step);
                        }
                    }
                }
                return Ok(ExitCode::SUCCESS);
            }

            let cancel_token = setup_signal_handler();
            let result = orchestrator.run_all(filter.as_ref(), cancel_token).await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                println!("\nMigration {}!", result.status);
                println!("  Run ID: {}", result.run_id);
                println!("  Duration: {:.2}s", result.duration_seconds);
                println!(
                    "  Tables: {}/{}",
                    result.tables_success, result.tables_total
                );
                println!("  Rows: {}", result.rows_migrated);
                for table in result.tables.iter().filter(|t| t.error.is_some()) {
                    println!(
                        "  Failed: {} at {:?}: {}",
                        table.table,
                        table.stage,
                        table.error.as_deref().unwrap_or_default()
                    );
                }
            }

            if result.has_failures() {
                return Ok(ExitCode::from(EXIT_TABLE_FAILURE));
            }
            if result.tables_cancelled > 0 {
                return Err(DecryptError::Cancelled);
            }
        }

        Commands::Discover { .. } => {
            let filter = config.migration.table_filter()?;

            let orchestrator = Orchestrator::connect(&config).await?;
            let grouped = orchestrator.discover(filter.as_ref()).await?;

            if cli.output_json {
                let mut entries = Vec::with_capacity(grouped.len());
                for (table, columns) in &grouped {
                    let mut cols = Vec::with_capacity(columns.len());
                    for c in columns {
                        cols.push(serde_json::json!({
                            "name": c.name(),
                            "declaration": declare_type(&c.column).ok(),
                            "plain_declaration": declare_nullable(&c.column).ok(),
                            "encryption_type": c.encryption_type,
                            "column_key_name": c.column_key_name,
                        }));
                    }
                    entries.push(serde_json::json!({
                        "table": table.full_name(),
                        "columns": cols,
                    }));
                }
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                println!("Encrypted columns in {} tables:", grouped.len());
                for (table, columns) in &grouped {
                    println!("\n  {}", table);
                    for c in columns {
                        let declaration = match declare_type(&c.column) {
                            Ok(d) => d,
                            Err(e) => format!("unsupported ({})", e),
                        };
                        println!(
                            "    {} {} [{}, {}]",
                            c.name(),
                            declaration,
                            c.encryption_type,
                            c.column_key_name
                        );
                    }
                }
            }
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::connect(&config).await?;
            let start = std::time::Instant::now();
            let result = orchestrator.health_check().await;
            let latency_ms = start.elapsed().as_millis() as u64;

            if cli.output_json {
                let report = serde_json::json!({
                    "connected": result.is_ok(),
                    "latency_ms": latency_ms,
                    "error": result.as_ref().err().map(|e| e.to_string()),
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  SQL Server: {} ({}ms)",
                    if result.is_ok() { "OK" } else { "FAILED" },
                    latency_ms
                );
            }
            result?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn apply_overrides(config: &mut Config, command: &Commands) {
    match command {
        Commands::Run {
            tables,
            workers,
            batch_size,
            ..
        } => {
            if let Some(tables) = tables {
                config.migration.tables = tables.clone();
            }
            if let Some(w) = workers {
                config.migration.workers = Some(*w);
            }
            if let Some(size) = batch_size {
                config.migration.batch_size = *size;
            }
        }
        Commands::Discover { tables } => {
            if let Some(tables) = tables {
                config.migration.tables = tables.clone();
            }
        }
        Commands::HealthCheck => {}
    }
}

fn setup_logging(verbosity: &str, format: &str) {
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
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the returned token on SIGINT or SIGTERM.
///
/// Tables stop between batches; the batch in flight finishes or rolls back.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to set up {} handler: {}", name, e);
                    return;
                }
            };
            stream.recv().await;
            eprintln!("\nReceived {}. Stopping after the current batch...", name);
            token.cancel();
        });
    }

    cancel_token
}

#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to set up Ctrl-C handler: {}", e);
            return;
        }
        eprintln!("\nReceived Ctrl-C. Stopping after the current batch...");
        token.cancel();
    });

    cancel_token
}
