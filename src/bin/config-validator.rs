//! # Outbox Configuration Validator
//!
//! Command-line tool for checking dispatcher configuration before deploying a
//! worker. Loads defaults, the optional file and `OUTBOX__*` variables exactly
//! as the dispatcher does, validates them and prints the effective result.

use clap::{Parser, ValueEnum};
use outbox_dispatcher::config::{OutboxConfig, ENV_PREFIX};
use outbox_dispatcher::logging::init_structured_logging;
use outbox_dispatcher::store::collection_name;
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate outbox dispatcher configuration")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "OUTBOX_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Environment variable prefix
    #[arg(long, default_value = ENV_PREFIX)]
    env_prefix: String,

    /// Output format
    #[arg(long, value_enum, default_value = "table")]
    format: OutputFormat,
}

fn main() {
    let cli = Cli::parse();
    init_structured_logging();

    match run(&cli) {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {:#}", e);
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = OutboxConfig::load_with_env_prefix(cli.config.as_deref(), &cli.env_prefix)?;

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
        OutputFormat::Table => print_table(cli, &config),
    }
    Ok(())
}

fn print_table(cli: &Cli, config: &OutboxConfig) {
    println!("🔧 Outbox Configuration");
    match &cli.config {
        Some(path) => println!("Source file: {}", path.display()),
        None => println!("Source file: (none)"),
    }
    println!("Environment prefix: {}__", cli.env_prefix);
    println!();

    let handler_timeout = config
        .handler_timeout_seconds
        .map_or_else(|| "none".to_string(), |s| format!("{s}s"));
    let rows = [
        ("collection", collection_name(&config.collection_name_prefix)),
        ("poll_interval", format!("{}s", config.poll_interval_seconds)),
        ("inter_cycle_delay", format!("{}ms", config.inter_cycle_delay_ms)),
        ("batch_size", config.batch_size.to_string()),
        ("max_retry_attempts", config.max_retry_attempts.to_string()),
        (
            "retry_delay",
            format!(
                "{}s doubling, capped at {}s",
                config.base_retry_delay_seconds, config.max_retry_delay_seconds
            ),
        ),
        ("claim_lease", format!("{}m", config.claim_lease_minutes)),
        ("processing_ttl", format!("{}m", config.processing_ttl_minutes)),
        ("handler_timeout", handler_timeout),
        (
            "shutdown_grace_period",
            format!("{}s", config.shutdown_grace_period_seconds),
        ),
        ("auto_start", config.auto_start.to_string()),
        (
            "worker_id",
            config
                .worker_id
                .clone()
                .unwrap_or_else(|| "(generated at startup)".to_string()),
        ),
    ];
    for (key, value) in rows {
        println!("  {key:<24} {value}");
    }
    println!();
    println!("✅ Configuration is valid");
}
