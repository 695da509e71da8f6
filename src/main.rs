use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use warden::config::WardenConfig;
use warden::ratelimit::{RateLimitConfig, RateLimiter};

/// Operator tool for the Warden rate limiter.
#[derive(Debug, Parser)]
#[command(name = "warden", version, about)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Redis URL, overrides the configured store
    #[arg(long, global = true)]
    redis_url: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count one request and print the decision
    Check {
        identifier: String,
        #[arg(short, long, default_value = "api")]
        preset: String,
    },
    /// Show the current window without counting a request
    Status {
        identifier: String,
        #[arg(short, long, default_value = "api")]
        preset: String,
    },
    /// Clear the counter for an identifier
    Reset {
        identifier: String,
        #[arg(short, long, default_value = "api")]
        preset: String,
    },
    /// Probe the shared store and print health and metrics
    Health,
    /// Fire concurrent requests for one identifier and summarize the decisions
    Burst {
        identifier: String,
        #[arg(short, long, default_value = "api")]
        preset: String,
        #[arg(short = 'n', long, default_value_t = 100)]
        requests: usize,
    },
    /// Periodically log health until interrupted
    Monitor {
        #[arg(long, default_value_t = 10)]
        interval_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = WardenConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(url) = cli.redis_url {
        config.store.url = Some(url);
    }

    let limiter = Arc::new(RateLimiter::from_config(&config)?);
    info!(instance_id = %limiter.instance_id(), "Rate limiter initialized");

    match cli.command {
        Command::Check { identifier, preset } => {
            let limit = preset_config(&config, &preset)?;
            let result = limiter.check_rate_limit(&identifier, &limit).await;
            print_json(&json!({ "result": result, "headers": headers_json(&result.headers()) }))?;
        }
        Command::Status { identifier, preset } => {
            let limit = preset_config(&config, &preset)?;
            let result = limiter.get_rate_limit_status(&identifier, &limit).await;
            print_json(&result)?;
        }
        Command::Reset { identifier, preset } => {
            let limit = preset_config(&config, &preset)?;
            limiter.reset_rate_limit(&identifier, &limit).await;
            info!(identifier = %identifier, preset = %preset, "Counter reset");
        }
        Command::Health => {
            let health = limiter.health_check().await;
            print_json(&json!({ "health": health, "metrics": limiter.metrics() }))?;
        }
        Command::Burst { identifier, preset, requests } => {
            let limit = preset_config(&config, &preset)?;

            let checks = (0..requests).map(|_| {
                let limiter = limiter.clone();
                let limit = limit.clone();
                let identifier = identifier.clone();
                tokio::spawn(async move { limiter.check_rate_limit(&identifier, &limit).await })
            });

            let mut allowed = 0usize;
            let mut denied = 0usize;
            for outcome in futures::future::join_all(checks).await {
                match outcome {
                    Ok(result) if result.allowed => allowed += 1,
                    Ok(_) => denied += 1,
                    Err(e) => warn!(error = %e, "Check task failed"),
                }
            }

            print_json(&json!({
                "requests": requests,
                "allowed": allowed,
                "denied": denied,
                "metrics": limiter.metrics(),
            }))?;
        }
        Command::Monitor { interval_secs } => {
            monitor(limiter, Duration::from_secs(interval_secs.max(1))).await;
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn preset_config(config: &WardenConfig, name: &str) -> anyhow::Result<RateLimitConfig> {
    config.presets.get(name).cloned().with_context(|| {
        format!(
            "unknown preset '{}', available: {}",
            name,
            config.presets.names().join(", ")
        )
    })
}

fn headers_json(headers: &[(&'static str, String)]) -> serde_json::Value {
    headers
        .iter()
        .map(|(name, value)| (name.to_string(), serde_json::Value::String(value.clone())))
        .collect::<serde_json::Map<_, _>>()
        .into()
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Log health until a shutdown signal arrives.
async fn monitor(limiter: Arc<RateLimiter>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let health = limiter.health_check().await;
                let metrics = limiter.metrics();
                info!(
                    backend_connected = health.backend_connected,
                    fallback_active = health.fallback_active,
                    fallback_entries = health.fallback_entry_count,
                    backend_errors = metrics.backend_errors,
                    "Limiter health"
                );
            }
        }
    }

    info!("Monitor stopped");
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
