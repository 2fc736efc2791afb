//! VibeBridge - priority-routed bridge between two MQTT brokers
//!
//! Usage:
//!   vibebridge --config <FILE> [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Configuration file (JSON, or TOML by extension)
//!   -w, --workers <N>        Number of pipeline workers
//!   -b, --buffer-size <N>    Capacity of the hand-off buffer
//!   --health-port <PORT>     Enable the health endpoint on this port
//!   -l, --log-level          Log level (error, warn, info, debug, trace)
//!   --check                  Validate the configuration and exit
//!   -h, --help               Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vibebridge::broker::Broker;
use vibebridge::config::Config;
use vibebridge::remote::{MqttSink, MqttSource};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// VibeBridge - consume, route, transform and republish
#[derive(Parser, Debug)]
#[command(name = "vibebridge")]
#[command(version)]
#[command(about = "Priority-routed bridge between two MQTT brokers")]
struct Args {
    /// Configuration file path (JSON, or TOML when the extension is .toml)
    #[arg(short, long)]
    config: PathBuf,

    /// Number of pipeline workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Capacity of the hand-off buffer
    #[arg(short, long)]
    buffer_size: Option<usize>,

    /// Serve /health and /metrics on this port
    #[arg(long)]
    health_port: Option<u16>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

/// CLI flag, then `RUST_LOG`, then the config file
fn log_filter(args: &Args, config: &Config) -> EnvFilter {
    if let Some(level) = args.log_level {
        return EnvFilter::new(level.as_directive());
    }
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        return EnvFilter::from_default_env();
    }
    EnvFilter::try_new(&config.log.level).unwrap_or_else(|_| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config file: {}", e);
            std::process::exit(1);
        }
    };

    // CLI args override file config
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }
    if let Some(buffer_size) = args.buffer_size {
        config.buffer_size = buffer_size;
    }
    if let Some(port) = args.health_port {
        config.health.enabled = true;
        config.health.port = port;
    }

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    if args.check {
        println!("Configuration OK: {}", args.config.display());
        return Ok(());
    }

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(log_filter(&args, &config))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Loaded configuration from {:?}", args.config);
    info!("Starting VibeBridge");
    info!("  Source: {}", config.source.endpoints.join(", "));
    info!("  Subscriptions: {}", config.source.topic_filters().join(", "));
    info!("  Sink: {}", config.sink.endpoint);
    info!("  Routes: {}", config.routes.len());
    info!("  Workers: {}", config.worker_count);
    info!("  Buffer size: {}", config.buffer_size);
    info!("  Publish QoS: {:?}", config.sink.qos());
    if config.health.enabled {
        info!(
            "  Health: enabled (http://{}/health)",
            config.health.bind_address()
        );
    } else {
        info!("  Health: disabled");
    }

    let source = Arc::new(MqttSource::new(config.source.clone()));
    let sink = Arc::new(MqttSink::new(config.sink.clone()));
    let broker = Broker::new(config.broker_config(), source, sink)?;

    if let Err(e) = broker.run_until_shutdown().await {
        error!("Bridge error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
