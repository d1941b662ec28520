//! auxlink-proxyd - proxy host process
//!
//! Owns the real transport of a process-mode proxy. Send requests arrive as
//! JSON lines on stdin; frames for the subscribers leave as JSON lines on
//! stdout. Logs go to stderr.

use anyhow::{Context, Result};
use auxlink_core::core::proxy::serve;
use auxlink_core::core::trace::TraceSink;
use auxlink_core::{TraceConfig, TraceFormat, TransportConfig, TransportFactory};
use clap::Parser;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Proxy host for auxlink
#[derive(Parser, Debug)]
#[command(
    name = "auxlink-proxyd",
    version,
    about = "Proxy host process for auxlink",
    long_about = None
)]
struct Args {
    /// Proxy name, used in logs and traces
    #[arg(long)]
    name: String,

    /// Real transport, as serialized `TransportConfig`
    #[arg(long = "transport-json", env = "AUXLINK_PROXY_TRANSPORT")]
    transport_json: String,

    /// Subscriber names, in id order
    #[arg(long = "subscriber")]
    subscribers: Vec<String>,

    /// Dispatch poll interval in milliseconds
    #[arg(long = "poll-ms", default_value_t = 20)]
    poll_ms: u64,

    /// Trace forwarded frames to this file
    #[arg(long)]
    trace: Option<PathBuf>,

    /// Trace line format (text, hex, json_lines)
    #[arg(long = "trace-format", default_value = "text")]
    trace_format: TraceFormat,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    tracing::info!(proxy = %args.name, "Starting auxlink-proxyd v{}", env!("CARGO_PKG_VERSION"));

    let config: TransportConfig =
        serde_json::from_str(&args.transport_json).context("Invalid --transport-json")?;
    let transport = config
        .build()
        .with_context(|| format!("Cannot build transport for proxy {}", args.name))?;

    let trace = match args.trace {
        Some(path) => {
            let config = TraceConfig {
                path,
                format: args.trace_format,
            };
            let sink = TraceSink::create(&config)
                .with_context(|| format!("Cannot open trace file {}", config.path.display()))?;
            Some(Arc::new(sink))
        }
        None => None,
    };

    serve(
        &args.name,
        transport,
        BufReader::new(io::stdin()),
        io::stdout(),
        args.subscribers,
        trace,
        Duration::from_millis(args.poll_ms.max(1)),
    )
    .with_context(|| format!("Proxy {} failed", args.name))?;

    tracing::info!(proxy = %args.name, "Exiting");
    Ok(())
}
