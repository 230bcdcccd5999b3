//! Toolbridge CLI
//!
//! Command-line interface for the toolbridge remote tool layer.
//! `agent` hosts demo tools and connects them to a proxy; `proxy` accepts
//! agents and invokes their tools from stdin commands.

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::time::Duration;
use toolbridge_core::config::defaults;
use toolbridge_core::events::StdoutEventSink;
use toolbridge_core::{HandlerConfig, RouterConfig};
use tracing_subscriber::EnvFilter;

mod agent;
mod proxy;

/// Toolbridge - remote tool invocation over newline-delimited JSON
#[derive(Parser, Debug)]
#[command(name = "toolbridge")]
#[command(version, about, long_about = None)]
struct Args {
    /// Output format: text or json
    #[arg(short, long, default_value = "text", global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Host the demo tools and connect them to a proxy
    Agent {
        /// Proxy endpoint
        #[arg(short, long, env = "TOOLBRIDGE_ENDPOINT", default_value = defaults::DEFAULT_ENDPOINT)]
        endpoint: String,

        /// Application name used as the tool prefix
        #[arg(short = 'n', long, env = "TOOLBRIDGE_APP_NAME", default_value = defaults::DEFAULT_APP_NAME)]
        app_name: String,

        /// Disable automatic reconnection
        #[arg(long, env = "TOOLBRIDGE_NO_RECONNECT")]
        no_reconnect: bool,

        /// First reconnect delay in milliseconds
        #[arg(long, env = "TOOLBRIDGE_RECONNECT_INITIAL_MS", default_value_t = defaults::DEFAULT_RECONNECT_INITIAL_MS)]
        reconnect_initial_ms: u64,

        /// Reconnect delay cap in milliseconds
        #[arg(long, env = "TOOLBRIDGE_RECONNECT_MAX_MS", default_value_t = defaults::DEFAULT_RECONNECT_MAX_MS)]
        reconnect_max_ms: u64,
    },

    /// Accept agents and invoke their tools from stdin
    Proxy {
        /// Address to listen on
        #[arg(short, long, env = "TOOLBRIDGE_LISTEN", default_value = defaults::DEFAULT_LISTEN_ADDR)]
        listen: String,

        /// Invocation deadline in milliseconds
        #[arg(short, long, env = "TOOLBRIDGE_TIMEOUT_MS", default_value_t = defaults::DEFAULT_INVOKE_TIMEOUT_MS)]
        timeout_ms: u64,
    },
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let json_output = matches!(args.format, OutputFormat::Json);
    let event_sink = StdoutEventSink::new(json_output);

    let outcome = match args.command {
        Commands::Agent {
            endpoint,
            app_name,
            no_reconnect,
            reconnect_initial_ms,
            reconnect_max_ms,
        } => {
            let config = HandlerConfig::new(app_name)
                .with_endpoint(endpoint)
                .with_auto_reconnect(!no_reconnect)
                .with_reconnect_delays(
                    Duration::from_millis(reconnect_initial_ms),
                    Duration::from_millis(reconnect_max_ms),
                );
            tracing::info!(
                "Starting agent '{}' for {}",
                config.app_name,
                config.endpoint
            );
            agent::run_agent(config, event_sink).await
        }
        Commands::Proxy {
            listen,
            timeout_ms,
        } => {
            let config = RouterConfig::new()
                .with_listen_addr(listen)
                .with_invoke_timeout(Duration::from_millis(timeout_ms));
            tracing::info!("Starting proxy on {}", config.listen_addr);
            proxy::run_proxy(config, event_sink, json_output).await
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
