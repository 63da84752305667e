//! `gatebridge`: chat-to-agent gateway bridge.
//!
//! Connects to the agent gateway, then forwards every line typed on stdin
//! as one agent turn and prints the agent's replies. Configuration via CLI
//! flags, environment variables, or config file
//! (`~/.config/gatebridge/config.toml`).
//!
//! ```bash
//! # Gateway port and token taken from ~/.moltbot/moltbot.json
//! cargo run --bin gatebridge
//!
//! # Explicit gateway
//! cargo run --bin gatebridge -- --gateway-url ws://127.0.0.1:18789 \
//!     --gateway-token "$TOKEN" --reply-mode collapsed
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;

use gatebridge::bridge::Bridge;
use gatebridge::chat::console::{self, ConsoleChannel};
use gatebridge::config::{AppConfig, CliArgs};
use gatebridge::gateway::{GatewayClient, GatewayError, mask_secret};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "gatebridge starting");

    let config = match AppConfig::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(err = %e, "failed to load configuration");
            eprintln!("gatebridge: {e}");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        url = %config.gateway.url,
        agent_id = %config.gateway.agent_id,
        token = %mask_secret(&config.gateway.token),
        mode = ?config.bridge.aggregator.mode,
        "configuration loaded"
    );

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let gateway = match GatewayClient::connect(config.gateway.clone(), &cancel).await {
        Ok(client) => Arc::new(client),
        Err(GatewayError::Cancelled) => return ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(err = %e, "failed to connect to agent gateway");
            eprintln!("gatebridge: failed to connect to agent gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    let inbound = console::spawn_stdin_reader(config.inbound_capacity, cancel.clone());
    let bridge = Arc::new(Bridge::new(
        Arc::clone(&gateway),
        Arc::new(ConsoleChannel::stdout()),
        config.bridge,
    ));

    let mut lost = false;
    let bridge_task = bridge.run(inbound, cancel.clone());
    tokio::pin!(bridge_task);
    tokio::select! {
        () = &mut bridge_task => {}
        () = gateway.disconnected() => {
            lost = !cancel.is_cancelled();
            cancel.cancel();
            bridge_task.await;
        }
    }

    gateway.close().await;
    tracing::info!("gatebridge stopped");

    if lost {
        eprintln!("gatebridge: gateway connection lost");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Cancel `cancel` on Ctrl-C or SIGTERM.
async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(err = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown signal received");
    cancel.cancel();
}

/// Initialize tracing to stderr, or to `file_path` when given.
///
/// `RUST_LOG` takes precedence over `level`. Returns the writer guard, which
/// must live until exit so buffered lines are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let (writer, guard) = match file_path {
        Some(path) => {
            let log_dir = path.parent()?;
            let file_name = path.file_name()?.to_str()?;
            let file_appender = tracing_appender::rolling::never(log_dir, file_name);
            tracing_appender::non_blocking(file_appender)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(env_filter)
        .with_ansi(file_path.is_none())
        .init();

    Some(guard)
}
