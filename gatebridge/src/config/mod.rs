//! Configuration for the `gatebridge` binary.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/gatebridge/config.toml`)
//! 4. The agent backend's own JSON config (`~/.moltbot/moltbot.json`), for
//!    the gateway port and token only
//! 5. Compiled defaults
//!
//! Missing config files are not an error. An explicit `--config` path that
//! doesn't exist is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::aggregator::{AggregatorConfig, ReplyMode};
use crate::bridge::BridgeConfig;
use crate::gateway::GatewayConfig;

/// Gateway port used when nothing else names one.
pub const DEFAULT_GATEWAY_PORT: u16 = 18789;

/// Default thinking placeholder delay in collapsed mode.
pub const DEFAULT_THINKING_MS: u64 = 2500;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// No gateway token in any layer.
    #[error(
        "gateway token not configured; set --gateway-token, GATEBRIDGE_GATEWAY_TOKEN or gateway.auth in the backend config"
    )]
    MissingToken,

    /// The gateway URL is not a usable WebSocket URL.
    #[error("invalid gateway URL `{url}`: {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Reply mode as written on the command line or in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyModeSetting {
    /// Flush partial replies whenever the agent pauses.
    Streaming,
    /// One reply per turn, with a thinking placeholder.
    Collapsed,
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    gateway: GatewayFileConfig,
    aggregator: AggregatorFileConfig,
    bridge: BridgeFileConfig,
}

/// `[gateway]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct GatewayFileConfig {
    url: Option<String>,
    port: Option<u16>,
    token: Option<String>,
    agent_id: Option<String>,
    connect_timeout_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    fragment_capacity: Option<usize>,
}

/// `[aggregator]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct AggregatorFileConfig {
    idle_window_ms: Option<u64>,
    global_timeout_secs: Option<u64>,
    reply_mode: Option<ReplyModeSetting>,
    thinking_ms: Option<u64>,
}

/// `[bridge]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct BridgeFileConfig {
    session_prefix: Option<String>,
    placeholder_text: Option<String>,
    inbound_capacity: Option<usize>,
}

// ---------------------------------------------------------------------------
// Backend JSON config (only the gateway section is read)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct BackendConfig {
    gateway: BackendGateway,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct BackendGateway {
    port: Option<u16>,
    auth: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved bridge configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub bridge: BridgeConfig,
    /// Buffer between the chat reader and the bridge.
    pub inbound_capacity: usize,
}

impl AppConfig {
    /// Load configuration by merging CLI args, env vars and config files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, if no token is configured anywhere, or if the resulting
    /// gateway URL is invalid.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let backend = load_backend_config(cli.backend_config.as_deref());
        Self::resolve(cli, &file, &backend)
    }

    /// Resolve from CLI args and parsed files.
    ///
    /// Priority: CLI > file > backend config > default.
    fn resolve(
        cli: &CliArgs,
        file: &ConfigFile,
        backend: &BackendConfig,
    ) -> Result<Self, ConfigError> {
        let gateway_defaults = GatewayConfig::default();
        let bridge_defaults = BridgeConfig::default();
        let aggregator_defaults = AggregatorConfig::default();

        let port = cli
            .gateway_port
            .or(file.gateway.port)
            .or(backend.gateway.port)
            .unwrap_or(DEFAULT_GATEWAY_PORT);
        let url = cli
            .gateway_url
            .clone()
            .or_else(|| file.gateway.url.clone())
            .unwrap_or_else(|| format!("ws://127.0.0.1:{port}"));
        validate_gateway_url(&url)?;

        let token = cli
            .gateway_token
            .clone()
            .or_else(|| file.gateway.token.clone())
            .or_else(|| backend.gateway.auth.clone())
            .filter(|t| !t.trim().is_empty())
            .ok_or(ConfigError::MissingToken)?;

        let gateway = GatewayConfig {
            url,
            token,
            agent_id: cli
                .agent_id
                .clone()
                .or_else(|| file.gateway.agent_id.clone())
                .unwrap_or(gateway_defaults.agent_id),
            connect_timeout: file
                .gateway
                .connect_timeout_secs
                .map_or(gateway_defaults.connect_timeout, Duration::from_secs),
            handshake_timeout: file
                .gateway
                .handshake_timeout_secs
                .map_or(gateway_defaults.handshake_timeout, Duration::from_secs),
            request_timeout: file
                .gateway
                .request_timeout_secs
                .map_or(gateway_defaults.request_timeout, Duration::from_secs),
            fragment_capacity: file
                .gateway
                .fragment_capacity
                .unwrap_or(gateway_defaults.fragment_capacity),
            ..gateway_defaults
        };

        let thinking_ms = cli
            .thinking_ms
            .or(file.aggregator.thinking_ms)
            .unwrap_or(DEFAULT_THINKING_MS);
        let mode = match cli
            .reply_mode
            .or(file.aggregator.reply_mode)
            .unwrap_or(ReplyModeSetting::Streaming)
        {
            ReplyModeSetting::Streaming => ReplyMode::Streaming,
            ReplyModeSetting::Collapsed => ReplyMode::Collapsed {
                placeholder_after: (thinking_ms > 0).then_some(Duration::from_millis(thinking_ms)),
            },
        };

        let bridge = BridgeConfig {
            session_prefix: file
                .bridge
                .session_prefix
                .clone()
                .unwrap_or(bridge_defaults.session_prefix),
            placeholder_text: file
                .bridge
                .placeholder_text
                .clone()
                .unwrap_or(bridge_defaults.placeholder_text),
            aggregator: AggregatorConfig {
                idle_window: file
                    .aggregator
                    .idle_window_ms
                    .map_or(aggregator_defaults.idle_window, Duration::from_millis),
                global_timeout: file
                    .aggregator
                    .global_timeout_secs
                    .map_or(aggregator_defaults.global_timeout, Duration::from_secs),
                mode,
            },
        };

        Ok(Self {
            gateway,
            bridge,
            inbound_capacity: file.bridge.inbound_capacity.unwrap_or(64),
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Bridge a chat surface to an agent gateway")]
pub struct CliArgs {
    /// WebSocket URL of the agent gateway (overrides --gateway-port).
    #[arg(long, env = "GATEBRIDGE_GATEWAY_URL")]
    pub gateway_url: Option<String>,

    /// Port of a gateway on 127.0.0.1.
    #[arg(long, env = "GATEBRIDGE_GATEWAY_PORT")]
    pub gateway_port: Option<u16>,

    /// Gateway authentication token.
    #[arg(long, env = "GATEBRIDGE_GATEWAY_TOKEN", hide_env_values = true)]
    pub gateway_token: Option<String>,

    /// Agent that handles every turn.
    #[arg(long, env = "GATEBRIDGE_AGENT_ID")]
    pub agent_id: Option<String>,

    /// Delay before the thinking placeholder in collapsed mode (0 disables).
    #[arg(long, env = "GATEBRIDGE_THINKING_MS")]
    pub thinking_ms: Option<u64>,

    /// How replies are emitted.
    #[arg(long, value_enum, env = "GATEBRIDGE_REPLY_MODE")]
    pub reply_mode: Option<ReplyModeSetting>,

    /// Path to config file (default: `~/.config/gatebridge/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Path to the agent backend's JSON config (default: `~/.moltbot/moltbot.json`).
    #[arg(long, env = "GATEBRIDGE_BACKEND_CONFIG")]
    pub backend_config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "GATEBRIDGE_LOG")]
    pub log_level: String,

    /// Path to log file (default: stderr).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn validate_gateway_url(raw: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let parsed = url::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "ws" | "wss" => {}
        other => return Err(invalid(format!("unsupported scheme `{other}`"))),
    }
    if parsed.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(())
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("gatebridge").join("config.toml");
    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}

/// Read the backend's JSON config. Unreadable or malformed files are
/// skipped; they only ever supply fallbacks.
fn load_backend_config(explicit_path: Option<&Path>) -> BackendConfig {
    let path = match explicit_path {
        Some(p) => p.to_path_buf(),
        None => match dirs::home_dir() {
            Some(home) => home.join(".moltbot").join("moltbot.json"),
            None => return BackendConfig::default(),
        },
    };
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::debug!(path = %path.display(), err = %e, "backend config not readable");
            return BackendConfig::default();
        }
    };
    serde_json::from_str(&contents).unwrap_or_else(|e| {
        tracing::warn!(path = %path.display(), err = %e, "ignoring malformed backend config");
        BackendConfig::default()
    })
}
