//! Layered TOML configuration for the Switchboard gateway.
//!
//! Reads configuration from multiple sources with precedence:
//! CLI flags > env vars > config file > defaults

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use switchboard_client::UpstreamServerConfig;
use switchboard_transport::Url;
use switchboard_types::ConfigError;

/// The default listen address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8787";

/// The default server name reported in `initialize`.
pub const DEFAULT_SERVER_NAME: &str = "switchboard";

/// Path prefix for OAuth callbacks; the server id is appended.
pub const OAUTH_CALLBACK_PATH: &str = "/oauth/callback";

/// The default time a tool waits for an elicitation answer.
pub const DEFAULT_ELICITATION_TIMEOUT_MS: u64 = 60_000;

/// Resolved configuration for a gateway run.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    /// Externally reachable base URL, without a trailing slash.
    pub public_url: String,
    pub server_name: String,
    pub elicitation_timeout: Duration,
    /// Keep sent events so clients can resume with `Last-Event-ID`.
    pub event_replay: bool,
    pub oauth: OAuthSettings,
    pub servers: BTreeMap<String, UpstreamServerConfig>,
    pub config_dir: PathBuf,
}

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub oauth: OAuthSettings,
    #[serde(default)]
    pub servers: BTreeMap<String, UpstreamServerConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub listen: Option<String>,
    pub public_url: Option<String>,
    pub name: Option<String>,
    pub elicitation_timeout_ms: Option<u64>,
    pub event_replay: Option<bool>,
}

/// Where the browser lands after an OAuth callback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OAuthSettings {
    pub success_redirect: Option<String>,
    pub error_redirect: Option<String>,
}

/// CLI overrides that take highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub listen: Option<String>,
    pub public_url: Option<String>,
    /// Read this file instead of `<config dir>/config.toml`.
    pub config_path: Option<PathBuf>,
}

impl GatewayConfig {
    /// Load configuration from all sources, applying precedence rules.
    ///
    /// Precedence (highest to lowest):
    /// 1. CLI flags
    /// 2. Environment variables (`SWITCHBOARD_LISTEN`, `SWITCHBOARD_PUBLIC_URL`)
    /// 3. Config file (`$SWITCHBOARD_CONFIG_DIR/config.toml` or `~/.switchboard/config.toml`)
    /// 4. Defaults
    pub fn load(overrides: CliOverrides) -> Result<Self, ConfigError> {
        Self::load_with_env(overrides, |key| std::env::var(key).ok())
    }

    /// [`GatewayConfig::load`] with an injectable environment.
    pub fn load_with_env(
        overrides: CliOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let config_dir = config_dir_from(&env);
        let path = overrides
            .config_path
            .clone()
            .unwrap_or_else(|| config_dir.join("config.toml"));
        let settings = load_settings_file(&path);

        // Resolve listen address: CLI > env > config file > default
        let listen_str = overrides
            .listen
            .or_else(|| env("SWITCHBOARD_LISTEN"))
            .or(settings.gateway.listen)
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let listen: SocketAddr =
            listen_str
                .parse()
                .map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
                    key: "listen".into(),
                    message: format!("'{listen_str}': {e}"),
                })?;

        // Resolve public URL
        let public_url = overrides
            .public_url
            .or_else(|| env("SWITCHBOARD_PUBLIC_URL"))
            .or(settings.gateway.public_url)
            .unwrap_or_else(|| format!("http://{listen}"));
        let public_url = public_url.trim_end_matches('/').to_string();
        Url::parse(&public_url).map_err(|e| ConfigError::InvalidValue {
            key: "public_url".into(),
            message: format!("'{public_url}': {e}"),
        })?;

        for (name, server) in &settings.servers {
            Url::parse(&server.url).map_err(|e| ConfigError::InvalidValue {
                key: format!("servers.{name}.url"),
                message: format!("'{}': {e}", server.url),
            })?;
        }

        Ok(GatewayConfig {
            listen,
            public_url,
            server_name: settings
                .gateway
                .name
                .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string()),
            elicitation_timeout: Duration::from_millis(
                settings
                    .gateway
                    .elicitation_timeout_ms
                    .unwrap_or(DEFAULT_ELICITATION_TIMEOUT_MS),
            ),
            event_replay: settings.gateway.event_replay.unwrap_or(false),
            oauth: settings.oauth,
            servers: settings.servers,
            config_dir,
        })
    }

    /// Prefix every OAuth callback URL starts with.
    pub fn callback_base(&self) -> String {
        format!("{}{OAUTH_CALLBACK_PATH}", self.public_url)
    }

    /// Redirect URL registered for `server_id`.
    pub fn callback_url(&self, server_id: &str) -> String {
        format!("{}/{server_id}", self.callback_base())
    }
}

/// Get the Switchboard config directory path (~/.switchboard/).
pub fn config_dir() -> PathBuf {
    config_dir_from(|key| std::env::var(key).ok())
}

fn config_dir_from(env: impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(dir) = env("SWITCHBOARD_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".switchboard")
}

/// Load and parse a TOML settings file, returning defaults on any error.
fn load_settings_file(path: &Path) -> SettingsFile {
    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Failed to parse {}: {}", path.display(), e);
            SettingsFile::default()
        }),
        Err(_) => SettingsFile::default(),
    }
}
