use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::protocol::{CSRF_TOKEN_PATH, HEALTH_PATH};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SluiceConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
    pub client: ClientConfig,
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SecurityConfig {
    /// Origins allowed to call the API from a browser.
    pub allowed_origins: Vec<String>,
    pub max_body_bytes: u64,
    pub token_ttl_secs: u64,
    /// HMAC secret for CSRF tokens. A random secret is generated per process
    /// when unset, which invalidates outstanding tokens on restart.
    pub csrf_secret: Option<String>,
    /// Paths that accept mutating requests without a CSRF token.
    pub exempt_paths: Vec<String>,
    /// Peers whose `X-Forwarded-For` header is trusted for client identity.
    pub trusted_proxies: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub chat_max_requests: u32,
    pub general_max_requests: u32,
    /// Path prefixes counted against the chat budget.
    pub chat_path_prefixes: Vec<String>,
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub max_retries: u32,
    pub retry_delays_ms: Vec<u64>,
    pub connect_timeout_secs: u64,
    pub token_fetch_timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,
    /// A cached token this close to expiry is treated as expired.
    pub token_refresh_margin_secs: u64,
    /// `"memory"` or `"file"`.
    pub token_store: String,
    /// File store location. `{session}` expands to the terminal session key.
    pub token_store_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BackendConfig {
    pub model: String,
    /// Pause between echoed fragments, to make streaming observable.
    pub fragment_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
            log_level: "info".into(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![
                "http://localhost:5173".into(),
                "http://127.0.0.1:5173".into(),
            ],
            max_body_bytes: 1024 * 1024,
            token_ttl_secs: 3600,
            csrf_secret: None,
            exempt_paths: vec![CSRF_TOKEN_PATH.into(), HEALTH_PATH.into()],
            trusted_proxies: vec!["127.0.0.1".into(), "::1".into()],
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            chat_max_requests: 20,
            general_max_requests: 120,
            chat_path_prefixes: vec!["/api/conversations/".into()],
            cleanup_interval_secs: 300,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        let token_store_path = default_sluice_dir()
            .join("session")
            .join(SESSION_PLACEHOLDER)
            .join("csrf.json")
            .to_string_lossy()
            .into_owned();
        Self {
            base_url: "http://127.0.0.1:8787".into(),
            max_retries: 5,
            retry_delays_ms: vec![1000, 2000, 4000, 8000, 16000],
            connect_timeout_secs: 10,
            token_fetch_timeout_secs: 10,
            stream_idle_timeout_secs: 60,
            token_refresh_margin_secs: 5,
            token_store: "file".into(),
            token_store_path,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            model: "echo-1".into(),
            fragment_delay_ms: 40,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn token_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.token_fetch_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    pub fn token_refresh_margin(&self) -> Duration {
        Duration::from_secs(self.token_refresh_margin_secs)
    }
}

/// Returns `~/.sluice/`
pub fn default_sluice_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".sluice")
}

/// Returns the default config file path: `~/.sluice/config.toml`
pub fn default_config_path() -> PathBuf {
    default_sluice_dir().join("config.toml")
}

impl SluiceConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            SluiceConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (SLUICE_HOST, SLUICE_PORT,
    /// SLUICE_LOG_LEVEL, SLUICE_CSRF_SECRET, SLUICE_BASE_URL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SLUICE_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = std::env::var("SLUICE_PORT") {
            match val.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %val, "ignoring invalid SLUICE_PORT"),
            }
        }
        if let Ok(val) = std::env::var("SLUICE_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("SLUICE_CSRF_SECRET") {
            self.security.csrf_secret = Some(val);
        }
        if let Ok(val) = std::env::var("SLUICE_BASE_URL") {
            self.client.base_url = val;
        }
    }

    /// Address the server binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Resolve the token store path for the current terminal session,
    /// expanding `~` if needed.
    pub fn resolved_token_store_path(&self) -> PathBuf {
        self.token_store_path_for(&session_key())
    }

    pub fn token_store_path_for(&self, session: &str) -> PathBuf {
        expand_tilde(&self.client.token_store_path.replace(SESSION_PLACEHOLDER, session))
    }
}

/// Placeholder in `client.token_store_path` for the session key.
pub const SESSION_PLACEHOLDER: &str = "{session}";

/// Key scoping the file token store to one terminal session: `SLUICE_SESSION`
/// when set, otherwise the invoking shell's process id.
pub fn session_key() -> String {
    match std::env::var("SLUICE_SESSION") {
        Ok(key) if !key.trim().is_empty() => sanitize_session_key(&key),
        _ => parent_session_key(),
    }
}

fn sanitize_session_key(key: &str) -> String {
    key.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(unix)]
fn parent_session_key() -> String {
    format!("ppid-{}", std::os::unix::process::parent_id())
}

#[cfg(not(unix))]
fn parent_session_key() -> String {
    "default".into()
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
