use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
    pub sidecar: SidecarConfig,
    pub queue: QueueConfig,
    pub devices: DeviceConfig,
    pub servers: Vec<ServerSeed>,
    pub accounts: Vec<AccountSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8092,
        }
    }
}

/// Admin surface credentials. Customer routes authenticate with account API keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub sqlite_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            sqlite_path: "~/.wa-gateway/state.sqlite".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Sent as `X-Sidecar-Token` on calls into the WhatsApp session servers.
    pub api_token: Option<String>,
    /// Expected on status callbacks coming back from the session servers.
    pub webhook_token: Option<String>,
    pub webhook_path: String,
    pub request_timeout_seconds: u64,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            api_token: None,
            webhook_token: None,
            webhook_path: "/v1/session-events".to_string(),
            request_timeout_seconds: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub poll_interval_ms: u64,
    pub estimated_send_ms: u64,
    pub max_retries: i64,
    pub max_bulk: usize,
    pub max_bulk_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            estimated_send_ms: 2000,
            max_retries: 5,
            max_bulk: 1000,
            max_bulk_delay_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub qr_ttl_seconds: i64,
    pub probe_interval_seconds: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            qr_ttl_seconds: 120,
            probe_interval_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSeed {
    pub id: String,
    pub url: String,
    pub max_capacity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSeed {
    pub id: String,
    pub name: String,
    pub api_key: String,
    #[serde(default = "default_package")]
    pub package_name: String,
    #[serde(default = "unlimited")]
    pub message_limit: i64,
    #[serde(default = "unlimited")]
    pub device_limit: i64,
}

fn default_package() -> String {
    "default".to_string()
}

fn unlimited() -> i64 {
    -1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            database: DatabaseConfig::default(),
            sidecar: SidecarConfig::default(),
            queue: QueueConfig::default(),
            devices: DeviceConfig::default(),
            servers: vec![ServerSeed {
                id: "local".to_string(),
                url: "http://127.0.0.1:4040".to_string(),
                max_capacity: 50,
            }],
            accounts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("sidecar.webhook_path must start with '/': {0:?}")]
    WebhookPathNotAbsolute(String),
    #[error("sidecar.webhook_path must not contain route parameters: {0:?}")]
    WebhookPathHasParams(String),
    #[error("sidecar.webhook_path collides with an API route: {0:?}")]
    WebhookPathTaken(String),
}

/// The webhook is mounted next to the API routes in `taken`; the router
/// refuses relative, parameterised or duplicate paths.
pub fn check_webhook_path(path: &str, taken: &[&str]) -> Result<(), ConfigError> {
    if !path.starts_with('/') {
        return Err(ConfigError::WebhookPathNotAbsolute(path.to_string()));
    }
    if path.contains(':') || path.contains('*') {
        return Err(ConfigError::WebhookPathHasParams(path.to_string()));
    }
    if taken.contains(&path) {
        return Err(ConfigError::WebhookPathTaken(path.to_string()));
    }
    Ok(())
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn resolve_config_path() -> PathBuf {
    env::var("WA_GATEWAY_CONFIG")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| expand_tilde("~/.wa-gateway/wa-gateway.json"))
}

fn env_override(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub fn load_config() -> Config {
    let config_path = resolve_config_path();
    let mut cfg = Config::default();

    if config_path.exists() {
        match fs::read_to_string(&config_path) {
            Ok(raw) => match serde_json::from_str::<Config>(&raw) {
                Ok(file_cfg) => cfg = file_cfg,
                Err(err) => tracing::warn!(
                    path = %config_path.display(),
                    "ignoring unparsable config file: {err}"
                ),
            },
            Err(err) => tracing::warn!(path = %config_path.display(), "cannot read config: {err}"),
        }
    }

    apply_env_overrides(&mut cfg);
    cfg
}

pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(token) = env_override("WA_GATEWAY_ADMIN_TOKEN") {
        cfg.auth.admin_token = Some(token);
    }
    if let Some(url) = env_override("WA_GATEWAY_DATABASE_URL") {
        cfg.database.url = Some(url);
    }
    if let Some(path) = env_override("WA_GATEWAY_SQLITE_PATH") {
        cfg.database.sqlite_path = path;
    }
    if let Some(token) = env_override("WA_GATEWAY_SIDECAR_TOKEN") {
        cfg.sidecar.api_token = Some(token);
    }
    if let Some(token) = env_override("WA_GATEWAY_WEBHOOK_TOKEN") {
        cfg.sidecar.webhook_token = Some(token);
    }
    if let Some(port) = env_override("WA_GATEWAY_PORT").and_then(|p| p.parse().ok()) {
        cfg.server.port = port;
    }
}

pub fn resolve_database_url(cfg: &Config) -> String {
    if let Some(url) = cfg.database.url.as_ref() {
        return url.to_string();
    }

    let path = expand_tilde(&cfg.database.sqlite_path);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    format!("sqlite://{}?mode=rwc", path.to_string_lossy())
}
