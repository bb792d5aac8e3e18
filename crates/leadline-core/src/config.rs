use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::models::{CurrentUser, PushKeys, PushSubscription};
use crate::notify::PermissionState;
use crate::sync::RetryPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine home directory")]
    NoHomeDir,

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to generate schema: {0}")]
    Schema(#[from] serde_json::Error),
}

type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Configuration for the leadline sync core
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub reminders: ReminderSettings,
    #[serde(default)]
    pub notifications: NotificationSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RemoteConfig {
    /// Base URL of the hosted backend (REST collections live under `/rest/v1`)
    pub base_url: Option<String>,
    /// Public API key sent with every request
    pub api_key: Option<String>,
    /// Base URL of leadline-server, which owns the notification endpoints
    pub notifications_url: Option<String>,
    /// Websocket URL of the realtime assignment feed
    pub realtime_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SyncSettings {
    /// Path to the local queue database
    pub database_path: Option<PathBuf>,

    /// Attempts before a queued mutation is failed for manual resolution
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    /// Maximum number of unsynced mutations kept locally
    #[serde(default = "default_max_queue_len")]
    pub max_queue_len: usize,

    /// Periodic drain interval in seconds, for mutations waiting on backoff
    #[serde(default = "default_sync_interval")]
    pub interval_seconds: u64,

    /// Connectivity flaps inside this window collapse into one drain
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Seconds before a mutation claimed by another process is presumed abandoned
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,

    /// URL sampled by the connectivity probe (defaults to the remote base URL)
    pub probe_url: Option<String>,

    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReminderSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Poll interval in seconds
    #[serde(default = "default_reminder_interval")]
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NotificationSettings {
    /// Ask for notification permission once per session when still undecided
    #[serde(default = "default_true")]
    pub auto_request_permission: bool,

    /// Push subscription issued to this device, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<PushEndpointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PushEndpointConfig {
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
}

impl PushEndpointConfig {
    pub fn to_subscription(&self) -> PushSubscription {
        PushSubscription {
            endpoint: self.endpoint.clone(),
            keys: PushKeys {
                p256dh: self.p256dh.clone(),
                auth: self.auth.clone(),
            },
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_secs() -> u64 {
    2
}

fn default_backoff_max_secs() -> u64 {
    300 // 5 minutes
}

fn default_max_queue_len() -> usize {
    10_000
}

fn default_sync_interval() -> u64 {
    30
}

fn default_debounce_ms() -> u64 {
    1_500
}

fn default_claim_timeout_secs() -> u64 {
    300
}

fn default_probe_interval_secs() -> u64 {
    10
}

fn default_probe_timeout_ms() -> u64 {
    3_000
}

fn default_reminder_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            database_path: None,
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            max_queue_len: default_max_queue_len(),
            interval_seconds: default_sync_interval(),
            debounce_ms: default_debounce_ms(),
            claim_timeout_secs: default_claim_timeout_secs(),
            probe_url: None,
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Default for ReminderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_reminder_interval(),
        }
    }
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            auto_request_permission: true,
            push: None,
        }
    }
}

const CONFIG_HEADER: &str = "# leadline configuration\n# Generate a JSON schema with `leadline-syncd schema`\n\n";

fn data_dir() -> ConfigResult<PathBuf> {
    let home_dir = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
    Ok(home_dir.join(".local").join("share").join("leadline"))
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> ConfigResult<T> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn write_file(path: &Path, content: &str) -> ConfigResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

impl Config {
    /// Location of the config file, honouring `LEADLINE_CONFIG`
    pub fn config_path() -> ConfigResult<PathBuf> {
        if let Ok(custom_path) = std::env::var("LEADLINE_CONFIG") {
            return Ok(PathBuf::from(custom_path));
        }
        let home_dir = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home_dir.join(".config").join("leadline").join("config.toml"))
    }

    /// Load configuration from the default location, writing defaults if missing
    pub fn load() -> ConfigResult<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            let default_config = Self::default();
            default_config.save_to(&path)?;
            return Ok(default_config);
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        read_toml(path)
    }

    pub fn save(&self) -> ConfigResult<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        let toml_str = toml::to_string_pretty(self)?;
        write_file(path, &format!("{CONFIG_HEADER}{toml_str}"))
    }

    /// Local queue database, defaulting to the data directory
    pub fn database_path(&self) -> ConfigResult<PathBuf> {
        match &self.sync.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("queue.db")),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.sync.max_attempts.max(1),
            base_delay: Duration::from_secs(self.sync.backoff_base_secs),
            max_delay: Duration::from_secs(self.sync.backoff_max_secs),
            jitter: true,
        }
    }

    /// URL the connectivity probe samples
    pub fn probe_url(&self) -> Option<String> {
        self.sync
            .probe_url
            .clone()
            .or_else(|| self.remote.base_url.clone())
    }

    pub fn generate_schema() -> ConfigResult<String> {
        let schema = schemars::schema_for!(Config);
        Ok(serde_json::to_string_pretty(&schema)?)
    }
}

/// Machine-specific state that is never synced
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct State {
    #[serde(default)]
    pub auth: AuthState,
    #[serde(default)]
    pub device: DeviceState,
    #[serde(default)]
    pub notifications: NotificationState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AuthState {
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub role: Option<String>,
    /// Bearer token issued by the auth provider
    pub access_token: Option<String>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DeviceState {
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct NotificationState {
    #[serde(default)]
    pub permission: PermissionState,
}

impl State {
    /// Location of the state file, honouring `LEADLINE_STATE`
    pub fn state_path() -> ConfigResult<PathBuf> {
        if let Ok(custom_path) = std::env::var("LEADLINE_STATE") {
            return Ok(PathBuf::from(custom_path));
        }
        Ok(data_dir()?.join("state.toml"))
    }

    pub fn load() -> ConfigResult<Self> {
        let path = Self::state_path()?;
        if !path.exists() {
            let mut state = Self::default();
            state.init();
            state.save_to(&path)?;
            return Ok(state);
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        read_toml(path)
    }

    pub fn save(&self) -> ConfigResult<()> {
        self.save_to(&Self::state_path()?)
    }

    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        let toml_str = toml::to_string_pretty(self)?;
        write_file(path, &toml_str)
    }

    /// Generate a device id if missing
    pub fn init(&mut self) {
        if self.device.device_id.is_none() {
            self.device.device_id = Some(uuid::Uuid::new_v4().to_string());
        }
    }

    /// Check if the stored session exists and has not expired
    pub fn is_session_valid(&self) -> bool {
        match (&self.auth.access_token, self.auth.expires_at) {
            (Some(token), Some(expires_at)) => {
                !token.is_empty() && chrono::Utc::now() < expires_at
            }
            (Some(token), None) => !token.is_empty(),
            _ => false,
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        if self.is_session_valid() {
            self.auth.access_token.as_deref()
        } else {
            None
        }
    }

    pub fn current_user(&self) -> Option<CurrentUser> {
        if !self.is_session_valid() {
            return None;
        }
        Some(CurrentUser {
            id: self.auth.user_id.clone()?,
            role: self
                .auth
                .role
                .clone()
                .unwrap_or_else(|| "telecaller".to_string()),
            email: self.auth.email.clone(),
        })
    }

    pub fn store_session(
        &mut self,
        user: &CurrentUser,
        access_token: String,
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    ) {
        self.auth.user_id = Some(user.id.clone());
        self.auth.role = Some(user.role.clone());
        self.auth.email = user.email.clone();
        self.auth.access_token = Some(access_token);
        self.auth.expires_at = expires_at;
    }

    pub fn clear_session(&mut self) {
        self.auth = AuthState::default();
    }
}
