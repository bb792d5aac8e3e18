use anyhow::Context;
use serde::Deserialize;
use std::{env, fs, path::Path, path::PathBuf};

/// Server configuration loaded from TOML file
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub auth: AuthSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

/// Network settings for the HTTP server
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    /// Host/interface to bind to, e.g. "127.0.0.1"
    pub host: String,
    /// Port to listen on, e.g. 3000
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    /// HMAC secret the auth provider signs session JWTs with.
    /// `${VAR}` reads it from the environment.
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    /// Directory holding `subscriptions.db`
    pub data_dir: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: "~/.local/share/leadline/server".to_string(),
        }
    }
}

impl StorageSettings {
    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        expand_home(&self.data_dir)
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => Ok(dirs::home_dir()
            .context("cannot determine home directory")?
            .join(rest)),
        None => Ok(PathBuf::from(path)),
    }
}

/// Resolve `${VAR}` to the value of the environment variable `VAR`
fn expand_env(value: &str, field: &str) -> anyhow::Result<String> {
    match value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        Some(var) => {
            env::var(var).with_context(|| format!("missing environment var {var} for {field}"))
        }
        None => Ok(value.to_string()),
    }
}

impl Settings {
    /// Load and parse the configuration from the given TOML file path
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&data)
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    pub fn from_toml(data: &str) -> anyhow::Result<Self> {
        let mut settings: Settings = toml::from_str(data).context("failed to parse config")?;
        settings.auth.jwt_secret = expand_env(&settings.auth.jwt_secret, "jwt_secret")?;
        if settings.auth.jwt_secret.is_empty() {
            anyhow::bail!("auth.jwt_secret must not be empty");
        }
        Ok(settings)
    }
}
