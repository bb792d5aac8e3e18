use anyhow::{Context, Result};
use leadline_core::config::{Config, State};
use std::path::{Path, PathBuf};
use tracing::info;

/// Expand a leading `~/` in a command line path
pub fn expand_path(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => Ok(dirs::home_dir()
            .context("Cannot determine home directory")?
            .join(rest)),
        None => Ok(PathBuf::from(path)),
    }
}

/// Load the daemon configuration, writing defaults on first run
pub fn load_syncd_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => Config::config_path()?,
    };

    if !path.exists() {
        let default_config = Config::default();
        default_config
            .save_to(&path)
            .context("Failed to save default config")?;
        info!("Created default config at {}", path.display());
        return Ok(default_config);
    }

    Config::load_from(&path).with_context(|| format!("Failed to load {}", path.display()))
}

/// Load machine state, making sure this device has an id
pub fn load_state() -> Result<(State, PathBuf)> {
    let path = State::state_path()?;
    let mut state = if path.exists() {
        State::load_from(&path).with_context(|| format!("Failed to load {}", path.display()))?
    } else {
        State::default()
    };

    if state.device.device_id.is_none() {
        state.init();
        state
            .save_to(&path)
            .context("Failed to save state with device info")?;
        info!(
            "Generated new device_id: {}",
            state.device.device_id.as_deref().unwrap_or_default()
        );
    }
    Ok((state, path))
}
