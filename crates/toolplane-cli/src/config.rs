//! Configuration discovery and loading.
//!
//! Resolution order: explicit `--config` path, then the
//! `TOOLPLANE_CONFIG` environment variable, then
//! `~/.config/toolplane/toolplane.toml`, then built-in defaults.
//! A path given explicitly must exist; the well-known locations are
//! allowed to be absent.

use std::path::PathBuf;

use anyhow::Context;
use tracing::{debug, info};

use toolplane_types::Config;

/// Environment variable naming an alternate config path.
const CONFIG_ENV: &str = "TOOLPLANE_CONFIG";

/// Load configuration, falling back to defaults when no file is found.
pub fn load(explicit: Option<&str>) -> anyhow::Result<Config> {
    let Some(path) = discover(explicit)? else {
        debug!("no config file found, using defaults");
        return Ok(Config::default());
    };

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    let config: Config = toml::from_str(&text)
        .with_context(|| format!("failed to parse config at {}", path.display()))?;

    info!(path = %path.display(), "loaded configuration");
    Ok(config)
}

/// Find the config file to use, if any.
fn discover(explicit: Option<&str>) -> anyhow::Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        let path = PathBuf::from(path);
        if !path.exists() {
            anyhow::bail!("config file not found: {}", path.display());
        }
        return Ok(Some(path));
    }

    if let Ok(path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(path);
        if !path.exists() {
            anyhow::bail!("{CONFIG_ENV} points at a missing file: {}", path.display());
        }
        return Ok(Some(path));
    }

    if let Some(config_dir) = dirs::config_dir() {
        let path = config_dir.join("toolplane").join("toolplane.toml");
        if path.exists() {
            return Ok(Some(path));
        }
    }

    Ok(None)
}
