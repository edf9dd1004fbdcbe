mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

const SEARCH_PATHS: [&str; 2] = ["config/cetus.toml", "cetus.toml"];

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Load the explicit path if given, else the first readable search path, else defaults
pub fn load_or_default(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    if let Some(path) = explicit {
        let config = load_config(path)?;
        info!(path = %path.display(), "Loaded configuration");
        return Ok(config);
    }

    for path in SEARCH_PATHS.iter().map(PathBuf::from) {
        if !path.exists() {
            continue;
        }
        match load_config(&path) {
            Ok(config) => {
                info!(path = %path.display(), "Loaded configuration");
                return Ok(config);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load config");
            }
        }
    }

    info!("Using default configuration");
    Ok(Config::default())
}
