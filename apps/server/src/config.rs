//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the HTTP/WS server to (0 = auto-allocate).
    /// Override: `PERCEPT_BIND_PORT`
    pub bind_port: u16,

    /// Directory where recordings and annotation sidecars live.
    /// Override: `PERCEPT_RECORDINGS_DIR`
    pub recordings_dir: PathBuf,

    /// Base URL of the segmentation service.
    /// Override: `PERCEPT_SEGMENTATION_HOST`
    pub segmentation_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_port: 0,
            recordings_dir: PathBuf::from("recordings"),
            segmentation_host: "http://127.0.0.1:8081".to_string(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, falling back to defaults when no
    /// path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = if let Some(path) = path {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            Self::default()
        };
        Ok(config)
    }

    /// Converts to the core library configuration.
    pub fn to_core_config(&self) -> percept_core::Config {
        percept_core::Config {
            preferred_port: self.bind_port,
            recordings_dir: self.recordings_dir.clone(),
            segmentation_host: self.segmentation_host.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_converts_cleanly() {
        let config = ServerConfig::default();
        let core = config.to_core_config();
        assert!(core.validate().is_ok());
        assert_eq!(core.preferred_port, 0);
    }

    #[test]
    fn partial_yaml_uses_defaults() {
        let config: ServerConfig = serde_yaml::from_str("bind_port: 9000\n").unwrap();
        assert_eq!(config.bind_port, 9000);
        assert_eq!(config.segmentation_host, "http://127.0.0.1:8081");
    }
}
