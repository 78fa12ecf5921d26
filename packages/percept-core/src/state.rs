//! Core application configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration for the Percept Hub server.
///
/// All fields have sensible defaults.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Preferred port for the HTTP/WS server (0 = auto-allocate).
    pub preferred_port: u16,

    /// Directory where recordings and their sidecars live.
    pub recordings_dir: PathBuf,

    /// Base URL of the segmentation service (http:// or https://).
    pub segmentation_host: String,
}

impl Config {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.recordings_dir.as_os_str().is_empty() {
            return Err("recordings_dir must not be empty".to_string());
        }
        if !self.segmentation_host.starts_with("http://")
            && !self.segmentation_host.starts_with("https://")
        {
            return Err(format!(
                "segmentation_host must be an http(s) URL, got {:?}",
                self.segmentation_host
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preferred_port: 0,
            recordings_dir: PathBuf::from("recordings"),
            segmentation_host: "http://127.0.0.1:8081".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_http_segmentation_host() {
        let config = Config {
            segmentation_host: "127.0.0.1:8081".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_recordings_dir() {
        let config = Config {
            recordings_dir: PathBuf::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
