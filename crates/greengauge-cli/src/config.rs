//! Server configuration: JSON file plus command-line overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use greengauge_core::PipelineConfig;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 10000;

/// Everything `greengauge serve` needs.
///
/// ```json
/// {
///   "host": "0.0.0.0",
///   "port": 10000,
///   "data": "greengauge.json",
///   "reference": "reference.json",
///   "pipeline": { "poll_interval_ms": 5000, "request_timeout_ms": 3000 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data: Option<PathBuf>,
    pub reference: Option<PathBuf>,
    pub pipeline: PipelineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            data: None,
            reference: None,
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Flags given on the command line. `None` keeps the file's value.
#[derive(Debug, Default)]
pub struct Overrides<'a> {
    pub config: Option<&'a str>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub data: Option<String>,
    pub reference: Option<String>,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        serde_json::from_str(&text).map_err(|e| format!("invalid config {}: {e}", path.display()))
    }

    /// Load the file named by `overrides.config` (if any) and apply the flags.
    pub fn resolve(overrides: Overrides<'_>) -> Result<Self, String> {
        let mut config = match overrides.config {
            Some(path) => Self::load(Path::new(path))?,
            None => Self::default(),
        };
        if let Some(host) = overrides.host {
            config.host = host;
        }
        if let Some(port) = overrides.port {
            config.port = port;
        }
        if let Some(data) = overrides.data {
            config.data = Some(PathBuf::from(data));
        }
        if let Some(reference) = overrides.reference {
            config.reference = Some(PathBuf::from(reference));
        }
        config.pipeline.validate().map_err(|e| e.to_string())?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let c = ServerConfig::resolve(Overrides::default()).unwrap();
        assert_eq!(c.host, "127.0.0.1");
        assert_eq!(c.port, 10000);
        assert!(c.data.is_none());
    }

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serve.json");
        std::fs::write(
            &path,
            r#"{"host": "0.0.0.0", "port": 8080, "pipeline": {"poll_interval_ms": 1000}}"#,
        )
        .unwrap();
        let path_str = path.to_string_lossy().to_string();

        let c = ServerConfig::resolve(Overrides {
            config: Some(&path_str),
            port: Some(9090),
            ..Overrides::default()
        })
        .unwrap();
        assert_eq!(c.host, "0.0.0.0");
        assert_eq!(c.port, 9090);
        assert_eq!(c.pipeline.poll_interval_ms, 1000);
        assert_eq!(c.pipeline.precision, 3);
    }

    #[test]
    fn test_invalid_pipeline_section_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serve.json");
        std::fs::write(&path, r#"{"pipeline": {"poll_interval_ms": 0}}"#).unwrap();
        let path_str = path.to_string_lossy().to_string();
        assert!(
            ServerConfig::resolve(Overrides {
                config: Some(&path_str),
                ..Overrides::default()
            })
            .is_err()
        );
    }

    #[test]
    fn test_demo_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos/serve.json");
        let c = ServerConfig::load(&path).unwrap();
        assert_eq!(c.pipeline.request_timeout_ms, Some(3000));
        assert_eq!(c.reference, Some(PathBuf::from("demos/reference.json")));
        c.pipeline.validate().unwrap();
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(ServerConfig::load(Path::new("/nonexistent/greengauge.json")).is_err());
    }
}
