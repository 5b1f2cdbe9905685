//! Engine settings
//!
//! Loaded from a TOML/YAML/JSON file through the `config` crate, with
//! `SAFENET_*` environment variables taking precedence. Every field has a
//! default so an empty or missing file is valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable prefix for overrides, e.g. `SAFENET_CONFIG_DIR`
pub const ENV_PREFIX: &str = "SAFENET";

/// Locations probed by [`EngineSettings::load_with_defaults`], first hit wins
pub const DEFAULT_SETTINGS_PATHS: &[&str] = &["/etc/safenet/engine.toml", "./safenet.toml"];

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid setting {field}: {value}")]
    Invalid { field: &'static str, value: String },
}

/// Tunables of the safe-apply engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Directory of the layered configuration store
    pub config_dir: PathBuf,
    /// Tag placed between priority and identity in file names
    pub file_tag: String,
    pub file_extension: String,
    /// Permission bits for written files; `None` keeps the umask default
    pub file_mode: Option<u32>,
    /// Prefixes of the older fixed-priority naming scheme, cleaned up on rewrite
    pub legacy_prefixes: Vec<u8>,
    /// Renderer written into generated documents
    pub renderer: String,
    /// Default test duration handed to the backend
    pub test_timeout_seconds: u64,
    /// Added to the test duration for the local timer
    pub timeout_buffer_seconds: u64,
    pub netplan_path: String,
    pub ip_path: String,
    /// Upper bound for apply and routing commands
    pub command_timeout_seconds: u64,
    /// Snapshot and restore routes around attempts
    pub preserve_routes: bool,
    /// Where attempt journals are written, disabled when unset
    pub journal_dir: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/etc/netplan"),
            file_tag: "xavs".to_string(),
            file_extension: "yaml".to_string(),
            file_mode: Some(0o600),
            legacy_prefixes: vec![90, 91, 92, 95],
            renderer: "networkd".to_string(),
            test_timeout_seconds: 120,
            timeout_buffer_seconds: 5,
            netplan_path: "netplan".to_string(),
            ip_path: "ip".to_string(),
            command_timeout_seconds: 60,
            preserve_routes: true,
            journal_dir: None,
        }
    }
}

impl EngineSettings {
    /// Load settings from `path`, with environment overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?;

        let loaded: EngineSettings = settings.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Load from the first existing standard location, falling back to
    /// defaults; environment overrides always apply
    pub fn load_with_defaults() -> Result<Self, SettingsError> {
        let mut builder = config::Config::builder();

        if let Some(path) = DEFAULT_SETTINGS_PATHS
            .iter()
            .map(Path::new)
            .find(|p| p.exists())
        {
            log::info!("Loading engine settings from {}", path.display());
            builder = builder.add_source(config::File::from(path));
        }

        let loaded: EngineSettings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let valid_token = |s: &str| {
            !s.is_empty()
                && s
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        };

        if !valid_token(&self.file_tag) {
            return Err(SettingsError::Invalid {
                field: "file_tag",
                value: self.file_tag.clone(),
            });
        }
        if !valid_token(&self.file_extension) {
            return Err(SettingsError::Invalid {
                field: "file_extension",
                value: self.file_extension.clone(),
            });
        }
        if self.test_timeout_seconds == 0 {
            return Err(SettingsError::Invalid {
                field: "test_timeout_seconds",
                value: "0".to_string(),
            });
        }
        if let Some(prefix) = self.legacy_prefixes.iter().find(|p| **p > 99) {
            return Err(SettingsError::Invalid {
                field: "legacy_prefixes",
                value: prefix.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = EngineSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.timeout_buffer_seconds, 5);
        assert_eq!(settings.file_mode, Some(0o600));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "config_dir = \"/tmp/netplan-test\"").unwrap();
        writeln!(file, "test_timeout_seconds = 60").unwrap();
        writeln!(file, "file_tag = \"lab\"").unwrap();

        let settings = EngineSettings::load_from_file(file.path()).unwrap();
        assert_eq!(settings.config_dir, PathBuf::from("/tmp/netplan-test"));
        assert_eq!(settings.test_timeout_seconds, 60);
        assert_eq!(settings.file_tag, "lab");
        // untouched fields keep their defaults
        assert_eq!(settings.renderer, "networkd");
        assert!(settings.preserve_routes);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let settings = EngineSettings {
            file_tag: "a/b".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::Invalid {
                field: "file_tag",
                ..
            })
        ));

        let settings = EngineSettings {
            test_timeout_seconds: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = EngineSettings {
            legacy_prefixes: vec![90, 150],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
