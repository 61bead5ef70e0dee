//! Configuration management for the vmsmith CLI.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::cli::Args;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vmsmith/vmsmith.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Management layer connection
    pub connection: ConnectionConfig,
    /// Log output
    pub logging: LoggingConfig,
    /// Local storage tooling
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load the configuration named on the command line, or the one at the
    /// default location if it exists, or fall back to defaults.
    pub fn resolve(args: &Args) -> Result<Self> {
        let config = match &args.config {
            Some(path) => Self::load(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(DEFAULT_CONFIG_PATH)?,
            None => Self::default(),
        };
        Ok(config.with_cli_overrides(args))
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref uri) = args.connect {
            self.connection.uri = Some(uri.clone());
        }

        if args.dev {
            self.connection.backend = Backend::Mock;
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }

        if args.log_json {
            self.logging.format = LogFormat::Json;
        }

        self
    }
}

/// Management layer connection configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Libvirt connection URI (libvirt's default connection if not set)
    pub uri: Option<String>,
    /// Backend type
    pub backend: Backend,
}

/// Management backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Libvirt/QEMU backend
    Libvirt,
    /// In-memory backend for development
    Mock,
}

impl Default for Backend {
    fn default() -> Self {
        Self::Libvirt
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        Self::Pretty
    }
}

/// Storage tooling configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// qemu-img binary used to probe image formats
    pub qemu_img_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            qemu_img_path: "qemu-img".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.connection.backend, Backend::Libvirt);
        assert_eq!(config.connection.uri, None);
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.storage.qemu_img_path, "qemu-img");
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "connection:\n  uri: qemu:///session\nlogging:\n  format: json\n"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.connection.uri.as_deref(), Some("qemu:///session"));
        assert_eq!(config.connection.backend, Backend::Libvirt);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_load_errors() {
        assert!(Config::load("/nonexistent/vmsmith.yaml").is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "connection:\n  backend: xen\n").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_cli_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "connection:\n  uri: qemu:///session\n").unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let args = Args::parse_from([
            "vmsmith",
            "--config",
            &path,
            "--connect",
            "qemu:///system",
            "--dev",
            "--log-level",
            "debug",
            "pool-list",
        ]);
        let config = Config::resolve(&args).unwrap();

        assert_eq!(config.connection.uri.as_deref(), Some("qemu:///system"));
        assert_eq!(config.connection.backend, Backend::Mock);
        assert_eq!(config.logging.level, "debug");
    }
}
