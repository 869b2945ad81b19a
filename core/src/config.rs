//! Engine configuration
//!
//! Values are layered, lowest priority first:
//! 1. Built-in defaults
//! 2. A TOML file: the explicit path, else `STRAND_CONFIG_PATH`, else an
//!    optional `strand.toml` in the working directory
//! 3. Environment variables prefixed `STRAND_`, nested with `__`
//!    (`STRAND_SCHEDULER__CAPACITY=64`), after loading `.env` if present
//! 4. Builder overrides

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::scheduler::DEFAULT_CAPACITY;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "STRAND_CONFIG_PATH";

/// Config file looked up when no path is given
const DEFAULT_CONFIG_FILE: &str = "strand";

const ENV_PREFIX: &str = "STRAND";

/* ===================== Sections ===================== */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Ring buffer size of the trampoline scheduler
    pub capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Surface failures no listener handled
    pub report_unhandled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            report_unhandled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub runtime: RuntimeConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load from file and environment with no overrides
    pub fn load() -> Result<Self> {
        Self::builder().build()
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.capacity == 0 {
            bail!("scheduler.capacity must be greater than zero");
        }
        if self.logging.filter.trim().is_empty() {
            bail!("logging.filter must not be empty");
        }
        Ok(())
    }

    /// Render as TOML, in the format accepted by the config file
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

/* ===================== Builder ===================== */

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_path: Option<PathBuf>,
    capacity: Option<usize>,
    log_filter: Option<String>,
    skip_env: bool,
}

impl ConfigBuilder {
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn capacity(mut self, capacity: Option<usize>) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn log_filter(mut self, filter: Option<String>) -> Self {
        self.log_filter = filter;
        self
    }

    /// Ignore environment variables and `.env` (file and overrides still apply)
    pub fn skip_env(mut self, skip: bool) -> Self {
        self.skip_env = skip;
        self
    }

    pub fn build(self) -> Result<Config> {
        if !self.skip_env {
            // A missing .env is fine
            let _ = dotenvy::dotenv();
        }

        let path = self.config_path.or_else(|| {
            if self.skip_env {
                None
            } else {
                std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from)
            }
        });

        let defaults = Config::default();
        let mut builder = config::Config::builder()
            .set_default("scheduler.capacity", defaults.scheduler.capacity as i64)?
            .set_default("runtime.report_unhandled", defaults.runtime.report_unhandled)?
            .set_default("logging.filter", defaults.logging.filter)?;

        builder = match &path {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file not found: {}", path.display());
                }
                builder.add_source(config::File::from(path.as_path()).required(true))
            }
            None => builder.add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };

        if !self.skip_env {
            builder = builder.add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        if let Some(capacity) = self.capacity {
            builder = builder.set_override("scheduler.capacity", capacity as i64)?;
        }
        if let Some(filter) = self.log_filter {
            builder = builder.set_override("logging.filter", filter)?;
        }

        let config: Config = builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Environment variables are process-global
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{}.toml", name, uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = Config::builder().skip_env(true).build().unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.scheduler.capacity, 1024);
        assert!(config.runtime.report_unhandled);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn test_file_then_override() {
        let path = write_temp(
            "strand-config",
            "[scheduler]\ncapacity = 64\n\n[runtime]\nreport_unhandled = false\n",
        );
        let config = Config::builder()
            .skip_env(true)
            .config_path(Some(path.clone()))
            .build()
            .unwrap();
        assert_eq!(config.scheduler.capacity, 64);
        assert!(!config.runtime.report_unhandled);

        let overridden = Config::builder()
            .skip_env(true)
            .config_path(Some(path.clone()))
            .capacity(Some(8))
            .build()
            .unwrap();
        assert_eq!(overridden.scheduler.capacity, 8);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_environment_layer() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("STRAND_SCHEDULER__CAPACITY", "32");
        std::env::set_var("STRAND_LOGGING__FILTER", "strand_core=debug");
        let config = Config::load();
        std::env::remove_var("STRAND_SCHEDULER__CAPACITY");
        std::env::remove_var("STRAND_LOGGING__FILTER");

        let config = config.unwrap();
        assert_eq!(config.scheduler.capacity, 32);
        assert_eq!(config.logging.filter, "strand_core=debug");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = Config::builder()
            .skip_env(true)
            .capacity(Some(0))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("capacity"));

        let missing = Config::builder()
            .skip_env(true)
            .config_path(Some(PathBuf::from("/nonexistent/strand.toml")))
            .build();
        assert!(missing.is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = Config::default();
        config.scheduler.capacity = 12;
        let rendered = config.to_toml().unwrap();
        let path = write_temp("strand-rendered", &rendered);
        let loaded = Config::builder()
            .skip_env(true)
            .config_path(Some(path.clone()))
            .build()
            .unwrap();
        assert_eq!(loaded, config);
        std::fs::remove_file(path).unwrap();
    }
}
