//! Configuration using Figment
//!
//! Strongly-typed configuration of the acquisition context. Configuration is
//! loaded from:
//! 1. `config/scan.toml` (base configuration)
//! 2. Environment variables (prefixed with `DAQ_SCAN_`)
//!
//! # Example
//! ```no_run
//! use daq_scan::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Data root: {}", config.data.root.display());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::logging::OutputFormat;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Data directories, counters and file names
    #[serde(default)]
    pub data: DataConfig,
    /// Scan engine settings
    #[serde(default)]
    pub scan: ScanConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log line format (pretty, compact, json)
    #[serde(default)]
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "daq-scan".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::default(),
        }
    }
}

/// Data directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Global data root
    pub root: PathBuf,
    /// Proposal directory below the root (empty: the root itself)
    #[serde(default)]
    pub proposal_dir: String,
    /// Sample directory below the proposal directory
    #[serde(default)]
    pub sample_dir: String,
    /// Name of the counter file kept in each data directory
    #[serde(default = "default_counter_file")]
    pub counter_file: String,
    /// Number of finished scans kept in memory
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// File name templates per set type (`point`, `scan`, `subscan`, `block`)
    #[serde(default)]
    pub name_templates: HashMap<String, Vec<String>>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            proposal_dir: String::new(),
            sample_dir: String::new(),
            counter_file: default_counter_file(),
            history_size: default_history_size(),
            name_templates: HashMap::new(),
        }
    }
}

/// Scan engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Interval between detector completion polls in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Dry-run mode: no counters, only simulation-capable sinks
    #[serde(default)]
    pub simulation: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            simulation: false,
        }
    }
}

// Default value functions
fn default_counter_file() -> String {
    "counters.json".to_string()
}

fn default_history_size() -> usize {
    10
}

fn default_poll_interval() -> u64 {
    10
}

impl AppConfig {
    /// Load configuration from `config/scan.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `DAQ_SCAN_`, nested
    /// keys separated by `__`.
    /// Example: `DAQ_SCAN_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/scan.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQ_SCAN_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.data.counter_file.is_empty() || self.data.counter_file.contains('/') {
            return Err(format!(
                "Invalid counter_file '{}'. Must be a plain file name",
                self.data.counter_file
            ));
        }

        if self.data.history_size == 0 {
            return Err("history_size must be at least 1".to_string());
        }

        if self.scan.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be positive".to_string());
        }

        let valid_settypes = ["point", "scan", "subscan", "block"];
        for (settype, templates) in &self.data.name_templates {
            if !valid_settypes.contains(&settype.as_str()) {
                return Err(format!(
                    "Invalid name_templates key '{}'. Must be one of: {}",
                    settype,
                    valid_settypes.join(", ")
                ));
            }
            if templates.is_empty() {
                return Err(format!("name_templates.{} must not be empty", settype));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
name = "Test"
log_level = "debug"

[data]
root = "/tmp/daq"
proposal_dir = "p1234"
history_size = 3

[data.name_templates]
scan = ["{{proposal}}_{{scancounter:0>8}}.csv"]

[scan]
poll_interval_ms = 5
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.data.root, PathBuf::from("/tmp/daq"));
        assert_eq!(config.data.counter_file, "counters.json");
        assert_eq!(config.data.history_size, 3);
        assert_eq!(config.scan.poll_interval_ms, 5);
        assert!(!config.scan.simulation);
        assert_eq!(
            config.data.name_templates["scan"],
            vec!["{proposal}_{scancounter:0>8}.csv".to_string()]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("scan.toml", "[scan]\nsimulation = false\n")?;
            jail.set_env("DAQ_SCAN_SCAN__SIMULATION", "true");
            jail.set_env("DAQ_SCAN_APPLICATION__LOG_LEVEL", "warn");
            jail.set_env("DAQ_SCAN_APPLICATION__LOG_FORMAT", "json");

            let config = AppConfig::load_from("scan.toml")?;
            assert!(config.scan.simulation);
            assert_eq!(config.application.log_level, "warn");
            assert_eq!(config.application.log_format, OutputFormat::Json);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_name_template_key() {
        let mut config = AppConfig::default();
        config
            .data
            .name_templates
            .insert("run".to_string(), vec!["x.dat".to_string()]);
        assert!(config.validate().is_err());
    }
}
