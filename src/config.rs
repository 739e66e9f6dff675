//! Server configuration: JSON file plus a small set of environment
//! overrides (host, port, data directory, log filter). Nothing else in
//! the environment influences behavior.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::memory::HalfLifeDefaults;

pub const APP_NAME: &str = "Kontura";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {reason}")]
    Unreadable { path: String, reason: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How an export target delivers artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportKind {
    XmlFile,
    CsvFile,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportTarget {
    pub kind: ExportKind,
    /// Directory for file targets, URL for HTTP targets.
    pub dest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEndpoint {
    pub url: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "defaults::host")]
    pub host: String,
    #[serde(default = "defaults::port")]
    pub port: u16,
    #[serde(default = "defaults::data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "defaults::log_filter")]
    pub log_filter: String,

    /// Concurrent inference slots.
    #[serde(default = "defaults::max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "defaults::max_queue_depth")]
    pub max_queue_depth: usize,
    #[serde(default = "defaults::prompt_token_budget")]
    pub prompt_token_budget: u32,
    /// Requests per minute per user.
    #[serde(default = "defaults::rate_limit_per_user")]
    pub rate_limit_per_user: u32,

    #[serde(default = "defaults::home_currency")]
    pub home_currency: String,
    /// Cash bookings at or above this amount cannot auto-advance.
    #[serde(default = "defaults::aml_cash_threshold", with = "rust_decimal::serde::str")]
    pub aml_cash_threshold: Decimal,

    #[serde(default = "defaults::l1_retention_days")]
    pub l1_retention_days: i64,
    #[serde(default)]
    pub l2_half_life_days: HalfLifeDefaults,

    #[serde(default = "defaults::rag_confidence_floor")]
    pub rag_confidence_floor: f32,

    /// Always true. Present so an attempt to turn it off is a loud
    /// config error instead of a silent ignore.
    #[serde(default = "defaults::approval_required")]
    pub approval_required_for_monetary: bool,

    #[serde(default = "defaults::export_targets")]
    pub export_targets: BTreeMap<String, ExportTarget>,

    #[serde(default = "defaults::inference_endpoint")]
    pub inference_endpoint: ModelEndpoint,
    #[serde(default = "defaults::vision_endpoint")]
    pub vision_endpoint: ModelEndpoint,
    #[serde(default = "defaults::embedding_endpoint")]
    pub embedding_endpoint: ModelEndpoint,
}

mod defaults {
    use super::*;

    pub fn host() -> String {
        "127.0.0.1".into()
    }
    pub fn port() -> u16 {
        8440
    }
    pub fn data_dir() -> PathBuf {
        PathBuf::from("./data")
    }
    pub fn log_filter() -> String {
        "info,kontura=debug".into()
    }
    pub fn max_sessions() -> usize {
        3
    }
    pub fn max_queue_depth() -> usize {
        50
    }
    pub fn prompt_token_budget() -> u32 {
        32_768
    }
    pub fn rate_limit_per_user() -> u32 {
        10
    }
    pub fn home_currency() -> String {
        "EUR".into()
    }
    pub fn aml_cash_threshold() -> Decimal {
        "10000.00".parse().expect("constant")
    }
    pub fn l1_retention_days() -> i64 {
        30
    }
    pub fn rag_confidence_floor() -> f32 {
        0.05
    }
    pub fn approval_required() -> bool {
        true
    }
    pub fn export_targets() -> BTreeMap<String, ExportTarget> {
        let mut targets = BTreeMap::new();
        targets.insert(
            "cpp".into(),
            ExportTarget {
                kind: ExportKind::XmlFile,
                dest: "./export/cpp".into(),
            },
        );
        targets.insert(
            "synesis".into(),
            ExportTarget {
                kind: ExportKind::CsvFile,
                dest: "./export/synesis".into(),
            },
        );
        targets
    }
    pub fn inference_endpoint() -> ModelEndpoint {
        ModelEndpoint {
            url: "http://127.0.0.1:8080".into(),
            model: "local-primary".into(),
        }
    }
    pub fn vision_endpoint() -> ModelEndpoint {
        ModelEndpoint {
            url: "http://127.0.0.1:8081".into(),
            model: "local-vision".into(),
        }
    }
    pub fn embedding_endpoint() -> ModelEndpoint {
        ModelEndpoint {
            url: "http://127.0.0.1:8082".into(),
            model: "local-embed".into(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults are total")
    }
}

impl Config {
    /// Load from a JSON file, apply environment overrides, validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut config: Config =
            serde_json::from_str(&raw).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Environment shadowing: host, port, data dir, log level only.
    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("KONTURA_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("KONTURA_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(dir) = std::env::var("KONTURA_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(filter) = std::env::var("KONTURA_LOG") {
            self.log_filter = filter;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.approval_required_for_monetary {
            return Err(ConfigError::Invalid(
                "approval_required_for_monetary cannot be disabled".into(),
            ));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid("max_sessions must be at least 1".into()));
        }
        if !crate::money::is_known_currency(&self.home_currency) {
            return Err(ConfigError::Invalid(format!(
                "unknown home currency {}",
                self.home_currency
            )));
        }
        if self.aml_cash_threshold <= Decimal::ZERO {
            return Err(ConfigError::Invalid("aml_cash_threshold must be positive".into()));
        }
        if self.export_targets.is_empty() {
            return Err(ConfigError::Invalid("at least one export target required".into()));
        }
        Ok(())
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("kontura.db")
    }

    pub fn watched_dir(&self) -> PathBuf {
        self.data_dir.join("watched")
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.data_dir.join("quarantine")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.home_currency, "EUR");
        assert_eq!(config.aml_cash_threshold.to_string(), "10000.00");
        assert_eq!(config.l1_retention_days, 30);
        assert!(config.export_targets.contains_key("cpp"));
    }

    #[test]
    fn approval_gate_cannot_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kontura.json");
        std::fs::write(&path, r#"{"approval_required_for_monetary": false}"#).unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn unknown_fields_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kontura.json");
        std::fs::write(&path, r#"{"surprise_option": 1}"#).unwrap();

        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kontura.json");
        std::fs::write(
            &path,
            r#"{"max_sessions": 5, "aml_cash_threshold": "15000.00", "rate_limit_per_user": 20}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.max_sessions, 5);
        assert_eq!(config.aml_cash_threshold.to_string(), "15000.00");
        assert_eq!(config.rate_limit_per_user, 20);
    }

    #[test]
    fn missing_file_is_unreadable() {
        let err = Config::load(Path::new("/nonexistent/kontura.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Unreadable { .. }));
    }
}
