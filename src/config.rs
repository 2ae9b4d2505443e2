//! Configuration for impact-ledger

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::bundle::BundleRatio;
use crate::db::Category;
use crate::error::LedgerError;

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("impact-ledger")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the ledger database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Scheduled accrual interval in seconds (0 = manual runs only)
    #[serde(default = "default_accrual_interval")]
    pub accrual_interval_secs: u64,

    /// How long a writer waits for the SQLite lock
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,

    /// Selection attempts per issue call (2 = one retry after a conflict)
    #[serde(default = "default_issue_attempts")]
    pub issue_attempts: u32,

    /// Certificate number prefix, e.g. CDV-2026-000001
    #[serde(default = "default_certificate_prefix")]
    pub certificate_prefix: String,

    /// Raw units per token
    #[serde(default)]
    pub rates: RateConfig,

    /// Tokens per certificate
    #[serde(default)]
    pub bundle: BundleConfig,
}

/// Conversion rate per category, in the category's raw unit (kg, hours, units)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateConfig {
    #[serde(default = "default_rate")]
    pub residue: Decimal,
    #[serde(default = "default_rate")]
    pub education: Decimal,
    #[serde(default = "default_rate")]
    pub product: Decimal,
}

impl RateConfig {
    pub fn rate(&self, category: Category) -> Decimal {
        match category {
            Category::Residue => self.residue,
            Category::Education => self.education,
            Category::Product => self.product,
        }
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            residue: default_rate(),
            education: default_rate(),
            product: default_rate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleConfig {
    #[serde(default = "default_bundle_residue")]
    pub residue: u32,
    #[serde(default = "default_bundle_education")]
    pub education: u32,
    #[serde(default = "default_bundle_product")]
    pub product: u32,
}

impl BundleConfig {
    pub fn ratio(&self) -> Result<BundleRatio, LedgerError> {
        BundleRatio::new(BTreeMap::from([
            (Category::Residue, self.residue),
            (Category::Education, self.education),
            (Category::Product, self.product),
        ]))
    }
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            residue: default_bundle_residue(),
            education: default_bundle_education(),
            product: default_bundle_product(),
        }
    }
}

fn default_http_port() -> u16 {
    8095
}

fn default_accrual_interval() -> u64 {
    300
}

fn default_busy_timeout() -> u64 {
    5_000
}

fn default_issue_attempts() -> u32 {
    2
}

fn default_certificate_prefix() -> String {
    "CDV".to_string()
}

fn default_rate() -> Decimal {
    Decimal::ONE
}

fn default_bundle_residue() -> u32 {
    250
}

fn default_bundle_education() -> u32 {
    5
}

fn default_bundle_product() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            http_port: default_http_port(),
            accrual_interval_secs: default_accrual_interval(),
            busy_timeout_ms: default_busy_timeout(),
            issue_attempts: default_issue_attempts(),
            certificate_prefix: default_certificate_prefix(),
            rates: RateConfig::default(),
            bundle: BundleConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Reject settings the ledger cannot run with
    pub fn validate(&self) -> Result<(), LedgerError> {
        for category in Category::ALL {
            let rate = self.rates.rate(category);
            if rate <= Decimal::ZERO {
                return Err(LedgerError::Config(format!(
                    "Rate for {} must be positive, got {}",
                    category, rate
                )));
            }
        }
        self.bundle.ratio()?;
        if self.issue_attempts == 0 {
            return Err(LedgerError::Config("issue_attempts must be at least 1".into()));
        }
        if self.certificate_prefix.trim().is_empty() {
            return Err(LedgerError::Config("certificate_prefix must not be empty".into()));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Get ledger database path
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(crate::db::DB_FILE_NAME)
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.bundle.ratio().unwrap().total(), 256);
        assert_eq!(config.rates.rate(Category::Education), Decimal::ONE);
        assert_eq!(config.issue_attempts, 2);
    }

    #[test]
    fn test_partial_file_uses_field_defaults() {
        let config: Config = toml::from_str(
            r#"
            http_port = 9000

            [rates]
            residue = "2.5"

            [bundle]
            product = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.http_port, 9000);
        assert_eq!(config.rates.residue, Decimal::new(25, 1));
        assert_eq!(config.rates.product, Decimal::ONE);
        assert_eq!(config.bundle.residue, 250);
        assert_eq!(config.bundle.ratio().unwrap().total(), 257);
        assert_eq!(config.certificate_prefix, "CDV");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.rates.product = Decimal::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.bundle = BundleConfig { residue: 0, education: 0, product: 0 };
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.issue_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.toml");

        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        config.rates.residue = Decimal::new(5, 1);
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.data_dir, config.data_dir);
        assert_eq!(loaded.rates, config.rates);
        assert_eq!(loaded.bundle, config.bundle);
    }
}
