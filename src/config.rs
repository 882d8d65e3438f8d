use crate::error::JobsiteError;
use serde::{Deserialize, Serialize};
use std::{
    fs::{read_to_string, write},
    path::{Path, PathBuf},
    time::Duration,
};

pub const CONFIG_FILE: &str = "jobsite.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanyConfig {
    pub name: String,
    /// Where client decisions are reported
    pub email: String,
}

impl Default for CompanyConfig {
    fn default() -> Self {
        CompanyConfig {
            name: "My Contracting Co.".to_string(),
            email: "office@example.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite file, relative to the config file's directory unless absolute
    pub database: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            database: PathBuf::from("jobsite.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSaveConfig {
    pub debounce_ms: u64,
}

impl Default for AutoSaveConfig {
    fn default() -> Self {
        AutoSaveConfig { debounce_ms: 1500 }
    }
}

impl AutoSaveConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub path: PathBuf,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            path: PathBuf::from(crate::cache::PRODUCT_CACHE_FILE),
            ttl_secs: 24 * 60 * 60,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimateConfig {
    pub number_prefix: String,
    pub default_tax_rate_bps: i64,
    pub validity_days: i64,
}

impl Default for EstimateConfig {
    fn default() -> Self {
        EstimateConfig {
            number_prefix: "EST".to_string(),
            default_tax_rate_bps: 0,
            validity_days: 30,
        }
    }
}

/// Longest validity an estimate may be sent with (ten years).
pub const MAX_VALIDITY_DAYS: i64 = 3650;

impl EstimateConfig {
    pub fn validity_ms(&self) -> i64 {
        self.validity_days
            .clamp(0, MAX_VALIDITY_DAYS)
            .saturating_mul(crate::properties::MILLIS_PER_DAY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Prefix of links sent to clients
    pub public_base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "127.0.0.1:8080".to_string(),
            public_base_url: "http://127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub company: CompanyConfig,
    pub store: StoreConfig,
    pub autosave: AutoSaveConfig,
    pub cache: CacheConfig,
    pub estimates: EstimateConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), JobsiteError> {
        let email = self.company.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(JobsiteError::Validation(format!(
                "company.email '{email}' is not an email address"
            )));
        }
        if !(0..=crate::properties::FULL_BPS).contains(&self.estimates.default_tax_rate_bps) {
            return Err(JobsiteError::Validation(format!(
                "estimates.default_tax_rate_bps {} is out of range",
                self.estimates.default_tax_rate_bps
            )));
        }
        if !(1..=MAX_VALIDITY_DAYS).contains(&self.estimates.validity_days) {
            return Err(JobsiteError::Validation(format!(
                "estimates.validity_days must be between 1 and {MAX_VALIDITY_DAYS}"
            )));
        }
        if self.estimates.number_prefix.trim().is_empty() {
            return Err(JobsiteError::Validation(
                "estimates.number_prefix cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve relative database and cache paths against `root`.
    pub fn rooted(mut self, root: &Path) -> AppConfig {
        if self.store.database.is_relative() {
            self.store.database = root.join(&self.store.database);
        }
        if self.cache.path.is_relative() {
            self.cache.path = root.join(&self.cache.path);
        }
        self
    }
}

pub trait ConfigProvider: Send + Sync {
    fn get_config(&self) -> Result<AppConfig, JobsiteError>;
    fn set_config(&self, config: &AppConfig) -> Result<(), JobsiteError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        TomlConfigProvider { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigProvider for TomlConfigProvider {
    fn get_config(&self) -> Result<AppConfig, JobsiteError> {
        tracing::debug!("Attempting to read config from: {:?}", &self.path);
        if !self.path.exists() {
            tracing::debug!("Config file not found, using defaults.");
            return Ok(AppConfig::default());
        }
        let content = read_to_string(&self.path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn set_config(&self, config: &AppConfig) -> Result<(), JobsiteError> {
        tracing::debug!("Attempting to write config to: {:?}", &self.path);
        config.validate()?;
        let toml_string = toml::to_string(config)?;
        write(&self.path, toml_string)?;
        Ok(())
    }
}
