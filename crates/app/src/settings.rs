//! Handles settings for the application. Configuration is written in
//! `settings.toml` and every key can be overridden from the environment
//! with the `LEDGER` prefix, e.g. `LEDGER_SWEEPER__INTERVAL_SECS=30`.
use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct App {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for App {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Database {
    Memory,
    Sqlite(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Engine {
    /// Secret keying the code hashes. Unset falls back to the engine's
    /// built-in development secret.
    pub code_secret: Option<String>,
    pub enforce_active: bool,
    pub enforce_start_date: bool,
    pub pending_default_days: Option<i64>,
    pub pending_max_days: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Sweeper {
    pub enabled: bool,
    pub batch_size: u64,
    /// Time budget of a single sweep.
    pub budget_secs: i64,
    pub safety_margin_secs: i64,
    pub interval_secs: u64,
}

impl Default for Sweeper {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 500,
            budget_secs: 300,
            safety_margin_secs: 10,
            interval_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub app: App,
    pub database: Database,
    #[serde(default)]
    pub engine: Engine,
    #[serde(default)]
    pub sweeper: Sweeper,
}

impl Settings {
    pub fn new(path: &Path) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix("LEDGER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }
}
