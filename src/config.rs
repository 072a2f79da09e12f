//! TOML configuration parsing and validation.
//!
//! The engine is configured by a single document (default
//! `./config/evidence.toml`):
//!
//! ```toml
//! [engine]
//! default_region = "global"
//! connect_timeout_secs = 15
//! call_timeout_secs = 120
//! deadline_secs = 300
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 5000
//! backoff_multiplier = 2.0
//! max_delay_ms = 30000
//!
//! [sources.nice]
//! kind = "http"
//! url = "http://127.0.0.1:7401"
//!
//! [sources.pubmed]
//! kind = "fixture"
//! path = "fixtures/pubmed.json"
//!
//! [[regions]]
//! region_name = "uk"
//! country_codes = ["GB", "UK"]
//! required_sources = ["nice", "pubmed"]
//! min_results_threshold = 2
//!
//! [[regions.tiers]]
//! tier_index = 0
//! required = true
//!
//! [[regions.tiers.search_specs]]
//! resource_type = "guideline"
//! operation_name = "search_guidelines"
//! result_key = "guidelines"
//! parameter_template = { query = "{scenario}" }
//! ```
//!
//! Regions and tiers are static: they are read once and never change for the
//! lifetime of the process.

use anyhow::{bail, Context, Result};
use evidence_core::region::{RegionConfig, RegionTable};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
    #[serde(default)]
    pub regions: Vec<RegionConfig>,
}

/// Upper bound on a request deadline (one day).
pub const MAX_DEADLINE_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Deserialize, Clone)]
pub struct EngineSettings {
    #[serde(default = "default_region")]
    pub default_region: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Request deadline applied when the caller does not pass one.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_region: default_region(),
            connect_timeout_secs: default_connect_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            deadline_secs: None,
        }
    }
}

impl EngineSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

fn default_region() -> String {
    "global".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    15
}
fn default_call_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    5_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    30_000
}

/// How to reach one knowledge source.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    Http(HttpSourceConfig),
    Fixture(FixtureSourceConfig),
}

impl SourceConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceConfig::Http(_) => "http",
            SourceConfig::Fixture(_) => "fixture",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpSourceConfig {
    /// Base URL; `/health`, `/tools/list` and `/tools/{name}` are appended.
    pub url: String,
    /// Environment variable holding a bearer token, if the source needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_http_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct FixtureSourceConfig {
    /// JSON fixture file; relative paths are resolved against the config file.
    pub path: PathBuf,
}

impl Config {
    /// Build the validated region table.
    pub fn region_table(&self) -> Result<RegionTable> {
        RegionTable::new(self.regions.clone(), &self.engine.default_region)
    }

    /// Structural validation shared by file and in-memory configs.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be >= 1");
        }
        if self.retry.backoff_multiplier.is_nan() || self.retry.backoff_multiplier < 1.0 {
            bail!("retry.backoff_multiplier must be >= 1.0");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            bail!("retry.base_delay_ms must be <= retry.max_delay_ms");
        }
        if self.engine.connect_timeout_secs == 0 {
            bail!("engine.connect_timeout_secs must be > 0");
        }
        if self.engine.call_timeout_secs == 0 {
            bail!("engine.call_timeout_secs must be > 0");
        }
        if let Some(secs) = self.engine.deadline_secs {
            if secs == 0 || secs > MAX_DEADLINE_SECS {
                bail!("engine.deadline_secs must be between 1 and {}", MAX_DEADLINE_SECS);
            }
        }

        for (name, source) in &self.sources {
            if let SourceConfig::Http(http) = source {
                if !(http.url.starts_with("http://") || http.url.starts_with("https://")) {
                    bail!("sources.{}.url must start with http:// or https://", name);
                }
            }
        }

        // Also validates tiers and country codes.
        self.region_table()?;

        Ok(())
    }

    /// Every source id a region requires must be declared under `[sources]`.
    pub fn check_sources_declared(&self) -> Result<()> {
        for region in &self.regions {
            for id in &region.required_sources {
                if !self.sources.contains_key(id) {
                    bail!(
                        "region '{}' requires source '{}' which is not declared under [sources]",
                        region.region_name,
                        id
                    );
                }
            }
        }
        Ok(())
    }
}

/// Parse and validate a config document held in memory.
///
/// Unlike [`load_config`], undeclared source ids are allowed here so that
/// embedding applications can register sources programmatically.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config = parse_config(&content)?;
    config.check_sources_declared()?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for source in config.sources.values_mut() {
        if let SourceConfig::Fixture(fixture) = source {
            if fixture.path.is_relative() {
                fixture.path = base.join(&fixture.path);
            }
        }
    }

    Ok(config)
}
