use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use common::common::labels::Labels;
use common::common::relabel::{RelabelConfig, Relabeler};
use common::error::{Error, Result};

use crate::discover::discover::RawTarget;

pub const DEFAULT_METRICS_PATH: &str = "/metrics";
pub const DEFAULT_SCHEME: &str = "http";
pub const DEFAULT_SCRAPE_INTERVAL: &str = "60s";
pub const DEFAULT_SCRAPE_TIMEOUT: &str = "10s";
pub const DEFAULT_DISCOVERY_INTERVAL: &str = "30s";

const SD_CONFIGS_SUFFIX: &str = "_sd_configs";

fn default_metrics_path() -> String {
    DEFAULT_METRICS_PATH.to_string()
}

fn default_scheme() -> String {
    DEFAULT_SCHEME.to_string()
}

fn default_scrape_interval() -> String {
    DEFAULT_SCRAPE_INTERVAL.to_string()
}

fn default_scrape_timeout() -> String {
    DEFAULT_SCRAPE_TIMEOUT.to_string()
}

fn default_discovery_interval() -> String {
    DEFAULT_DISCOVERY_INTERVAL.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StaticTarget {
    pub host: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// The `ScrapeConfig` object of an `input_prometheus` plugin.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScrapeConfig {
    pub job_name: String,
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_scrape_interval")]
    pub scrape_interval: String,
    #[serde(default = "default_scrape_timeout")]
    pub scrape_timeout: String,
    #[serde(default)]
    pub scrape_targets: Vec<StaticTarget>,
    #[serde(default)]
    pub relabel_configs: Vec<RelabelConfig>,
    #[serde(default)]
    pub params: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval: String,
    /// Everything else, including `*_sd_configs` blocks.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ScrapeConfig {
    pub fn from_json(value: &Value) -> Result<Self> {
        Self::deserialize(value)
            .map_err(|e| Error::InvalidConfig(format!("invalid ScrapeConfig: {}", e)))
    }

    /// True when the job names a discovery mechanism, e.g. a non-empty
    /// `kubernetes_sd_configs` list. Its content is resolved by the coordinator.
    pub fn discovery_enabled(&self) -> bool {
        self.extra.iter().any(|(key, value)| {
            key.ends_with(SD_CONFIGS_SUFFIX)
                && match value {
                    Value::Null => false,
                    Value::Array(items) => !items.is_empty(),
                    Value::Object(fields) => !fields.is_empty(),
                    _ => true,
                }
        })
    }
}

pub fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    let d = humantime::parse_duration(value.trim())
        .map_err(|e| Error::InvalidConfig(format!("invalid {} {:?}: {}", field, value, e)))?;
    if d.is_zero() {
        return Err(Error::InvalidConfig(format!("{} must be positive", field)));
    }
    Ok(d)
}

/// Validated job configuration.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub job_name: String,
    pub metrics_path: String,
    pub scheme: String,
    pub scrape_interval_string: String,
    pub scrape_timeout_string: String,
    pub scrape_interval: Duration,
    pub scrape_timeout: Duration,
    pub discovery_interval: Duration,
    pub discovery_enabled: bool,
    pub static_targets: Vec<StaticTarget>,
    pub params: BTreeMap<String, Vec<String>>,
    pub relabeler: Relabeler,
}

impl JobSettings {
    pub fn new(config: ScrapeConfig) -> Result<Self> {
        if config.job_name.trim().is_empty() {
            return Err(Error::InvalidConfig("job_name is required".to_string()));
        }
        if config.scheme != "http" && config.scheme != "https" {
            return Err(Error::InvalidConfig(format!(
                "unsupported scheme {:?} for job {}",
                config.scheme, config.job_name
            )));
        }
        let scrape_interval = parse_duration("scrape_interval", &config.scrape_interval)?;
        let scrape_timeout =
            parse_duration("scrape_timeout", &config.scrape_timeout)?.min(scrape_interval);
        let discovery_interval =
            parse_duration("discovery_interval", &config.discovery_interval)?;
        let relabeler = Relabeler::new(&config.relabel_configs)?;
        let metrics_path = if config.metrics_path.starts_with('/') {
            config.metrics_path.clone()
        } else {
            format!("/{}", config.metrics_path)
        };
        let discovery_enabled = config.discovery_enabled();

        Ok(Self {
            job_name: config.job_name,
            metrics_path,
            scheme: config.scheme,
            scrape_interval_string: config.scrape_interval,
            scrape_timeout_string: config.scrape_timeout,
            scrape_interval,
            scrape_timeout,
            discovery_interval,
            discovery_enabled,
            static_targets: config.scrape_targets,
            params: config.params,
            relabeler,
        })
    }

    pub fn static_raw_targets(&self) -> Vec<RawTarget> {
        self.static_targets
            .iter()
            .map(|t| RawTarget::new(t.host.clone(), Labels::from(t.labels.clone())))
            .collect()
    }
}
