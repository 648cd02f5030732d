use std::collections::BTreeMap;
use std::env;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use common::common::labels::Labels;
use common::error::{Error, Result};

pub const ADDRESS_LABEL: &str = "__address__";

pub const ENV_COLLECTOR_ID: &str = "POD_NAME";
pub const ENV_OPERATOR_HOST: &str = "OPERATOR_HOST";
pub const ENV_OPERATOR_PORT: &str = "OPERATOR_PORT";

/// A discovered endpoint before relabeling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTarget {
    pub address: String,
    pub labels: Labels,
}

impl RawTarget {
    pub fn new(address: impl Into<String>, labels: Labels) -> Self {
        let address = address.into();
        let mut labels = labels;
        labels.set_if_absent(ADDRESS_LABEL, address.as_str());
        Self { address, labels }
    }
}

/// One element of the coordinator's response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroup {
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl TargetGroup {
    pub fn into_raw_targets(self) -> impl Iterator<Item = RawTarget> {
        let labels = Labels::from(self.labels);
        self.targets
            .into_iter()
            .map(move |address| RawTarget::new(address, labels.clone()))
    }
}

#[async_trait]
pub trait Discoverer: Send + Sync {
    async fn refresh(&self, job_name: &str) -> Result<Vec<RawTarget>>;
}

/// Where the coordinator lives and who is asking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arguments {
    pub operator_host: String,
    pub operator_port: u16,
    pub collector_id: String,
}

impl Arguments {
    pub fn new(operator_host: impl Into<String>, operator_port: u16, collector_id: impl Into<String>) -> Self {
        Self {
            operator_host: operator_host.into(),
            operator_port,
            collector_id: collector_id.into(),
        }
    }

    /// Reads `POD_NAME`, `OPERATOR_HOST` and `OPERATOR_PORT`. Missing values
    /// are left empty; a port that is present but not numeric is an error.
    pub fn from_env() -> Result<Self> {
        let operator_port = match env::var(ENV_OPERATOR_PORT) {
            Ok(port) if !port.trim().is_empty() => port.trim().parse::<u16>().map_err(|e| {
                Error::InvalidConfig(format!("{}={:?}: {}", ENV_OPERATOR_PORT, port, e))
            })?,
            _ => 0,
        };
        Ok(Self {
            operator_host: env::var(ENV_OPERATOR_HOST).unwrap_or_default(),
            operator_port,
            collector_id: env::var(ENV_COLLECTOR_ID).unwrap_or_default(),
        })
    }

    pub fn is_configured(&self) -> bool {
        !self.operator_host.is_empty() && self.operator_port != 0
    }
}
