use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use common::common::labels::Labels;
use common::error::{Error, Result};

use crate::discover::discover::RawTarget;
use crate::scrape::config::{parse_duration, JobSettings};

pub use crate::discover::discover::ADDRESS_LABEL;

pub const SCHEME_LABEL: &str = "__scheme__";
pub const METRICS_PATH_LABEL: &str = "__metrics_path__";
pub const SCRAPE_INTERVAL_LABEL: &str = "__scrape_interval__";
pub const SCRAPE_TIMEOUT_LABEL: &str = "__scrape_timeout__";
pub const RESERVED_LABEL_PREFIX: &str = "__";
pub const META_LABEL_PREFIX: &str = "__meta_";
pub const TMP_LABEL_PREFIX: &str = "__tmp_";
pub const PARAM_LABEL_PREFIX: &str = "__param_";
pub const JOB_LABEL: &str = "job";
pub const INSTANCE_LABEL: &str = "instance";

/// Outcome of the most recent scrape of a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TargetHealth {
    #[default]
    Unknown,
    Good,
    Bad,
}

/// A resolved scrape endpoint. Two targets with the same `hash` are the same
/// target, whichever reconciliation pass produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub job_name: String,
    pub metrics_path: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub scrape_interval: Duration,
    pub scrape_timeout: Duration,
    pub labels: Labels,
    pub targets: Vec<String>,
    pub params: BTreeMap<String, Vec<String>>,
    pub hash: String,
    seed: u64,
}

impl Target {
    pub fn address(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    pub fn url(&self) -> String {
        let mut url = format!("{}://{}{}", self.scheme, self.address(), self.metrics_path);
        let query = self.query();
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }
        url
    }

    pub fn query(&self) -> String {
        let mut ser = url::form_urlencoded::Serializer::new(String::new());
        for (k, values) in &self.params {
            for v in values {
                ser.append_pair(k, v);
            }
        }
        ser.finish()
    }

    /// Labels attached to forwarded samples: everything without the reserved
    /// prefix, plus `instance` when relabeling did not set one.
    pub fn public_labels(&self) -> Labels {
        let mut lset = self.labels.clone();
        lset.retain(|l| !l.name.starts_with(RESERVED_LABEL_PREFIX));
        lset.set_if_absent(INSTANCE_LABEL, self.address());
        lset
    }

    /// Time to wait before the first scrape so that targets of one job spread
    /// over the interval instead of firing together.
    pub fn offset(&self, interval: Duration, now: SystemTime) -> Duration {
        let interval_ns = (interval.as_nanos() as u64).max(1);
        let now_ns = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let base = now_ns % interval_ns;
        let slot = self.seed % interval_ns;
        Duration::from_nanos((slot + interval_ns - base) % interval_ns)
    }
}

/// Fills in the job-derived labels a raw target does not carry itself.
pub fn populate_labels(raw: &RawTarget, settings: &JobSettings) -> Labels {
    let mut lset = raw.labels.clone();
    lset.set_if_absent(ADDRESS_LABEL, raw.address.as_str());
    lset.set_if_absent(JOB_LABEL, settings.job_name.as_str());
    lset.set_if_absent(SCHEME_LABEL, settings.scheme.as_str());
    lset.set_if_absent(METRICS_PATH_LABEL, settings.metrics_path.as_str());
    lset.set_if_absent(SCRAPE_INTERVAL_LABEL, settings.scrape_interval_string.as_str());
    lset.set_if_absent(SCRAPE_TIMEOUT_LABEL, settings.scrape_timeout_string.as_str());
    for (key, values) in &settings.params {
        if let Some(value) = values.first() {
            lset.set_if_absent(&format!("{}{}", PARAM_LABEL_PREFIX, key), value.as_str());
        }
    }
    lset
}

/// Splits `host[:port]`, defaulting the port from the scheme.
pub fn parse_address(address: &str, scheme: &str) -> Result<(String, u16)> {
    let address = address.trim();
    let default_port = match scheme {
        "https" => 443,
        _ => 80,
    };
    let invalid = || Error::InvalidData(format!("invalid address {:?}", address));

    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| invalid())?,
            None if tail.is_empty() => default_port,
            None => return Err(invalid()),
        };
        return Ok((host.to_string(), port));
    }
    match address.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => Ok((address.to_string(), default_port)),
        Some((host, port)) if !host.is_empty() => Ok((host.to_string(), port.parse().map_err(|_| invalid())?)),
        Some(_) => Err(invalid()),
        None if address.is_empty() => Err(invalid()),
        None => Ok((address.to_string(), default_port)),
    }
}

/// Turns a relabeled label set into a target, or explains why it is dropped.
pub fn target_from_labels(
    mut lset: Labels,
    origin: &str,
    settings: &JobSettings,
) -> Result<Target> {
    let address = lset
        .get(ADDRESS_LABEL)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidData("no address".to_string()))?;
    let scheme = lset.get(SCHEME_LABEL).unwrap_or(settings.scheme.as_str()).to_string();
    if scheme != "http" && scheme != "https" {
        return Err(Error::InvalidData(format!("invalid scheme {:?}", scheme)));
    }
    let (host, port) = parse_address(&address, &scheme)?;
    if !has_port(&address) {
        lset.set(ADDRESS_LABEL, join_host_port(&host, port));
    }

    lset.retain(|l| !l.name.starts_with(META_LABEL_PREFIX) && !l.name.starts_with(TMP_LABEL_PREFIX));

    let metrics_path = lset
        .get(METRICS_PATH_LABEL)
        .unwrap_or(settings.metrics_path.as_str())
        .to_string();
    let scrape_interval = match lset.get(SCRAPE_INTERVAL_LABEL) {
        Some(v) => parse_duration(SCRAPE_INTERVAL_LABEL, v)?,
        None => settings.scrape_interval,
    };
    let scrape_timeout = match lset.get(SCRAPE_TIMEOUT_LABEL) {
        Some(v) => parse_duration(SCRAPE_TIMEOUT_LABEL, v)?,
        None => settings.scrape_timeout,
    }
    .min(scrape_interval);

    let mut params = settings.params.clone();
    for l in lset.iter() {
        if let Some(key) = l.name.strip_prefix(PARAM_LABEL_PREFIX) {
            params.insert(key.to_string(), vec![l.value.clone()]);
        }
    }

    let (hash, seed) = target_hash(&host, port, &scheme, &metrics_path, &lset);
    Ok(Target {
        job_name: settings.job_name.clone(),
        metrics_path,
        scheme,
        host,
        port,
        scrape_interval,
        scrape_timeout,
        labels: lset,
        targets: vec![origin.to_string()],
        params,
        hash,
        seed,
    })
}

/// `<host>:<port>` followed by the first 16 hex digits of a SHA-256 over the
/// endpoint and the sorted final labels.
pub fn target_hash(host: &str, port: u16, scheme: &str, path: &str, labels: &Labels) -> (String, u64) {
    let mut hasher = Sha256::new();
    let port_str = port.to_string();
    for part in [scheme, path, host, port_str.as_str()] {
        hasher.update(part.as_bytes());
        hasher.update([0xffu8]);
    }
    labels.digest_into(&mut hasher);
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let hash = format!("{}{}", join_host_port(host, port), hex::encode(head));
    (hash, u64::from_be_bytes(head))
}

fn has_port(address: &str) -> bool {
    match address.strip_prefix('[') {
        Some(rest) => rest.contains("]:"),
        None => matches!(address.rsplit_once(':'), Some((host, _)) if !host.contains(':')),
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
