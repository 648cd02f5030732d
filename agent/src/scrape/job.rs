use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use log::{debug, info};
use tokio::sync::Mutex;

use common::common::labels::Labels;
use common::error::Result;

use crate::discover::discover::{Discoverer, RawTarget};
use crate::scrape::config::{JobSettings, ScrapeConfig};
use crate::scrape::target::{populate_labels, target_from_labels, Target};

pub type TargetMap = HashMap<String, Arc<Target>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Loading,
    Active,
    Stopped,
}

/// Hashes that appeared and vanished in one reconciliation pass.
#[derive(Debug, Default)]
pub struct TargetsDiff {
    pub added: Vec<Arc<Target>>,
    pub removed: Vec<String>,
}

impl TargetsDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    fn between(old: &TargetMap, new: &TargetMap) -> Self {
        let added = new
            .iter()
            .filter(|(hash, _)| !old.contains_key(*hash))
            .map(|(_, t)| Arc::clone(t))
            .collect();
        let removed = old
            .keys()
            .filter(|hash| !new.contains_key(*hash))
            .cloned()
            .collect();
        Self { added, removed }
    }
}

pub struct ScrapeJob {
    settings: JobSettings,
    discoverer: Option<Arc<dyn Discoverer>>,
    targets: ArcSwap<TargetMap>,
    dropped: ArcSwap<Vec<Labels>>,
    state: RwLock<JobState>,
    reconcile_lock: Mutex<()>,
}

impl ScrapeJob {
    pub fn new(config: ScrapeConfig) -> Result<Self> {
        Ok(Self::from_settings(JobSettings::new(config)?))
    }

    fn from_settings(settings: JobSettings) -> Self {
        Self {
            settings,
            discoverer: None,
            targets: ArcSwap::from_pointee(HashMap::new()),
            dropped: ArcSwap::from_pointee(Vec::new()),
            state: RwLock::new(JobState::Loading),
            reconcile_lock: Mutex::new(()),
        }
    }

    pub fn with_discoverer(mut self, discoverer: Arc<dyn Discoverer>) -> Self {
        self.discoverer = Some(discoverer);
        self
    }

    pub fn job_name(&self) -> &str {
        &self.settings.job_name
    }

    pub fn metrics_path(&self) -> &str {
        &self.settings.metrics_path
    }

    pub fn scheme(&self) -> &str {
        &self.settings.scheme
    }

    pub fn scrape_interval_string(&self) -> &str {
        &self.settings.scrape_interval_string
    }

    pub fn scrape_timeout_string(&self) -> &str {
        &self.settings.scrape_timeout_string
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    pub fn state(&self) -> JobState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_discovery(&self) -> bool {
        self.discoverer.is_some()
    }

    /// Period between reconciliation passes; `None` for static-only jobs,
    /// which reconcile once.
    pub fn refresh_interval(&self) -> Option<Duration> {
        self.discoverer
            .as_ref()
            .map(|_| self.settings.discovery_interval)
    }

    /// Current targets by hash. The returned map is never modified afterwards.
    pub fn targets(&self) -> Arc<TargetMap> {
        self.targets.load_full()
    }

    pub fn targets_snapshot(&self) -> TargetMap {
        (**self.targets.load()).clone()
    }

    /// Discovered label sets that relabeling or resolution rejected in the last pass.
    pub fn dropped_targets(&self) -> Vec<Labels> {
        (**self.dropped.load()).clone()
    }

    async fn collect_raw_targets(&self) -> Result<Vec<RawTarget>> {
        let mut raw = self.settings.static_raw_targets();
        if let Some(discoverer) = &self.discoverer {
            raw.extend(discoverer.refresh(self.job_name()).await?);
        }
        Ok(raw)
    }

    /// Relabels and resolves raw targets. Raw targets resolving to the same
    /// hash are merged into one target listing every origin address.
    pub fn resolve(&self, raw: Vec<RawTarget>) -> (TargetMap, Vec<Labels>) {
        let mut resolved: HashMap<String, Target> = HashMap::new();
        let mut dropped = Vec::new();

        for raw_target in raw {
            let populated = populate_labels(&raw_target, &self.settings);
            let Some(relabeled) = self.settings.relabeler.process(populated) else {
                dropped.push(raw_target.labels);
                continue;
            };
            match target_from_labels(relabeled, &raw_target.address, &self.settings) {
                Ok(target) => match resolved.get_mut(&target.hash) {
                    Some(existing) => existing.targets.push(raw_target.address),
                    None => {
                        resolved.insert(target.hash.clone(), target);
                    }
                },
                Err(err) => {
                    debug!(
                        "job {}: dropping target {}: {}",
                        self.job_name(),
                        raw_target.address,
                        err
                    );
                    dropped.push(raw_target.labels);
                }
            }
        }

        let map = resolved
            .into_iter()
            .map(|(hash, target)| (hash, Arc::new(target)))
            .collect();
        (map, dropped)
    }

    /// Runs one reconciliation pass and swaps in the new target map.
    ///
    /// On discovery failure the previous map stays in place and the error is
    /// returned. Passes for one job never overlap.
    pub async fn reconcile(&self) -> Result<TargetsDiff> {
        let _guard = self.reconcile_lock.lock().await;
        if self.state() == JobState::Stopped {
            return Ok(TargetsDiff::default());
        }

        let raw = self.collect_raw_targets().await?;
        let (new_targets, dropped) = self.resolve(raw);

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state == JobState::Stopped {
            return Ok(TargetsDiff::default());
        }
        let old = self.targets.load();
        let diff = TargetsDiff::between(&old, &new_targets);
        debug!(
            "job {}: {} targets, {} added, {} removed, {} dropped",
            self.job_name(),
            new_targets.len(),
            diff.added.len(),
            diff.removed.len(),
            dropped.len()
        );
        self.targets.store(Arc::new(new_targets));
        self.dropped.store(Arc::new(dropped));
        *state = JobState::Active;
        Ok(diff)
    }

    /// Moves the job to `Stopped` and clears its targets. Returns the hashes
    /// that were live.
    pub fn stop(&self) -> Vec<String> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state == JobState::Stopped {
            return Vec::new();
        }
        *state = JobState::Stopped;
        let old = self.targets.swap(Arc::new(HashMap::new()));
        self.dropped.store(Arc::new(Vec::new()));
        info!("job {} stopped with {} targets", self.job_name(), old.len());
        old.keys().cloned().collect()
    }
}
