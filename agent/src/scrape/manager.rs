use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use futures::future::join_all;
use log::{info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use common::error::{Error, Result};

use crate::appender::Appendable;
use crate::common::registry::Options;
use crate::discover::operator_discovery::OperatorDiscovery;
use crate::http::HttpClient;
use crate::scrape::config::ScrapeConfig;
use crate::scrape::job::{JobState, ScrapeJob, TargetMap, TargetsDiff};
use crate::scrape::metrics::{ScrapeMetrics, OUTCOME_FAILURE, OUTCOME_SUCCESS};
use crate::scrape::scrape_loop::ScrapeWork;

struct JobEntry {
    job: Arc<ScrapeJob>,
    queue_key: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

type WorkMap = HashMap<String, Arc<ScrapeWork>>;

/// Registry of every scrape job of the process and the works scraping their
/// targets. Works are keyed by job name, then by target hash.
pub struct ScraperGroup {
    opts: Options,
    client: Arc<dyn HttpClient>,
    queue: Arc<dyn Appendable>,
    metrics: ScrapeMetrics,
    jobs: RwLock<HashMap<String, JobEntry>>,
    works: RwLock<HashMap<String, WorkMap>>,
    // serializes registration and removal
    lifecycle: Mutex<()>,
}

impl ScraperGroup {
    pub fn new(
        opts: Options,
        client: Arc<dyn HttpClient>,
        queue: Arc<dyn Appendable>,
    ) -> Result<Arc<ScraperGroup>> {
        let metrics = ScrapeMetrics::new(&opts.registerer)?;
        Ok(Arc::new(ScraperGroup {
            opts,
            client,
            queue,
            metrics,
            jobs: RwLock::new(HashMap::new()),
            works: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(()),
        }))
    }

    fn client(&self) -> Arc<dyn HttpClient> {
        Arc::clone(&self.client)
    }

    /// Validates the config and builds a job, attaching coordinator discovery
    /// when the config asks for it.
    pub fn build_job(&self, config: ScrapeConfig) -> Result<ScrapeJob> {
        let job = ScrapeJob::new(config)?;
        if !job.settings().discovery_enabled {
            return Ok(job);
        }
        if !self.opts.discovery.is_configured() {
            warn!(
                "job {} uses discovery but the coordinator address is not configured",
                job.job_name()
            );
        }
        let timeout = job.settings().scrape_timeout;
        let discovery = OperatorDiscovery::new(self.opts.discovery.clone(), self.client(), timeout);
        Ok(job.with_discoverer(Arc::new(discovery)))
    }

    pub async fn register_job(
        self: &Arc<Self>,
        config: ScrapeConfig,
        queue_key: impl Into<String>,
    ) -> Result<String> {
        let job = Arc::new(self.build_job(config)?);
        let name = job.job_name().to_string();
        self.add_job(job, queue_key).await?;
        Ok(name)
    }

    /// Registers a built job and starts reconciling it. A job already
    /// registered under the same name is torn down first.
    pub async fn add_job(self: &Arc<Self>, job: Arc<ScrapeJob>, queue_key: impl Into<String>) -> Result<()> {
        if job.state() == JobState::Stopped {
            return Err(Error::InvalidConfig(format!(
                "job {} is stopped and cannot be registered again",
                job.job_name()
            )));
        }
        let queue_key = queue_key.into();
        let name = job.job_name().to_string();

        let _guard = self.lifecycle.lock().await;
        if self.remove_job(&name).await {
            info!("job {} replaced", name);
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(Self::run_job(
            Arc::downgrade(self),
            Arc::clone(&job),
            queue_key.clone(),
            token.clone(),
        ));
        self.jobs.write().unwrap_or_else(PoisonError::into_inner).insert(
            name.clone(),
            JobEntry {
                job,
                queue_key,
                token,
                handle,
            },
        );
        info!("job {} registered", name);
        Ok(())
    }

    /// Removes the job and stops all its works. Returns false when no job
    /// with that name was registered.
    pub async fn unregister_job(&self, job_name: &str) -> bool {
        let _guard = self.lifecycle.lock().await;
        let removed = self.remove_job(job_name).await;
        if removed {
            info!("job {} unregistered", job_name);
        }
        removed
    }

    async fn remove_job(&self, job_name: &str) -> bool {
        let entry = self
            .jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_name);
        let Some(entry) = entry else {
            return false;
        };

        entry.token.cancel();
        if let Err(err) = entry.handle.await {
            if err.is_panic() {
                warn!("reconciliation of job {} panicked: {}", job_name, err);
            }
        }
        entry.job.stop();

        let works = self
            .works
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_name)
            .unwrap_or_default();
        join_all(works.values().map(|w| w.stop_scrape_loop())).await;
        self.metrics.forget_job(job_name);
        true
    }

    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        for name in self.job_names() {
            self.remove_job(&name).await;
        }
        info!("scraper group stopped");
    }

    pub fn job(&self, job_name: &str) -> Option<Arc<ScrapeJob>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_name)
            .map(|e| Arc::clone(&e.job))
    }

    pub fn queue_key(&self, job_name: &str) -> Option<String> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_name)
            .map(|e| e.queue_key.clone())
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Copy of the job's current target map.
    pub fn targets_snapshot(&self, job_name: &str) -> Option<TargetMap> {
        self.job(job_name).map(|job| job.targets_snapshot())
    }

    pub fn get_work(&self, job_name: &str, hash: &str) -> Option<Arc<ScrapeWork>> {
        self.works
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_name)
            .and_then(|works| works.get(hash))
            .cloned()
    }

    pub fn work_count(&self, job_name: &str) -> usize {
        self.works
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_name)
            .map_or(0, |works| works.len())
    }

    async fn run_job(
        group: Weak<ScraperGroup>,
        job: Arc<ScrapeJob>,
        queue_key: String,
        token: CancellationToken,
    ) {
        loop {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                result = job.reconcile() => result,
            };
            let Some(group) = group.upgrade() else {
                return;
            };
            let outcome = if result.is_ok() {
                OUTCOME_SUCCESS
            } else {
                OUTCOME_FAILURE
            };
            if job.has_discovery() {
                group
                    .metrics
                    .discovery_total
                    .with_label_values(&[job.job_name(), outcome])
                    .inc();
            }
            match result {
                Ok(diff) => group.sync_works(&job, &queue_key, diff).await,
                Err(err) => warn!(
                    "job {}: discovery failed, keeping {} targets: {}",
                    job.job_name(),
                    job.targets().len(),
                    err
                ),
            }
            drop(group);

            let Some(every) = job.refresh_interval() else {
                return;
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(every) => {}
            }
        }
    }

    /// Stops works of vanished hashes and starts one work per new hash.
    /// Works of unchanged hashes are left running.
    async fn sync_works(&self, job: &ScrapeJob, queue_key: &str, diff: TargetsDiff) {
        if diff.is_empty() {
            return;
        }
        let job_name = job.job_name();
        let client = self.client();
        let mut stopped = Vec::with_capacity(diff.removed.len());
        let active = {
            let mut works = self.works.write().unwrap_or_else(PoisonError::into_inner);
            let job_works = works.entry(job_name.to_string()).or_default();
            for hash in &diff.removed {
                if let Some(work) = job_works.remove(hash) {
                    stopped.push(work);
                }
            }
            for target in diff.added {
                let hash = target.hash.clone();
                if job_works.contains_key(&hash) {
                    continue;
                }
                let work = Arc::new(ScrapeWork::new(
                    target,
                    queue_key,
                    Arc::clone(&client),
                    Arc::clone(&self.queue),
                    self.metrics.clone(),
                ));
                work.start_scrape_loop();
                job_works.insert(hash, work);
            }
            job_works.len()
        };
        join_all(stopped.iter().map(|w| w.stop_scrape_loop())).await;
        self.metrics
            .active_targets
            .with_label_values(&[job_name])
            .set(active as i64);
        info!(
            "job {}: {} works running, {} stopped",
            job_name,
            active,
            stopped.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::appender::ProcessQueueManager;
    use crate::discover::discover::{Arguments, Discoverer, RawTarget};
    use crate::http::{HttpRequest, HttpResponse};

    const QUEUE: &str = "pipeline";

    #[derive(Default)]
    struct OkClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HttpClient for OkClient {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HttpResponse {
                status: 200,
                body: b"up 1\n".to_vec(),
            })
        }
    }

    struct SwitchableDiscoverer {
        second: AtomicBool,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Discoverer for SwitchableDiscoverer {
        async fn refresh(&self, _job_name: &str) -> Result<Vec<RawTarget>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Http("connection refused".to_string()));
            }
            let mut addrs = vec!["10.0.0.1:9100", "10.0.0.2:9100"];
            if self.second.load(Ordering::SeqCst) {
                addrs = vec!["10.0.0.2:9100", "10.0.0.3:9100"];
            }
            Ok(addrs
                .into_iter()
                .map(|a| RawTarget::new(a, Default::default()))
                .collect())
        }
    }

    fn group(client: Arc<dyn HttpClient>) -> Arc<ScraperGroup> {
        let queue = Arc::new(ProcessQueueManager::new(64));
        queue.create_or_update_queue(QUEUE, 64);
        let opts = Options::new(Arguments::default(), Arc::new(prometheus::Registry::new()));
        ScraperGroup::new(opts, client, queue).unwrap()
    }

    fn static_config(name: &str) -> ScrapeConfig {
        ScrapeConfig::from_json(&json!({
            "job_name": name,
            "scrape_interval": "15s",
            "scrape_targets": [{"host": "10.0.0.1:9100"}, {"host": "10.0.0.2:9100"}]
        }))
        .unwrap()
    }

    fn discovery_job(discoverer: Arc<SwitchableDiscoverer>) -> Arc<ScrapeJob> {
        let config = ScrapeConfig::from_json(&json!({
            "job_name": "pods",
            "scrape_interval": "15s",
            "discovery_interval": "30s",
            "kubernetes_sd_configs": [{"role": "pod"}]
        }))
        .unwrap();
        Arc::new(ScrapeJob::new(config).unwrap().with_discoverer(discoverer))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn register_starts_one_work_per_target() {
        let g = group(Arc::new(OkClient::default()));
        let name = g.register_job(static_config("node"), QUEUE).await.unwrap();
        assert_eq!(name, "node");
        settle().await;

        let snapshot = g.targets_snapshot("node").unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(g.work_count("node"), 2);
        for hash in snapshot.keys() {
            assert!(g.get_work("node", hash).unwrap().is_running());
        }
        assert!(g.get_work("node", "nope").is_none());
        assert_eq!(g.job("node").unwrap().state(), JobState::Active);
        assert_eq!(g.queue_key("node").as_deref(), Some(QUEUE));
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_stops_every_work() {
        let client = Arc::new(OkClient::default());
        let g = group(client.clone());
        g.register_job(static_config("node"), QUEUE).await.unwrap();
        settle().await;
        let works: Vec<_> = g
            .targets_snapshot("node")
            .unwrap()
            .keys()
            .map(|h| g.get_work("node", h).unwrap())
            .collect();

        assert!(g.unregister_job("node").await);
        assert!(g.job("node").is_none());
        assert!(g.targets_snapshot("node").is_none());
        assert_eq!(g.work_count("node"), 0);
        assert!(works.iter().all(|w| !w.is_running()));

        let calls = client.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), calls);
        assert!(!g.unregister_job("node").await);
    }

    #[tokio::test]
    async fn invalid_config_registers_nothing() {
        let g = group(Arc::new(OkClient::default()));
        let config = ScrapeConfig::from_json(&json!({
            "job_name": "bad",
            "relabel_configs": [{"action": "keep", "source_labels": ["a"], "regex": "(("}]
        }))
        .unwrap();
        assert!(g.register_job(config, QUEUE).await.is_err());
        assert!(g.job_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconciliation_only_touches_changed_hashes() {
        let g = group(Arc::new(OkClient::default()));
        let discoverer = Arc::new(SwitchableDiscoverer {
            second: AtomicBool::new(false),
            fail: AtomicBool::new(false),
        });
        g.add_job(discovery_job(discoverer.clone()), QUEUE).await.unwrap();
        settle().await;

        let before = g.targets_snapshot("pods").unwrap();
        let kept_hash = before
            .iter()
            .find(|(_, t)| t.host == "10.0.0.2")
            .map(|(h, _)| h.clone())
            .unwrap();
        let kept = g.get_work("pods", &kept_hash).unwrap();

        discoverer.second.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(31)).await;
        settle().await;

        let after = g.targets_snapshot("pods").unwrap();
        assert_eq!(after.len(), 2);
        assert!(after.values().any(|t| t.host == "10.0.0.3"));
        assert!(!after.values().any(|t| t.host == "10.0.0.1"));
        assert!(Arc::ptr_eq(&kept, &g.get_work("pods", &kept_hash).unwrap()));
        assert!(kept.is_running());
        assert_eq!(g.work_count("pods"), 2);

        discoverer.fail.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;
        let failed = g.targets_snapshot("pods").unwrap();
        let mut kept_hashes: Vec<_> = failed.keys().collect();
        let mut after_hashes: Vec<_> = after.keys().collect();
        kept_hashes.sort();
        after_hashes.sort();
        assert_eq!(kept_hashes, after_hashes);
        assert_eq!(g.work_count("pods"), 2);

        g.stop().await;
        assert!(g.job_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reregistering_replaces_the_job() {
        let g = group(Arc::new(OkClient::default()));
        g.register_job(static_config("node"), QUEUE).await.unwrap();
        settle().await;
        let first = g.job("node").unwrap();

        let config = ScrapeConfig::from_json(&json!({
            "job_name": "node",
            "scrape_targets": [{"host": "10.0.0.9:9100"}]
        }))
        .unwrap();
        g.register_job(config, "other").await.unwrap();
        settle().await;

        assert_eq!(first.state(), JobState::Stopped);
        assert_eq!(g.job_names(), vec!["node".to_string()]);
        assert_eq!(g.work_count("node"), 1);
        assert_eq!(g.queue_key("node").as_deref(), Some("other"));
        assert!(g.add_job(first, QUEUE).await.is_err());
    }
}
