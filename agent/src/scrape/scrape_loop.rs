use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime};

use log::{debug, error, info};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use common::error::{Error, Result};

use crate::appender::{Appendable, ScrapeSample};
use crate::http::{HttpClient, HttpRequest};
use crate::scrape::metrics::{ScrapeMetrics, OUTCOME_FAILURE, OUTCOME_SUCCESS};
use crate::scrape::target::{Target, TargetHealth};

const SCRAPE_ACCEPT_HEADER: &str = "text/plain;version=0.0.4;q=0.9,*/*;q=0.1";

#[derive(Debug, Default)]
struct ScrapeCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrapeStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TargetStatus {
    pub health: TargetHealth,
    pub last_error: Option<String>,
    pub last_scrape: Option<SystemTime>,
    pub last_scrape_duration: Duration,
}

struct LoopHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// The scrape loop of one target.
pub struct ScrapeWork {
    target: Arc<Target>,
    queue_key: String,
    client: RwLock<Arc<dyn HttpClient>>,
    queue: Arc<dyn Appendable>,
    metrics: ScrapeMetrics,
    counters: ScrapeCounters,
    status: Mutex<TargetStatus>,
    handle: Mutex<Option<LoopHandle>>,
    stopping: tokio::sync::Mutex<()>,
}

impl ScrapeWork {
    pub fn new(
        target: Arc<Target>,
        queue_key: impl Into<String>,
        client: Arc<dyn HttpClient>,
        queue: Arc<dyn Appendable>,
        metrics: ScrapeMetrics,
    ) -> Self {
        Self {
            target,
            queue_key: queue_key.into(),
            client: RwLock::new(client),
            queue,
            metrics,
            counters: ScrapeCounters::default(),
            status: Mutex::new(TargetStatus::default()),
            handle: Mutex::new(None),
            stopping: tokio::sync::Mutex::new(()),
        }
    }

    pub fn target(&self) -> &Arc<Target> {
        &self.target
    }

    pub fn job_name(&self) -> &str {
        &self.target.job_name
    }

    pub fn hash(&self) -> &str {
        &self.target.hash
    }

    pub fn client(&self) -> Arc<dyn HttpClient> {
        Arc::clone(&self.client.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replaces the client used from the next scrape on.
    pub fn set_client(&self, client: Arc<dyn HttpClient>) {
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = client;
    }

    pub fn stats(&self) -> ScrapeStats {
        ScrapeStats {
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn status(&self) -> TargetStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.task.is_finished())
    }

    /// Spawns the loop on the current runtime. Does nothing when it already runs.
    pub fn start_scrape_loop(self: &Arc<Self>) {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.as_ref().is_some_and(|h| !h.task.is_finished()) {
            return;
        }
        let token = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(self).run(token.clone()));
        *handle = Some(LoopHandle { token, task });
        info!(
            "started scrape loop for {} in job {}",
            self.target.url(),
            self.job_name()
        );
    }

    /// Cancels the loop and waits for it to exit. After this returns no
    /// scrape of this work runs and no result is forwarded, also for callers
    /// that raced another stop.
    pub async fn stop_scrape_loop(&self) {
        let _stopping = self.stopping.lock().await;
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(LoopHandle { token, task }) = handle else {
            return;
        };
        token.cancel();
        if let Err(err) = task.await {
            if err.is_panic() {
                error!("scrape loop for {} panicked: {}", self.target.url(), err);
            }
        }
        info!(
            "stopped scrape loop for {} in job {}",
            self.target.url(),
            self.job_name()
        );
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        let interval = self.target.scrape_interval;
        let offset = self.target.offset(interval, SystemTime::now());
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + offset, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = self.scrape_once() => {}
            }
        }
        debug!("scrape loop for {} exited", self.target.url());
    }

    fn request(&self) -> HttpRequest {
        let timeout = self.target.scrape_timeout;
        HttpRequest::get(
            self.target.host.clone(),
            self.target.port,
            self.target.metrics_path.clone(),
        )
        .with_query(self.target.query())
        .with_https(self.target.scheme == "https")
        .with_header("Accept", SCRAPE_ACCEPT_HEADER)
        .with_header(
            "X-Prometheus-Scrape-Timeout-Seconds",
            format!("{}", timeout.as_secs_f64()),
        )
        .with_timeout(timeout)
    }

    /// Performs one scrape cycle and forwards the body on success.
    pub async fn scrape_once(&self) -> Result<()> {
        let start = Instant::now();
        let scrape_time = SystemTime::now();
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);

        let result = self.fetch().await;
        let elapsed = start.elapsed();
        self.metrics
            .scrape_duration
            .with_label_values(&[self.job_name()])
            .observe(elapsed.as_secs_f64());

        let body = match result {
            Ok(body) => {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .scrape_total
                    .with_label_values(&[self.job_name(), OUTCOME_SUCCESS])
                    .inc();
                self.update_status(scrape_time, elapsed, None);
                body
            }
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .scrape_total
                    .with_label_values(&[self.job_name(), OUTCOME_FAILURE])
                    .inc();
                debug!("scrape of {} failed: {}", self.target.url(), err);
                self.update_status(scrape_time, elapsed, Some(err.to_string()));
                return Err(err);
            }
        };

        let sample = ScrapeSample {
            job_name: self.target.job_name.clone(),
            labels: self.target.public_labels(),
            body,
            scrape_time,
        };
        if let Err(err) = self.queue.push(&self.queue_key, sample) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .queue_dropped
                .with_label_values(&[self.job_name()])
                .inc();
            debug!("dropping scrape result of {}: {}", self.target.url(), err);
            return Err(err);
        }
        Ok(())
    }

    async fn fetch(&self) -> Result<Vec<u8>> {
        let request = self.request();
        let url = request.url();
        let timeout = request.timeout;
        let resp = tokio::time::timeout(timeout, self.client().send(request))
            .await
            .map_err(|_| Error::Http(format!("{}: timed out after {:?}", url, timeout)))??;
        if resp.status != 200 {
            return Err(Error::UnexpectedStatus {
                status: resp.status,
                url,
            });
        }
        Ok(resp.body)
    }

    fn update_status(&self, at: SystemTime, took: Duration, err: Option<String>) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        status.health = if err.is_some() {
            TargetHealth::Bad
        } else {
            TargetHealth::Good
        };
        status.last_error = err;
        status.last_scrape = Some(at);
        status.last_scrape_duration = took;
    }
}
