use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};

use common::error::Result;

pub const OUTCOME_SUCCESS: &str = "success";
pub const OUTCOME_FAILURE: &str = "failure";

#[derive(Clone)]
pub struct ScrapeMetrics {
    pub scrape_total: IntCounterVec,
    pub scrape_duration: HistogramVec,
    pub discovery_total: IntCounterVec,
    pub active_targets: IntGaugeVec,
    pub queue_dropped: IntCounterVec,
}

impl ScrapeMetrics {
    pub fn new(reg: &Registry) -> Result<ScrapeMetrics> {
        let scrape_total = register_counter_vec(
            "prometheus_scrape_total",
            "Total number of scrape cycles by outcome.",
            &["job", "outcome"],
            reg,
        )?;
        let scrape_duration = HistogramVec::new(
            HistogramOpts::new(
                "prometheus_scrape_duration_seconds",
                "Duration of scrape cycles.",
            ),
            &["job"],
        )?;
        reg.register(Box::new(scrape_duration.clone()))?;
        let discovery_total = register_counter_vec(
            "prometheus_discovery_total",
            "Total number of discovery polls by outcome.",
            &["job", "outcome"],
            reg,
        )?;
        let active_targets = IntGaugeVec::new(
            Opts::new(
                "prometheus_active_targets",
                "Number of targets currently being scraped.",
            ),
            &["job"],
        )?;
        reg.register(Box::new(active_targets.clone()))?;
        let queue_dropped = register_counter_vec(
            "prometheus_queue_dropped_total",
            "Total number of scrape results dropped because the process queue refused them.",
            &["job"],
            reg,
        )?;

        Ok(ScrapeMetrics {
            scrape_total,
            scrape_duration,
            discovery_total,
            active_targets,
            queue_dropped,
        })
    }

    /// Drops every series of a job that is no longer registered.
    pub fn forget_job(&self, job: &str) {
        for outcome in [OUTCOME_SUCCESS, OUTCOME_FAILURE] {
            let _ = self.scrape_total.remove_label_values(&[job, outcome]);
            let _ = self.discovery_total.remove_label_values(&[job, outcome]);
        }
        let _ = self.scrape_duration.remove_label_values(&[job]);
        let _ = self.active_targets.remove_label_values(&[job]);
        let _ = self.queue_dropped.remove_label_values(&[job]);
    }
}

fn register_counter_vec(name: &str, help: &str, labels: &[&str], reg: &Registry) -> Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)?;
    reg.register(Box::new(counter.clone()))?;
    Ok(counter)
}
