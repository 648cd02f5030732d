use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use log::info;
use tokio::sync::Mutex;

use common::error::{Error, Result};

use crate::scrape::job::ScrapeJob;
use crate::scrape::manager::ScraperGroup;

/// Maps pipeline configuration names to the job each one registered.
pub struct InputRunner {
    group: Arc<ScraperGroup>,
    inputs: RwLock<HashMap<String, String>>,
    /// Held across a whole update, remove or stop.
    lifecycle: Mutex<()>,
}

impl InputRunner {
    pub fn new(group: Arc<ScraperGroup>) -> InputRunner {
        InputRunner {
            group,
            inputs: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn group(&self) -> &Arc<ScraperGroup> {
        &self.group
    }

    /// Registers the job of a pipeline, replacing whatever the pipeline
    /// registered before. Returns the job name. A job owned by another
    /// pipeline is refused and nothing changes.
    pub async fn update_scrape_input(
        &self,
        config_name: &str,
        job: Arc<ScrapeJob>,
        queue_key: &str,
    ) -> Result<String> {
        let _guard = self.lifecycle.lock().await;
        let job_name = job.job_name().to_string();
        if let Some(owner) = self.owner_of(&job_name).filter(|o| o != config_name) {
            return Err(Error::InvalidConfig(format!(
                "job {} is already used by pipeline {}",
                job_name, owner
            )));
        }

        let previous = self
            .inputs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(config_name)
            .cloned();
        if let Some(previous) = previous.filter(|p| *p != job_name) {
            self.group.unregister_job(&previous).await;
        }

        self.group.add_job(job, queue_key).await?;
        self.inputs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config_name.to_string(), job_name.clone());
        info!("pipeline {} scrapes job {}", config_name, job_name);
        Ok(job_name)
    }

    /// Unregisters the job of a pipeline. Returns false when the pipeline had
    /// none.
    pub async fn remove_scrape_input(&self, config_name: &str) -> bool {
        let _guard = self.lifecycle.lock().await;
        let job_name = self
            .inputs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(config_name);
        let Some(job_name) = job_name else {
            return false;
        };
        self.group.unregister_job(&job_name).await;
        info!("pipeline {} no longer scrapes job {}", config_name, job_name);
        true
    }

    pub fn has_input(&self, config_name: &str) -> bool {
        self.job_name(config_name)
            .is_some_and(|job| self.group.job(&job).is_some())
    }

    pub fn job_name(&self, config_name: &str) -> Option<String> {
        self.inputs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(config_name)
            .cloned()
    }

    fn owner_of(&self, job_name: &str) -> Option<String> {
        self.inputs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(_, job)| *job == job_name)
            .map(|(config, _)| config.clone())
    }

    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        let inputs: Vec<String> = self
            .inputs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, job)| job)
            .collect();
        for job in inputs {
            self.group.unregister_job(&job).await;
        }
        self.group.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::appender::{Appendable, ProcessQueueManager};
    use crate::common::registry::Options;
    use crate::http::{HttpClient, HttpRequest, HttpResponse};
    use crate::scrape::config::ScrapeConfig;

    struct NoopClient;

    #[async_trait]
    impl HttpClient for NoopClient {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse> {
            Ok(HttpResponse { status: 200, body: Vec::new() })
        }
    }

    fn runner() -> InputRunner {
        let queue = Arc::new(ProcessQueueManager::default());
        queue.create_or_update_queue("q", 0);
        let group = ScraperGroup::new(Options::default(), Arc::new(NoopClient), queue).unwrap();
        InputRunner::new(group)
    }

    fn job(name: &str) -> Arc<ScrapeJob> {
        let config = ScrapeConfig::from_json(&json!({
            "job_name": name,
            "scrape_targets": [{"host": "127.0.0.1:9100"}]
        }))
        .unwrap();
        Arc::new(ScrapeJob::new(config).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_maps_to_one_job() {
        let r = runner();
        r.update_scrape_input("p1", job("a"), "q").await.unwrap();
        assert!(r.has_input("p1"));
        assert_eq!(r.job_name("p1").as_deref(), Some("a"));

        r.update_scrape_input("p1", job("b"), "q").await.unwrap();
        assert_eq!(r.group().job_names(), vec!["b".to_string()]);

        assert!(r.update_scrape_input("p2", job("b"), "q").await.is_err());
        assert!(!r.has_input("p2"));

        assert!(r.remove_scrape_input("p1").await);
        assert!(!r.has_input("p1"));
        assert!(r.group().job("b").is_none());
        assert!(!r.remove_scrape_input("p1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_update_keeps_previous_job() {
        let r = runner();
        r.update_scrape_input("p1", job("a"), "q").await.unwrap();
        r.update_scrape_input("p2", job("b"), "q").await.unwrap();

        assert!(r.update_scrape_input("p1", job("b"), "q").await.is_err());
        assert_eq!(r.job_name("p1").as_deref(), Some("a"));
        assert!(r.group().job("a").is_some());
        assert!(r.has_input("p1"));
        assert_eq!(r.job_name("p2").as_deref(), Some("b"));
        assert!(r.group().job("b").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_updates_of_one_job_admit_one_pipeline() {
        let r = runner();
        let (first, second) = tokio::join!(
            r.update_scrape_input("p1", job("a"), "q"),
            r.update_scrape_input("p2", job("a"), "q"),
        );
        assert!(first.is_ok() != second.is_ok());
        assert_eq!(r.group().job_names(), vec!["a".to_string()]);
        assert!(r.has_input("p1") != r.has_input("p2"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_unregisters_everything() {
        let r = runner();
        r.update_scrape_input("p1", job("a"), "q").await.unwrap();
        r.update_scrape_input("p2", job("b"), "q").await.unwrap();
        r.stop().await;
        assert!(r.group().job_names().is_empty());
        assert!(!r.has_input("p1"));
    }
}
