use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use serde_json::Value;

use common::error::{Error, Result};

use crate::common::component::Component;
use crate::input::runner::InputRunner;
use crate::input::PipelineContext;
use crate::scrape::config::ScrapeConfig;
use crate::scrape::job::{JobState, ScrapeJob};

pub const NAME: &str = "input_prometheus";

const SCRAPE_CONFIG_KEY: &str = "ScrapeConfig";

/// Pipeline input that scrapes one Prometheus job.
pub struct PrometheusInput {
    context: PipelineContext,
    runner: Arc<InputRunner>,
    config: Option<ScrapeConfig>,
    job: Option<Arc<ScrapeJob>>,
}

impl PrometheusInput {
    pub fn new(context: PipelineContext, runner: Arc<InputRunner>) -> PrometheusInput {
        PrometheusInput {
            context,
            runner,
            config: None,
            job: None,
        }
    }

    pub fn name(&self) -> &'static str {
        NAME
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    /// Loads `{"ScrapeConfig": {...}}`. Configuration errors are returned
    /// here and leave the input without a job.
    pub fn init(&mut self, config: &Value) -> Result<()> {
        let scrape_config = config.get(SCRAPE_CONFIG_KEY).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "{}: {} is required in pipeline {}",
                NAME, SCRAPE_CONFIG_KEY, self.context.config_name
            ))
        })?;
        let scrape_config = ScrapeConfig::from_json(scrape_config)?;
        let job = self.runner.group().build_job(scrape_config.clone())?;
        self.config = Some(scrape_config);
        self.job = Some(Arc::new(job));
        Ok(())
    }

    pub fn scrape_job(&self) -> Option<&Arc<ScrapeJob>> {
        self.job.as_ref()
    }
}

#[async_trait]
impl Component for PrometheusInput {
    async fn start(&mut self) -> Result<()> {
        let Some(job) = self.job.clone() else {
            return Err(Error::InvalidConfig(format!(
                "{}: pipeline {} was not initialized",
                NAME, self.context.config_name
            )));
        };
        // a stopped job cannot be revived, rebuild it from the config
        let job = match (job.state(), &self.config) {
            (JobState::Stopped, Some(config)) => {
                let fresh = Arc::new(self.runner.group().build_job(config.clone())?);
                self.job = Some(Arc::clone(&fresh));
                fresh
            }
            _ => job,
        };
        let job_name = self
            .runner
            .update_scrape_input(&self.context.config_name, job, &self.context.process_queue_key)
            .await?;
        info!("{} started job {} for pipeline {}", NAME, job_name, self.context.config_name);
        Ok(())
    }

    async fn stop(&mut self, is_pipeline_removing: bool) -> Result<()> {
        self.runner.remove_scrape_input(&self.context.config_name).await;
        info!(
            "{} stopped for pipeline {}, removing: {}",
            NAME, self.context.config_name, is_pipeline_removing
        );
        Ok(())
    }
}
