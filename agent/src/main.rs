use std::fs;
use std::panic;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use log::{debug, error, info, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Root};
use log4rs::Config;
use prometheus::Registry;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use agent::appender::{Appendable, ProcessQueueManager};
use agent::common::component::Component;
use agent::common::registry::Options;
use agent::http::ReqwestClient;
use agent::input::prometheus::PrometheusInput;
use agent::input::runner::InputRunner;
use agent::input::PipelineContext;
use agent::scrape::manager::ScraperGroup;

const DRAIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "agent", about = "Scrapes Prometheus targets into pipeline queues")]
struct Cli {
    /// Pipeline config file, one pipeline per file named after the file stem.
    #[arg(short, long = "config", required = true)]
    configs: Vec<PathBuf>,

    #[arg(long, default_value_t = LevelFilter::Info)]
    log_level: LevelFilter,

    #[arg(long, default_value_t = agent::appender::DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,
}

fn init_logging(level: LevelFilter) -> anyhow::Result<()> {
    let stdout = ConsoleAppender::builder().build();
    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(level))?;
    log4rs::init_config(config)?;

    panic::set_hook(Box::new(|panic_info| {
        error!("{}", panic_info);
        let backtrace = std::backtrace::Backtrace::capture();
        error!("backtrace: {:#?}", backtrace);
    }));
    Ok(())
}

fn pipeline_name(path: &Path) -> anyhow::Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("cannot derive a pipeline name from {}", path.display()))
}

fn read_config(path: &Path) -> anyhow::Result<Value> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level)?;

    let registry = Arc::new(Registry::new());
    let options = Options::from_env(Arc::clone(&registry))?;
    let queues = Arc::new(ProcessQueueManager::new(cli.queue_capacity));
    let client = Arc::new(ReqwestClient::new()?);
    let group = ScraperGroup::new(options, client, queues.clone())?;
    let runner = Arc::new(InputRunner::new(group));

    let mut inputs = Vec::with_capacity(cli.configs.len());
    for path in &cli.configs {
        let name = pipeline_name(path)?;
        let config = read_config(path)?;
        queues.create_or_update_queue(&name, 0);

        let mut input = PrometheusInput::new(PipelineContext::new(name.clone(), name.clone()), Arc::clone(&runner));
        input
            .init(&config)
            .with_context(|| format!("pipeline {}", name))?;
        input.start().await?;
        inputs.push(input);
    }
    info!("{} pipelines running", inputs.len());

    // stands in for the processing stage that would parse the payloads
    let token = CancellationToken::new();
    let drain = tokio::spawn({
        let queues = queues.clone();
        let token = token.clone();
        async move {
            let mut ticker = tokio::time::interval(DRAIN_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                for key in queues.keys() {
                    for sample in queues.drain(&key) {
                        debug!(
                            "pipeline {}: {} bytes from {} {}",
                            key,
                            sample.body.len(),
                            sample.job_name,
                            sample.labels
                        );
                    }
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    for input in inputs.iter_mut() {
        if let Err(err) = input.stop(true).await {
            error!("stopping {}: {}", input.context().config_name, err);
        }
    }
    runner.stop().await;
    token.cancel();
    drain.await?;
    Ok(())
}
