pub mod prometheus;
pub mod runner;

/// What a pipeline tells its inputs about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineContext {
    pub config_name: String,
    pub process_queue_key: String,
}

impl PipelineContext {
    pub fn new(config_name: impl Into<String>, process_queue_key: impl Into<String>) -> Self {
        Self {
            config_name: config_name.into(),
            process_queue_key: process_queue_key.into(),
        }
    }
}
