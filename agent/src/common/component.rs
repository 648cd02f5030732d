use async_trait::async_trait;

use common::error::Result;

/// Lifecycle of a pipeline plugin.
#[async_trait]
pub trait Component: Send {
    async fn start(&mut self) -> Result<()>;

    /// `is_pipeline_removing` is true when the owning pipeline goes away for
    /// good rather than being reloaded.
    async fn stop(&mut self, is_pipeline_removing: bool) -> Result<()>;
}
