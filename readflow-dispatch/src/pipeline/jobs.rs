//! Recurring pipeline jobs.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::DeliveryPipeline;
use crate::Result;
use crate::scheduler::Job;

/// Re-dispatches attempts whose retry instant has passed.
pub struct RetrySweepJob {
    pipeline: DeliveryPipeline,
}

impl RetrySweepJob {
    pub fn new(pipeline: DeliveryPipeline) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Job for RetrySweepJob {
    fn name(&self) -> &str {
        "retry-sweep"
    }

    async fn run(&self, _cancel: &CancellationToken) -> Result<()> {
        self.pipeline.retry_sweep().await.map(|_| ())
    }
}

/// Purges terminal attempts past retention.
pub struct CleanupJob {
    pipeline: DeliveryPipeline,
}

impl CleanupJob {
    pub fn new(pipeline: DeliveryPipeline) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Job for CleanupJob {
    fn name(&self) -> &str {
        "cleanup"
    }

    async fn run(&self, _cancel: &CancellationToken) -> Result<()> {
        self.pipeline.cleanup().await.map(|_| ())
    }
}
