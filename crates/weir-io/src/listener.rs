//! Batch lifecycle callbacks

use crate::batch::Batch;
use crate::context::DataContext;
use crate::error::Error;
use crate::stats::StatisticsSnapshot;
use async_trait::async_trait;

/// Observer of the processor's batch lifecycle. Every hook defaults to a no-op.
#[async_trait]
pub trait DataProcessorListener: Send + Sync {
    /// Called before a batch is loaded. Returning `false` drains the batch
    /// without writing it.
    async fn before_batch_started(&self, _ctx: &DataContext, _batch: &Batch) -> bool {
        true
    }

    /// Called after the writer started the batch
    async fn after_batch_started(&self, _ctx: &DataContext, _batch: &Batch) {}

    /// Called after the last table and before the writer commits
    async fn before_batch_end(&self, _ctx: &DataContext, _batch: &Batch) {}

    /// Called once the writer committed the batch, or rolled it back on an ignore-batch signal
    async fn batch_successful(&self, _ctx: &DataContext, _batch: &Batch) {}

    /// Called exactly once for a failed batch, after the writer rolled back
    async fn batch_in_error(&self, _ctx: &DataContext, _batch: &Batch, _error: &Error) {}

    /// Periodic notification for long-running batches
    async fn batch_progress_update(
        &self,
        _ctx: &DataContext,
        _batch: &Batch,
        _statistics: &StatisticsSnapshot,
    ) {
    }
}

/// Listener that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl DataProcessorListener for NoopListener {}
