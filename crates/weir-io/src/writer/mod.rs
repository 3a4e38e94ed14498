//! # Writers
//!
//! A [`DataWriter`] receives the rows of one batch at a time, table by table.
//!
//! - [`DatabaseWriter`] applies rows to a [`DatabasePlatform`](weir_rdbc::connection::DatabasePlatform)
//!   inside one transaction per batch, resolving conflicts on the way.
//! - [`TransformWriter`] rewrites rows through the transformation engine and
//!   hands the results to the writer it wraps.
//! - [`MemoryDataWriter`] records everything it is given.

mod conflict;
mod database;
mod memory;
mod settings;
mod transform;

pub use conflict::{
    is_newer, Conflict, ConflictContext, ConflictResolver, DefaultConflictResolver,
    DetectConflict, Resolution, ResolveConflict,
};
pub use database::{DatabaseWriter, DatabaseWriterFilter, LoadStatus};
pub use memory::{MemoryDataWriter, WriterEvent, WriterLog};
pub use settings::DatabaseWriterSettings;
pub use transform::TransformWriter;

use crate::batch::Batch;
use crate::context::DataContext;
use crate::data::CsvData;
use crate::error::Result;
use crate::stats::StatisticsSnapshot;
use async_trait::async_trait;
use weir_rdbc::types::Table;

/// Sink for the rows of a batch.
///
/// Calls arrive as `start_batch`, then per table `start_table`, `write`*,
/// `end_table`, then `end_batch`. `end_batch(ctx, true)` may arrive without
/// any earlier call and must be safe then.
#[async_trait]
pub trait DataWriter: Send {
    /// Prepare for a run
    async fn open(&mut self, ctx: &mut DataContext) -> Result<()>;

    /// Begin the batch held by `ctx`
    async fn start_batch(&mut self, ctx: &mut DataContext) -> Result<()>;

    /// Begin a table; `false` declines its rows
    async fn start_table(&mut self, ctx: &mut DataContext, table: &Table) -> Result<bool>;

    /// Apply one row
    async fn write(&mut self, ctx: &mut DataContext, data: CsvData) -> Result<()>;

    /// Finish a table
    async fn end_table(&mut self, ctx: &mut DataContext, table: &Table) -> Result<()>;

    /// Finish the batch, rolling back when `in_error`
    async fn end_batch(&mut self, ctx: &mut DataContext, in_error: bool) -> Result<()>;

    /// Release resources
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Counters of the current batch
    fn statistics(&self) -> StatisticsSnapshot;
}

/// Picks the writer for a batch; `None` drains the batch unwritten
pub trait WriterResolver: Send + Sync {
    /// Writer for `batch`
    fn resolve(&self, ctx: &DataContext, batch: &Batch) -> Option<Box<dyn DataWriter>>;
}

impl<F> WriterResolver for F
where
    F: Fn(&DataContext, &Batch) -> Option<Box<dyn DataWriter>> + Send + Sync,
{
    fn resolve(&self, ctx: &DataContext, batch: &Batch) -> Option<Box<dyn DataWriter>> {
        self(ctx, batch)
    }
}
