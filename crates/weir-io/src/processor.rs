//! # Batch processor
//!
//! Streams batches from a [`DataReader`] into the [`DataWriter`] chosen for
//! each batch.
//!
//! ```text
//! open reader
//!   └─ per batch: listener veto? ─ writer resolved? ─┐ no: drain rows
//!        start_batch                                 │
//!        global rows                                 │
//!        per table: start_table ─ rows ─ end_table   │
//!        complete? ─ end_batch(false) ─ successful   │
//!        on error: end_batch(true) ─ batch_in_error  │
//! close reader ◄─────────────────────────────────────┘
//! ```

use crate::batch::{Batch, BatchPhase};
use crate::context::DataContext;
use crate::error::{Error, Result};
use crate::listener::{DataProcessorListener, NoopListener};
use crate::reader::DataReader;
use crate::stats::StatisticsSnapshot;
use crate::writer::{DataWriter, WriterResolver};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use validator::Validate;

/// Processor tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Seconds between progress notifications for a long-running batch
    #[validate(range(min = 1, max = 86_400, message = "progress_interval_secs must be between 1 and 86400"))]
    pub progress_interval_secs: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            progress_interval_secs: 60,
        }
    }
}

impl ProcessorConfig {
    /// Progress interval as a duration
    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

/// Where the row loop stands inside a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowMode {
    /// Rows go to the writer
    Write,
    /// Rows are read and dropped
    Drain,
}

/// Drives one reader through its batches.
///
/// One processor owns one context at a time; run several processors to load
/// batches in parallel.
pub struct DataProcessor {
    reader: Box<dyn DataReader>,
    resolver: Box<dyn WriterResolver>,
    listener: Arc<dyn DataProcessorListener>,
    config: ProcessorConfig,
}

impl DataProcessor {
    /// Processor over `reader`, resolving a writer per batch
    pub fn new(
        reader: Box<dyn DataReader>,
        resolver: Box<dyn WriterResolver>,
        listener: Option<Arc<dyn DataProcessorListener>>,
    ) -> Self {
        Self {
            reader,
            resolver,
            listener: listener.unwrap_or_else(|| Arc::new(NoopListener)),
            config: ProcessorConfig::default(),
        }
    }

    /// Replace the tuning
    pub fn with_config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// Active tuning
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Process every batch the reader yields.
    ///
    /// Returns the statistics of all successful batches. The first failed
    /// batch stops processing and its error is returned.
    pub async fn process(
        &mut self,
        ctx: &mut DataContext,
        cancel: &CancellationToken,
    ) -> Result<StatisticsSnapshot> {
        self.config.validate()?;
        self.reader.open(ctx).await?;
        let result = self.process_batches(ctx, cancel).await;
        let closed = self.reader.close().await;
        let totals = result?;
        closed?;
        Ok(totals)
    }

    async fn process_batches(
        &mut self,
        ctx: &mut DataContext,
        cancel: &CancellationToken,
    ) -> Result<StatisticsSnapshot> {
        let mut totals = StatisticsSnapshot::default();
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(batch) = self.reader.next_batch(ctx).await? else {
                break;
            };
            ctx.set_batch(Some(batch.clone()));
            let stats = self.process_batch(ctx, cancel, batch).await?;
            totals.merge(&stats);
        }
        ctx.set_batch(None);
        Ok(totals)
    }

    fn current(ctx: &DataContext, fallback: &Batch) -> Batch {
        ctx.batch().cloned().unwrap_or_else(|| fallback.clone())
    }

    async fn process_batch(
        &mut self,
        ctx: &mut DataContext,
        cancel: &CancellationToken,
        batch: Batch,
    ) -> Result<StatisticsSnapshot> {
        let listen = self.listener.before_batch_started(ctx, &batch).await;
        let writer = if listen {
            self.resolver.resolve(ctx, &batch)
        } else {
            None
        };
        let Some(mut writer) = writer else {
            debug!(batch_id = batch.batch_id, vetoed = !listen, "Draining batch without a writer");
            self.drain_batch(ctx, cancel).await?;
            return Ok(StatisticsSnapshot::default());
        };

        let mut finalized = false;
        let outcome = self
            .write_batch(ctx, cancel, &batch, writer.as_mut(), &mut finalized)
            .await;

        let result = match outcome {
            Ok(()) => {
                let stats = writer.statistics();
                info!(
                    batch_id = batch.batch_id,
                    channel = %batch.channel_id,
                    stats = %stats,
                    "Batch loaded"
                );
                self.listener
                    .batch_successful(ctx, &Self::current(ctx, &batch))
                    .await;
                Ok(stats)
            }
            Err(Error::IgnoreBatch) => {
                warn!(batch_id = batch.batch_id, "Batch ignored");
                self.drain_batch(ctx, cancel).await?;
                if let Some(current) = ctx.batch_mut() {
                    current.ignored = true;
                }
                if !finalized {
                    writer.end_batch(ctx, true).await?;
                }
                self.listener
                    .batch_successful(ctx, &Self::current(ctx, &batch))
                    .await;
                Ok(writer.statistics())
            }
            Err(e) => {
                if !finalized {
                    if let Err(rollback) = writer.end_batch(ctx, true).await {
                        error!(batch_id = batch.batch_id, error = %rollback, "Failed to roll back batch");
                    }
                }
                error!(batch_id = batch.batch_id, error = %e, "Batch failed");
                ctx.set_last_error(Some(e.to_string()));
                self.listener
                    .batch_in_error(ctx, &Self::current(ctx, &batch), &e)
                    .await;
                Err(e)
            }
        };

        if let Err(e) = writer.close().await {
            warn!(batch_id = batch.batch_id, error = %e, "Failed to close writer");
        }
        result
    }

    async fn write_batch(
        &mut self,
        ctx: &mut DataContext,
        cancel: &CancellationToken,
        batch: &Batch,
        writer: &mut dyn DataWriter,
        finalized: &mut bool,
    ) -> Result<()> {
        if batch.invalid_for_retry {
            return Err(Error::protocol(format!(
                "batch {} cannot be retried and must be resent",
                batch.node_batch_id()
            )));
        }

        writer.open(ctx).await?;
        writer.start_batch(ctx).await?;
        self.listener.after_batch_started(ctx, batch).await;
        let mut last_progress = Instant::now();

        self.write_rows(ctx, cancel, writer, RowMode::Write, &mut last_progress)
            .await?;

        loop {
            let started = Instant::now();
            let table = self.reader.next_table(ctx).await?;
            if let Some(current) = ctx.batch_mut() {
                current.add_elapsed(BatchPhase::Read, started.elapsed());
            }
            let Some(table) = table else {
                break;
            };
            ctx.set_table(Some(table.clone()));
            let mode = if writer.start_table(ctx, &table).await? {
                RowMode::Write
            } else {
                debug!(table = %table.fully_qualified_name(), "Writer declined table");
                RowMode::Drain
            };
            self.write_rows(ctx, cancel, writer, mode, &mut last_progress)
                .await?;
            if mode == RowMode::Write {
                writer.end_table(ctx, &table).await?;
            }
            ctx.set_table(None);
        }

        let current = Self::current(ctx, batch);
        if !current.complete {
            let mut message = format!(
                "batch {} was not complete; the reader did not reach its end marker",
                current.node_batch_id()
            );
            if current.is_extract() {
                message.push_str(
                    ". Some platforms limit the size of large objects; check the source row sizes",
                );
            }
            return Err(Error::protocol(message));
        }

        self.listener.before_batch_end(ctx, &current).await;
        *finalized = true;
        writer.end_batch(ctx, false).await
    }

    /// Stream the rows of the current table (or the global rows) to `writer`.
    ///
    /// An ignored row switches the rest of the table to draining.
    async fn write_rows(
        &mut self,
        ctx: &mut DataContext,
        cancel: &CancellationToken,
        writer: &mut dyn DataWriter,
        mut mode: RowMode,
        last_progress: &mut Instant,
    ) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let started = Instant::now();
            let data = self.reader.next_data(ctx).await?;
            if let Some(current) = ctx.batch_mut() {
                current.add_elapsed(BatchPhase::Read, started.elapsed());
            }
            let Some(data) = data else {
                return Ok(());
            };
            if mode == RowMode::Drain {
                continue;
            }

            let started = Instant::now();
            let written = writer.write(ctx, data).await;
            if let Some(current) = ctx.batch_mut() {
                current.add_elapsed(BatchPhase::Write, started.elapsed());
            }
            match written {
                Ok(()) => {}
                Err(Error::IgnoreRow) => {
                    debug!(batch_id = ctx.batch_id(), "Row ignored; draining the rest of the table");
                    mode = RowMode::Drain;
                }
                Err(e) => return Err(e),
            }

            if last_progress.elapsed() >= self.config.progress_interval() {
                *last_progress = Instant::now();
                if let Some(current) = ctx.batch() {
                    self.listener
                        .batch_progress_update(ctx, current, &writer.statistics())
                        .await;
                }
            }
        }
    }

    /// Read the rest of the batch without writing it
    async fn drain_batch(&mut self, ctx: &mut DataContext, cancel: &CancellationToken) -> Result<()> {
        loop {
            while self.reader.next_data(ctx).await?.is_some() {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
            }
            if self.reader.next_table(ctx).await?.is_none() {
                return Ok(());
            }
        }
    }
}

impl std::fmt::Debug for DataProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataProcessor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CsvData;
    use crate::reader::{MemoryBatch, MemoryDataReader};
    use crate::writer::{MemoryDataWriter, WriterEvent, WriterLog};
    use weir_rdbc::types::{Column, Table, TypeCode};

    fn table() -> Table {
        Table::with_columns(None, None, "ITEM", vec![Column::key("ID", TypeCode::Integer)])
    }

    fn resolver(log: &WriterLog) -> Box<dyn WriterResolver> {
        let log = log.clone();
        Box::new(move |_: &DataContext, _: &Batch| {
            Some(Box::new(MemoryDataWriter::new(log.clone())) as Box<dyn DataWriter>)
        })
    }

    #[tokio::test]
    async fn test_processes_batches_in_order() {
        let reader = MemoryDataReader::new(vec![
            MemoryBatch::new(Batch::new(1, "default"))
                .with_table(table(), vec![CsvData::insert(vec![Some("1".into())])]),
            MemoryBatch::new(Batch::new(2, "default"))
                .with_table(table(), vec![CsvData::insert(vec![Some("2".into())])]),
        ]);
        let log = WriterLog::default();
        let mut processor = DataProcessor::new(Box::new(reader), resolver(&log), None);
        let mut ctx = DataContext::new();
        let stats = processor
            .process(&mut ctx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.get(crate::stats::Statistic::RowCount), 2);
        let ends: Vec<_> = log
            .events()
            .into_iter()
            .filter_map(|e| match e {
                WriterEvent::EndBatch { batch_id, in_error } => Some((batch_id, in_error)),
                _ => None,
            })
            .collect();
        assert_eq!(ends, vec![(1, false), (2, false)]);
    }

    #[tokio::test]
    async fn test_invalid_for_retry_fails_before_rows() {
        let reader = MemoryDataReader::new(vec![MemoryBatch::new(
            Batch::new(7, "default").with_invalid_for_retry(true),
        )
        .with_table(table(), vec![CsvData::insert(vec![Some("1".into())])])]);
        let log = WriterLog::default();
        let mut processor = DataProcessor::new(Box::new(reader), resolver(&log), None);
        let err = processor
            .process(&mut DataContext::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(ref m) if m.contains('7')));
        assert!(log.rows().is_empty());
    }

    #[tokio::test]
    async fn test_missing_writer_drains() {
        let reader = MemoryDataReader::new(vec![
            MemoryBatch::new(Batch::new(1, "default"))
                .with_table(table(), vec![CsvData::insert(vec![Some("1".into())])]),
        ]);
        let resolver: Box<dyn WriterResolver> =
            Box::new(|_: &DataContext, _: &Batch| None::<Box<dyn DataWriter>>);
        let mut processor = DataProcessor::new(Box::new(reader), resolver, None);
        let stats = processor
            .process(&mut DataContext::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats, StatisticsSnapshot::default());
    }

    #[test]
    fn test_config_validation() {
        assert_eq!(ProcessorConfig::default().progress_interval(), Duration::from_secs(60));
        let config = ProcessorConfig {
            progress_interval_secs: 0,
        };
        assert!(config.validate().is_err());
    }
}
