//! Writer that records what it receives

use super::DataWriter;
use crate::context::DataContext;
use crate::data::CsvData;
use crate::error::Result;
use crate::stats::{Statistic, Statistics, StatisticsSnapshot};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use weir_rdbc::types::Table;

/// One call observed by a [`MemoryDataWriter`]
#[derive(Debug, Clone)]
pub enum WriterEvent {
    /// `open`
    Open,
    /// `start_batch` with the batch id
    StartBatch(i64),
    /// `start_table` with the fully qualified name
    StartTable(String),
    /// `write`
    Write(CsvData),
    /// `end_table`
    EndTable(String),
    /// `end_batch` with the error flag
    EndBatch {
        /// Batch id
        batch_id: i64,
        /// Whether the batch failed
        in_error: bool,
    },
    /// `close`
    Close,
}

/// Shared, cloneable record of writer calls
#[derive(Debug, Clone, Default)]
pub struct WriterLog {
    events: Arc<Mutex<Vec<WriterEvent>>>,
}

impl WriterLog {
    /// Every event so far
    pub fn events(&self) -> Vec<WriterEvent> {
        self.events.lock().clone()
    }

    /// Rows written so far
    pub fn rows(&self) -> Vec<CsvData> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                WriterEvent::Write(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: WriterEvent) {
        self.events.lock().push(event);
    }
}

/// Writer that keeps every call in a [`WriterLog`].
///
/// Tables named in `declined` are refused at `start_table`.
#[derive(Debug, Default)]
pub struct MemoryDataWriter {
    log: WriterLog,
    declined: HashSet<String>,
    stats: Statistics,
}

impl MemoryDataWriter {
    /// Writer recording into `log`
    pub fn new(log: WriterLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    /// Refuse rows of `table`
    pub fn declining(mut self, table: impl Into<String>) -> Self {
        self.declined.insert(table.into());
        self
    }

    /// The shared log
    pub fn log(&self) -> &WriterLog {
        &self.log
    }
}

#[async_trait]
impl DataWriter for MemoryDataWriter {
    async fn open(&mut self, _ctx: &mut DataContext) -> Result<()> {
        self.log.push(WriterEvent::Open);
        Ok(())
    }

    async fn start_batch(&mut self, ctx: &mut DataContext) -> Result<()> {
        self.stats.reset();
        self.log.push(WriterEvent::StartBatch(ctx.batch_id()));
        Ok(())
    }

    async fn start_table(&mut self, _ctx: &mut DataContext, table: &Table) -> Result<bool> {
        let name = table.fully_qualified_name();
        if self.declined.contains(&name) {
            return Ok(false);
        }
        self.log.push(WriterEvent::StartTable(name));
        Ok(true)
    }

    async fn write(&mut self, _ctx: &mut DataContext, data: CsvData) -> Result<()> {
        self.stats.incr(Statistic::RowCount);
        self.log.push(WriterEvent::Write(data));
        Ok(())
    }

    async fn end_table(&mut self, _ctx: &mut DataContext, table: &Table) -> Result<()> {
        self.log.push(WriterEvent::EndTable(table.fully_qualified_name()));
        Ok(())
    }

    async fn end_batch(&mut self, ctx: &mut DataContext, in_error: bool) -> Result<()> {
        self.log.push(WriterEvent::EndBatch {
            batch_id: ctx.batch_id(),
            in_error,
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.log.push(WriterEvent::Close);
        Ok(())
    }

    fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }
}
