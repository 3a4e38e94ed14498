//! Batch readers
//!
//! A reader yields batches, then tables within a batch, then rows within a
//! table. Rows that belong to no table (SQL or script events that precede the
//! first table) are returned by `next_data` before the first `next_table`.
//! When a batch ends the reader marks `complete` on the context's batch if it
//! saw the batch terminator.

use crate::batch::Batch;
use crate::context::DataContext;
use crate::data::CsvData;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use weir_rdbc::types::Table;

/// Source of batches
#[async_trait]
pub trait DataReader: Send {
    /// Prepare for reading
    async fn open(&mut self, ctx: &mut DataContext) -> Result<()>;

    /// Next batch, `None` when there are no more
    async fn next_batch(&mut self, ctx: &mut DataContext) -> Result<Option<Batch>>;

    /// Next table in the current batch, `None` at the end of the batch
    async fn next_table(&mut self, ctx: &mut DataContext) -> Result<Option<Table>>;

    /// Next row of the current table, `None` at the end of the table
    async fn next_data(&mut self, ctx: &mut DataContext) -> Result<Option<CsvData>>;

    /// Release resources
    async fn close(&mut self) -> Result<()>;
}

/// A decoded batch held in memory
#[derive(Debug, Clone)]
pub struct MemoryBatch {
    batch: Batch,
    global: Vec<CsvData>,
    tables: Vec<(Table, Vec<CsvData>)>,
    truncated: bool,
}

impl MemoryBatch {
    /// Wrap a batch with no rows
    pub fn new(batch: Batch) -> Self {
        Self {
            batch,
            global: Vec::new(),
            tables: Vec::new(),
            truncated: false,
        }
    }

    /// Add a row that belongs to no table
    pub fn with_global(mut self, data: CsvData) -> Self {
        self.global.push(data);
        self
    }

    /// Add a table with its rows
    pub fn with_table(mut self, table: Table, rows: Vec<CsvData>) -> Self {
        self.tables.push((table, rows));
        self
    }

    /// Simulate a batch whose terminator was never read
    pub fn truncated(mut self) -> Self {
        self.truncated = true;
        self
    }
}

#[derive(Debug)]
struct Cursor {
    global: VecDeque<CsvData>,
    tables: VecDeque<(Table, Vec<CsvData>)>,
    rows: VecDeque<CsvData>,
    in_table: bool,
    truncated: bool,
}

/// Reader over batches already held in memory
#[derive(Debug, Default)]
pub struct MemoryDataReader {
    pending: VecDeque<MemoryBatch>,
    cursor: Option<Cursor>,
    opened: bool,
    closed: bool,
}

impl MemoryDataReader {
    /// Create a reader over the given batches
    pub fn new(batches: Vec<MemoryBatch>) -> Self {
        Self {
            pending: batches.into(),
            ..Self::default()
        }
    }

    /// Whether `open` was called
    pub fn is_opened(&self) -> bool {
        self.opened
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl DataReader for MemoryDataReader {
    async fn open(&mut self, _ctx: &mut DataContext) -> Result<()> {
        self.opened = true;
        Ok(())
    }

    async fn next_batch(&mut self, _ctx: &mut DataContext) -> Result<Option<Batch>> {
        let Some(next) = self.pending.pop_front() else {
            self.cursor = None;
            return Ok(None);
        };
        self.cursor = Some(Cursor {
            global: next.global.into(),
            tables: next.tables.into(),
            rows: VecDeque::new(),
            in_table: false,
            truncated: next.truncated,
        });
        let mut batch = next.batch;
        batch.complete = false;
        Ok(Some(batch))
    }

    async fn next_table(&mut self, ctx: &mut DataContext) -> Result<Option<Table>> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };
        cursor.global.clear();
        match cursor.tables.pop_front() {
            Some((table, rows)) => {
                cursor.rows = rows.into();
                cursor.in_table = true;
                Ok(Some(table))
            }
            None => {
                cursor.rows.clear();
                cursor.in_table = false;
                if let Some(batch) = ctx.batch_mut() {
                    batch.complete = !cursor.truncated;
                }
                Ok(None)
            }
        }
    }

    async fn next_data(&mut self, ctx: &mut DataContext) -> Result<Option<CsvData>> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };
        let next = if cursor.in_table {
            cursor.rows.pop_front()
        } else {
            cursor.global.pop_front()
        };
        if next.is_some() {
            if let Some(batch) = ctx.batch_mut() {
                batch.increment_line_count();
            }
        }
        Ok(next)
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
