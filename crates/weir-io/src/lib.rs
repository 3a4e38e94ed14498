//! # weir-io
//!
//! Change records, row transformation and batch loading for weir.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐    ┌───────────────┐    ┌──────────────────┐    ┌────────────────┐
//! │ DataReader │───►│ DataProcessor │───►│ TransformWriter  │───►│ DatabaseWriter │
//! │  batches   │    │  per batch    │    │ TransformEngine  │    │ DatabasePlatform│
//! └────────────┘    └───────┬───────┘    └──────────────────┘    └────────────────┘
//!                           │
//!                           ▼
//!                DataProcessorListener
//! ```
//!
//! - [`data::CsvData`] is one captured change, with its CSV-encoded slots.
//! - [`transform::TransformEngine`] maps a source row onto target rows.
//! - [`writer::DatabaseWriter`] applies rows in one transaction per batch and
//!   resolves conflicts.
//! - [`processor::DataProcessor`] drives a reader through its batches and
//!   reports the lifecycle to a listener.
//!
//! ## Quick Start
//!
//! ```rust
//! use weir_io::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> weir_io::Result<()> {
//! let table = Table::with_columns(None, None, "ITEM", vec![Column::key("ID", TypeCode::Integer)]);
//! let reader = MemoryDataReader::new(vec![MemoryBatch::new(Batch::new(1, "default"))
//!     .with_table(table, vec![CsvData::insert(vec![Some("1".into())])])]);
//!
//! let log = WriterLog::default();
//! let writers = log.clone();
//! let resolver = move |_: &DataContext, _: &Batch| {
//!     Some(Box::new(MemoryDataWriter::new(writers.clone())) as Box<dyn DataWriter>)
//! };
//!
//! let mut processor = DataProcessor::new(Box::new(reader), Box::new(resolver), None);
//! let stats = processor
//!     .process(&mut DataContext::new(), &CancellationToken::new())
//!     .await?;
//! assert_eq!(stats.get(Statistic::RowCount), 1);
//! assert_eq!(log.rows().len(), 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod batch;
pub mod context;
pub mod csv;
pub mod data;
pub mod error;
pub mod listener;
pub mod processor;
pub mod reader;
pub mod stats;
pub mod transform;
pub mod writer;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, Result};

    // Change model
    pub use crate::batch::{Batch, BatchPhase};
    pub use crate::context::{ContextValue, DataContext};
    pub use crate::data::{CsvData, DataEventType, DataSlot};
    pub use crate::stats::{Statistic, Statistics, StatisticsSnapshot};

    // Transformation
    pub use crate::transform::{
        ColumnTransform, ColumnTransformRegistry, IncludeOn, TransformColumn, TransformEngine,
        TransformPoint, TransformTable, TransformedData,
    };

    // Reading, writing and processing
    pub use crate::listener::{DataProcessorListener, NoopListener};
    pub use crate::processor::{DataProcessor, ProcessorConfig};
    pub use crate::reader::{DataReader, MemoryBatch, MemoryDataReader};
    pub use crate::writer::{
        Conflict, DataWriter, DatabaseWriter, DatabaseWriterSettings, MemoryDataWriter,
        TransformWriter, WriterLog, WriterResolver,
    };

    // Table model from the SQL layer
    pub use weir_rdbc::types::{Column, Table, TypeCode};
}

pub use error::{Error, Result};
