//! Batch processing through readers, transforms and writers

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use weir_io::prelude::*;
use weir_io::transform::{DeleteAction, TargetDmlAction, UpdateAction};
use weir_io::writer::WriterEvent;

// ============================================================================
// Fixtures
// ============================================================================

static INIT: Once = Once::new();

fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn customer() -> Table {
    Table::with_columns(
        None,
        None,
        "CUSTOMER",
        vec![
            Column::key("ID", TypeCode::Integer),
            Column::new("NAME", TypeCode::Varchar),
        ],
    )
}

fn row(id: &str, name: &str) -> CsvData {
    CsvData::insert(vec![Some(id.into()), Some(name.into())])
}

fn memory_writers(log: &WriterLog) -> Box<dyn WriterResolver> {
    let log = log.clone();
    Box::new(move |_: &DataContext, _: &Batch| {
        Some(Box::new(MemoryDataWriter::new(log.clone())) as Box<dyn DataWriter>)
    })
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<String>>,
    veto: bool,
}

impl RecordingListener {
    fn vetoing() -> Self {
        Self {
            veto: true,
            ..Self::default()
        }
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl DataProcessorListener for RecordingListener {
    async fn before_batch_started(&self, _ctx: &DataContext, batch: &Batch) -> bool {
        self.push(format!("before_started:{}", batch.batch_id));
        !self.veto
    }

    async fn after_batch_started(&self, _ctx: &DataContext, batch: &Batch) {
        self.push(format!("after_started:{}", batch.batch_id));
    }

    async fn before_batch_end(&self, _ctx: &DataContext, batch: &Batch) {
        self.push(format!("before_end:{}", batch.batch_id));
    }

    async fn batch_successful(&self, _ctx: &DataContext, batch: &Batch) {
        self.push(format!("successful:{}:ignored={}", batch.batch_id, batch.ignored));
    }

    async fn batch_in_error(&self, _ctx: &DataContext, batch: &Batch, error: &Error) {
        self.push(format!("in_error:{}:{:?}", batch.batch_id, error.category()));
    }

    async fn batch_progress_update(
        &self,
        _ctx: &DataContext,
        batch: &Batch,
        statistics: &StatisticsSnapshot,
    ) {
        self.push(format!(
            "progress:{}:{}",
            batch.batch_id,
            statistics.get(Statistic::RowCount)
        ));
    }
}

/// Wraps a memory writer and fails rows whose first value matches a marker
struct SignalingWriter {
    inner: MemoryDataWriter,
    marker: &'static str,
    error: fn() -> Error,
    delay: Option<Duration>,
}

impl SignalingWriter {
    fn new(log: &WriterLog, marker: &'static str, error: fn() -> Error) -> Self {
        Self {
            inner: MemoryDataWriter::new(log.clone()),
            marker,
            error,
            delay: None,
        }
    }
}

#[async_trait]
impl DataWriter for SignalingWriter {
    async fn open(&mut self, ctx: &mut DataContext) -> weir_io::Result<()> {
        self.inner.open(ctx).await
    }

    async fn start_batch(&mut self, ctx: &mut DataContext) -> weir_io::Result<()> {
        self.inner.start_batch(ctx).await
    }

    async fn start_table(&mut self, ctx: &mut DataContext, table: &Table) -> weir_io::Result<bool> {
        self.inner.start_table(ctx, table).await
    }

    async fn write(&mut self, ctx: &mut DataContext, data: CsvData) -> weir_io::Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let first = data
            .parsed(DataSlot::RowData)?
            .and_then(|row| row.first().cloned().flatten());
        if first.as_deref() == Some(self.marker) {
            return Err((self.error)());
        }
        self.inner.write(ctx, data).await
    }

    async fn end_table(&mut self, ctx: &mut DataContext, table: &Table) -> weir_io::Result<()> {
        self.inner.end_table(ctx, table).await
    }

    async fn end_batch(&mut self, ctx: &mut DataContext, in_error: bool) -> weir_io::Result<()> {
        self.inner.end_batch(ctx, in_error).await
    }

    async fn close(&mut self) -> weir_io::Result<()> {
        self.inner.close().await
    }

    fn statistics(&self) -> StatisticsSnapshot {
        self.inner.statistics()
    }
}

fn signaling(log: &WriterLog, marker: &'static str, error: fn() -> Error) -> Box<dyn WriterResolver> {
    let log = log.clone();
    Box::new(move |_: &DataContext, _: &Batch| {
        Some(Box::new(SignalingWriter::new(&log, marker, error)) as Box<dyn DataWriter>)
    })
}

fn end_batches(log: &WriterLog) -> Vec<(i64, bool)> {
    log.events()
        .into_iter()
        .filter_map(|e| match e {
            WriterEvent::EndBatch { batch_id, in_error } => Some((batch_id, in_error)),
            _ => None,
        })
        .collect()
}

fn written_ids(log: &WriterLog) -> Vec<String> {
    log.rows()
        .iter()
        .filter_map(|data| {
            data.parsed(DataSlot::RowData)
                .ok()
                .flatten()
                .and_then(|row| row.first().cloned().flatten())
        })
        .collect()
}

// ============================================================================
// Change records
// ============================================================================

#[test]
fn test_update_changed_columns() {
    let data = CsvData::update(
        vec![Some("1".into()), Some("Jane".into())],
        Some(vec![Some("1".into()), Some("John".into())]),
        vec![Some("1".into())],
    );
    assert_eq!(data.changed_columns().unwrap(), &[false, true]);
}

// ============================================================================
// Transformation
// ============================================================================

#[tokio::test]
async fn test_implied_columns_pass_through_on_insert() {
    let rule = TransformTable::new("CUSTOMER", "CLIENT").with_column(
        TransformColumn::new("NAME", "NAME")
            .with_transform("const", Some("changed"))
            .with_include_on(IncludeOn::Update),
    );
    let log = WriterLog::default();
    let mut writer = TransformWriter::new(
        Box::new(MemoryDataWriter::new(log.clone())),
        Arc::new(TransformEngine::new(TransformPoint::Load)),
        vec![rule],
    );
    let mut ctx = DataContext::new();
    ctx.set_batch(Some(Batch::new(1, "default")));
    let table = customer();

    writer.start_table(&mut ctx, &table).await.unwrap();
    writer.write(&mut ctx, row("1", "Jane")).await.unwrap();
    writer.end_table(&mut ctx, &table).await.unwrap();

    let rows = log.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].event_type(), DataEventType::Insert);
    assert_eq!(
        rows[0].parsed(DataSlot::RowData).unwrap().unwrap(),
        &[Some("1".to_string()), Some("Jane".to_string())]
    );
}

async fn transform_one(rule: TransformTable, data: CsvData) -> Vec<CsvData> {
    let log = WriterLog::default();
    let mut writer = TransformWriter::new(
        Box::new(MemoryDataWriter::new(log.clone())),
        Arc::new(TransformEngine::new(TransformPoint::Load)),
        vec![rule],
    );
    let mut ctx = DataContext::new();
    ctx.set_batch(Some(Batch::new(1, "default")));
    let table = customer();
    writer.start_table(&mut ctx, &table).await.unwrap();
    writer.write(&mut ctx, data).await.unwrap();
    writer.end_table(&mut ctx, &table).await.unwrap();
    log.rows()
}

#[tokio::test]
async fn test_update_turned_insert_reads_insert_scope() {
    init_test_logging();
    let rule = TransformTable::new("CUSTOMER", "CUSTOMER")
        .with_update_action(UpdateAction::Fixed(TargetDmlAction::InsRow))
        .with_column(
            TransformColumn::computed("NOTE")
                .with_transform("const", Some("updated"))
                .with_include_on(IncludeOn::Update),
        );
    let update = CsvData::update(
        vec![Some("1".into()), Some("Janet".into())],
        Some(vec![Some("1".into()), Some("Jane".into())]),
        vec![Some("1".into())],
    );

    let rows = transform_one(rule, update).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].event_type(), DataEventType::Insert);
    assert_eq!(
        rows[0].parsed(DataSlot::RowData).unwrap().unwrap(),
        &[Some("1".to_string()), Some("Janet".to_string())]
    );
}

#[tokio::test]
async fn test_delete_turned_update_reads_delete_scope() {
    init_test_logging();
    let rule = TransformTable::new("CUSTOMER", "CUSTOMER")
        .with_delete_action(DeleteAction::UpdateCol)
        .with_column(
            TransformColumn::computed("DELETED")
                .with_transform("const", Some("Y"))
                .with_include_on(IncludeOn::Delete),
        )
        .with_column(
            TransformColumn::computed("NOTE")
                .with_transform("const", Some("updated"))
                .with_include_on(IncludeOn::Update),
        );

    let rows = transform_one(rule, CsvData::delete(vec![Some("1".into())], None)).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].event_type(), DataEventType::Update);
    assert_eq!(
        rows[0].parsed(DataSlot::RowData).unwrap().unwrap(),
        &[Some("1".to_string()), Some("Y".to_string())]
    );
}

// ============================================================================
// Processing
// ============================================================================

#[tokio::test]
async fn test_ignored_row_drains_rest_of_table() {
    init_test_logging();
    let other = Table::with_columns(None, None, "ORDERS", vec![Column::key("ID", TypeCode::Integer)]);
    let reader = MemoryDataReader::new(vec![MemoryBatch::new(Batch::new(5, "default"))
        .with_table(customer(), vec![row("1", "a"), row("2", "b"), row("3", "c")])
        .with_table(other, vec![CsvData::insert(vec![Some("9".into())])])]);
    let log = WriterLog::default();
    let listener = Arc::new(RecordingListener::default());
    let mut processor = DataProcessor::new(
        Box::new(reader),
        signaling(&log, "2", || Error::IgnoreRow),
        Some(listener.clone()),
    );

    processor
        .process(&mut DataContext::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(written_ids(&log), vec!["1", "9"]);
    assert_eq!(end_batches(&log), vec![(5, false)]);
    assert_eq!(
        listener.events(),
        vec![
            "before_started:5",
            "after_started:5",
            "before_end:5",
            "successful:5:ignored=false",
        ]
    );
}

#[tokio::test]
async fn test_incomplete_batch_is_a_protocol_error() {
    init_test_logging();
    let reader = MemoryDataReader::new(vec![MemoryBatch::new(Batch::new(17, "default"))
        .with_table(customer(), vec![row("1", "a")])
        .truncated()]);
    let log = WriterLog::default();
    let listener = Arc::new(RecordingListener::default());
    let mut processor = DataProcessor::new(Box::new(reader), memory_writers(&log), Some(listener.clone()));
    let mut ctx = DataContext::new();

    let err = processor
        .process(&mut ctx, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Protocol(ref message) if message.contains("17")));
    assert_eq!(end_batches(&log), vec![(17, true)]);
    assert!(!listener.events().iter().any(|e| e.starts_with("before_end")));
    assert_eq!(
        listener.events().last().map(String::as_str),
        Some("in_error:17:Protocol")
    );
    assert!(ctx.last_error().is_some_and(|e| e.contains("17")));
}

#[tokio::test]
async fn test_failed_batch_rolls_back_and_reports_once() {
    init_test_logging();
    let reader = MemoryDataReader::new(vec![
        MemoryBatch::new(Batch::new(1, "default"))
            .with_table(customer(), vec![row("1", "a"), row("boom", "b")]),
        MemoryBatch::new(Batch::new(2, "default")).with_table(customer(), vec![row("3", "c")]),
    ]);
    let log = WriterLog::default();
    let listener = Arc::new(RecordingListener::default());
    let mut processor = DataProcessor::new(
        Box::new(reader),
        signaling(&log, "boom", || Error::protocol("bad row")),
        Some(listener.clone()),
    );

    let err = processor
        .process(&mut DataContext::new(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Protocol(_)));
    assert_eq!(end_batches(&log), vec![(1, true)]);
    let failures = listener
        .events()
        .iter()
        .filter(|e| e.starts_with("in_error"))
        .count();
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn test_ignored_batch_rolls_back_and_succeeds() {
    let reader = MemoryDataReader::new(vec![MemoryBatch::new(Batch::new(3, "default"))
        .with_table(customer(), vec![row("1", "a"), row("skip", "b"), row("4", "d")])]);
    let log = WriterLog::default();
    let listener = Arc::new(RecordingListener::default());
    let mut processor = DataProcessor::new(
        Box::new(reader),
        signaling(&log, "skip", || Error::IgnoreBatch),
        Some(listener.clone()),
    );

    processor
        .process(&mut DataContext::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(end_batches(&log), vec![(3, true)]);
    assert_eq!(
        listener.events().last().map(String::as_str),
        Some("successful:3:ignored=true")
    );
}

#[tokio::test]
async fn test_vetoed_batch_is_drained() {
    let reader = MemoryDataReader::new(vec![
        MemoryBatch::new(Batch::new(1, "default")).with_table(customer(), vec![row("1", "a")]),
    ]);
    let log = WriterLog::default();
    let listener = Arc::new(RecordingListener::vetoing());
    let mut processor = DataProcessor::new(Box::new(reader), memory_writers(&log), Some(listener.clone()));

    processor
        .process(&mut DataContext::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert!(log.events().is_empty());
    assert_eq!(listener.events(), vec!["before_started:1"]);
}

#[tokio::test]
async fn test_declined_table_is_drained() {
    let orders = Table::with_columns(None, None, "ORDERS", vec![Column::key("ID", TypeCode::Integer)]);
    let reader = MemoryDataReader::new(vec![MemoryBatch::new(Batch::new(1, "default"))
        .with_table(orders, vec![CsvData::insert(vec![Some("7".into())])])
        .with_table(customer(), vec![row("1", "a")])]);
    let log = WriterLog::default();
    let writers = log.clone();
    let resolver = move |_: &DataContext, _: &Batch| {
        Some(Box::new(MemoryDataWriter::new(writers.clone()).declining("ORDERS")) as Box<dyn DataWriter>)
    };
    let mut processor = DataProcessor::new(Box::new(reader), Box::new(resolver), None);

    processor
        .process(&mut DataContext::new(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(written_ids(&log), vec!["1"]);
    assert!(!log
        .events()
        .iter()
        .any(|e| matches!(e, WriterEvent::EndTable(name) if name == "ORDERS")));
}

#[tokio::test]
async fn test_global_rows_precede_tables() {
    let reader = MemoryDataReader::new(vec![MemoryBatch::new(Batch::new(1, "default"))
        .with_global(CsvData::sql("set search_path = app"))
        .with_table(customer(), vec![row("1", "a")])]);
    let log = WriterLog::default();
    let mut processor = DataProcessor::new(Box::new(reader), memory_writers(&log), None);

    processor
        .process(&mut DataContext::new(), &CancellationToken::new())
        .await
        .unwrap();

    let events = log.events();
    let first_write = events
        .iter()
        .position(|e| matches!(e, WriterEvent::Write(_)))
        .unwrap();
    let first_table = events
        .iter()
        .position(|e| matches!(e, WriterEvent::StartTable(_)))
        .unwrap();
    assert!(first_write < first_table);
    assert_eq!(log.rows()[0].event_type(), DataEventType::Sql);
}

#[tokio::test]
async fn test_cancellation_stops_processing() {
    let reader = MemoryDataReader::new(vec![
        MemoryBatch::new(Batch::new(1, "default")).with_table(customer(), vec![row("1", "a")]),
    ]);
    let log = WriterLog::default();
    let mut processor = DataProcessor::new(Box::new(reader), memory_writers(&log), None);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = processor
        .process(&mut DataContext::new(), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(log.rows().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_progress_is_reported_on_interval() {
    let reader = MemoryDataReader::new(vec![MemoryBatch::new(Batch::new(8, "default"))
        .with_table(customer(), vec![row("1", "a"), row("2", "b"), row("3", "c")])]);
    let log = WriterLog::default();
    let writers = log.clone();
    let resolver = move |_: &DataContext, _: &Batch| {
        let mut writer = SignalingWriter::new(&writers, "never", || Error::IgnoreRow);
        writer.delay = Some(Duration::from_secs(40));
        Some(Box::new(writer) as Box<dyn DataWriter>)
    };
    let listener = Arc::new(RecordingListener::default());
    let mut processor = DataProcessor::new(Box::new(reader), Box::new(resolver), Some(listener.clone()))
        .with_config(ProcessorConfig {
            progress_interval_secs: 60,
        });

    processor
        .process(&mut DataContext::new(), &CancellationToken::new())
        .await
        .unwrap();

    let progress: Vec<_> = listener
        .events()
        .into_iter()
        .filter(|e| e.starts_with("progress"))
        .collect();
    assert_eq!(progress, vec!["progress:8:2"]);
}
