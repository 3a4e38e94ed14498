//! Writer that applies rows to a target database

use super::conflict::{
    is_newer, Conflict, ConflictContext, ConflictResolver, DefaultConflictResolver,
    DetectConflict, Resolution, ResolveConflict,
};
use super::settings::DatabaseWriterSettings;
use super::DataWriter;
use crate::context::DataContext;
use crate::data::{CsvData, DataEventType, DataSlot};
use crate::error::{Error, Result};
use crate::stats::{Statistic, Statistics, StatisticsSnapshot};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use weir_rdbc::connection::{DatabasePlatform, Transaction};
use weir_rdbc::dml::{DmlStatement, DmlType};
use weir_rdbc::types::{Column, Table, TypeCode, Value};

/// Outcome of applying one row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// The row was applied
    Success,
    /// The row did not match the target state
    Conflict,
}

/// Hooks around the database writer's work.
///
/// Every method has a no-op default.
pub trait DatabaseWriterFilter: Send + Sync {
    /// Called before a row is applied; `false` skips the row
    fn before_write(&self, _ctx: &DataContext, _table: &Table, _data: &CsvData) -> bool {
        true
    }

    /// Called after a row was applied
    fn after_write(&self, _ctx: &DataContext, _table: &Table, _data: &CsvData) {}

    /// Called before a successful batch is committed
    fn batch_complete(&self, _ctx: &DataContext) {}

    /// Called after a batch was committed
    fn batch_committed(&self, _ctx: &DataContext) {}

    /// Called after a batch was rolled back
    fn batch_rolled_back(&self, _ctx: &DataContext) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StatementKey {
    dml_type: DmlType,
    table: String,
    keys: Vec<String>,
    columns: Vec<String>,
    null_keys: Vec<bool>,
}

/// Lookup used in a WHERE clause: the key columns and their values
struct Lookup<'a> {
    keys: Vec<&'a Column>,
    values: Vec<Option<String>>,
}

impl Lookup<'_> {
    fn null_mask(&self) -> Vec<bool> {
        self.values.iter().map(Option::is_none).collect()
    }
}

fn is_lob(column: &Column) -> bool {
    matches!(
        column.type_code,
        TypeCode::Blob | TypeCode::Clob | TypeCode::LongVarBinary | TypeCode::LongVarchar
    )
}

/// Applies rows inside one transaction per batch.
///
/// Target tables are looked up once per run and cached in the context;
/// the layout is re-aligned to each incoming table header.
/// Compiled statements are cached per table, operation, column set and null
/// key mask.
pub struct DatabaseWriter {
    platform: Arc<dyn DatabasePlatform>,
    settings: DatabaseWriterSettings,
    resolver: Arc<dyn ConflictResolver>,
    filters: Vec<Arc<dyn DatabaseWriterFilter>>,
    tx: Option<Box<dyn Transaction>>,
    target_table: Option<Table>,
    statements: Mutex<HashMap<StatementKey, Arc<DmlStatement>>>,
    missing_tables: HashSet<String>,
    uncommitted: u64,
    stats: Statistics,
}

impl DatabaseWriter {
    /// Writer over `platform` with default settings
    pub fn new(platform: Arc<dyn DatabasePlatform>) -> Self {
        Self {
            platform,
            settings: DatabaseWriterSettings::default(),
            resolver: Arc::new(DefaultConflictResolver),
            filters: Vec::new(),
            tx: None,
            target_table: None,
            statements: Mutex::new(HashMap::new()),
            missing_tables: HashSet::new(),
            uncommitted: 0,
            stats: Statistics::new(),
        }
    }

    /// Replace the settings
    pub fn with_settings(mut self, settings: DatabaseWriterSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the conflict resolver
    pub fn with_conflict_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Add a filter
    pub fn with_filter(mut self, filter: Arc<dyn DatabaseWriterFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Active settings
    pub fn settings(&self) -> &DatabaseWriterSettings {
        &self.settings
    }

    /// Number of compiled statements held in the cache
    pub fn cached_statements(&self) -> usize {
        self.statements.lock().len()
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn statement(
        &self,
        dml_type: DmlType,
        table: &Table,
        keys: &[&Column],
        columns: &[&Column],
        null_keys: Vec<bool>,
    ) -> Result<Arc<DmlStatement>> {
        let key = StatementKey {
            dml_type,
            table: table.fully_qualified_name(),
            keys: keys.iter().map(|c| c.name.clone()).collect(),
            columns: columns.iter().map(|c| c.name.clone()).collect(),
            null_keys,
        };
        let mut cache = self.statements.lock();
        if let Some(statement) = cache.get(&key) {
            return Ok(statement.clone());
        }
        let statement = Arc::new(self.platform.create_dml_statement(
            dml_type,
            table,
            keys.iter().map(|c| (*c).clone()).collect(),
            columns.iter().map(|c| (*c).clone()).collect(),
            key.null_keys.clone(),
            self.settings.text_column_expression.clone(),
        )?);
        debug!(sql = statement.sql(), "Compiled statement");
        cache.insert(key, statement.clone());
        Ok(statement)
    }

    fn transaction(&self) -> Result<&dyn Transaction> {
        self.tx
            .as_deref()
            .ok_or_else(|| Error::protocol("no open transaction; start_batch was not called"))
    }

    fn bind(statement: &DmlStatement, texts: &[Option<String>]) -> Result<Vec<Value>> {
        texts
            .iter()
            .zip(statement.types())
            .map(|(text, type_code)| Ok(Value::from_text(text.as_deref(), *type_code)?))
            .collect()
    }

    async fn execute(
        &self,
        statement: &DmlStatement,
        columns: &[Option<String>],
        keys: &[Option<String>],
    ) -> Result<u64> {
        let texts = statement.value_array_from_parts(columns, keys);
        let values = Self::bind(statement, &texts)?;
        Ok(self.transaction()?.execute(statement.sql(), &values).await?)
    }

    /// Zero rows or a unique key violation is a conflict
    fn classify(result: Result<u64>) -> Result<LoadStatus> {
        match result {
            Ok(0) => Ok(LoadStatus::Conflict),
            Ok(_) => Ok(LoadStatus::Success),
            Err(Error::Database(e)) if e.is_unique_key_violation() => {
                debug!(error = %e, "Unique key violation treated as a conflict");
                Ok(LoadStatus::Conflict)
            }
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Row values
    // ========================================================================

    fn row_values(table: &Table, data: &CsvData) -> Result<Vec<Option<String>>> {
        let row = data.parsed(DataSlot::RowData)?.unwrap_or_default();
        if row.len() != table.columns.len() {
            return Err(Error::protocol(format!(
                "{} row for {} has {} values but the table has {} columns",
                data.event_type(),
                table.fully_qualified_name(),
                row.len(),
                table.columns.len()
            )));
        }
        Ok(row.to_vec())
    }

    /// Target layout in the order of the incoming columns, with the incoming
    /// key flags when any are set
    fn align_to_incoming(found: Table, incoming: &Table) -> Table {
        if incoming.columns.is_empty() {
            return found;
        }
        let names: Vec<String> = incoming.columns.iter().map(|c| c.name.clone()).collect();
        let mut ordered = found.order_columns(&names);
        if incoming.columns.iter().any(|c| c.primary_key) {
            for column in &mut ordered.columns {
                column.primary_key = incoming.column(&column.name).is_some_and(|c| c.primary_key);
            }
        }
        ordered
    }

    fn key_columns(table: &Table) -> Vec<&Column> {
        let keys = table.primary_key_columns();
        if keys.is_empty() {
            table.columns.iter().collect()
        } else {
            keys
        }
    }

    /// Values of the key columns, from PK_DATA, else OLD_DATA, else ROW_DATA
    fn key_values(table: &Table, data: &CsvData) -> Result<Vec<Option<String>>> {
        let keys = Self::key_columns(table);
        if let Some(pk) = data.parsed(DataSlot::PkData)? {
            if pk.len() != keys.len() {
                return Err(Error::protocol(format!(
                    "{} key data for {} has {} values but the table has {} key columns",
                    data.event_type(),
                    table.fully_qualified_name(),
                    pk.len(),
                    keys.len()
                )));
            }
            return Ok(pk.to_vec());
        }
        let source = match data.parsed(DataSlot::OldData)? {
            Some(old) if !old.is_empty() => old,
            _ => data.parsed(DataSlot::RowData)?.unwrap_or_default(),
        };
        Ok(keys
            .iter()
            .map(|k| {
                table
                    .column_index(&k.name)
                    .and_then(|i| source.get(i).cloned().flatten())
            })
            .collect())
    }

    fn detect_type(&self, conflict: &Conflict, by_pk_only: bool) -> DetectConflict {
        if by_pk_only || !self.settings.use_conflict_detection {
            DetectConflict::UsePkData
        } else {
            conflict.detect_type
        }
    }

    /// Choose the WHERE columns and values for an update or delete
    fn lookup<'a>(
        table: &'a Table,
        data: &CsvData,
        detect: DetectConflict,
        conflict: &Conflict,
    ) -> Result<Lookup<'a>> {
        let keys = Self::key_columns(table);
        let key_values = Self::key_values(table, data)?;
        let old = data
            .parsed(DataSlot::OldData)?
            .filter(|old| old.len() == table.columns.len())
            .map(<[Option<String>]>::to_vec);
        let by_pk = || Lookup {
            keys: keys.clone(),
            values: key_values.clone(),
        };
        let Some(old) = old else {
            return Ok(by_pk());
        };

        let lookup = match detect {
            DetectConflict::UsePkData => by_pk(),
            DetectConflict::UseOldData => Lookup {
                keys: table.columns.iter().filter(|c| !is_lob(c)).collect(),
                values: table
                    .columns
                    .iter()
                    .zip(&old)
                    .filter(|(c, _)| !is_lob(c))
                    .map(|(_, v)| v.clone())
                    .collect(),
            },
            DetectConflict::UseChangedData => {
                let changed = data.changed_columns()?;
                let mut lookup = Lookup {
                    keys: Vec::new(),
                    values: Vec::new(),
                };
                for (i, column) in table.columns.iter().enumerate() {
                    let is_key = keys.iter().any(|k| k.name == column.name);
                    if !is_key && changed.get(i).copied().unwrap_or(false) && !is_lob(column) {
                        lookup.keys.push(column);
                        lookup.values.push(old[i].clone());
                    }
                }
                lookup.keys.extend(keys.iter().copied());
                lookup.values.extend(key_values.iter().cloned());
                lookup
            }
            DetectConflict::UseTimestamp | DetectConflict::UseVersion => {
                let detect_column = conflict
                    .detect_expression
                    .as_deref()
                    .and_then(|name| table.column_index(name));
                match detect_column {
                    Some(i) => {
                        let mut lookup = Lookup {
                            keys: vec![&table.columns[i]],
                            values: vec![old[i].clone()],
                        };
                        lookup.keys.extend(keys.iter().copied());
                        lookup.values.extend(key_values.iter().cloned());
                        lookup
                    }
                    None => by_pk(),
                }
            }
        };
        Ok(lookup)
    }

    // ========================================================================
    // Operations
    // ========================================================================

    async fn insert(&mut self, table: &Table, data: &CsvData) -> Result<LoadStatus> {
        let row = Self::row_values(table, data)?;
        let columns: Vec<&Column> = table.columns.iter().collect();
        let statement = self.statement(DmlType::Insert, table, &[], &columns, Vec::new())?;
        let status = Self::classify(self.execute(&statement, &row, &[]).await)?;
        if status == LoadStatus::Success {
            self.stats.incr(Statistic::InsertCount);
        }
        Ok(status)
    }

    async fn update(&mut self, table: &Table, data: &CsvData, by_pk_only: bool) -> Result<LoadStatus> {
        let row = Self::row_values(table, data)?;
        let conflict = self.settings.conflict_for(&table.fully_qualified_name()).clone();
        let detect = self.detect_type(&conflict, by_pk_only);
        let lookup = Self::lookup(table, data, detect, &conflict)?;

        let old = data.parsed(DataSlot::OldData)?;
        let changes_only = self.settings.apply_changes_only
            && !data.is_no_binary_old_data()
            && old.is_some_and(|o| o.len() == row.len());
        let changed = data.changed_columns()?;
        let key_values = Self::key_values(table, data)?;
        let keys = Self::key_columns(table);

        let mut columns = Vec::new();
        let mut values = Vec::new();
        for (i, column) in table.columns.iter().enumerate() {
            if column.auto_increment {
                continue;
            }
            let include = if changes_only {
                let old_missing = old.and_then(|o| o.get(i)).map_or(true, Option::is_none);
                changed.get(i).copied().unwrap_or(true) || (is_lob(column) && old_missing)
            } else {
                match keys.iter().position(|k| k.name == column.name) {
                    Some(k) if column.primary_key => key_values.get(k) != Some(&row[i]),
                    _ => true,
                }
            };
            if include {
                columns.push(column);
                values.push(row[i].clone());
            }
        }
        if columns.is_empty() {
            debug!(table = %table.fully_qualified_name(), "No changed columns to update");
            return Ok(LoadStatus::Success);
        }

        let statement =
            self.statement(DmlType::Update, table, &lookup.keys, &columns, lookup.null_mask())?;
        let status = Self::classify(self.execute(&statement, &values, &lookup.values).await)?;
        if status == LoadStatus::Success {
            self.stats.incr(Statistic::UpdateCount);
        }
        Ok(status)
    }

    async fn delete(&mut self, table: &Table, data: &CsvData, by_pk_only: bool) -> Result<LoadStatus> {
        let conflict = self.settings.conflict_for(&table.fully_qualified_name()).clone();
        let detect = self.detect_type(&conflict, by_pk_only);
        let lookup = Self::lookup(table, data, detect, &conflict)?;
        let statement =
            self.statement(DmlType::Delete, table, &lookup.keys, &[], lookup.null_mask())?;
        let status = Self::classify(self.execute(&statement, &[], &lookup.values).await)?;
        if status == LoadStatus::Success {
            self.stats.incr(Statistic::DeleteCount);
        }
        Ok(status)
    }

    async fn sql(&mut self, data: &CsvData) -> Result<()> {
        let Some(sql) = data
            .parsed(DataSlot::RowData)?
            .and_then(|row| row.first().cloned().flatten())
        else {
            return Err(Error::protocol("SQL event without a statement"));
        };
        let count = self.transaction()?.execute(&sql, &[]).await?;
        debug!(rows = count, "Executed SQL event");
        Ok(())
    }

    // ========================================================================
    // Conflicts
    // ========================================================================

    async fn row_exists(&self, table: &Table, data: &CsvData) -> Result<bool> {
        let keys = Self::key_columns(table);
        let values = Self::key_values(table, data)?;
        let mask = values.iter().map(Option::is_none).collect();
        let statement = self.statement(DmlType::Count, table, &keys, &[], mask)?;
        let texts = statement.value_array_from_parts::<Option<String>>(&[], &values);
        let params = Self::bind(&statement, &texts)?;
        let rows = self.transaction()?.query(statement.sql(), &params).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get(0))
            .and_then(Value::as_i64)
            .is_some_and(|n| n > 0))
    }

    async fn existing_value(&self, table: &Table, data: &CsvData, column: &str) -> Result<Option<String>> {
        let Some(detect) = table.column(column) else {
            return Ok(None);
        };
        let keys = Self::key_columns(table);
        let values = Self::key_values(table, data)?;
        let mask = values.iter().map(Option::is_none).collect();
        let statement = self.statement(DmlType::Select, table, &keys, &[detect], mask)?;
        let texts = statement.value_array_from_parts::<Option<String>>(&[], &values);
        let params = Self::bind(&statement, &texts)?;
        let rows = self.transaction()?.query(statement.sql(), &params).await?;
        Ok(rows.first().and_then(|row| row.get(0)).and_then(Value::to_text))
    }

    fn incoming_value(table: &Table, data: &CsvData, column: &str) -> Result<Option<String>> {
        let slot = if data.event_type() == DataEventType::Delete {
            DataSlot::OldData
        } else {
            DataSlot::RowData
        };
        Ok(table
            .column_index(column)
            .and_then(|i| {
                data.parsed(slot)
                    .ok()
                    .flatten()
                    .and_then(|values| values.get(i).cloned())
            })
            .flatten())
    }

    async fn resolve_conflict(&mut self, ctx: &DataContext, table: &Table, data: &CsvData) -> Result<()> {
        let name = table.fully_qualified_name();
        let conflict = self.settings.conflict_for(&name).clone();
        let event_type = data.event_type();

        let row_exists = match event_type {
            DataEventType::Insert => true,
            DataEventType::Update | DataEventType::Delete
                if self.detect_type(&conflict, false) == DetectConflict::UsePkData =>
            {
                false
            }
            _ => self.row_exists(table, data).await?,
        };
        let incoming_is_newer = match (&conflict.resolve_type, conflict.detect_expression.as_deref()) {
            (ResolveConflict::NewerWins, Some(column)) if row_exists => {
                let existing = self.existing_value(table, data, column).await?;
                let incoming = Self::incoming_value(table, data, column)?;
                Some(is_newer(incoming.as_deref(), existing.as_deref()))
            }
            _ => None,
        };

        let resolution = self.resolver.resolve(&ConflictContext {
            table: &name,
            event_type,
            conflict: &conflict,
            row_exists,
            incoming_is_newer,
        })?;
        if self.settings.log_conflict_resolution {
            info!(
                batch_id = ctx.batch_id(),
                table = %name,
                event = %event_type,
                ?resolution,
                "Resolved conflict"
            );
        }

        let unresolved = |what: &str| Error::conflict(name.clone(), event_type, what.to_string());
        match resolution {
            Resolution::Apply(DataEventType::Insert) => {
                if self.insert(table, data).await? == LoadStatus::Conflict {
                    return Err(unresolved("fallback insert conflicted"));
                }
                self.stats.incr(Statistic::FallbackInsertCount);
            }
            Resolution::Apply(DataEventType::Update) => {
                if self.update(table, data, true).await? == LoadStatus::Conflict {
                    return Err(unresolved("fallback update matched no row"));
                }
                self.stats.incr(Statistic::FallbackUpdateCount);
            }
            Resolution::Apply(DataEventType::Delete) => {
                if self.delete(table, data, true).await? == LoadStatus::Conflict {
                    self.stats.incr(Statistic::MissingDeleteCount);
                }
            }
            Resolution::Apply(other) => {
                return Err(unresolved(&format!("cannot fall back to {}", other)));
            }
            Resolution::IgnoreRow => self.stats.incr(Statistic::IgnoreRowCount),
            Resolution::IgnoreBatch => return Err(Error::IgnoreBatch),
            Resolution::MissingDelete => self.stats.incr(Statistic::MissingDeleteCount),
        }
        Ok(())
    }

    async fn early_commit(&mut self, ctx: &DataContext) -> Result<()> {
        self.uncommitted += 1;
        let limit = self.settings.max_rows_before_commit;
        if limit == 0 || self.uncommitted < limit {
            return Ok(());
        }
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        self.tx = Some(self.platform.begin().await?);
        debug!(batch_id = ctx.batch_id(), rows = self.uncommitted, "Committed early");
        self.uncommitted = 0;
        Ok(())
    }
}

#[async_trait]
impl DataWriter for DatabaseWriter {
    async fn open(&mut self, _ctx: &mut DataContext) -> Result<()> {
        debug!(platform = self.platform.name(), "Opened database writer");
        Ok(())
    }

    async fn start_batch(&mut self, ctx: &mut DataContext) -> Result<()> {
        self.stats.reset();
        self.uncommitted = 0;
        if let Some(stale) = self.tx.take() {
            warn!(batch_id = ctx.batch_id(), "Rolling back a transaction left open by a previous batch");
            stale.rollback().await?;
        }
        self.tx = Some(self.platform.begin().await?);
        Ok(())
    }

    async fn start_table(&mut self, ctx: &mut DataContext, table: &Table) -> Result<bool> {
        let name = table.fully_qualified_name();
        let found = match ctx.cached_table(&name) {
            Some(cached) => cached.clone(),
            None => {
                let found = self
                    .platform
                    .lookup_table(table.catalog.as_deref(), table.schema.as_deref(), &table.name)
                    .await?;
                let Some(found) = found else {
                    self.target_table = None;
                    if self.settings.ignore_missing_tables {
                        if self.missing_tables.insert(name.clone()) {
                            warn!(batch_id = ctx.batch_id(), table = %name, "Target table is missing; its rows are skipped");
                        }
                        return Ok(false);
                    }
                    return Err(weir_rdbc::Error::TableNotFound { table: name }.into());
                };
                ctx.cache_table(name, found.clone());
                found
            }
        };
        self.target_table = Some(Self::align_to_incoming(found, table));
        Ok(true)
    }

    async fn write(&mut self, ctx: &mut DataContext, data: CsvData) -> Result<()> {
        self.stats.incr(Statistic::RowCount);
        self.stats.incr(Statistic::LineNumber);
        data.validate()?;

        let event_type = data.event_type();
        match event_type {
            DataEventType::Sql => return self.sql(&data).await,
            DataEventType::Create | DataEventType::Script => {
                warn!(batch_id = ctx.batch_id(), event = %event_type, "Event type is not applied by the database writer");
                return Ok(());
            }
            DataEventType::Reload | DataEventType::Unknown => {
                warn!(batch_id = ctx.batch_id(), event = %event_type, "Skipping unsupported event");
                return Ok(());
            }
            _ => {}
        }

        let table = self
            .target_table
            .clone()
            .ok_or_else(|| Error::protocol(format!("{} row written outside a table", event_type)))?;
        if !self.filters.iter().all(|f| f.before_write(ctx, &table, &data)) {
            debug!(table = %table.fully_qualified_name(), "Row skipped by filter");
            return Ok(());
        }

        let started = Instant::now();
        let status = match event_type {
            DataEventType::Insert => self.insert(&table, &data).await?,
            DataEventType::Update => self.update(&table, &data, false).await?,
            _ => self.delete(&table, &data, false).await?,
        };
        if status == LoadStatus::Conflict {
            self.resolve_conflict(ctx, &table, &data).await?;
        }
        self.stats.stop_timer(Statistic::LoadMillis, started);

        for filter in &self.filters {
            filter.after_write(ctx, &table, &data);
        }
        self.early_commit(ctx).await
    }

    async fn end_table(&mut self, _ctx: &mut DataContext, _table: &Table) -> Result<()> {
        self.target_table = None;
        Ok(())
    }

    async fn end_batch(&mut self, ctx: &mut DataContext, in_error: bool) -> Result<()> {
        self.target_table = None;
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        if in_error {
            tx.rollback().await?;
            for filter in &self.filters {
                filter.batch_rolled_back(ctx);
            }
            debug!(batch_id = ctx.batch_id(), "Rolled back batch");
        } else {
            for filter in &self.filters {
                filter.batch_complete(ctx);
            }
            tx.commit().await?;
            for filter in &self.filters {
                filter.batch_committed(ctx);
            }
            debug!(batch_id = ctx.batch_id(), stats = %self.stats.snapshot(), "Committed batch");
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        self.statements.lock().clear();
        Ok(())
    }

    fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }
}
