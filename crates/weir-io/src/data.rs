//! Captured row changes
//!
//! A [`CsvData`] is one row mutation. Its column values live in named slots
//! ([`DataSlot`]) that may be held as delimited text, as parsed values, or both.
//! Each form is derived from the other on first access; writing a slot drops
//! the derived form and the cached changed-column vector.

use crate::csv;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::OnceLock;

/// Kind of captured change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataEventType {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
    /// Row re-sent for an initial or repair load
    Reload,
    /// Raw SQL to run at the target
    Sql,
    /// Table definition to create at the target
    Create,
    /// Script to run at the target
    Script,
    /// Shares the `U` code with `Update`, so decoding never produces it
    Unknown,
}

impl DataEventType {
    /// Single character code
    pub const fn code(self) -> &'static str {
        match self {
            Self::Insert => "I",
            Self::Update => "U",
            Self::Delete => "D",
            Self::Reload => "R",
            Self::Sql => "S",
            Self::Create => "C",
            Self::Script => "B",
            Self::Unknown => "U",
        }
    }

    /// Decode a single character code
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "I" => Some(Self::Insert),
            "U" => Some(Self::Update),
            "D" => Some(Self::Delete),
            "R" => Some(Self::Reload),
            "S" => Some(Self::Sql),
            "C" => Some(Self::Create),
            "B" => Some(Self::Script),
            _ => None,
        }
    }

    /// INSERT, UPDATE or DELETE
    pub const fn is_dml(self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }
}

impl fmt::Display for DataEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Reload => "RELOAD",
            Self::Sql => "SQL",
            Self::Create => "CREATE",
            Self::Script => "SCRIPT",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Named value slot of a [`CsvData`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSlot {
    /// New column values
    RowData,
    /// Column values before the change
    OldData,
    /// Primary key values
    PkData,
    /// Values supplied by a manual conflict resolution
    ResolveData,
}

impl DataSlot {
    /// Slot name as used in batch files
    pub const fn name(self) -> &'static str {
        match self {
            Self::RowData => "ROW_DATA",
            Self::OldData => "OLD_DATA",
            Self::PkData => "PK_DATA",
            Self::ResolveData => "RESOLVE_DATA",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SlotData {
    raw: OnceLock<String>,
    parsed: OnceLock<Vec<Option<String>>>,
}

impl SlotData {
    fn from_raw(raw: String) -> Self {
        let slot = Self::default();
        let _ = slot.raw.set(raw);
        slot
    }

    fn from_parsed(values: Vec<Option<String>>) -> Self {
        let slot = Self::default();
        let _ = slot.parsed.set(values);
        slot
    }

    fn raw(&self) -> &str {
        self.raw.get_or_init(|| {
            self.parsed
                .get()
                .map(|values| csv::encode(values))
                .unwrap_or_default()
        })
    }

    fn parsed(&self) -> Result<&[Option<String>]> {
        if let Some(values) = self.parsed.get() {
            return Ok(values);
        }
        let values = csv::decode(self.raw.get().map(String::as_str).unwrap_or_default())?;
        Ok(self.parsed.get_or_init(|| values))
    }
}

/// Pipeline metadata carried with a change.
///
/// Well-known keys are typed; anything else goes in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    /// Table the change was captured on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_table: Option<String>,
    /// Channel the change travels on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    /// Source transaction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    /// Router that selected the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_id: Option<String>,
    /// Capture sequence number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_id: Option<i64>,
    /// Application data captured with the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_data: Option<String>,
    /// Everything else
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One captured row mutation
#[derive(Debug, Clone)]
pub struct CsvData {
    event_type: DataEventType,
    slots: BTreeMap<DataSlot, SlotData>,
    changed: OnceLock<Vec<bool>>,
    no_binary_old_data: bool,
    /// Pipeline metadata
    pub attributes: Attributes,
}

impl CsvData {
    /// Create a change with no values
    pub fn new(event_type: DataEventType) -> Self {
        Self {
            event_type,
            slots: BTreeMap::new(),
            changed: OnceLock::new(),
            no_binary_old_data: false,
            attributes: Attributes::default(),
        }
    }

    /// Create an INSERT
    pub fn insert(row: Vec<Option<String>>) -> Self {
        Self::new(DataEventType::Insert).with_parsed(DataSlot::RowData, row)
    }

    /// Create an UPDATE
    pub fn update(
        row: Vec<Option<String>>,
        old: Option<Vec<Option<String>>>,
        pk: Vec<Option<String>>,
    ) -> Self {
        let data = Self::new(DataEventType::Update)
            .with_parsed(DataSlot::RowData, row)
            .with_parsed(DataSlot::PkData, pk);
        match old {
            Some(old) => data.with_parsed(DataSlot::OldData, old),
            None => data,
        }
    }

    /// Create a DELETE
    pub fn delete(pk: Vec<Option<String>>, old: Option<Vec<Option<String>>>) -> Self {
        let data = Self::new(DataEventType::Delete).with_parsed(DataSlot::PkData, pk);
        match old {
            Some(old) => data.with_parsed(DataSlot::OldData, old),
            None => data,
        }
    }

    /// Create a SQL event
    pub fn sql(statement: impl Into<String>) -> Self {
        Self::new(DataEventType::Sql).with_parsed(DataSlot::RowData, vec![Some(statement.into())])
    }

    /// Builder form of [`CsvData::put_parsed`]
    pub fn with_parsed(mut self, slot: DataSlot, values: Vec<Option<String>>) -> Self {
        self.put_parsed(slot, values);
        self
    }

    /// Builder form of [`CsvData::put_csv`]
    pub fn with_csv(mut self, slot: DataSlot, raw: impl Into<String>) -> Self {
        self.put_csv(slot, raw);
        self
    }

    /// Builder for attributes
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Kind of change
    pub fn event_type(&self) -> DataEventType {
        self.event_type
    }

    /// Change the kind of change
    pub fn set_event_type(&mut self, event_type: DataEventType) {
        self.event_type = event_type;
    }

    /// Replace a slot with parsed values
    pub fn put_parsed(&mut self, slot: DataSlot, values: Vec<Option<String>>) {
        self.slots.insert(slot, SlotData::from_parsed(values));
        self.changed = OnceLock::new();
    }

    /// Replace a slot with delimited text
    pub fn put_csv(&mut self, slot: DataSlot, raw: impl Into<String>) {
        self.slots.insert(slot, SlotData::from_raw(raw.into()));
        self.changed = OnceLock::new();
    }

    /// Drop a slot
    pub fn remove(&mut self, slot: DataSlot) {
        if self.slots.remove(&slot).is_some() {
            self.changed = OnceLock::new();
        }
    }

    /// Whether a slot is present
    pub fn contains(&self, slot: DataSlot) -> bool {
        self.slots.contains_key(&slot)
    }

    /// Parsed values of a slot, `None` when the slot is absent
    pub fn parsed(&self, slot: DataSlot) -> Result<Option<&[Option<String>]>> {
        self.slots.get(&slot).map(SlotData::parsed).transpose()
    }

    /// Delimited text of a slot, `None` when the slot is absent
    pub fn csv(&self, slot: DataSlot) -> Option<&str> {
        self.slots.get(&slot).map(SlotData::raw)
    }

    /// Old values were captured without binary columns
    pub fn is_no_binary_old_data(&self) -> bool {
        self.no_binary_old_data
    }

    /// Mark old values as captured without binary columns
    pub fn set_no_binary_old_data(&mut self, value: bool) {
        self.no_binary_old_data = value;
    }

    /// Per-column changed flags comparing row data with old data by position.
    ///
    /// Columns without an old value count as changed.
    pub fn changed_columns(&self) -> Result<&[bool]> {
        if let Some(changed) = self.changed.get() {
            return Ok(changed);
        }
        let row = self.parsed(DataSlot::RowData)?.unwrap_or_default();
        let old = self.parsed(DataSlot::OldData)?.unwrap_or_default();
        let changed = row
            .iter()
            .enumerate()
            .map(|(i, value)| old.get(i).map_or(true, |previous| previous != value))
            .collect();
        Ok(self.changed.get_or_init(|| changed))
    }

    /// Mark a column as changed, e.g. when old LOB data is unknown
    pub fn set_changed(&mut self, index: usize, changed: bool) -> Result<()> {
        let mut flags = self.changed_columns()?.to_vec();
        if let Some(flag) = flags.get_mut(index) {
            *flag = changed;
        }
        self.changed = OnceLock::new();
        let _ = self.changed.set(flags);
        Ok(())
    }

    /// Pair column names with a slot's values, by position.
    ///
    /// An absent slot yields an empty map. Extra names or values are ignored.
    pub fn to_column_values<S: AsRef<str>>(
        &self,
        names: &[S],
        slot: DataSlot,
    ) -> Result<HashMap<String, Option<String>>> {
        let values = self.parsed(slot)?.unwrap_or_default();
        Ok(names
            .iter()
            .zip(values)
            .map(|(name, value)| (name.as_ref().to_string(), value.clone()))
            .collect())
    }

    /// Whether applying this change needs a target table
    pub fn requires_table(&self) -> bool {
        !matches!(self.event_type, DataEventType::Create | DataEventType::Script)
    }

    /// Check that the slots required by the event type are present
    pub fn validate(&self) -> Result<()> {
        let missing = |slot: DataSlot| {
            Error::protocol(format!(
                "{} event is missing {}",
                self.event_type,
                slot.name()
            ))
        };
        match self.event_type {
            DataEventType::Insert | DataEventType::Reload if !self.contains(DataSlot::RowData) => {
                Err(missing(DataSlot::RowData))
            }
            DataEventType::Update if !self.contains(DataSlot::RowData) => {
                Err(missing(DataSlot::RowData))
            }
            DataEventType::Delete
                if !self.contains(DataSlot::PkData) && !self.contains(DataSlot::OldData) =>
            {
                Err(missing(DataSlot::PkData))
            }
            DataEventType::Sql | DataEventType::Script if !self.contains(DataSlot::RowData) => {
                Err(missing(DataSlot::RowData))
            }
            _ => Ok(()),
        }
    }

    /// Copy of this change without old values
    pub fn without_old_data(&self) -> Self {
        let mut copy = self.clone();
        copy.remove(DataSlot::OldData);
        copy
    }
}
