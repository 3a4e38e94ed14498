//! Script evaluation seam and process-wide script state

use crate::context::ContextValue;
use crate::error::BoxError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Value exchanged with a script runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScriptValue {
    /// No value
    Null,
    /// Flag
    Bool(bool),
    /// Integer
    Integer(i64),
    /// Floating point
    Float(f64),
    /// Text
    String(String),
    /// Several values, one target row each
    List(Vec<Option<String>>),
    /// Leave the column out of the target row
    IgnoreColumn,
    /// Drop the row
    IgnoreRow,
}

impl ScriptValue {
    /// Text form as stored in a row, `None` for null and the signals
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Null | Self::IgnoreColumn | Self::IgnoreRow | Self::List(_) => None,
            Self::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            Self::Integer(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::String(s) => Some(s.clone()),
        }
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::List(values) => write!(f, "{:?}", values),
            Self::IgnoreColumn => f.write_str("<ignore column>"),
            Self::IgnoreRow => f.write_str("<ignore row>"),
            other => f.write_str(other.to_text().as_deref().unwrap_or("null")),
        }
    }
}

impl From<Option<String>> for ScriptValue {
    fn from(v: Option<String>) -> Self {
        v.map_or(Self::Null, Self::String)
    }
}

impl From<Option<&str>> for ScriptValue {
    fn from(v: Option<&str>) -> Self {
        v.map_or(Self::Null, |s| Self::String(s.to_string()))
    }
}

impl From<&str> for ScriptValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for ScriptValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<&ContextValue> for ScriptValue {
    fn from(v: &ContextValue) -> Self {
        match v {
            ContextValue::Bool(b) => Self::Bool(*b),
            ContextValue::Integer(i) => Self::Integer(*i),
            ContextValue::String(s) => Self::String(s.clone()),
            ContextValue::List(items) => Self::List(items.iter().cloned().map(Some).collect()),
        }
    }
}

/// Embedded script runtime.
///
/// Implementations receive the script text and named bindings and return a
/// single value. The store is shared by every evaluation in the process.
pub trait ScriptEvaluator: Send + Sync {
    /// Evaluate `script` against `bindings`
    fn eval(
        &self,
        script: &str,
        bindings: &BTreeMap<String, ScriptValue>,
        state: &SharedStateStore,
    ) -> Result<ScriptValue, BoxError>;
}

impl<F> ScriptEvaluator for F
where
    F: Fn(&str, &BTreeMap<String, ScriptValue>, &SharedStateStore) -> Result<ScriptValue, BoxError>
        + Send
        + Sync,
{
    fn eval(
        &self,
        script: &str,
        bindings: &BTreeMap<String, ScriptValue>,
        state: &SharedStateStore,
    ) -> Result<ScriptValue, BoxError> {
        self(script, bindings, state)
    }
}

/// Concurrent key/value store that survives across batches.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct SharedStateStore {
    inner: Arc<DashMap<String, ScriptValue>>,
}

impl SharedStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide store
    pub fn global() -> &'static SharedStateStore {
        static GLOBAL: OnceLock<SharedStateStore> = OnceLock::new();
        GLOBAL.get_or_init(SharedStateStore::new)
    }

    /// Read a value
    pub fn get(&self, key: &str) -> Option<ScriptValue> {
        self.inner.get(key).map(|entry| entry.value().clone())
    }

    /// Store a value, returning the previous one
    pub fn put(&self, key: impl Into<String>, value: ScriptValue) -> Option<ScriptValue> {
        self.inner.insert(key.into(), value)
    }

    /// Remove a value
    pub fn remove(&self, key: &str) -> Option<ScriptValue> {
        self.inner.remove(key).map(|(_, value)| value)
    }

    /// Atomically replace a value, starting from `Null` when absent
    pub fn update<F>(&self, key: impl Into<String>, f: F) -> ScriptValue
    where
        F: FnOnce(&ScriptValue) -> ScriptValue,
    {
        let mut entry = self.inner.entry(key.into()).or_insert(ScriptValue::Null);
        let next = f(entry.value());
        *entry.value_mut() = next.clone();
        next
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_store_is_shared_between_clones() {
        let store = SharedStateStore::new();
        let clone = store.clone();
        clone.put("last", ScriptValue::from("42"));
        assert_eq!(store.get("last"), Some(ScriptValue::from("42")));
        assert_eq!(store.remove("last"), Some(ScriptValue::from("42")));
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_updates() {
        let store = SharedStateStore::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        store.update("n", |v| match v {
                            ScriptValue::Integer(i) => ScriptValue::Integer(i + 1),
                            _ => ScriptValue::Integer(1),
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get("n"), Some(ScriptValue::Integer(800)));
    }

    #[test]
    fn test_closure_evaluator() {
        let evaluator = |script: &str,
                         bindings: &BTreeMap<String, ScriptValue>,
                         _state: &SharedStateStore|
         -> Result<ScriptValue, BoxError> {
            Ok(bindings
                .get(script)
                .cloned()
                .unwrap_or(ScriptValue::Null))
        };
        let mut bindings = BTreeMap::new();
        bindings.insert("NAME".to_string(), ScriptValue::from("Jane"));
        let value = evaluator
            .eval("NAME", &bindings, SharedStateStore::global())
            .unwrap();
        assert_eq!(value.to_text().as_deref(), Some("Jane"));
    }
}
