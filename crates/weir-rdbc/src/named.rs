//! Named-parameter SQL
//!
//! Turns templates such as `select * from T where id in (:ids) and k = :k` into
//! positional `?` SQL plus a matching value array.
//!
//! - `:name`, `:{name}` and `&name` are named parameters
//! - `::` is a cast operator, never a parameter
//! - quoted strings, quoted identifiers and `--` / `/* */` comments are skipped
//! - a bare `?` is an unnamed parameter; one statement may not mix both styles

use crate::error::{Error, Result};
use crate::types::Value;
use std::collections::{HashMap, HashSet};

/// One occurrence of a named parameter in a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterOccurrence {
    /// Parameter name without prefix or braces
    pub name: String,
    /// Byte offset of the prefix character
    pub start: usize,
    /// Byte offset one past the last character of the occurrence
    pub end: usize,
}

/// Immutable result of scanning a named-parameter template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSql {
    sql: String,
    parameters: Vec<ParameterOccurrence>,
    named_parameter_count: usize,
    unnamed_parameter_count: usize,
}

impl ParsedSql {
    /// Scan a template
    pub fn parse(sql: &str) -> Self {
        let bytes = sql.as_bytes();
        let mut parameters = Vec::new();
        let mut distinct = HashSet::new();
        let mut unnamed_parameter_count = 0;
        let mut i = 0;

        while i < bytes.len() {
            let skip_to = skip_comments_and_quotes(bytes, i);
            if skip_to != i {
                i = skip_to;
                continue;
            }

            let c = bytes[i];
            if c == b':' || c == b'&' {
                let next = bytes.get(i + 1).copied();
                if c == b':' && next == Some(b':') {
                    i += 2;
                    continue;
                }
                if c == b':' && next == Some(b'{') {
                    if let Some(close) = sql[i + 2..].find('}') {
                        let end = i + 2 + close;
                        let name = &sql[i + 2..end];
                        if !name.is_empty() {
                            distinct.insert(name.to_string());
                            parameters.push(ParameterOccurrence {
                                name: name.to_string(),
                                start: i,
                                end: end + 1,
                            });
                        }
                        i = end + 1;
                        continue;
                    }
                }
                let mut j = i + 1;
                while j < bytes.len() && is_identifier_byte(bytes[j]) {
                    j += 1;
                }
                if j - i > 1 {
                    let name = &sql[i + 1..j];
                    distinct.insert(name.to_string());
                    parameters.push(ParameterOccurrence {
                        name: name.to_string(),
                        start: i,
                        end: j,
                    });
                }
                i = j.max(i + 1);
                continue;
            }
            if c == b'?' {
                unnamed_parameter_count += 1;
            }
            i += 1;
        }

        Self {
            sql: sql.to_string(),
            named_parameter_count: distinct.len(),
            parameters,
            unnamed_parameter_count,
        }
    }

    /// The template text
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Named parameter occurrences, in template order
    pub fn parameters(&self) -> &[ParameterOccurrence] {
        &self.parameters
    }

    /// Parameter names, in template order (repeats included)
    pub fn parameter_names(&self) -> Vec<&str> {
        self.parameters.iter().map(|p| p.name.as_str()).collect()
    }

    /// Number of distinct named parameters
    pub fn named_parameter_count(&self) -> usize {
        self.named_parameter_count
    }

    /// Number of bare `?` placeholders
    pub fn unnamed_parameter_count(&self) -> usize {
        self.unnamed_parameter_count
    }

    /// Named occurrences plus bare placeholders
    pub fn total_parameter_count(&self) -> usize {
        self.parameters.len() + self.unnamed_parameter_count
    }

    /// Rewrite every named occurrence to positional placeholders.
    ///
    /// A sequence value expands to one `?` per element; a sequence of
    /// sequences expands to parenthesized groups, e.g. `(?, ?), (?, ?)`.
    pub fn substitute(&self, values: &HashMap<String, Value>) -> Result<String> {
        let mut sql = String::with_capacity(self.sql.len() + self.parameters.len() * 4);
        let mut last = 0;
        for parameter in &self.parameters {
            sql.push_str(&self.sql[last..parameter.start]);
            let value = values
                .get(&parameter.name)
                .ok_or_else(|| Error::missing_parameter(&parameter.name))?;
            sql.push_str(&placeholders_for(value));
            last = parameter.end;
        }
        sql.push_str(&self.sql[last..]);
        Ok(sql)
    }

    /// Build the positional value array in the order [`ParsedSql::substitute`]
    /// renders placeholders.
    pub fn build_value_array(&self, values: &HashMap<String, Value>) -> Result<Vec<Value>> {
        if self.named_parameter_count > 0 && self.unnamed_parameter_count > 0 {
            return Err(Error::MixedPlaceholders {
                named: self.named_parameter_count,
                unnamed: self.unnamed_parameter_count,
            });
        }
        let mut array = Vec::with_capacity(self.parameters.len());
        for parameter in &self.parameters {
            let value = values
                .get(&parameter.name)
                .ok_or_else(|| Error::missing_parameter(&parameter.name))?;
            match value {
                Value::Array(items) => {
                    for item in items {
                        match item {
                            Value::Array(inner) => array.extend(inner.iter().cloned()),
                            other => array.push(other.clone()),
                        }
                    }
                }
                other => array.push(other.clone()),
            }
        }
        Ok(array)
    }

    /// Substitute and build the value array in one step
    pub fn prepare(&self, values: &HashMap<String, Value>) -> Result<(String, Vec<Value>)> {
        let array = self.build_value_array(values)?;
        Ok((self.substitute(values)?, array))
    }
}

fn placeholders_for(value: &Value) -> String {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Array(inner) => format!("({})", vec!["?"; inner.len()].join(", ")),
                _ => "?".to_string(),
            })
            .collect::<Vec<_>>()
            .join(", "),
        _ => "?".to_string(),
    }
}

#[inline]
fn is_identifier_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Position just past a quoted region or comment starting at `i`, or `i` itself
fn skip_comments_and_quotes(bytes: &[u8], i: usize) -> usize {
    let rest = &bytes[i..];
    let find_from = |start: usize, pattern: &[u8]| -> Option<usize> {
        bytes[start..]
            .windows(pattern.len())
            .position(|w| w == pattern)
            .map(|p| start + p)
    };

    match rest {
        [b'\'', ..] | [b'"', ..] => {
            let quote = rest[0];
            match bytes[i + 1..].iter().position(|b| *b == quote) {
                Some(p) => i + 1 + p + 1,
                None => bytes.len(),
            }
        }
        [b'-', b'-', ..] => match find_from(i + 2, b"\n") {
            Some(p) => p + 1,
            None => bytes.len(),
        },
        [b'/', b'*', ..] => match find_from(i + 2, b"*/") {
            Some(p) => p + 2,
            None => bytes.len(),
        },
        _ => i,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_parse_named() {
        let parsed = ParsedSql::parse("select * from t where a = :a and b = &b or c = :a");
        assert_eq!(parsed.parameter_names(), vec!["a", "b", "a"]);
        assert_eq!(parsed.named_parameter_count(), 2);
        assert_eq!(parsed.unnamed_parameter_count(), 0);
        assert_eq!(parsed.total_parameter_count(), 3);
    }

    #[test]
    fn test_skips_quotes_comments_and_casts() {
        let parsed = ParsedSql::parse(
            "select ':x', \"y:z\" -- :nope ?\n from t /* :no ? */ where v::text = :v",
        );
        assert_eq!(parsed.parameter_names(), vec!["v"]);
        assert_eq!(parsed.unnamed_parameter_count(), 0);
    }

    #[test]
    fn test_braced_parameter() {
        let parsed = ParsedSql::parse("update t set a = :{first name} where id = :id");
        assert_eq!(parsed.parameter_names(), vec!["first name", "id"]);
    }

    #[test]
    fn test_substitute_sequences() {
        let parsed = ParsedSql::parse("select * from t where id in (:ids) and (a, b) in (:pairs)");
        let vals = values(&[
            ("ids", Value::from(vec![1, 2, 3])),
            (
                "pairs",
                Value::Array(vec![Value::from(vec![1, 2]), Value::from(vec![3, 4])]),
            ),
        ]);
        assert_eq!(
            parsed.substitute(&vals).unwrap(),
            "select * from t where id in (?, ?, ?) and (a, b) in ((?, ?), (?, ?))"
        );
        assert_eq!(parsed.build_value_array(&vals).unwrap().len(), 7);
    }

    #[test]
    fn test_missing_parameter() {
        let parsed = ParsedSql::parse("select * from t where id = :id");
        let err = parsed.substitute(&HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::MissingParameter { name } if name == "id"));
    }

    #[test]
    fn test_mixed_placeholders_rejected() {
        let parsed = ParsedSql::parse("select * from t where id = :id and b = ?");
        let err = parsed
            .build_value_array(&values(&[("id", Value::Int64(1))]))
            .unwrap_err();
        assert!(matches!(err, Error::MixedPlaceholders { named: 1, unnamed: 1 }));
    }

    #[test]
    fn test_unnamed_only() {
        let parsed = ParsedSql::parse("select * from t where a = ? and b = ?");
        assert_eq!(parsed.unnamed_parameter_count(), 2);
        assert!(parsed.build_value_array(&HashMap::new()).unwrap().is_empty());
        assert_eq!(parsed.substitute(&HashMap::new()).unwrap(), parsed.sql());
    }
}
