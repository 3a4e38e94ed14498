//! Delimited text form of a row
//!
//! ```text
//! "1","it\"s",,""
//!  │    │     │  └ empty string
//!  │    │     └ null (empty, unquoted)
//!  │    └ embedded quote, backslash escaped
//!  └ every non-null value is quoted
//! ```
//!
//! A row with no values and a row holding a single null both encode to the
//! empty string; decoding the empty string yields a single null.

use crate::error::{Error, Result};

/// Encode values as one delimited line
pub fn encode(values: &[Option<String>]) -> String {
    let mut line = String::with_capacity(values.len() * 8);
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        if let Some(value) = value {
            line.push('"');
            for c in value.chars() {
                if c == '"' || c == '\\' {
                    line.push('\\');
                }
                line.push(c);
            }
            line.push('"');
        }
    }
    line
}

/// Decode one delimited line
pub fn decode(line: &str) -> Result<Vec<Option<String>>> {
    let mut values = Vec::new();
    let mut chars = line.char_indices().peekable();

    loop {
        match chars.peek().copied() {
            Some((start, '"')) => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some((_, escaped)) => value.push(escaped),
                            None => break,
                        },
                        '"' => {
                            closed = true;
                            break;
                        }
                        other => value.push(other),
                    }
                }
                if !closed {
                    return Err(Error::protocol(format!(
                        "unterminated quoted value at offset {} in '{}'",
                        start, line
                    )));
                }
                values.push(Some(value));
                match chars.next() {
                    None => return Ok(values),
                    Some((_, ',')) => {}
                    Some((offset, c)) => {
                        return Err(Error::protocol(format!(
                            "unexpected '{}' after quoted value at offset {} in '{}'",
                            c, offset, line
                        )))
                    }
                }
            }
            _ => {
                // Bare field: empty is null, anything else is taken verbatim
                let mut value = String::new();
                let mut at_end = true;
                for (_, c) in chars.by_ref() {
                    if c == ',' {
                        at_end = false;
                        break;
                    }
                    value.push(c);
                }
                values.push(if value.is_empty() { None } else { Some(value) });
                if at_end {
                    return Ok(values);
                }
            }
        }
    }
}
