//! Response flattening
//!
//! Upstream responses arrive as a JSON object mapping opaque top-level keys
//! to sub-objects, each carrying a `data` field holding rows of columns
//! (a list of lists). Flattening walks every top-level key and emits one
//! fixed-width row tuple per inner row, preserving column order and count.
//!
//! The shape is a validated contract, not duck typing: a missing `data`
//! field, a non-list row, or a width mismatch is a data-integrity error.
//! Columns are never dropped or padded.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::fetch::RawResponse;

/// One flattened row: raw JSON column values, in received order
///
/// Typing against the storage schema happens at insert time; the flattener
/// only guarantees shape and width.
pub type RowTuple = Vec<Value>;

/// Errors that can occur while flattening an upstream payload
#[derive(Debug, Error)]
pub enum FlattenError {
    /// The payload deviates from the object-of-`data`-arrays contract
    #[error("Unexpected response shape: {0}")]
    UnexpectedShape(String),

    /// A row's column count does not match the declared schema width
    #[error("Row under key '{key}' has {actual} columns, schema declares {expected}")]
    WidthMismatch {
        key: String,
        expected: usize,
        actual: usize,
    },
}

/// Flattens nested upstream payloads into fixed-width row tuples
#[derive(Debug, Clone, Copy)]
pub struct Flattener {
    width: usize,
}

impl Flattener {
    /// Creates a flattener for rows of the given declared width
    pub fn new(width: usize) -> Self {
        Self { width }
    }

    /// Starts a lazy walk over the payload's rows
    ///
    /// The top level is validated eagerly; individual rows are validated as
    /// they are pulled, so large payloads can be streamed straight into the
    /// store without materializing every tuple first.
    pub fn rows<'a>(&self, raw: &'a RawResponse) -> Result<FlattenedRows<'a>, FlattenError> {
        let map = raw.body.as_object().ok_or_else(|| {
            FlattenError::UnexpectedShape("top level is not a JSON object".to_string())
        })?;

        Ok(FlattenedRows {
            width: self.width,
            outer: map.iter(),
            current: None,
            done: false,
        })
    }
}

/// Iterator over flattened rows; finite, not restartable
#[derive(Debug)]
pub struct FlattenedRows<'a> {
    width: usize,
    outer: serde_json::map::Iter<'a>,
    current: Option<(&'a str, std::slice::Iter<'a, Value>)>,
    done: bool,
}

impl<'a> FlattenedRows<'a> {
    /// Pulls the `data` array out of one top-level sub-object
    fn open_key(key: &'a str, value: &'a Value) -> Result<std::slice::Iter<'a, Value>, FlattenError> {
        let sub: &Map<String, Value> = value.as_object().ok_or_else(|| {
            FlattenError::UnexpectedShape(format!("value under key '{}' is not an object", key))
        })?;
        let data = sub.get("data").ok_or_else(|| {
            FlattenError::UnexpectedShape(format!("key '{}' has no 'data' field", key))
        })?;
        let rows = data.as_array().ok_or_else(|| {
            FlattenError::UnexpectedShape(format!("'data' under key '{}' is not an array", key))
        })?;
        Ok(rows.iter())
    }

    /// Shape-checks one inner row and clones it into a tuple
    fn open_row(&self, key: &str, row: &Value) -> Result<RowTuple, FlattenError> {
        let columns = row.as_array().ok_or_else(|| {
            FlattenError::UnexpectedShape(format!("row under key '{}' is not an array", key))
        })?;
        if columns.len() != self.width {
            return Err(FlattenError::WidthMismatch {
                key: key.to_string(),
                expected: self.width,
                actual: columns.len(),
            });
        }
        Ok(columns.to_vec())
    }
}

impl<'a> Iterator for FlattenedRows<'a> {
    type Item = Result<RowTuple, FlattenError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some((key, inner)) = self.current.as_mut() {
                if let Some(row) = inner.next() {
                    let key = *key;
                    let item = self.open_row(key, row);
                    if item.is_err() {
                        self.done = true;
                    }
                    return Some(item);
                }
                self.current = None;
            }
            match self.outer.next() {
                Some((key, value)) => match Self::open_key(key, value) {
                    Ok(inner) => self.current = Some((key.as_str(), inner)),
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                },
                None => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}
