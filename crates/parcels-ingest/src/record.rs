//! Parsed record types
//!
//! A [`Header`] is derived once from a file's first row; every [`Record`]
//! from that file carries values aligned positionally to it. Column names are
//! trimmed and lowercased once at the header so the same canonical identity
//! is used end-to-end (the staging store is case-sensitive about columns).

use serde_json::Value;
use std::sync::Arc;

/// JSON object payload for one staged row, keyed by normalized column name
pub type JsonMap = serde_json::Map<String, Value>;

/// Normalized column names for one source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    columns: Vec<String>,
}

impl Header {
    /// Build a header from raw first-row tokens, trimming and lowercasing
    /// each column name
    pub fn from_raw<I, S>(raw: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let columns = raw
            .into_iter()
            .map(|c| c.as_ref().trim().to_lowercase())
            .collect();
        Self { columns }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// One parsed data row: nullable values aligned to the file's [`Header`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    values: Vec<Option<String>>,
}

impl Record {
    /// Build a record from raw field values. Empty fields (including
    /// empty-quoted `""`) become `None` so "no data" is stored consistently.
    pub fn from_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let values = fields
            .into_iter()
            .map(|f| {
                let f = f.as_ref();
                if f.is_empty() {
                    None
                } else {
                    Some(f.to_string())
                }
            })
            .collect();
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Option<String>] {
        &self.values
    }

    /// Convert to a JSON object keyed by the header's normalized column
    /// names, with explicit nulls for absent values
    pub fn to_json(&self, header: &Arc<Header>) -> JsonMap {
        header
            .columns()
            .iter()
            .zip(self.values.iter())
            .map(|(name, value)| {
                let json = match value {
                    Some(v) => Value::String(v.clone()),
                    None => Value::Null,
                };
                (name.clone(), json)
            })
            .collect()
    }
}
