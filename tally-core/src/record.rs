//! Units of work flowing through the pipeline.
//!
//! A `Record` comes from the source. Everything derived from it carries the record's
//! `DeliveryHandle`, so the ack for the record can be correlated once all derived work is
//! done.
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique delivery handle of a `Record`, assigned by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryHandle(pub u64);

impl fmt::Display for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Raw unit of work from the source. The payload is opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub handle: DeliveryHandle,
    pub payload: Vec<u8>,
}

impl Record {
    pub fn new(handle: DeliveryHandle, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            handle,
            payload: payload.into(),
        }
    }
}

/// Normalized token. `value` is the grouping key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub handle: DeliveryHandle,
}

impl Token {
    pub fn new(value: impl Into<String>, handle: DeliveryHandle) -> Self {
        Self {
            value: value.into(),
            handle,
        }
    }
}

/// Updated count of one key, emitted by an aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountEntry {
    pub key: String,
    pub count: u64,
    pub handle: DeliveryHandle,
}

/// One row of the sink store: a row key and named string fields under one family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub key: String,
    pub family: String,
    pub fields: Vec<(String, String)>,
}

impl Row {
    pub fn new(key: impl Into<String>, family: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            family: family.into(),
            fields: Vec::new(),
        }
    }

    /// Row holding a single `count` field.
    pub fn count(key: impl Into<String>, family: impl Into<String>, count: u64) -> Self {
        Self::new(key, family).with_field("count", count.to_string())
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push_field(name, value);
        self
    }

    pub fn push_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Entry handed to a sink writer: the row to persist and the record it derives from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteEntry {
    pub row: Row,
    pub handle: DeliveryHandle,
}

impl WriteEntry {
    pub fn new(row: Row, handle: DeliveryHandle) -> Self {
        Self { row, handle }
    }

    pub fn from_count(entry: CountEntry, family: &str) -> Self {
        Self {
            row: Row::count(entry.key, family, entry.count),
            handle: entry.handle,
        }
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.row.key
    }
}

/// Anything that can be routed by key.
pub trait Keyed {
    fn routing_key(&self) -> &str;

    fn handle(&self) -> DeliveryHandle;
}

impl Keyed for Token {
    #[inline]
    fn routing_key(&self) -> &str {
        &self.value
    }

    #[inline]
    fn handle(&self) -> DeliveryHandle {
        self.handle
    }
}

impl Keyed for WriteEntry {
    #[inline]
    fn routing_key(&self) -> &str {
        &self.row.key
    }

    #[inline]
    fn handle(&self) -> DeliveryHandle {
        self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_row() {
        let entry = CountEntry {
            key: "the".to_string(),
            count: 3,
            handle: DeliveryHandle(7),
        };

        let write = WriteEntry::from_count(entry, "wc");

        assert_eq!(write.key(), "the");
        assert_eq!(write.row.family, "wc");
        assert_eq!(write.row.field("count"), Some("3"));
        assert_eq!(write.handle, DeliveryHandle(7));
    }

    #[test]
    fn test_row_fields_keep_order() {
        let row = Row::new("sf:123", "info")
            .with_field("mailType", "1")
            .with_field("weight", "2.5");

        let names: Vec<&str> = row.fields.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["mailType", "weight"]);
        assert_eq!(row.field("missing"), None);
    }
}
