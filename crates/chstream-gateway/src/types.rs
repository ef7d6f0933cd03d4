//! Values exchanged between the engine client, the executor and the encoder

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

/// Counters reported by the engine while a query runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub rows_processed: u64,
    pub bytes_processed: u64,
    pub rows_total: u64,
}

/// Column name and engine type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

impl Column {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// A single value in a result row.
///
/// Serializes to plain JSON; dates and date-times become ISO-8601 strings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Array(Vec<Cell>),
    /// Tuples, maps and other composite values the engine already encodes as JSON
    Json(serde_json::Value),
}

pub type Row = Vec<Cell>;

/// Final rows and columns of a query
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultSet {
    pub rows: Vec<Row>,
    pub columns: Vec<Column>,
}
