//! Server-Sent Events encoding
//!
//! Every record has the same shape:
//!
//! ```text
//! retry: 10000
//! id: <event id>
//! event: <kind>
//! data: <JSON payload>
//!
//! ```

use crate::types::{Column, ProgressSnapshot, ResultSet, Row};
use bytes::Bytes;
use chstream_common::{ExecutionError, Result};
use serde::Serialize;
use std::fmt;

/// Client reconnect hint in milliseconds
pub const RETRY_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Progress,
    Result,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Progress => "progress",
            EventKind::Result => "result",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `progress` event; the byte count is kept back for the final stats
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressPayload {
    pub rows_processed: u64,
    pub rows_total: u64,
}

impl From<&ProgressSnapshot> for ProgressPayload {
    fn from(snapshot: &ProgressSnapshot) -> Self {
        Self {
            rows_processed: snapshot.rows_processed,
            rows_total: snapshot.rows_total,
        }
    }
}

/// Statistics attached to a successful result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionStats {
    #[serde(rename = "rows")]
    pub row_count: u64,
    #[serde(rename = "bytes")]
    pub byte_count: u64,
    pub duration_ms: u64,
}

/// Payload of the terminal `result` event.
///
/// Built only through [`ResultPayload::success`] and [`ResultPayload::failure`],
/// so an error never travels together with rows or stats.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultPayload {
    rows: Vec<Row>,
    columns: Vec<Column>,
    error: Option<ExecutionError>,
    stats: Option<ExecutionStats>,
}

impl ResultPayload {
    pub fn success(result: ResultSet, stats: ExecutionStats) -> Self {
        Self {
            rows: result.rows,
            columns: result.columns,
            error: None,
            stats: Some(stats),
        }
    }

    pub fn failure(error: ExecutionError) -> Self {
        Self {
            rows: Vec::new(),
            columns: Vec::new(),
            error: Some(error),
            stats: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Progress(ProgressPayload),
    Result(ResultPayload),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Progress(_) => EventKind::Progress,
            EventPayload::Result(_) => EventKind::Result,
        }
    }
}

/// Encode one event record
pub fn encode(id: u64, payload: &EventPayload) -> Result<Bytes> {
    let data = match payload {
        EventPayload::Progress(progress) => serde_json::to_string(progress)?,
        EventPayload::Result(result) => serde_json::to_string(result)?,
    };
    Ok(Bytes::from(format!(
        "retry: {}\nid: {}\nevent: {}\ndata: {}\n\n",
        RETRY_MS,
        id,
        payload.kind(),
        data
    )))
}
