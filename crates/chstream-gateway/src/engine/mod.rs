//! Data engine client abstraction
//!
//! The gateway talks to the engine through [`Engine`] and [`EngineConnection`].
//! A connection is created without I/O, then driven through
//! `connect` → `execute_with_progress` → `next_progress`* → `result`, and
//! finally `disconnect`, which must be idempotent.

pub mod clickhouse;
#[cfg(test)]
pub mod scripted;

use crate::connection::ConnectionDescriptor;
use crate::types::{ProgressSnapshot, ResultSet};
use async_trait::async_trait;
use chstream_common::Result;

pub use clickhouse::{ClickHouseHttpEngine, HttpEngineSettings};

/// Factory for per-request engine connections
pub trait Engine: Send + Sync {
    /// Build an unconnected client for one request
    fn client(&self, descriptor: &ConnectionDescriptor) -> Box<dyn EngineConnection>;
}

/// One request's connection to the engine
#[async_trait]
pub trait EngineConnection: Send {
    /// Establish the connection; fails if the engine is unreachable
    async fn connect(&mut self) -> Result<()>;

    /// Submit a query for progressive execution
    async fn execute_with_progress(&mut self, sql: &str) -> Result<()>;

    /// Next progress snapshot, or `None` once execution has finished
    async fn next_progress(&mut self) -> Option<Result<ProgressSnapshot>>;

    /// Final rows and columns; only valid after `next_progress` returned `None`
    async fn result(&mut self) -> Result<ResultSet>;

    /// Release every held resource. Calling it again has no effect.
    fn disconnect(&mut self);
}
