//! Query execution on a single engine connection
//!
//! [`QueryExecution`] owns the request's connection through a [`ConnectionGuard`],
//! so the connection is released exactly once whether the query completes,
//! fails, or the execution is simply dropped because the client went away.

use crate::engine::EngineConnection;
use crate::types::{ProgressSnapshot, ResultSet};
use chstream_common::{ChStreamError, Result};
use tracing::debug;

/// Releases the wrapped connection on drop unless already released
pub struct ConnectionGuard {
    connection: Option<Box<dyn EngineConnection>>,
}

impl ConnectionGuard {
    pub fn new(connection: Box<dyn EngineConnection>) -> Self {
        Self {
            connection: Some(connection),
        }
    }

    fn get(&mut self) -> Result<&mut (dyn EngineConnection + 'static)> {
        self.connection
            .as_deref_mut()
            .ok_or_else(|| ChStreamError::internal("engine connection already released"))
    }

    /// Disconnect now; later calls and the eventual drop do nothing
    pub fn release(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.disconnect();
            debug!("Engine connection released");
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Lazy progress sequence plus deferred result for one query
pub struct QueryExecution {
    guard: ConnectionGuard,
    last_bytes: u64,
    snapshots: u64,
    exhausted: bool,
}

impl QueryExecution {
    /// Take ownership of an unconnected engine client
    pub fn new(connection: Box<dyn EngineConnection>) -> Self {
        Self {
            guard: ConnectionGuard::new(connection),
            last_bytes: 0,
            snapshots: 0,
            exhausted: false,
        }
    }

    /// Connect and submit the query
    pub async fn begin(&mut self, sql: &str) -> Result<()> {
        let connection = self.guard.get()?;
        connection.connect().await?;
        connection.execute_with_progress(sql).await
    }

    /// Pull the next snapshot; `None` once the engine has finished
    pub async fn next_progress(&mut self) -> Option<Result<ProgressSnapshot>> {
        if self.exhausted {
            return None;
        }
        let connection = match self.guard.get() {
            Ok(connection) => connection,
            Err(err) => return Some(Err(err)),
        };
        match connection.next_progress().await {
            Some(Ok(snapshot)) => {
                self.last_bytes = snapshot.bytes_processed;
                self.snapshots += 1;
                Some(Ok(snapshot))
            }
            Some(Err(err)) => Some(Err(err)),
            None => {
                self.exhausted = true;
                None
            }
        }
    }

    /// Final result; only available after the progress sequence is exhausted
    pub async fn result(&mut self) -> Result<ResultSet> {
        if !self.exhausted {
            return Err(ChStreamError::internal(
                "result requested before progress was exhausted",
            ));
        }
        self.guard.get()?.result().await
    }

    /// Byte count from the most recent snapshot, 0 if there was none
    pub fn last_bytes(&self) -> u64 {
        self.last_bytes
    }

    /// Number of snapshots pulled so far
    pub fn snapshots(&self) -> u64 {
        self.snapshots
    }

    /// Release the connection
    pub fn close(mut self) {
        self.guard.release();
    }
}
