//! Per-request stream driver
//!
//! Runs one query from connection to terminal event:
//!
//! ```text
//! INIT ─▶ STREAMING_PROGRESS ─▶ EMITTING_RESULT ───────▶ CLOSED
//!   └──────────────┴──────────▶ EMITTING_ERROR_RESULT ─▶ CLOSED
//! ```
//!
//! Encoded records go into a bounded channel that the response body drains.
//! A closed channel means the client went away: the driver stops without a
//! terminal event and the connection is released.

use crate::connection::ConnectionDescriptor;
use crate::engine::Engine;
use crate::event::{self, EventPayload, ExecutionStats, ProgressPayload, ResultPayload};
use crate::executor::QueryExecution;
use bytes::Bytes;
use chstream_common::{ChStreamError, ExecutionError};
use std::future::Future;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Init,
    StreamingProgress,
    EmittingResult,
    EmittingErrorResult,
    Closed,
}

/// How a stream ended
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    /// Result delivered
    Completed { events: u64, rows: u64 },
    /// Error delivered as the terminal event
    Failed { events: u64, error: ExecutionError },
    /// Client stopped reading before the terminal event
    ClientDisconnected { events: u64 },
    /// An event could not be encoded
    Aborted { events: u64 },
}

impl StreamOutcome {
    /// Events written to the client
    pub fn events(&self) -> u64 {
        match self {
            StreamOutcome::Completed { events, .. }
            | StreamOutcome::Failed { events, .. }
            | StreamOutcome::ClientDisconnected { events }
            | StreamOutcome::Aborted { events } => *events,
        }
    }
}

/// Reason the driver cannot write any more events
enum Halt {
    ClientGone,
    Encoding(ChStreamError),
}

struct StreamEmitter {
    sink: mpsc::Sender<Bytes>,
    next_id: u64,
    state: StreamState,
}

impl StreamEmitter {
    fn new(sink: mpsc::Sender<Bytes>) -> Self {
        Self {
            sink,
            next_id: 0,
            state: StreamState::Init,
        }
    }

    fn transition(&mut self, next: StreamState) {
        debug!(from = ?self.state, to = ?next, "Stream state change");
        self.state = next;
    }

    async fn emit(&mut self, payload: EventPayload) -> Result<(), Halt> {
        let record = event::encode(self.next_id, &payload).map_err(Halt::Encoding)?;
        self.sink.send(record).await.map_err(|_| Halt::ClientGone)?;
        self.next_id += 1;
        Ok(())
    }

    /// Await `fut` unless the client disconnects first
    async fn unless_client_leaves<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.sink.closed() => None,
            output = fut => Some(output),
        }
    }

    fn halted(&self, halt: Halt) -> StreamOutcome {
        match halt {
            Halt::ClientGone => self.client_gone(),
            Halt::Encoding(err) => {
                error!(error = %err, state = ?self.state, "Failed to encode event, aborting stream");
                StreamOutcome::Aborted {
                    events: self.next_id,
                }
            }
        }
    }

    fn client_gone(&self) -> StreamOutcome {
        info!(events = self.next_id, state = ?self.state, "Client disconnected mid-stream");
        StreamOutcome::ClientDisconnected {
            events: self.next_id,
        }
    }

    async fn fail(&mut self, err: ChStreamError) -> StreamOutcome {
        self.transition(StreamState::EmittingErrorResult);
        warn!(kind = err.kind(), code = err.code(), error = %err, "Query failed");
        let error = ExecutionError::from(&err);
        match self
            .emit(EventPayload::Result(ResultPayload::failure(error.clone())))
            .await
        {
            Ok(()) => StreamOutcome::Failed {
                events: self.next_id,
                error,
            },
            Err(halt) => self.halted(halt),
        }
    }

    async fn drive(
        &mut self,
        execution: &mut QueryExecution,
        sql: &str,
        started: Instant,
    ) -> StreamOutcome {
        match self.unless_client_leaves(execution.begin(sql)).await {
            None => return self.client_gone(),
            Some(Err(err)) => return self.fail(err).await,
            Some(Ok(())) => {}
        }

        self.transition(StreamState::StreamingProgress);
        loop {
            let Some(next) = self.unless_client_leaves(execution.next_progress()).await else {
                return self.client_gone();
            };
            match next {
                Some(Ok(snapshot)) => {
                    let payload = EventPayload::Progress(ProgressPayload::from(&snapshot));
                    if let Err(halt) = self.emit(payload).await {
                        return self.halted(halt);
                    }
                }
                Some(Err(err)) => return self.fail(err).await,
                None => break,
            }
        }

        self.transition(StreamState::EmittingResult);
        let result = match self.unless_client_leaves(execution.result()).await {
            None => return self.client_gone(),
            Some(Err(err)) => return self.fail(err).await,
            Some(Ok(result)) => result,
        };
        let stats = ExecutionStats {
            row_count: result.rows.len() as u64,
            byte_count: execution.last_bytes(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        let rows = stats.row_count;
        let duration_ms = stats.duration_ms;

        match self
            .emit(EventPayload::Result(ResultPayload::success(result, stats)))
            .await
        {
            Ok(()) => {
                info!(
                    events = self.next_id,
                    rows,
                    progress_updates = execution.snapshots(),
                    duration_ms,
                    "Query completed"
                );
                StreamOutcome::Completed {
                    events: self.next_id,
                    rows,
                }
            }
            Err(halt) => self.halted(halt),
        }
    }
}

/// Execute `sql` against the engine and stream events into `sink`.
///
/// The engine connection is released exactly once before this returns,
/// whichever way the stream ends.
#[instrument(skip_all, fields(host = %descriptor.host, port = descriptor.port, database = %descriptor.database))]
pub async fn run(
    engine: &dyn Engine,
    descriptor: &ConnectionDescriptor,
    sql: &str,
    sink: mpsc::Sender<Bytes>,
) -> StreamOutcome {
    let started = Instant::now();
    let mut emitter = StreamEmitter::new(sink);
    let mut execution = QueryExecution::new(engine.client(descriptor));

    let outcome = emitter.drive(&mut execution, sql, started).await;

    execution.close();
    emitter.transition(StreamState::Closed);
    outcome
}
