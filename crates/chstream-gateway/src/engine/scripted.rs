//! In-memory engine that replays a fixed script, for tests

use super::{Engine, EngineConnection};
use crate::connection::ConnectionDescriptor;
use crate::types::{ProgressSnapshot, ResultSet};
use async_trait::async_trait;
use chstream_common::{ChStreamError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One step of the progress sequence
#[derive(Debug, Clone)]
pub enum Step {
    Progress(u64, u64, u64),
    Fail(i32, &'static str),
    /// Never completes; used to hold a pull open while the client goes away
    Hang,
}

/// Counters shared between the engine and the test
#[derive(Debug, Default)]
pub struct Calls {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub result_fetches: AtomicUsize,
    pub last_descriptor: Mutex<Option<ConnectionDescriptor>>,
    pub last_sql: Mutex<Option<String>>,
}

impl Calls {
    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn result_fetches(&self) -> usize {
        self.result_fetches.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    connect_error: Option<(i32, &'static str)>,
    execute_error: Option<(i32, &'static str)>,
    steps: Vec<Step>,
    result: ResultSet,
    pub calls: Arc<Calls>,
}

impl ScriptedEngine {
    pub fn new(steps: Vec<Step>, result: ResultSet) -> Self {
        Self {
            steps,
            result,
            ..Default::default()
        }
    }

    pub fn unreachable() -> Self {
        Self {
            connect_error: Some((210, "Connection refused")),
            ..Default::default()
        }
    }

    pub fn rejecting(code: i32, message: &'static str) -> Self {
        Self {
            execute_error: Some((code, message)),
            ..Default::default()
        }
    }
}

impl Engine for ScriptedEngine {
    fn client(&self, descriptor: &ConnectionDescriptor) -> Box<dyn EngineConnection> {
        *self.calls.last_descriptor.lock().unwrap() = Some(descriptor.clone());
        Box::new(ScriptedConnection {
            engine: self.clone(),
            steps: self.steps.iter().cloned().collect(),
            exhausted: false,
        })
    }
}

struct ScriptedConnection {
    engine: ScriptedEngine,
    steps: VecDeque<Step>,
    exhausted: bool,
}

#[async_trait]
impl EngineConnection for ScriptedConnection {
    async fn connect(&mut self) -> Result<()> {
        self.engine.calls.connects.fetch_add(1, Ordering::SeqCst);
        match self.engine.connect_error {
            Some((_, message)) => Err(ChStreamError::ConnectionFailed(message.into())),
            None => Ok(()),
        }
    }

    async fn execute_with_progress(&mut self, sql: &str) -> Result<()> {
        *self.engine.calls.last_sql.lock().unwrap() = Some(sql.to_string());
        match self.engine.execute_error {
            Some((code, message)) => Err(ChStreamError::execution(code, message)),
            None => Ok(()),
        }
    }

    async fn next_progress(&mut self) -> Option<Result<ProgressSnapshot>> {
        match self.steps.pop_front() {
            Some(Step::Progress(rows, bytes, total)) => Some(Ok(ProgressSnapshot {
                rows_processed: rows,
                bytes_processed: bytes,
                rows_total: total,
            })),
            Some(Step::Fail(code, message)) => Some(Err(ChStreamError::execution(code, message))),
            Some(Step::Hang) => std::future::pending().await,
            None => {
                self.exhausted = true;
                None
            }
        }
    }

    async fn result(&mut self) -> Result<ResultSet> {
        self.engine.calls.result_fetches.fetch_add(1, Ordering::SeqCst);
        if !self.exhausted {
            return Err(ChStreamError::internal("result requested before progress ended"));
        }
        Ok(self.engine.result.clone())
    }

    fn disconnect(&mut self) {
        // Every call is counted so tests can see a double release
        self.engine.calls.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}
