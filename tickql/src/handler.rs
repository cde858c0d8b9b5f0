///
/// # Handlers
///
/// A handler owns one driver connection, one pending queue and at most one
/// worker thread. Every driver call goes through `Shared::driver`, so inline
/// callers and the worker never use the connection concurrently.
///
/// ## Lock order
///
/// A thread holding a statement lock may take the driver lock (streamed row
/// seeks do), never the reverse. `execute_statement` therefore copies what it
/// needs out of the statement, releases it, runs the query under the driver
/// lock, and only then re-locks the statement to publish the outcome.
///
/// ## Teardown
///
/// `close` stops and joins the worker before the connection is released, so
/// an in-flight query always finishes against a live driver. Statements
/// still queued at that point are dropped unexecuted.
///

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::driver::{BackendKind, ConnectParams, Driver, DriverError};
use crate::errors::EngineError;
use crate::ids::{HandlerId, OwnerId};
use crate::lock;
use crate::result_set::{Fetched, ResultSet};
use crate::statement::{ExecutionRequest, SharedStatement, Statement, StatementStatus};
use crate::worker::{self, PendingQueue};

struct Shared {
    id: HandlerId,
    driver: Mutex<Box<dyn Driver>>,
    queue: PendingQueue,
    active: AtomicBool,
    tick: Duration,
}

impl Shared {
    fn driver(&self) -> MutexGuard<'_, Box<dyn Driver>> {
        lock(&self.driver)
    }

    fn execute_statement(&self, stmt: &SharedStatement) {
        let request = {
            let stmt = lock(stmt);
            if stmt.status() != StatementStatus::None {
                return;
            }
            stmt.execution_request()
        };
        debug!(handler_id = %self.id, stmt_id = %request.id, query = %request.text, "executing statement");

        let (result_sets, error) = {
            let mut driver = self.driver();
            if driver.ping() != 0 {
                let error = DriverError::new(driver.last_error_code(), driver.last_error_message());
                (Vec::new(), Some(error))
            } else {
                run_query(&mut **driver, &request)
            }
        };

        if let Some(err) = &error {
            debug!(handler_id = %self.id, stmt_id = %request.id, error = %err, "statement failed");
        }
        lock(stmt).complete(result_sets, error);
    }
}

fn run_query(driver: &mut dyn Driver, request: &ExecutionRequest) -> (Vec<ResultSet>, Option<DriverError>) {
    let mut result_sets = Vec::new();
    let mut next = Some(driver.execute(&request.text));
    while let Some(outcome) = next {
        match outcome {
            Ok(result) => result_sets.push(ResultSet::from_driver(result, request.cached)),
            Err(err) => return (result_sets, Some(err)),
        }
        next = driver.fetch_additional_result();
    }
    (result_sets, None)
}

/// `user@host:port/db`, never the password.
fn endpoint(params: &ConnectParams) -> String {
    format!("{}@{}:{}/{}", params.user, params.host, params.port, params.database)
}

pub struct Handler {
    id: HandlerId,
    kind: BackendKind,
    owner: OwnerId,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Handler {
    /// Connects `driver`. On failure the driver is dropped and nothing is
    /// registered.
    pub fn connect(
        id: HandlerId,
        kind: BackendKind,
        owner: OwnerId,
        mut driver: Box<dyn Driver>,
        params: &ConnectParams,
        settings: &WorkerConfig,
    ) -> Result<Self, EngineError> {
        if let Err(err) = driver.connect(params) {
            warn!(
                kind = %kind,
                endpoint = %endpoint(params),
                error = %err,
                "connection failed"
            );
            return Err(EngineError::ConnectFailed {
                code: err.code,
                message: err.message,
            });
        }
        info!(
            handler_id = %id,
            kind = %kind,
            endpoint = %endpoint(params),
            "connected"
        );
        Ok(Self {
            id,
            kind,
            owner,
            shared: Arc::new(Shared {
                id,
                driver: Mutex::new(driver),
                queue: PendingQueue::new(settings.queue_capacity),
                active: AtomicBool::new(false),
                tick: Duration::from_millis(settings.tick_ms),
            }),
            worker: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn is_worker_running(&self) -> bool {
        lock(&self.worker).is_some()
    }

    pub fn start_worker(&self) -> Result<(), EngineError> {
        let mut slot = lock(&self.worker);
        if slot.is_some() {
            return Ok(());
        }
        self.shared.active.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("tickql-worker-{}", self.id))
            .spawn(move || {
                worker::run(&shared.queue, &shared.active, shared.tick, |stmt| {
                    shared.execute_statement(stmt)
                });
            });
        match spawned {
            Ok(handle) => {
                debug!(handler_id = %self.id, "worker started");
                *slot = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.active.store(false, Ordering::SeqCst);
                Err(EngineError::WorkerSpawn(e))
            }
        }
    }

    /// Blocks until the statement currently executing (if any) finishes.
    pub fn stop_worker(&self) {
        let handle = lock(&self.worker).take();
        let Some(handle) = handle else {
            return;
        };
        self.shared.active.store(false, Ordering::SeqCst);
        self.shared.queue.wake();
        if handle.join().is_err() {
            warn!(handler_id = %self.id, "worker thread panicked");
        }
        debug!(handler_id = %self.id, "worker stopped");
    }

    /// Queues `stmt` for the worker. Never blocks.
    pub fn enqueue(&self, stmt: SharedStatement) -> Result<(), EngineError> {
        self.shared
            .queue
            .push(stmt)
            .map_err(|_| EngineError::QueueFull(self.id))
    }

    /// Runs `stmt` on the calling thread.
    pub fn execute_statement(&self, stmt: &SharedStatement) {
        self.shared.execute_statement(stmt);
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn wait_idle(&self) {
        self.shared.queue.wait_idle(self.shared.tick, &self.shared.active);
    }

    pub fn seek_result(&self, stmt: &mut Statement, index: i64) -> bool {
        stmt.seek_result(index)
    }

    pub fn seek_row(&self, stmt: &mut Statement, row: i64) -> bool {
        let Some(set) = stmt.active_result_mut() else {
            return false;
        };
        if set.is_cached() {
            return set.seek_row(row);
        }
        let _driver = self.shared.driver();
        set.seek_row(row)
    }

    pub fn fetch_field<'a>(&self, stmt: &'a Statement, index: usize) -> Fetched<'a> {
        stmt.active_result()
            .map_or(Fetched::Borrowed(""), |set| set.fetch_field(index))
    }

    pub fn fetch_by_index<'a>(&self, stmt: &'a Statement, index: usize) -> Fetched<'a> {
        stmt.active_result()
            .map_or(Fetched::Borrowed(""), |set| set.fetch_by_index(index))
    }

    pub fn fetch_by_name<'a>(&self, stmt: &'a Statement, name: &str) -> Fetched<'a> {
        stmt.active_result()
            .map_or(Fetched::Borrowed(""), |set| set.fetch_by_name(name))
    }

    pub fn escape(&self, src: &str) -> String {
        self.shared.driver().escape(src)
    }

    pub fn ping(&self) -> i32 {
        self.shared.driver().ping()
    }

    pub fn server_stats(&self) -> String {
        self.shared.driver().server_stats()
    }

    pub fn charset(&self) -> String {
        self.shared.driver().charset()
    }

    pub fn set_charset(&self, charset: &str) -> bool {
        self.shared.driver().set_charset(charset)
    }

    /// Stops the worker, drops queued statements and releases the
    /// connection. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_worker();
        let dropped = self.shared.queue.clear();
        if dropped > 0 {
            warn!(handler_id = %self.id, dropped, "pending statements dropped on close");
        }
        self.shared.driver().disconnect();
        info!(handler_id = %self.id, "disconnected");
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        self.close();
    }
}
