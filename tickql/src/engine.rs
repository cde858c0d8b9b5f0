///
/// # Engine
///
/// The dispatcher in front of the handle tables. Every operation validates
/// its handles first and fails with `UnknownHandler` / `UnknownStatement`
/// without touching any state when they are stale.
///
/// ## Re-entrancy
///
/// Host callbacks receive `&Engine` and may call back into it, including
/// freeing the very statement being reported. The registry lock is only
/// held to look entries up or remove them; handler and statement `Arc`s are
/// cloned out and the lock is released before any driver call, worker join
/// or host callback.
///
/// ## Statement lifetime
///
/// | Path                       | Ends when                                    |
/// |----------------------------|----------------------------------------------|
/// | threaded                   | reconciliation pass after its callback       |
/// | inline                     | `free_result`                                |
/// | stored (`store_result`)    | `free_result`                                |
/// | any, handler gone          | next reconciliation pass                     |
///

use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::driver::{BackendKind, ConnectParams, DriverRegistry};
use crate::errors::EngineError;
use crate::format::ArgFormat;
use crate::handler::Handler;
use crate::ids::{HandlerId, OwnerId, StatementId};
use crate::lock;
use crate::logging::{LogLevel, LogLevels};
use crate::marshal::{self, CallbackHost};
use crate::registry::{Registry, StatementEntry};
use crate::result_set::{Fetched, ResultSet};
use crate::statement::{SharedStatement, Statement, StatementFlags, StatementStatus};
use crate::value::Value;

/// One query submission, as the host describes it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub owner: OwnerId,
    pub handler_id: HandlerId,
    pub text: String,
    pub flags: StatementFlags,
    pub callback: String,
    pub format: String,
    pub params: Vec<Value>,
}

impl QueryRequest {
    pub fn new(owner: OwnerId, handler_id: HandlerId, text: impl Into<String>) -> Self {
        Self {
            owner,
            handler_id,
            text: text.into(),
            flags: StatementFlags::NONE,
            callback: String::new(),
            format: String::new(),
            params: Vec::new(),
        }
    }

    pub fn flags(mut self, flags: StatementFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn callback(mut self, name: impl Into<String>, format: impl Into<String>) -> Self {
        self.callback = name.into();
        self.format = format.into();
        self
    }

    pub fn param(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }
}

/// Borrowed view of an executed statement and its handler.
///
/// Values fetched through `&self` borrow from the cursor, so the borrow
/// checker rules out moving the cursor while a borrowed value is alive.
pub struct Cursor<'a> {
    handler: &'a Handler,
    stmt: &'a mut Statement,
}

impl<'a> Cursor<'a> {
    pub fn result(&self) -> Option<&ResultSet> {
        self.stmt.active_result()
    }

    pub fn seek_result(&mut self, index: i64) -> bool {
        self.handler.seek_result(self.stmt, index)
    }

    pub fn seek_row(&mut self, row: i64) -> bool {
        self.handler.seek_row(self.stmt, row)
    }

    pub fn fetch_field(&self, index: usize) -> Fetched<'_> {
        self.handler.fetch_field(self.stmt, index)
    }

    pub fn fetch_by_index(&self, index: usize) -> Fetched<'_> {
        self.handler.fetch_by_index(self.stmt, index)
    }

    pub fn fetch_by_name(&self, name: &str) -> Fetched<'_> {
        self.handler.fetch_by_name(self.stmt, name)
    }

    pub fn num_rows(&self) -> usize {
        self.result().map_or(0, ResultSet::num_rows)
    }

    pub fn num_fields(&self) -> usize {
        self.result().map_or(0, ResultSet::num_fields)
    }
}

pub struct Engine {
    config: EngineConfig,
    drivers: DriverRegistry,
    registry: Mutex<Registry>,
    log_levels: Option<LogLevels>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_drivers(config, DriverRegistry::default())
    }

    pub fn with_drivers(config: EngineConfig, drivers: DriverRegistry) -> Self {
        Self {
            config,
            drivers,
            registry: Mutex::new(Registry::new()),
            log_levels: None,
        }
    }

    /// Attaches the sink thresholds returned by `init_logging` so
    /// `set_log_levels` can retune them.
    pub fn with_log_levels(mut self, levels: LogLevels) -> Self {
        self.log_levels = Some(levels);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn set_log_levels(&self, file: LogLevel, console: LogLevel) -> bool {
        let Some(levels) = &self.log_levels else {
            return false;
        };
        levels.set(file, console);
        warn!(file = ?file, console = ?console, "switching log levels");
        true
    }

    pub fn handler_count(&self) -> usize {
        lock(&self.registry).handler_count()
    }

    pub fn is_valid_handler(&self, id: HandlerId) -> bool {
        lock(&self.registry).is_valid_handler(id)
    }

    pub fn statement_count(&self) -> usize {
        lock(&self.registry).statement_count()
    }

    fn handler(&self, id: HandlerId) -> Result<Arc<Handler>, EngineError> {
        lock(&self.registry)
            .handler(id)
            .ok_or(EngineError::UnknownHandler(id))
    }

    fn entry(&self, id: StatementId) -> Result<StatementEntry, EngineError> {
        lock(&self.registry)
            .statement(id)
            .ok_or(EngineError::UnknownStatement(id))
    }

    /// Looks up an executed statement together with its (still live)
    /// handler.
    fn executed(&self, id: StatementId) -> Result<(Arc<Handler>, SharedStatement), EngineError> {
        let (entry, handler) = {
            let registry = lock(&self.registry);
            let entry = registry
                .statement(id)
                .ok_or(EngineError::UnknownStatement(id))?;
            let handler = registry
                .handler(entry.handler_id)
                .ok_or(EngineError::UnknownHandler(entry.handler_id))?;
            (entry, handler)
        };
        if lock(&entry.stmt).status() == StatementStatus::None {
            return Err(EngineError::NotExecuted(id));
        }
        Ok((handler, entry.stmt))
    }

    // Handlers

    pub fn connect(
        &self,
        owner: OwnerId,
        kind: BackendKind,
        params: &ConnectParams,
    ) -> Result<HandlerId, EngineError> {
        let Some(driver) = self.drivers.create(kind) else {
            error!(kind = %kind, "unknown SQL backend");
            return Err(EngineError::UnknownBackend(kind));
        };
        let id = lock(&self.registry).next_handler_id();
        let handler = Handler::connect(id, kind, owner, driver, params, &self.config.worker)?;
        handler.start_worker()?;
        debug!(handler_id = %id, kind = %handler.kind(), owner = %owner, "handler connected");
        lock(&self.registry).insert_handler(Arc::new(handler));
        Ok(id)
    }

    /// Stops the worker and closes the connection. Statements of this
    /// handler are reclaimed by the next reconciliation pass.
    pub fn disconnect(&self, id: HandlerId) -> Result<(), EngineError> {
        let handler = lock(&self.registry)
            .remove_handler(id)
            .ok_or(EngineError::UnknownHandler(id))?;
        handler.close();
        Ok(())
    }

    /// Blocks until the handler's queue is drained.
    pub fn wait(&self, id: HandlerId) -> Result<(), EngineError> {
        self.handler(id)?.wait_idle();
        Ok(())
    }

    pub fn ping(&self, id: HandlerId) -> Result<i32, EngineError> {
        Ok(self.handler(id)?.ping())
    }

    pub fn server_stats(&self, id: HandlerId) -> Result<String, EngineError> {
        Ok(self.handler(id)?.server_stats())
    }

    pub fn charset(&self, id: HandlerId) -> Result<String, EngineError> {
        Ok(self.handler(id)?.charset())
    }

    pub fn set_charset(&self, id: HandlerId, charset: &str) -> Result<(), EngineError> {
        let handler = self.handler(id)?;
        info!(handler_id = %id, charset, "setting charset");
        if handler.set_charset(charset) {
            Ok(())
        } else {
            Err(EngineError::CharsetRejected(charset.to_string()))
        }
    }

    pub fn escape(&self, id: HandlerId, src: &str) -> Result<String, EngineError> {
        Ok(self.handler(id)?.escape(src))
    }

    // Statements

    /// Creates a statement and either queues it (`THREADED`) or runs it
    /// before returning. An inline statement reports to its callback, or to
    /// the error handler on failure, through `host` before this returns.
    pub fn submit(
        &self,
        request: QueryRequest,
        host: &mut dyn CallbackHost,
    ) -> Result<StatementId, EngineError> {
        let handler = match self.handler(request.handler_id) {
            Ok(handler) => handler,
            Err(err) => {
                warn!(handler_id = %request.handler_id, "query on invalid handler");
                return Err(err);
            }
        };
        let format = ArgFormat::parse(&request.format);
        let bound = format.bind(request.params, self.config.callbacks.unknown_specifier)?;

        let mut registry = lock(&self.registry);
        let id = registry.next_statement_id();
        let stmt: SharedStatement = Arc::new(Mutex::new(Statement::new(
            id,
            request.owner,
            request.handler_id,
            request.text,
            request.flags,
            request.callback,
            format,
            bound,
        )));
        registry.insert_statement(
            id,
            StatementEntry {
                stmt: Arc::clone(&stmt),
                owner: request.owner,
                handler_id: request.handler_id,
            },
        );
        drop(registry);

        if request.flags.contains(StatementFlags::THREADED) {
            if let Err(err) = handler.enqueue(stmt) {
                lock(&self.registry).remove_statement(id);
                warn!(stmt_id = %id, error = %err, "statement rejected");
                return Err(err);
            }
            debug!(
                stmt_id = %id,
                handler_id = %request.handler_id,
                pending = handler.pending(),
                "statement queued"
            );
            return Ok(id);
        }

        handler.execute_statement(&stmt);
        let invocation = {
            let stmt = lock(&stmt);
            (!stmt.callback.is_empty() || stmt.error() != 0)
                .then(|| marshal::build_invocation(&stmt, &self.config.callbacks.error_handler))
        };
        match invocation {
            Some(invocation) => {
                marshal::dispatch(self, host, invocation);
            }
            None => debug!(stmt_id = %id, "statement executed without callback"),
        }
        Ok(id)
    }

    pub fn free_result(&self, id: StatementId) -> Result<(), EngineError> {
        let entry = self.entry(id)?;
        if lock(&entry.stmt).status() == StatementStatus::None {
            return Err(EngineError::NotExecuted(id));
        }
        debug!(stmt_id = %id, "freeing statement");
        lock(&self.registry).remove_statement(id);
        Ok(())
    }

    /// Keeps a threaded statement alive past its callback until an explicit
    /// `free_result`. A no-op for statements that were never threaded.
    pub fn store_result(&self, id: StatementId) -> Result<(), EngineError> {
        let entry = self.entry(id)?;
        let mut stmt = lock(&entry.stmt);
        if stmt.status() == StatementStatus::None {
            return Err(EngineError::NotExecuted(id));
        }
        if !stmt.is_threaded() {
            debug!(stmt_id = %id, "statement is not threaded, nothing to store");
            return Ok(());
        }
        debug!(stmt_id = %id, "storing statement");
        stmt.store();
        Ok(())
    }

    pub fn status(&self, id: StatementId) -> Result<StatementStatus, EngineError> {
        Ok(lock(&self.entry(id)?.stmt).status())
    }

    fn with_executed<T>(&self, id: StatementId, f: impl FnOnce(&Statement) -> T) -> Result<T, EngineError> {
        let entry = self.entry(id)?;
        let stmt = lock(&entry.stmt);
        if stmt.status() == StatementStatus::None {
            return Err(EngineError::NotExecuted(id));
        }
        Ok(f(&stmt))
    }

    pub fn error(&self, id: StatementId) -> Result<i32, EngineError> {
        self.with_executed(id, Statement::error)
    }

    pub fn error_message(&self, id: StatementId) -> Result<String, EngineError> {
        self.with_executed(id, |stmt| stmt.error_message().to_string())
    }

    pub fn insert_id(&self, id: StatementId) -> Result<i64, EngineError> {
        self.with_executed(id, |stmt| stmt.active_result().map_or(0, ResultSet::insert_id))
    }

    pub fn affected_rows(&self, id: StatementId) -> Result<i64, EngineError> {
        self.with_executed(id, |stmt| stmt.active_result().map_or(0, ResultSet::affected_rows))
    }

    pub fn num_rows(&self, id: StatementId) -> Result<usize, EngineError> {
        self.with_executed(id, |stmt| stmt.active_result().map_or(0, ResultSet::num_rows))
    }

    pub fn num_fields(&self, id: StatementId) -> Result<usize, EngineError> {
        self.with_executed(id, |stmt| stmt.active_result().map_or(0, ResultSet::num_fields))
    }

    // Cursors

    /// Runs `f` against the statement's cursor. The statement stays locked
    /// for the duration of `f`; do not call back into the engine for the
    /// same statement from inside it.
    pub fn with_cursor<T>(&self, id: StatementId, f: impl FnOnce(&mut Cursor<'_>) -> T) -> Result<T, EngineError> {
        let (handler, stmt) = self.executed(id)?;
        let mut stmt = lock(&stmt);
        let mut cursor = Cursor {
            handler: &handler,
            stmt: &mut stmt,
        };
        Ok(f(&mut cursor))
    }

    pub fn seek_result(&self, id: StatementId, index: i64) -> Result<(), EngineError> {
        debug!(stmt_id = %id, index, "seeking result");
        if self.with_cursor(id, |cursor| cursor.seek_result(index))? {
            Ok(())
        } else {
            Err(EngineError::OutOfRange { index })
        }
    }

    pub fn seek_row(&self, id: StatementId, row: i64) -> Result<(), EngineError> {
        debug!(stmt_id = %id, row, "seeking row");
        if self.with_cursor(id, |cursor| cursor.seek_row(row))? {
            Ok(())
        } else {
            Err(EngineError::OutOfRange { index: row })
        }
    }

    pub fn fetch_field(&self, id: StatementId, index: usize) -> Result<String, EngineError> {
        self.with_cursor(id, |cursor| cursor.fetch_field(index).into_owned())
    }

    pub fn fetch_by_index(&self, id: StatementId, index: usize) -> Result<String, EngineError> {
        self.with_cursor(id, |cursor| cursor.fetch_by_index(index).into_owned())
    }

    pub fn fetch_by_name(&self, id: StatementId, name: &str) -> Result<String, EngineError> {
        self.with_cursor(id, |cursor| cursor.fetch_by_name(name).into_owned())
    }

    // Lifecycle

    /// Fires callbacks for threaded statements the workers have finished
    /// and reclaims statements that are done. Returns the number of
    /// callbacks attempted.
    pub fn process_tick(&self, host: &mut dyn CallbackHost) -> usize {
        let snapshot = lock(&self.registry).statements();
        let mut fired = 0;

        for (id, entry) in snapshot {
            if !lock(&self.registry).contains_statement(id) {
                continue;
            }

            let invocation = {
                let mut stmt = lock(&entry.stmt);
                if stmt.is_threaded() && stmt.advance(StatementStatus::Processed) {
                    Some(marshal::build_invocation(&stmt, &self.config.callbacks.error_handler))
                } else {
                    None
                }
            };
            if let Some(invocation) = invocation {
                debug!(stmt_id = %id, error = lock(&entry.stmt).error(), "reporting statement");
                fired += 1;
                marshal::dispatch(self, host, invocation);
            }

            let mut registry = lock(&self.registry);
            if !registry.contains_statement(id) {
                continue;
            }
            let orphaned = !registry.is_valid_handler(entry.handler_id);
            let finished = {
                let stmt = lock(&entry.stmt);
                stmt.status() == StatementStatus::Processed && !stmt.is_stored()
            };
            if orphaned || finished {
                debug!(stmt_id = %id, orphaned, "erasing statement");
                registry.remove_statement(id);
            }
        }
        fired
    }

    /// Tears down everything `owner` created: handlers are stopped and
    /// closed, their statements dropped.
    pub fn release_owner(&self, owner: OwnerId) {
        let (handlers, statements) = lock(&self.registry).remove_owned_by(owner);
        if !handlers.is_empty() || !statements.is_empty() {
            info!(
                owner = %owner,
                handlers = handlers.len(),
                statements = statements.len(),
                "releasing owner"
            );
        }
        for handler in handlers {
            handler.close();
        }
    }

    pub fn shutdown(&self) {
        let (handlers, _statements) = lock(&self.registry).drain();
        for handler in handlers {
            handler.close();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
