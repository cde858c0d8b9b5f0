///
/// # tickql - Asynchronous SQL execution engine for embedded scripting hosts
///
/// A single-threaded host (a game server's script VM, a plugin runtime)
/// submits SQL through integer handles. Each connection (handler) runs its
/// queued statements on a dedicated worker thread; the host calls
/// `Engine::process_tick` once per frame to fire callbacks for whatever
/// finished and to reclaim completed statements.
///
/// ## Library Usage
///
/// ```rust,ignore
/// use tickql::{BackendKind, ConnectParams, Engine, EngineConfig, OwnerId, QueryRequest, StatementFlags};
///
/// let engine = Engine::new(EngineConfig::default());
/// let owner = OwnerId(1);
/// let db = engine.connect(owner, BackendKind::SQLITE, &ConnectParams::default())?;
///
/// let request = QueryRequest::new(owner, db, "SELECT name FROM users")
///     .flags(StatementFlags::THREADED)
///     .callback("OnUsersLoaded", "r");
/// engine.submit(request, &mut host)?;
///
/// // once per host tick
/// engine.process_tick(&mut host);
/// ```
///
/// Hosts that speak in sentinel values rather than `Result` use the
/// functions in `natives`, which mirror the scripting API one to one.
///

pub mod config;
pub mod driver;
pub mod engine;
pub mod errors;
pub mod format;
pub mod handler;
pub mod ids;
pub mod logging;
pub mod marshal;
pub mod natives;
pub mod registry;
pub mod result_set;
pub mod statement;
pub mod value;
pub mod worker;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::{CallbackConfig, EngineConfig, LoggingConfig, WorkerConfig};
pub use driver::{BackendKind, ConnectParams, Driver, DriverRegistry, DriverResult, RowCursor};
pub use engine::{Cursor, Engine, QueryRequest};
pub use errors::{ConfigError, DriverError, EngineError, FormatError, LoggingError};
pub use format::{ArgFormat, UnknownSpecifierPolicy};
pub use ids::{Cell, HandlerId, OwnerId, StatementId};
pub use logging::{init_logging, LogLevel, LogLevels};
pub use marshal::{Arg, CallFrame, CallbackHost, NoCallbacks, PublicIndex};
pub use result_set::{Fetched, NULL_TEXT};
pub use statement::{StatementFlags, StatementStatus};
pub use value::Value;

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
