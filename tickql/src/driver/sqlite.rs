///
/// SQLite driver backed by rusqlite.
///
/// `database` is a file path; an empty name or `:memory:` opens a private
/// in-memory database. Host, user, password and port are ignored.
///
/// Multi-statement text is split with `rusqlite::Batch` and every statement
/// produces one result. Rows are buffered in full before the next statement
/// runs, so the per-result cursors never hold a borrow of the connection.
/// Execution stops at the first failing statement; results produced before
/// it are still delivered, followed by the error.
///

use std::collections::VecDeque;
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::{Batch, Connection, Statement};

use super::{ConnectParams, Driver, DriverError, DriverResult, Row};

const BUSY_TIMEOUT_MS: u64 = 5_000;

fn sqlite_error(e: &rusqlite::Error) -> DriverError {
    let code = match e {
        rusqlite::Error::SqliteFailure(err, _) => err.extended_code,
        _ => -1,
    };
    DriverError::new(code, e.to_string())
}

fn render_value(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn run_statement(conn: &Connection, stmt: &mut Statement<'_>) -> Result<DriverResult, DriverError> {
    let fields: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(String::from)
        .collect();

    if fields.is_empty() {
        let changed = stmt.raw_execute().map_err(|e| sqlite_error(&e))?;
        return Ok(DriverResult::command(conn.last_insert_rowid(), changed as i64));
    }

    let mut buffered: Vec<Row> = Vec::new();
    let mut rows = stmt.raw_query();
    while let Some(row) = rows.next().map_err(|e| sqlite_error(&e))? {
        let mut values = Vec::with_capacity(fields.len());
        for index in 0..fields.len() {
            let value = row.get_ref(index).map_err(|e| sqlite_error(&e))?;
            values.push(render_value(value));
        }
        buffered.push(values);
    }

    let mut result = DriverResult::rows(fields, buffered);
    result.insert_id = conn.last_insert_rowid();
    Ok(result)
}

fn run_batch(conn: &Connection, sql: &str) -> VecDeque<Result<DriverResult, DriverError>> {
    let mut results = VecDeque::new();
    let mut batch = Batch::new(conn, sql);
    loop {
        match batch.next() {
            Ok(Some(mut stmt)) => {
                let outcome = run_statement(conn, &mut stmt);
                let failed = outcome.is_err();
                results.push_back(outcome);
                if failed {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                results.push_back(Err(sqlite_error(&e)));
                break;
            }
        }
    }
    results
}

#[derive(Default)]
pub struct SqliteDriver {
    conn: Option<Connection>,
    last_error: Option<DriverError>,
    pending: VecDeque<Result<DriverResult, DriverError>>,
}

impl SqliteDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn record<T>(&mut self, outcome: Result<T, DriverError>) -> Result<T, DriverError> {
        match outcome {
            Ok(value) => {
                self.last_error = None;
                Ok(value)
            }
            Err(err) => {
                self.last_error = Some(err.clone());
                Err(err)
            }
        }
    }
}

impl Driver for SqliteDriver {
    fn connect(&mut self, params: &ConnectParams) -> Result<(), DriverError> {
        let opened = if params.database.is_empty() || params.database == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(&params.database)
        };
        let outcome = opened
            .and_then(|conn| {
                conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
                Ok(conn)
            })
            .map_err(|e| sqlite_error(&e));
        let conn = self.record(outcome)?;
        self.conn = Some(conn);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.pending.clear();
        if let Some(conn) = self.conn.take() {
            if let Err((_, e)) = conn.close() {
                tracing::warn!(error = %e, "sqlite connection did not close cleanly");
            }
        }
    }

    fn last_error_code(&self) -> i32 {
        self.last_error.as_ref().map_or(0, |e| e.code)
    }

    fn last_error_message(&self) -> String {
        self.last_error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_default()
    }

    fn ping(&mut self) -> i32 {
        let outcome = match self.conn.as_ref() {
            Some(conn) => conn
                .query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|e| sqlite_error(&e)),
            None => Err(DriverError::not_connected()),
        };
        match self.record(outcome) {
            Ok(()) => 0,
            Err(_) => 1,
        }
    }

    fn server_stats(&mut self) -> String {
        let Some(conn) = self.conn.as_ref() else {
            return String::new();
        };
        let pages: i64 = conn
            .pragma_query_value(None, "page_count", |row| row.get(0))
            .unwrap_or(0);
        format!("SQLite {}  Pages: {}", rusqlite::version(), pages)
    }

    fn charset(&mut self) -> String {
        self.conn
            .as_ref()
            .and_then(|conn| {
                conn.pragma_query_value(None, "encoding", |row| row.get::<_, String>(0))
                    .ok()
            })
            .unwrap_or_default()
    }

    fn set_charset(&mut self, charset: &str) -> bool {
        let Some(conn) = self.conn.as_ref() else {
            return false;
        };
        if let Err(e) = conn.pragma_update(None, "encoding", charset) {
            self.last_error = Some(sqlite_error(&e));
            return false;
        }
        // The encoding of an existing database cannot change; read it back.
        self.charset().eq_ignore_ascii_case(charset)
    }

    fn escape(&self, src: &str) -> String {
        src.replace('\'', "''")
    }

    fn execute(&mut self, sql: &str) -> Result<DriverResult, DriverError> {
        self.pending.clear();
        let mut results = match self.conn.as_ref() {
            Some(conn) => run_batch(conn, sql),
            None => VecDeque::from([Err(DriverError::not_connected())]),
        };
        let first = results
            .pop_front()
            .unwrap_or_else(|| Ok(DriverResult::command(0, 0)));
        self.pending = results;
        self.record(first)
    }

    fn fetch_additional_result(&mut self) -> Option<Result<DriverResult, DriverError>> {
        let next = self.pending.pop_front()?;
        Some(self.record(next))
    }
}

impl Drop for SqliteDriver {
    fn drop(&mut self) {
        self.disconnect();
    }
}
