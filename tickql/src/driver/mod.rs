///
/// Backend driver contract.
///
/// A `Driver` owns one backend connection. The engine never talks to a
/// concrete backend; handlers hold a `Box<dyn Driver>` created from the
/// `DriverRegistry` by backend kind. Drivers are not required to be `Sync`:
/// every call goes through the owning handler's driver mutex.
///
/// Results come back one at a time: `execute` returns the first result of
/// the SQL text and `fetch_additional_result` yields the rest until `None`.
/// A result either carries rows (`rows: Some`) or is a plain command.
///

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::collections::HashMap;
use std::fmt;

pub use crate::errors::DriverError;

/// One row of text cells. `None` is SQL NULL.
pub type Row = Vec<Option<String>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    pub host: String,
    pub user: String,
    pub password: String,
    pub database: String,
    /// 0 selects the backend's default port.
    pub port: u16,
}

pub trait Driver: Send {
    fn connect(&mut self, params: &ConnectParams) -> Result<(), DriverError>;
    fn disconnect(&mut self);
    fn last_error_code(&self) -> i32;
    fn last_error_message(&self) -> String;
    /// Returns 0 when the connection is alive.
    fn ping(&mut self) -> i32;
    fn server_stats(&mut self) -> String;
    fn charset(&mut self) -> String;
    fn set_charset(&mut self, charset: &str) -> bool;
    /// Output is at most `2 * src.len() + 1` bytes.
    fn escape(&self, src: &str) -> String;
    fn execute(&mut self, sql: &str) -> Result<DriverResult, DriverError>;
    fn fetch_additional_result(&mut self) -> Option<Result<DriverResult, DriverError>>;
}

/// Positioned access to the rows of one result, held by the backend.
pub trait RowCursor: Send {
    fn num_rows(&self) -> usize;

    /// Moves to `row` and fetches it. Returns false if `row` is out of range.
    fn seek(&mut self, row: usize) -> bool;

    /// The row fetched by the last successful `seek`.
    fn current(&self) -> Option<&[Option<String>]>;

    fn take_all(&mut self) -> Vec<Row> {
        let mut rows = Vec::with_capacity(self.num_rows());
        for index in 0..self.num_rows() {
            if !self.seek(index) {
                break;
            }
            if let Some(row) = self.current() {
                rows.push(row.to_vec());
            }
        }
        rows
    }
}

pub struct DriverResult {
    pub fields: Vec<String>,
    pub insert_id: i64,
    pub affected_rows: i64,
    pub rows: Option<Box<dyn RowCursor>>,
}

impl DriverResult {
    pub fn command(insert_id: i64, affected_rows: i64) -> Self {
        Self {
            fields: Vec::new(),
            insert_id,
            affected_rows,
            rows: None,
        }
    }

    pub fn rows(fields: Vec<String>, rows: Vec<Row>) -> Self {
        let affected_rows = rows.len() as i64;
        Self {
            fields,
            insert_id: 0,
            affected_rows,
            rows: Some(Box::new(BufferedRows::new(rows))),
        }
    }
}

impl fmt::Debug for DriverResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverResult")
            .field("fields", &self.fields)
            .field("insert_id", &self.insert_id)
            .field("affected_rows", &self.affected_rows)
            .field("num_rows", &self.rows.as_ref().map(|r| r.num_rows()))
            .finish()
    }
}

/// Rows fully buffered on the client side, like a stored result.
#[derive(Debug, Clone, Default)]
pub struct BufferedRows {
    rows: Vec<Row>,
    current: Option<usize>,
}

impl BufferedRows {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows,
            current: None,
        }
    }
}

impl RowCursor for BufferedRows {
    fn num_rows(&self) -> usize {
        self.rows.len()
    }

    fn seek(&mut self, row: usize) -> bool {
        if row < self.rows.len() {
            self.current = Some(row);
            true
        } else {
            false
        }
    }

    fn current(&self) -> Option<&[Option<String>]> {
        self.current
            .and_then(|index| self.rows.get(index))
            .map(Vec::as_slice)
    }

    fn take_all(&mut self) -> Vec<Row> {
        self.current = None;
        std::mem::take(&mut self.rows)
    }
}

/// Integer backend selector, as passed by the host to `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendKind(pub u32);

impl BackendKind {
    pub const SQLITE: BackendKind = BackendKind(1);
    pub const POSTGRES: BackendKind = BackendKind(2);
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            BackendKind::SQLITE => write!(f, "sqlite"),
            BackendKind::POSTGRES => write!(f, "postgres"),
            BackendKind(other) => write!(f, "#{}", other),
        }
    }
}

pub type DriverFactory = Box<dyn Fn() -> Box<dyn Driver> + Send + Sync>;

/// Maps backend kinds to driver constructors.
pub struct DriverRegistry {
    factories: HashMap<BackendKind, DriverFactory>,
}

impl DriverRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, kind: BackendKind, factory: F)
    where
        F: Fn() -> Box<dyn Driver> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Box::new(factory));
    }

    pub fn create(&self, kind: BackendKind) -> Option<Box<dyn Driver>> {
        self.factories.get(&kind).map(|factory| factory())
    }

    pub fn supports(&self, kind: BackendKind) -> bool {
        self.factories.contains_key(&kind)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::empty();
        #[cfg(feature = "sqlite")]
        registry.register(BackendKind::SQLITE, || Box::new(sqlite::SqliteDriver::new()));
        #[cfg(feature = "postgres")]
        registry.register(BackendKind::POSTGRES, || {
            Box::new(postgres::PostgresDriver::new())
        });
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<Row> {
        vec![
            vec![Some("1".into()), None],
            vec![Some("2".into()), Some("b".into())],
        ]
    }

    #[test]
    fn test_buffered_rows_seek() {
        let mut cursor = BufferedRows::new(rows());
        assert_eq!(cursor.current(), None);
        assert!(cursor.seek(1));
        assert_eq!(cursor.current().unwrap()[1].as_deref(), Some("b"));
        assert!(!cursor.seek(2));
        assert_eq!(cursor.current().unwrap()[0].as_deref(), Some("2"));
    }

    #[test]
    fn test_default_take_all_walks_every_row() {
        struct Wrapped(BufferedRows);
        impl RowCursor for Wrapped {
            fn num_rows(&self) -> usize {
                self.0.num_rows()
            }
            fn seek(&mut self, row: usize) -> bool {
                self.0.seek(row)
            }
            fn current(&self) -> Option<&[Option<String>]> {
                self.0.current()
            }
        }
        let mut cursor = Wrapped(BufferedRows::new(rows()));
        assert_eq!(cursor.take_all(), rows());
    }

    #[test]
    fn test_registry_rejects_unknown_kinds() {
        let registry = DriverRegistry::empty();
        assert!(registry.create(BackendKind(42)).is_none());
        assert_eq!(BackendKind(42).to_string(), "#42");
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_default_registry_has_sqlite() {
        assert!(DriverRegistry::default().supports(BackendKind::SQLITE));
    }
}
