///
/// # Result Sets
///
/// One `ResultSet` per result returned by a statement's SQL text. The row
/// strategy is fixed when the set is built:
///
/// - **Cached**: every row is copied out of the driver up front. Fetches
///   borrow straight from the cache and no driver call is ever made again.
/// - **Streamed**: the driver's cursor is kept and repositioned on each row
///   seek. Fetches return a fresh copy, since the cursor's row buffer is
///   replaced by the next seek.
///
/// `Fetched` carries that distinction: `Cow::Borrowed` is valid until the
/// next cursor-moving call on the same statement, `Cow::Owned` belongs to
/// the caller.
///
/// A SQL NULL is rendered as the literal `"NULL"`. An unknown field, an
/// empty result or a result without rows fetch as the empty string.
///

use std::borrow::Cow;

use crate::driver::{DriverResult, Row, RowCursor};

pub type Fetched<'a> = Cow<'a, str>;

pub const NULL_TEXT: &str = "NULL";

enum RowSource {
    Cached(Vec<Row>),
    Streamed(Option<Box<dyn RowCursor>>),
}

pub struct ResultSet {
    fields: Vec<String>,
    insert_id: i64,
    affected_rows: i64,
    num_rows: usize,
    active_row: usize,
    rows: RowSource,
}

impl ResultSet {
    pub fn from_driver(result: DriverResult, cached: bool) -> Self {
        let num_rows = result.rows.as_ref().map_or(0, |cursor| cursor.num_rows());
        let rows = match result.rows {
            Some(mut cursor) if cached => RowSource::Cached(cursor.take_all()),
            None if cached => RowSource::Cached(Vec::new()),
            Some(mut cursor) => {
                // Prefetch the first row so fetches work before any seek.
                cursor.seek(0);
                RowSource::Streamed(Some(cursor))
            }
            None => RowSource::Streamed(None),
        };
        Self {
            fields: result.fields,
            insert_id: result.insert_id,
            affected_rows: result.affected_rows,
            num_rows,
            active_row: 0,
            rows,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self.rows, RowSource::Cached(_))
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn insert_id(&self) -> i64 {
        self.insert_id
    }

    pub fn affected_rows(&self) -> i64 {
        self.affected_rows
    }

    pub fn active_row(&self) -> usize {
        self.active_row
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field == name)
    }

    pub fn fetch_field(&self, index: usize) -> Fetched<'_> {
        self.fields
            .get(index)
            .map_or(Cow::Borrowed(""), |name| Cow::Borrowed(name.as_str()))
    }

    /// `row < 0` moves `-row` rows forward from the active row.
    ///
    /// For streamed sets this is a blocking call into the driver cursor; the
    /// caller must hold the handler's driver lock.
    pub fn seek_row(&mut self, row: i64) -> bool {
        let target = if row < 0 {
            (self.active_row as i64).checked_sub(row)
        } else {
            Some(row)
        };
        let Some(target) = target else {
            return false;
        };
        if target == self.active_row as i64 {
            return true;
        }
        if target < 0 || target >= self.num_rows as i64 {
            return false;
        }
        let target = target as usize;
        if let RowSource::Streamed(Some(cursor)) = &mut self.rows {
            if !cursor.seek(target) {
                return false;
            }
        }
        self.active_row = target;
        true
    }

    pub fn fetch_by_index(&self, index: usize) -> Fetched<'_> {
        if self.num_rows == 0 || index >= self.fields.len() {
            return Cow::Borrowed("");
        }
        match &self.rows {
            RowSource::Cached(rows) => match rows.get(self.active_row).and_then(|r| r.get(index)) {
                Some(Some(value)) => Cow::Borrowed(value.as_str()),
                Some(None) => Cow::Borrowed(NULL_TEXT),
                None => Cow::Borrowed(""),
            },
            RowSource::Streamed(cursor) => {
                match cursor.as_ref().and_then(|c| c.current()).and_then(|r| r.get(index)) {
                    Some(Some(value)) => Cow::Owned(value.clone()),
                    Some(None) => Cow::Owned(NULL_TEXT.to_string()),
                    None => Cow::Borrowed(""),
                }
            }
        }
    }

    pub fn fetch_by_name(&self, name: &str) -> Fetched<'_> {
        match self.field_index(name) {
            Some(index) => self.fetch_by_index(index),
            None => Cow::Borrowed(""),
        }
    }
}
