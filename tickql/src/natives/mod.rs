///
/// # Natives
///
/// The scripting API, one function per native. The host has no error
/// channel, so every `EngineError` is logged here and turned into the
/// native's sentinel: `0` for most calls, `-1` for `sql_ping` and
/// `sql_escape_string`, an empty string for string outputs.
///
/// Handles arrive as cells. String outputs go to a host buffer described by
/// `(dest, size)`: `size` counts cells including the terminator, and a size
/// below 2 means the host could not tell, so the whole value is written.
///
/// | Native                       | Success                | Failure |
/// |------------------------------|------------------------|---------|
/// | `sql_connect`                | handler id             | 0       |
/// | `sql_query`                  | statement id           | 0       |
/// | `sql_ping`                   | driver status, 0 alive | -1      |
/// | `sql_escape_string`          | escaped length         | -1      |
/// | string outputs               | written length         | 0       |
/// | everything else              | value or 1             | 0       |
///

pub mod sprintf;

use tracing::warn;

use crate::driver::{BackendKind, ConnectParams};
use crate::engine::{Cursor, Engine, QueryRequest};
use crate::errors::EngineError;
use crate::ids::{Cell, HandlerId, OwnerId, StatementId};
use crate::logging::LogLevel;
use crate::marshal::CallbackHost;
use crate::statement::StatementFlags;
use crate::value::{cell_from_f32, Value};

/// Writes `src` into a host buffer of `size` cells. Output is cut to
/// `size - 1` bytes on a character boundary.
pub fn set_host_string(dest: &mut String, src: &str, size: Cell) -> Cell {
    dest.clear();
    if size < 2 {
        dest.push_str(src);
    } else {
        let mut end = src.len().min(size as usize - 1);
        while !src.is_char_boundary(end) {
            end -= 1;
        }
        dest.push_str(&src[..end]);
    }
    dest.len() as Cell
}

/// `atoi`: optional whitespace and sign, then the longest digit run.
pub fn parse_leading_int(text: &str) -> Cell {
    let text = text.trim_start();
    let (negative, digits) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    let mut value: i64 = 0;
    for b in digits.bytes().take_while(u8::is_ascii_digit) {
        value = (value * 10 + (b - b'0') as i64).min(i64::from(Cell::MAX) + 1);
    }
    let value = if negative { -value } else { value };
    value.clamp(i64::from(Cell::MIN), i64::from(Cell::MAX)) as Cell
}

/// `atof`: the longest prefix that reads as a decimal float, otherwise 0.
pub fn parse_leading_float(text: &str) -> f32 {
    let text = text.trim_start();
    let bytes = text.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'-' | b'+')) {
        end += 1;
    }
    let digits_start = end;
    while bytes.get(end).is_some_and(u8::is_ascii_digit) {
        end += 1;
    }
    let mut mantissa_digits = end - digits_start;
    if bytes.get(end) == Some(&b'.') {
        let fraction_start = end + 1;
        let mut fraction_end = fraction_start;
        while bytes.get(fraction_end).is_some_and(u8::is_ascii_digit) {
            fraction_end += 1;
        }
        mantissa_digits += fraction_end - fraction_start;
        if mantissa_digits > 0 {
            end = fraction_end;
        }
    }
    if mantissa_digits == 0 {
        return 0.0;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp_end = end + 1;
        if matches!(bytes.get(exp_end), Some(b'-' | b'+')) {
            exp_end += 1;
        }
        let exp_digits = exp_end;
        while bytes.get(exp_end).is_some_and(u8::is_ascii_digit) {
            exp_end += 1;
        }
        if exp_end > exp_digits {
            end = exp_end;
        }
    }
    text[..end].parse().unwrap_or(0.0)
}

fn handler_id(cell: Cell) -> HandlerId {
    HandlerId(i64::from(cell))
}

fn statement_id(cell: Cell) -> StatementId {
    StatementId(i64::from(cell))
}

fn index(cell: Cell) -> usize {
    usize::try_from(cell).unwrap_or(usize::MAX)
}

fn report(native: &str, err: &EngineError) {
    warn!(native, error = %err, "native call failed");
}

/// Unwraps `result` or logs and returns `fallback`.
fn or_sentinel<T>(native: &str, result: Result<T, EngineError>, fallback: T) -> T {
    result.unwrap_or_else(|err| {
        report(native, &err);
        fallback
    })
}

fn write_or_clear(native: &str, result: Result<String, EngineError>, dest: &mut String, size: Cell) -> Cell {
    match result {
        Ok(value) => set_host_string(dest, &value, size),
        Err(err) => {
            report(native, &err);
            dest.clear();
            0
        }
    }
}

pub fn sql_debug(engine: &Engine, file_level: Cell, console_level: Cell) -> Cell {
    let (Some(file), Some(console)) = (LogLevel::from_code(file_level), LogLevel::from_code(console_level)) else {
        warn!(file_level, console_level, "invalid log level");
        return 0;
    };
    engine.set_log_levels(file, console) as Cell
}

#[allow(clippy::too_many_arguments)]
pub fn sql_connect(
    engine: &Engine,
    owner: OwnerId,
    kind: Cell,
    host: &str,
    user: &str,
    password: &str,
    database: &str,
    port: Cell,
) -> Cell {
    let params = ConnectParams {
        host: host.to_string(),
        user: user.to_string(),
        password: password.to_string(),
        database: database.to_string(),
        port: u16::try_from(port).unwrap_or(0),
    };
    let kind = BackendKind(u32::try_from(kind).unwrap_or(0));
    or_sentinel("sql_connect", engine.connect(owner, kind, &params).map(HandlerId::as_cell), 0)
}

pub fn sql_disconnect(engine: &Engine, handler: Cell) -> Cell {
    or_sentinel("sql_disconnect", engine.disconnect(handler_id(handler)).map(|()| 1), 0)
}

pub fn sql_wait(engine: &Engine, handler: Cell) -> Cell {
    or_sentinel("sql_wait", engine.wait(handler_id(handler)).map(|()| 1), 0)
}

pub fn sql_set_charset(engine: &Engine, handler: Cell, charset: &str) -> Cell {
    if charset.is_empty() {
        warn!(handler, "empty charset");
        return 0;
    }
    or_sentinel("sql_set_charset", engine.set_charset(handler_id(handler), charset).map(|()| 1), 0)
}

pub fn sql_get_charset(engine: &Engine, handler: Cell, dest: &mut String, size: Cell) -> Cell {
    write_or_clear("sql_get_charset", engine.charset(handler_id(handler)), dest, size)
}

pub fn sql_ping(engine: &Engine, handler: Cell) -> Cell {
    or_sentinel("sql_ping", engine.ping(handler_id(handler)), -1)
}

pub fn sql_get_stat(engine: &Engine, handler: Cell, dest: &mut String, size: Cell) -> Cell {
    write_or_clear("sql_get_stat", engine.server_stats(handler_id(handler)), dest, size)
}

pub fn sql_escape_string(engine: &Engine, handler: Cell, src: &str, dest: &mut String, size: Cell) -> Cell {
    match engine.escape(handler_id(handler), src) {
        Ok(escaped) => set_host_string(dest, &escaped, size),
        Err(err) => {
            report("sql_escape_string", &err);
            dest.clear();
            -1
        }
    }
}

/// Formats a query text. `%z` escapes through the handler's driver, so the
/// handler must be valid even when the template has no `%z`.
pub fn sql_format(engine: &Engine, handler: Cell, dest: &mut String, size: Cell, template: &str, args: &[Value]) -> Cell {
    let handler = handler_id(handler);
    if !engine.is_valid_handler(handler) {
        report("sql_format", &EngineError::UnknownHandler(handler));
        dest.clear();
        return 0;
    }
    let escape = |s: &str| engine.escape(handler, s).unwrap_or_default();
    let formatted = sprintf::sprintf(template, args, &escape);
    set_host_string(dest, &formatted, size)
}

#[allow(clippy::too_many_arguments)]
pub fn sql_query(
    engine: &Engine,
    host: &mut dyn CallbackHost,
    owner: OwnerId,
    handler: Cell,
    query: &str,
    flags: Cell,
    callback: &str,
    format: &str,
    params: Vec<Value>,
) -> Cell {
    let request = QueryRequest {
        owner,
        handler_id: handler_id(handler),
        text: query.to_string(),
        flags: StatementFlags::from_bits(flags as u32),
        callback: callback.to_string(),
        format: format.to_string(),
        params,
    };
    or_sentinel("sql_query", engine.submit(request, host).map(StatementId::as_cell), 0)
}

pub fn sql_free_result(engine: &Engine, stmt: Cell) -> Cell {
    or_sentinel("sql_free_result", engine.free_result(statement_id(stmt)).map(|()| 1), 0)
}

pub fn sql_store_result(engine: &Engine, stmt: Cell) -> Cell {
    or_sentinel("sql_store_result", engine.store_result(statement_id(stmt)).map(|()| 1), 0)
}

/// Status code of the statement: 0 none, 1 executed, 2 processed. An
/// unknown statement reads as -1.
pub fn sql_status(engine: &Engine, stmt: Cell) -> Cell {
    or_sentinel("sql_status", engine.status(statement_id(stmt)).map(|s| s.code()), -1)
}

pub fn sql_insert_id(engine: &Engine, stmt: Cell) -> Cell {
    or_sentinel("sql_insert_id", engine.insert_id(statement_id(stmt)).map(|v| v as Cell), 0)
}

pub fn sql_affected_rows(engine: &Engine, stmt: Cell) -> Cell {
    or_sentinel("sql_affected_rows", engine.affected_rows(statement_id(stmt)).map(|v| v as Cell), 0)
}

pub fn sql_error(engine: &Engine, stmt: Cell) -> Cell {
    or_sentinel("sql_error", engine.error(statement_id(stmt)), 0)
}

pub fn sql_error_string(engine: &Engine, stmt: Cell, dest: &mut String, size: Cell) -> Cell {
    write_or_clear("sql_error_string", engine.error_message(statement_id(stmt)), dest, size)
}

pub fn sql_num_rows(engine: &Engine, stmt: Cell) -> Cell {
    or_sentinel("sql_num_rows", engine.num_rows(statement_id(stmt)).map(|v| v as Cell), 0)
}

pub fn sql_num_fields(engine: &Engine, stmt: Cell) -> Cell {
    or_sentinel("sql_num_fields", engine.num_fields(statement_id(stmt)).map(|v| v as Cell), 0)
}

/// `result == -1` selects the next result set.
pub fn sql_next_result(engine: &Engine, stmt: Cell, result: Cell) -> Cell {
    or_sentinel("sql_next_result", engine.seek_result(statement_id(stmt), i64::from(result)).map(|()| 1), 0)
}

pub fn sql_field_name(engine: &Engine, stmt: Cell, field: Cell, dest: &mut String, size: Cell) -> Cell {
    write_or_clear("sql_field_name", engine.fetch_field(statement_id(stmt), index(field)), dest, size)
}

/// Every field of the current row, each followed by `separator`.
pub fn sql_fetch_row(engine: &Engine, stmt: Cell, separator: &str, dest: &mut String, size: Cell) -> Cell {
    let row = engine.with_cursor(statement_id(stmt), |cursor| {
        let mut row = String::new();
        for field in 0..cursor.num_fields() {
            row.push_str(&cursor.fetch_by_index(field));
            row.push_str(separator);
        }
        row
    });
    write_or_clear("sql_fetch_row", row, dest, size)
}

/// `row == -1` advances one row.
pub fn sql_next_row(engine: &Engine, stmt: Cell, row: Cell) -> Cell {
    or_sentinel("sql_next_row", engine.seek_row(statement_id(stmt), i64::from(row)).map(|()| 1), 0)
}

/// Seeks `row` when given, then reads through `read`.
fn fetch_at(
    engine: &Engine,
    stmt: Cell,
    row: Option<Cell>,
    read: impl FnOnce(&Cursor<'_>) -> String,
) -> Result<String, EngineError> {
    let id = statement_id(stmt);
    engine
        .with_cursor(id, |cursor| {
            if let Some(row) = row {
                if !cursor.seek_row(i64::from(row)) {
                    return Err(EngineError::OutOfRange { index: i64::from(row) });
                }
            }
            Ok(read(cursor))
        })
        .and_then(|fetched| fetched)
}

pub fn sql_get_field(engine: &Engine, stmt: Cell, row: Option<Cell>, field: Cell, dest: &mut String, size: Cell) -> Cell {
    let value = fetch_at(engine, stmt, row, |cursor| cursor.fetch_by_index(index(field)).into_owned());
    write_or_clear("sql_get_field", value, dest, size)
}

pub fn sql_get_field_assoc(
    engine: &Engine,
    stmt: Cell,
    row: Option<Cell>,
    field: &str,
    dest: &mut String,
    size: Cell,
) -> Cell {
    let value = fetch_at(engine, stmt, row, |cursor| cursor.fetch_by_name(field).into_owned());
    write_or_clear("sql_get_field_assoc", value, dest, size)
}

pub fn sql_get_field_int(engine: &Engine, stmt: Cell, row: Option<Cell>, field: Cell) -> Cell {
    let value = fetch_at(engine, stmt, row, |cursor| cursor.fetch_by_index(index(field)).into_owned());
    or_sentinel("sql_get_field_int", value.map(|v| parse_leading_int(&v)), 0)
}

pub fn sql_get_field_assoc_int(engine: &Engine, stmt: Cell, row: Option<Cell>, field: &str) -> Cell {
    let value = fetch_at(engine, stmt, row, |cursor| cursor.fetch_by_name(field).into_owned());
    or_sentinel("sql_get_field_assoc_int", value.map(|v| parse_leading_int(&v)), 0)
}

/// Returns the float's bit pattern, as the host stores floats in cells.
pub fn sql_get_field_float(engine: &Engine, stmt: Cell, row: Option<Cell>, field: Cell) -> Cell {
    let value = fetch_at(engine, stmt, row, |cursor| cursor.fetch_by_index(index(field)).into_owned());
    or_sentinel(
        "sql_get_field_float",
        value.map(|v| cell_from_f32(parse_leading_float(&v))),
        cell_from_f32(0.0),
    )
}

pub fn sql_get_field_assoc_float(engine: &Engine, stmt: Cell, row: Option<Cell>, field: &str) -> Cell {
    let value = fetch_at(engine, stmt, row, |cursor| cursor.fetch_by_name(field).into_owned());
    or_sentinel(
        "sql_get_field_assoc_float",
        value.map(|v| cell_from_f32(parse_leading_float(&v))),
        cell_from_f32(0.0),
    )
}
