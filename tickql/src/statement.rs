///
/// # Statements
///
/// A statement is one submitted query: its input (SQL text, flags, callback
/// name, argument format and bound parameters) and its output (result sets,
/// error, active result index, status).
///
/// Status only moves forward: `None -> Executed -> Processed`. `advance`
/// refuses any backward or skipping transition, so every writer can call it
/// without re-checking the current state.
///

use std::ops::BitOr;
use std::sync::{Arc, Mutex};

use crate::driver::DriverError;
use crate::format::{ArgFormat, BoundArg};
use crate::ids::{HandlerId, OwnerId, StatementId};
use crate::result_set::ResultSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatementFlags(u32);

impl StatementFlags {
    pub const NONE: StatementFlags = StatementFlags(0);
    pub const THREADED: StatementFlags = StatementFlags(1);
    pub const CACHED: StatementFlags = StatementFlags(2);

    pub fn from_bits(bits: u32) -> Self {
        StatementFlags(bits & (Self::THREADED.0 | Self::CACHED.0))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: StatementFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn remove(&mut self, other: StatementFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for StatementFlags {
    type Output = StatementFlags;

    fn bitor(self, rhs: StatementFlags) -> StatementFlags {
        StatementFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum StatementStatus {
    #[default]
    None = 0,
    Executed = 1,
    Processed = 2,
}

impl StatementStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

pub type SharedStatement = Arc<Mutex<Statement>>;

pub struct Statement {
    pub id: StatementId,
    pub owner: OwnerId,
    pub handler_id: HandlerId,
    pub text: String,
    pub flags: StatementFlags,
    pub callback: String,
    pub format: ArgFormat,
    pub bound: Vec<BoundArg>,
    status: StatementStatus,
    result_sets: Vec<ResultSet>,
    active_result: usize,
    error: i32,
    error_message: String,
    stored: bool,
}

/// Everything the worker needs to run a statement without holding its lock.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub id: StatementId,
    pub text: String,
    pub cached: bool,
}

impl Statement {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: StatementId,
        owner: OwnerId,
        handler_id: HandlerId,
        text: String,
        flags: StatementFlags,
        callback: String,
        format: ArgFormat,
        bound: Vec<BoundArg>,
    ) -> Self {
        Self {
            id,
            owner,
            handler_id,
            text,
            flags,
            callback,
            format,
            bound,
            status: StatementStatus::None,
            result_sets: Vec::new(),
            active_result: 0,
            error: 0,
            error_message: String::new(),
            stored: false,
        }
    }

    pub fn status(&self) -> StatementStatus {
        self.status
    }

    /// Moves to `next` if it is exactly one step ahead. Returns whether the
    /// status changed.
    pub fn advance(&mut self, next: StatementStatus) -> bool {
        if next as u8 == self.status as u8 + 1 {
            self.status = next;
            true
        } else {
            false
        }
    }

    pub fn is_threaded(&self) -> bool {
        self.flags.contains(StatementFlags::THREADED)
    }

    pub fn is_cached(&self) -> bool {
        self.flags.contains(StatementFlags::CACHED)
    }

    pub fn is_stored(&self) -> bool {
        self.stored
    }

    pub fn execution_request(&self) -> ExecutionRequest {
        ExecutionRequest {
            id: self.id,
            text: self.text.clone(),
            cached: self.is_cached(),
        }
    }

    /// Publishes the outcome of an execution and marks the statement
    /// executed. Only the first completion is kept.
    pub fn complete(&mut self, result_sets: Vec<ResultSet>, error: Option<DriverError>) {
        if self.status != StatementStatus::None {
            return;
        }
        self.result_sets = result_sets;
        self.active_result = 0;
        if let Some(err) = error {
            self.error = err.code;
            self.error_message = err.message;
        }
        self.advance(StatementStatus::Executed);
    }

    /// Takes the statement out of the reconciliation cycle: clears
    /// `THREADED`, pins it until an explicit free and moves it to
    /// `Processed`.
    pub fn store(&mut self) {
        self.flags.remove(StatementFlags::THREADED);
        self.stored = true;
        self.advance(StatementStatus::Processed);
    }

    pub fn error(&self) -> i32 {
        self.error
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn result_sets(&self) -> &[ResultSet] {
        &self.result_sets
    }

    pub fn active_result_index(&self) -> usize {
        self.active_result
    }

    pub fn active_result(&self) -> Option<&ResultSet> {
        self.result_sets.get(self.active_result)
    }

    pub fn active_result_mut(&mut self) -> Option<&mut ResultSet> {
        self.result_sets.get_mut(self.active_result)
    }

    /// `-1` selects the next result set. Out-of-range indices leave the
    /// cursor untouched.
    pub fn seek_result(&mut self, index: i64) -> bool {
        let target = if index == -1 {
            self.active_result as i64 + 1
        } else {
            index
        };
        if target == self.active_result as i64 {
            return true;
        }
        if target >= 0 && (target as usize) < self.result_sets.len() {
            self.active_result = target as usize;
            return true;
        }
        false
    }
}
