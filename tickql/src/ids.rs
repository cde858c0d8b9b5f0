///
/// Handle types shared by every layer of the engine.
///
/// Handler and statement ids are assigned from per-registry counters starting
/// at 1. They stay within `1..=Cell::MAX` so every id fits a host cell, and
/// an id is only reused after its counter wraps and the old object is gone.
///

use std::fmt;

/// Fixed-width host value. Booleans, characters, integers and floats all
/// travel as one cell; floats are stored as their IEEE-754 bit pattern.
pub type Cell = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatementId(pub i64);

/// Opaque reference to the host context (script instance) that created a
/// handler or statement. Used to scope teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub u64);

// Registry ids never exceed `Cell::MAX`, so these casts are exact.

impl HandlerId {
    pub fn as_cell(self) -> Cell {
        self.0 as Cell
    }
}

impl StatementId {
    pub fn as_cell(self) -> Cell {
        self.0 as Cell
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
