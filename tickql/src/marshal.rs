///
/// # Callback Marshaling
///
/// Turns a finished statement into a host call. The host's call convention
/// is a stack: arguments are pushed last-to-first, so the marshaler walks the
/// bound arguments right to left and the callee reads them back in format
/// order. `CallFrame::args` returns them in that callee order.
///
/// A failed statement never reaches its own callback. The configured error
/// handler gets a fixed frame instead, pushed as callback name, SQL text,
/// error message, error code, handler id. The callee therefore declares them
/// in the reverse order:
///
/// ```text
/// OnSQLError(handler, error, const error_message[], const query[], const callback[])
/// ```
///
/// A frame owns its arrays and strings and is consumed by `exec`, so the
/// marshaling buffers are released on every path once the call returns.
///

use smallvec::SmallVec;
use tracing::debug;

use crate::engine::Engine;
use crate::format::BoundArg;
use crate::ids::{Cell, OwnerId, StatementId};
use crate::statement::Statement;

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Cell(Cell),
    Array(Vec<Cell>),
    Str(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallFrame {
    pushed: SmallVec<[Arg; 6]>,
}

impl CallFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_cell(&mut self, value: Cell) {
        self.pushed.push(Arg::Cell(value));
    }

    pub fn push_array(&mut self, values: Vec<Cell>) {
        self.pushed.push(Arg::Array(values));
    }

    pub fn push_string(&mut self, value: impl Into<String>) {
        self.pushed.push(Arg::Str(value.into()));
    }

    pub fn len(&self) -> usize {
        self.pushed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pushed.is_empty()
    }

    /// Arguments in the order the callee declares them.
    pub fn args(&self) -> impl Iterator<Item = &Arg> {
        self.pushed.iter().rev()
    }

    pub fn into_args(self) -> Vec<Arg> {
        let mut args = self.pushed.into_vec();
        args.reverse();
        args
    }
}

/// Index of a public function inside a host context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicIndex(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Completion,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub owner: OwnerId,
    pub stmt_id: StatementId,
    pub name: String,
    pub kind: CallbackKind,
    pub frame: CallFrame,
}

/// The scripting runtime, as seen from the engine.
///
/// `exec` receives the engine so callbacks can re-enter it (fetch fields,
/// free their own statement). The engine holds no locks while `exec` runs.
pub trait CallbackHost {
    fn find_public(&mut self, owner: OwnerId, name: &str) -> Option<PublicIndex>;
    fn exec(&mut self, engine: &Engine, owner: OwnerId, index: PublicIndex, frame: CallFrame) -> Cell;
}

/// A host without callbacks. Every lookup misses.
pub struct NoCallbacks;

impl CallbackHost for NoCallbacks {
    fn find_public(&mut self, _owner: OwnerId, _name: &str) -> Option<PublicIndex> {
        None
    }

    fn exec(&mut self, _engine: &Engine, _owner: OwnerId, _index: PublicIndex, _frame: CallFrame) -> Cell {
        0
    }
}

pub fn build_invocation(stmt: &Statement, error_handler: &str) -> Invocation {
    let mut frame = CallFrame::new();

    if stmt.error() == 0 {
        for arg in stmt.bound.iter().rev() {
            match arg {
                BoundArg::Array(cells) => frame.push_array(cells.clone()),
                BoundArg::Cell(cell) | BoundArg::Reference(cell) => frame.push_cell(*cell),
                BoundArg::StatementId => frame.push_cell(stmt.id.as_cell()),
                BoundArg::Str(s) => frame.push_string(s.as_str()),
            }
        }
        Invocation {
            owner: stmt.owner,
            stmt_id: stmt.id,
            name: stmt.callback.clone(),
            kind: CallbackKind::Completion,
            frame,
        }
    } else {
        frame.push_string(stmt.callback.as_str());
        frame.push_string(stmt.text.as_str());
        frame.push_string(stmt.error_message());
        frame.push_cell(stmt.error());
        frame.push_cell(stmt.handler_id.as_cell());
        Invocation {
            owner: stmt.owner,
            stmt_id: stmt.id,
            name: error_handler.to_string(),
            kind: CallbackKind::Error,
            frame,
        }
    }
}

/// Runs `invocation` if the host exports the target. A missing public is
/// not an error.
pub fn dispatch(engine: &Engine, host: &mut dyn CallbackHost, invocation: Invocation) -> Option<Cell> {
    if invocation.name.is_empty() {
        return None;
    }
    let Some(index) = host.find_public(invocation.owner, &invocation.name) else {
        debug!(
            stmt_id = %invocation.stmt_id,
            callback = %invocation.name,
            "callback not found, skipping"
        );
        return None;
    };
    debug!(
        stmt_id = %invocation.stmt_id,
        callback = %invocation.name,
        args = invocation.frame.len(),
        "executing callback"
    );
    Some(host.exec(engine, invocation.owner, index, invocation.frame))
}
