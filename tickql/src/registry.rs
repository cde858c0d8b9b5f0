///
/// Handle tables for handlers and statements.
///
/// Ids come from per-table counters that stay within host cell range. An id
/// is not handed out again until its counter wraps past `Cell::MAX`, and
/// never while it is still live. Both tables keep insertion order, so the
/// reconciliation pass visits statements oldest first.
///

use std::sync::Arc;

use indexmap::IndexMap;

use crate::handler::Handler;
use crate::ids::{Cell, HandlerId, OwnerId, StatementId};
use crate::statement::SharedStatement;

#[derive(Clone)]
pub struct StatementEntry {
    pub stmt: SharedStatement,
    pub owner: OwnerId,
    pub handler_id: HandlerId,
}

/// Advances `last` within `1..=Cell::MAX`, skipping ids still in use.
fn advance(last: &mut i64, in_use: impl Fn(i64) -> bool) -> i64 {
    loop {
        *last = if *last >= i64::from(Cell::MAX) { 1 } else { *last + 1 };
        if !in_use(*last) {
            return *last;
        }
    }
}

#[derive(Default)]
pub struct Registry {
    handlers: IndexMap<HandlerId, Arc<Handler>>,
    statements: IndexMap<StatementId, StatementEntry>,
    last_handler: i64,
    last_statement: i64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_handler_id(&mut self) -> HandlerId {
        let handlers = &self.handlers;
        HandlerId(advance(&mut self.last_handler, |id| handlers.contains_key(&HandlerId(id))))
    }

    pub fn next_statement_id(&mut self) -> StatementId {
        let statements = &self.statements;
        StatementId(advance(&mut self.last_statement, |id| statements.contains_key(&StatementId(id))))
    }

    pub fn insert_handler(&mut self, handler: Arc<Handler>) {
        self.handlers.insert(handler.id(), handler);
    }

    pub fn handler(&self, id: HandlerId) -> Option<Arc<Handler>> {
        self.handlers.get(&id).cloned()
    }

    pub fn is_valid_handler(&self, id: HandlerId) -> bool {
        self.handlers.contains_key(&id)
    }

    pub fn remove_handler(&mut self, id: HandlerId) -> Option<Arc<Handler>> {
        self.handlers.shift_remove(&id)
    }

    pub fn insert_statement(&mut self, id: StatementId, entry: StatementEntry) {
        self.statements.insert(id, entry);
    }

    pub fn statement(&self, id: StatementId) -> Option<StatementEntry> {
        self.statements.get(&id).cloned()
    }

    pub fn contains_statement(&self, id: StatementId) -> bool {
        self.statements.contains_key(&id)
    }

    pub fn remove_statement(&mut self, id: StatementId) -> Option<StatementEntry> {
        self.statements.shift_remove(&id)
    }

    /// Copies of every statement entry, oldest first.
    pub fn statements(&self) -> Vec<(StatementId, StatementEntry)> {
        self.statements
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    /// Removes everything `owner` created and hands it back for teardown
    /// outside the registry lock.
    pub fn remove_owned_by(&mut self, owner: OwnerId) -> (Vec<Arc<Handler>>, Vec<StatementEntry>) {
        let handler_ids: Vec<HandlerId> = self
            .handlers
            .iter()
            .filter(|(_, handler)| handler.owner() == owner)
            .map(|(id, _)| *id)
            .collect();
        let statement_ids: Vec<StatementId> = self
            .statements
            .iter()
            .filter(|(_, entry)| entry.owner == owner)
            .map(|(id, _)| *id)
            .collect();

        let handlers = handler_ids
            .into_iter()
            .filter_map(|id| self.handlers.shift_remove(&id))
            .collect();
        let statements = statement_ids
            .into_iter()
            .filter_map(|id| self.statements.shift_remove(&id))
            .collect();
        (handlers, statements)
    }

    pub fn drain(&mut self) -> (Vec<Arc<Handler>>, Vec<StatementEntry>) {
        let handlers = self.handlers.drain(..).map(|(_, handler)| handler).collect();
        let statements = self.statements.drain(..).map(|(_, entry)| entry).collect();
        (handlers, statements)
    }
}
