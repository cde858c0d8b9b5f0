//!
//! Per-handler pending queue and worker loop.
//!
//! The queue is a `Mutex<VecDeque>` paired with two condition variables:
//! `work` wakes the worker when something is pushed or the worker is being
//! stopped, `idle` wakes callers of `wait_idle` once the queue is empty and
//! nothing is executing. Pushing never waits on the worker; a bounded queue
//! hands the statement back instead of blocking.
//!

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::statement::SharedStatement;

struct QueueState {
    items: VecDeque<SharedStatement>,
    in_flight: usize,
}

pub struct PendingQueue {
    state: Mutex<QueueState>,
    work: Condvar,
    idle: Condvar,
    /// 0 means unbounded.
    capacity: usize,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                in_flight: 0,
            }),
            work: Condvar::new(),
            idle: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, stmt: SharedStatement) -> Result<(), SharedStatement> {
        let mut state = self.lock();
        if self.capacity != 0 && state.items.len() >= self.capacity {
            return Err(stmt);
        }
        state.items.push_back(stmt);
        self.work.notify_one();
        Ok(())
    }

    /// Takes the oldest statement and counts it as in flight until
    /// `finish` is called.
    pub fn pop(&self) -> Option<SharedStatement> {
        let mut state = self.lock();
        let stmt = state.items.pop_front()?;
        state.in_flight += 1;
        Some(stmt)
    }

    pub fn finish(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.items.is_empty() && state.in_flight == 0 {
            self.idle.notify_all();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every queued statement that has not started.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.items.len();
        state.items.clear();
        if state.in_flight == 0 {
            self.idle.notify_all();
        }
        dropped
    }

    /// Sleeps until there is work, the worker is stopped, or `tick` passes.
    pub fn wait_for_work(&self, tick: Duration, active: &AtomicBool) {
        let state = self.lock();
        if state.items.is_empty() && active.load(Ordering::SeqCst) {
            let _ = self
                .work
                .wait_timeout(state, tick)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wakes a sleeping worker so it can observe a cleared `active` flag.
    pub fn wake(&self) {
        let _state = self.lock();
        self.work.notify_all();
    }

    /// Blocks until the queue is empty and nothing is executing. Returns
    /// early if the worker stops, since nothing would drain the queue.
    pub fn wait_idle(&self, tick: Duration, active: &AtomicBool) {
        let mut state = self.lock();
        while (!state.items.is_empty() || state.in_flight > 0) && active.load(Ordering::SeqCst) {
            state = self
                .idle
                .wait_timeout(state, tick)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Drains the queue in FIFO order while `active` is set, sleeping on the
/// queue between bursts.
pub fn run<F>(queue: &PendingQueue, active: &AtomicBool, tick: Duration, mut execute: F)
where
    F: FnMut(&SharedStatement),
{
    while active.load(Ordering::SeqCst) {
        while active.load(Ordering::SeqCst) {
            let Some(stmt) = queue.pop() else {
                break;
            };
            execute(&stmt);
            queue.finish();
        }
        queue.wait_for_work(tick, active);
    }
}
