//!
//! Shared fixtures for the integration tests: a callback host that records
//! every call, and a scriptable driver whose `execute` blocks on a gate so
//! tests can hold a worker mid-statement.
//!

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tickql::{
    Arg, BackendKind, CallFrame, CallbackHost, Cell, ConnectParams, Driver, DriverError, DriverRegistry,
    DriverResult, Engine, EngineConfig, HandlerId, OwnerId, PublicIndex,
};

pub const MOCK: BackendKind = BackendKind(100);

/// Error code the mock reports for a statement part reading `FAIL`.
pub const MOCK_FAILURE: i32 = 1146;

#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub owner: OwnerId,
    pub name: String,
    pub args: Vec<Arg>,
}

type Hook = Box<dyn FnMut(&Engine, &Recorded)>;

pub struct RecordingHost {
    publics: Vec<String>,
    pub calls: Vec<Recorded>,
    hook: Option<Hook>,
}

impl RecordingHost {
    pub fn new(publics: &[&str]) -> Self {
        Self {
            publics: publics.iter().map(|name| name.to_string()).collect(),
            calls: Vec::new(),
            hook: None,
        }
    }

    /// Runs `hook` inside every callback, after it is recorded.
    pub fn with_hook(mut self, hook: impl FnMut(&Engine, &Recorded) + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.calls.iter().map(|call| call.name.as_str()).collect()
    }
}

impl CallbackHost for RecordingHost {
    fn find_public(&mut self, _owner: OwnerId, name: &str) -> Option<PublicIndex> {
        self.publics
            .iter()
            .position(|public| public == name)
            .map(|index| PublicIndex(index as i32))
    }

    fn exec(&mut self, engine: &Engine, owner: OwnerId, index: PublicIndex, frame: CallFrame) -> Cell {
        let recorded = Recorded {
            owner,
            name: self.publics[index.0 as usize].clone(),
            args: frame.into_args(),
        };
        if let Some(hook) = self.hook.as_mut() {
            hook(engine, &recorded);
        }
        self.calls.push(recorded);
        1
    }
}

/// A latch the mock driver blocks on before executing anything.
pub struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

struct GateState {
    open: bool,
    waiting: usize,
}

impl Gate {
    pub fn new(open: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState { open, waiting: 0 }),
            changed: Condvar::new(),
        })
    }

    pub fn open(&self) {
        self.state.lock().unwrap().open = true;
        self.changed.notify_all();
    }

    pub fn close(&self) {
        self.state.lock().unwrap().open = false;
    }

    fn pass(&self) {
        let mut state = self.state.lock().unwrap();
        state.waiting += 1;
        self.changed.notify_all();
        while !state.open {
            state = self.changed.wait(state).unwrap();
        }
        state.waiting -= 1;
    }

    /// Blocks until `count` statements are held at the gate.
    pub fn wait_for_waiters(&self, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut state = self.state.lock().unwrap();
        while state.waiting < count {
            let left = deadline.saturating_duration_since(Instant::now());
            assert!(!left.is_zero(), "no worker reached the gate");
            state = self.changed.wait_timeout(state, left).unwrap().0;
        }
    }
}

/// Executes `;`-separated parts, one result set per part. Each result has a
/// single `sql` column echoing the part. A part reading `FAIL` errors.
pub struct MockDriver {
    gate: Arc<Gate>,
    log: Arc<Mutex<Vec<String>>>,
    connected: bool,
    pending: VecDeque<Result<DriverResult, DriverError>>,
    last_error: (i32, String),
}

impl MockDriver {
    fn part_result(part: &str) -> Result<DriverResult, DriverError> {
        if part == "FAIL" {
            return Err(DriverError::new(MOCK_FAILURE, "Table 'game.missing' doesn't exist"));
        }
        Ok(DriverResult::rows(vec!["sql".to_string()], vec![vec![Some(part.to_string())]]))
    }
}

impl Driver for MockDriver {
    fn connect(&mut self, params: &ConnectParams) -> Result<(), DriverError> {
        if params.database == "refuse" {
            return Err(DriverError::new(2003, "Can't connect to server"));
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn last_error_code(&self) -> i32 {
        self.last_error.0
    }

    fn last_error_message(&self) -> String {
        self.last_error.1.clone()
    }

    fn ping(&mut self) -> i32 {
        if self.connected {
            0
        } else {
            self.last_error = (2006, "server has gone away".to_string());
            1
        }
    }

    fn server_stats(&mut self) -> String {
        "Uptime: 1".to_string()
    }

    fn charset(&mut self) -> String {
        "utf8".to_string()
    }

    fn set_charset(&mut self, charset: &str) -> bool {
        charset == "utf8"
    }

    fn escape(&self, src: &str) -> String {
        src.replace('\\', "\\\\").replace('\'', "\\'")
    }

    fn execute(&mut self, sql: &str) -> Result<DriverResult, DriverError> {
        self.gate.pass();
        self.log.lock().unwrap().push(sql.to_string());
        self.pending.clear();
        let mut parts = sql.split(';').map(str::trim).filter(|part| !part.is_empty());
        let first = parts.next().unwrap_or_default();
        self.pending.extend(parts.map(Self::part_result));
        let outcome = Self::part_result(first);
        if let Err(err) = &outcome {
            self.last_error = (err.code, err.message.clone());
        }
        outcome
    }

    fn fetch_additional_result(&mut self) -> Option<Result<DriverResult, DriverError>> {
        self.pending.pop_front()
    }
}

pub struct MockBackend {
    pub gate: Arc<Gate>,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl MockBackend {
    pub fn executed(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

/// An engine with SQLite plus the mock backend under `MOCK`.
pub fn mock_engine(config: EngineConfig, gate_open: bool) -> (Engine, MockBackend) {
    let gate = Gate::new(gate_open);
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut drivers = DriverRegistry::default();
    let (factory_gate, factory_log) = (Arc::clone(&gate), Arc::clone(&log));
    drivers.register(MOCK, move || {
        Box::new(MockDriver {
            gate: Arc::clone(&factory_gate),
            log: Arc::clone(&factory_log),
            connected: false,
            pending: VecDeque::new(),
            last_error: (0, String::new()),
        })
    });
    (Engine::with_drivers(config, drivers), MockBackend { gate, log })
}

pub fn connect_mock(engine: &Engine, owner: OwnerId) -> HandlerId {
    engine
        .connect(owner, MOCK, &ConnectParams::default())
        .expect("mock connect")
}

pub fn connect_sqlite(engine: &Engine, owner: OwnerId, database: &str) -> HandlerId {
    let params = ConnectParams {
        database: database.to_string(),
        ..ConnectParams::default()
    };
    engine
        .connect(owner, BackendKind::SQLITE, &params)
        .expect("sqlite connect")
}

/// Polls until `done` holds or a few seconds pass.
pub fn eventually(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}
