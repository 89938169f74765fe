//! Shared fixtures for the integration tests: configuration loading, a
//! scripted peripheral and helpers for reading core events.

#![allow(dead_code)]

use once_cell::sync::Lazy;
use rand::Rng;
use scsi_passthrough::{
    CapacityDescriptor, ChannelCore, CommandDescriptor, CommandResult, CompletionSink, CoreEvent,
    LunId, LunParams, PassthroughBackend, Peripheral, PeripheralError, PeripheralRequest,
    PeripheralSession, PeripheralStatus, TargetCore, Token,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// Test Configuration
// ============================================================================

#[derive(Debug)]
pub struct TestConfig {
    pub drain_timeout: Duration,
    pub max_luns: u32,
    pub size_blocks: u64,
    pub block_size: u32,
    pub threads: usize,
    pub stress_luns: usize,
    pub stress_submitters: usize,
    pub stress_commands: usize,
    pub max_completion_delay: Duration,
}

pub static TEST_CONFIG: Lazy<TestConfig> = Lazy::new(|| {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/test-config.toml");
    let contents = std::fs::read_to_string(path)
        .expect("Failed to read tests/test-config.toml - config file required");

    let config = contents
        .parse::<toml::Value>()
        .expect("Failed to parse tests/test-config.toml - invalid TOML syntax");

    let int = |section: &str, key: &str| -> i64 {
        config
            .get(section)
            .and_then(|s| s.get(key))
            .and_then(|v| v.as_integer())
            .unwrap_or_else(|| panic!("Missing or invalid '{}' in [{}] section", key, section))
    };

    TestConfig {
        drain_timeout: Duration::from_millis(int("backend", "drain_timeout_ms") as u64),
        max_luns: int("backend", "max_luns") as u32,
        size_blocks: int("lun", "size_blocks") as u64,
        block_size: int("lun", "block_size") as u32,
        threads: int("lun", "threads") as usize,
        stress_luns: int("stress", "luns") as usize,
        stress_submitters: int("stress", "submitters") as usize,
        stress_commands: int("stress", "commands_per_submitter") as usize,
        max_completion_delay: Duration::from_micros(int("stress", "max_completion_delay_us") as u64),
    }
});

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// LUN parameters from the shared config, on the given backing device
pub fn lun_params(backing: &str) -> LunParams {
    LunParams::builder()
        .name(backing)
        .size_blocks(TEST_CONFIG.size_blocks)
        .block_size(TEST_CONFIG.block_size)
        .threads(TEST_CONFIG.threads)
        .backing_id(backing)
        .build()
        .expect("test config holds valid LUN parameters")
}

pub fn backend_with(peripheral: Arc<dyn Peripheral>) -> (PassthroughBackend, Receiver<CoreEvent>) {
    let (core, events) = ChannelCore::new();
    (backend_with_core(peripheral, Arc::new(core)), events)
}

pub fn backend_with_core(peripheral: Arc<dyn Peripheral>, core: Arc<dyn TargetCore>) -> PassthroughBackend {
    init_logging();
    PassthroughBackend::builder()
        .default_drain_timeout(TEST_CONFIG.drain_timeout)
        .max_luns(TEST_CONFIG.max_luns)
        .build(peripheral, core)
        .expect("valid backend configuration")
}

/// TEST UNIT READY
pub fn tur(tag: u64) -> CommandDescriptor {
    CommandDescriptor::new(tag, &[0x00, 0, 0, 0, 0, 0])
}

/// Collect `n` completions, skipping registration events
pub fn completions(events: &Receiver<CoreEvent>, n: usize) -> Vec<(CommandDescriptor, CommandResult)> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut done = Vec::with_capacity(n);
    while done.len() < n {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(CoreEvent::Completed(desc, result)) => done.push((desc, result)),
            Ok(_) => {}
            Err(_) => panic!("timed out with {} of {} completions", done.len(), n),
        }
    }
    done
}

/// True if another completion shows up within `wait`
pub fn extra_completion(events: &Receiver<CoreEvent>, wait: Duration) -> bool {
    let deadline = Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(CoreEvent::Completed(..)) => return true,
            Ok(_) => {}
            Err(_) => return false,
        }
    }
}

/// Poll `cond` until it holds or ten seconds pass
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        thread::sleep(Duration::from_millis(2));
    }
}

// ============================================================================
// Gated Core
// ============================================================================

/// Target core that records its callbacks in order and can hold
/// `register_lun` until the test opens the gate
#[derive(Default)]
pub struct GatedCore {
    calls: Mutex<Vec<String>>,
    closed: Mutex<bool>,
    gate: Condvar,
    registering: AtomicUsize,
}

impl GatedCore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn close_gate(&self) {
        *self.closed.lock().unwrap() = true;
    }

    pub fn open_gate(&self) {
        *self.closed.lock().unwrap() = false;
        self.gate.notify_all();
    }

    /// Number of `register_lun` calls currently held at the gate
    pub fn registering(&self) -> usize {
        self.registering.load(Ordering::SeqCst)
    }

    /// Register/unregister calls seen so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl TargetCore for GatedCore {
    fn register_lun(&self, lun: LunId, _capacity: &CapacityDescriptor) {
        self.registering.fetch_add(1, Ordering::SeqCst);
        let closed = self.closed.lock().unwrap();
        drop(self.gate.wait_while(closed, |closed| *closed).unwrap());
        self.registering.fetch_sub(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(format!("register {}", lun));
    }

    fn unregister_lun(&self, lun: LunId) {
        self.calls.lock().unwrap().push(format!("unregister {}", lun));
    }

    fn complete(&self, _descriptor: CommandDescriptor, _result: CommandResult) {}
}

// ============================================================================
// Scripted Peripheral
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Complete from inside `issue`
    Immediate,
    /// Keep requests until the test releases them
    Hold,
    /// Complete from a fresh thread after a random delay
    Delayed,
}

/// A request the peripheral is holding on to
pub struct Held {
    pub sink: CompletionSink,
    pub token: Token,
    pub tag: u64,
}

#[derive(Default)]
struct Script {
    backing: HashSet<String>,
    mode: Mutex<Option<Mode>>,
    fail_tags: Mutex<HashSet<u64>>,
    abort_tags: Mutex<HashSet<u64>>,
    issued: Mutex<Vec<(LunId, u64)>>,
    held: Mutex<Vec<Held>>,
    in_flight: Mutex<HashSet<(LunId, Token)>>,
    duplicate_dispatches: AtomicUsize,
    issues_after_close: AtomicUsize,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

/// Peripheral stub whose behaviour the test scripts
#[derive(Clone)]
pub struct ScriptedPeripheral {
    script: Arc<Script>,
}

impl ScriptedPeripheral {
    pub fn new(backing: &[&str]) -> Self {
        let script = Script {
            backing: backing.iter().map(|s| s.to_string()).collect(),
            mode: Mutex::new(Some(Mode::Immediate)),
            ..Default::default()
        };
        ScriptedPeripheral {
            script: Arc::new(script),
        }
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.script.mode.lock().unwrap() = Some(mode);
    }

    /// Make `issue` fail synchronously for `tag`
    pub fn fail_tag(&self, tag: u64) {
        self.script.fail_tags.lock().unwrap().insert(tag);
    }

    /// Complete `tag` with an aborted status
    pub fn abort_tag(&self, tag: u64) {
        self.script.abort_tags.lock().unwrap().insert(tag);
    }

    /// Tags issued for `lun`, in issue order
    pub fn issued_tags(&self, lun: LunId) -> Vec<u64> {
        self.script
            .issued
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == lun)
            .map(|(_, tag)| *tag)
            .collect()
    }

    pub fn issued_count(&self) -> usize {
        self.script.issued.lock().unwrap().len()
    }

    pub fn held_count(&self) -> usize {
        self.script.held.lock().unwrap().len()
    }

    pub fn take_held(&self) -> Vec<Held> {
        std::mem::take(&mut *self.script.held.lock().unwrap())
    }

    /// Complete every held request successfully
    pub fn release_held(&self) {
        for held in self.take_held() {
            self.script
                .in_flight
                .lock()
                .unwrap()
                .remove(&(held.sink.lun(), held.token));
            held.sink.complete(held.token, PeripheralStatus::Ok, 0);
        }
    }

    /// Times a token was issued while a previous issue of it was unresolved
    pub fn duplicate_dispatches(&self) -> usize {
        self.script.duplicate_dispatches.load(Ordering::SeqCst)
    }

    pub fn issues_after_close(&self) -> usize {
        self.script.issues_after_close.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.script.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.script.closes.load(Ordering::SeqCst)
    }
}

impl Peripheral for ScriptedPeripheral {
    fn open(
        &self,
        backing_id: &str,
        sink: CompletionSink,
    ) -> Result<Box<dyn PeripheralSession>, PeripheralError> {
        if !self.script.backing.contains(backing_id) {
            return Err(PeripheralError::NotFound(backing_id.to_string()));
        }
        self.script.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            script: Arc::clone(&self.script),
            sink,
            closed: AtomicBool::new(false),
        }))
    }
}

struct ScriptedSession {
    script: Arc<Script>,
    sink: CompletionSink,
    closed: AtomicBool,
}

impl PeripheralSession for ScriptedSession {
    fn issue(&self, request: PeripheralRequest) -> Result<(), PeripheralError> {
        if self.closed.load(Ordering::SeqCst) {
            self.script.issues_after_close.fetch_add(1, Ordering::SeqCst);
            return Err(PeripheralError::SessionLost("session closed".to_string()));
        }

        let lun = self.sink.lun();
        self.script.issued.lock().unwrap().push((lun, request.tag));

        if self.script.fail_tags.lock().unwrap().contains(&request.tag) {
            return Err(PeripheralError::Rejected(format!("tag {}", request.tag)));
        }
        if self.script.abort_tags.lock().unwrap().contains(&request.tag) {
            self.sink.complete(request.token, PeripheralStatus::Aborted, 0);
            return Ok(());
        }

        if !self.script.in_flight.lock().unwrap().insert((lun, request.token)) {
            self.script.duplicate_dispatches.fetch_add(1, Ordering::SeqCst);
        }

        let mode = self.script.mode.lock().unwrap().unwrap_or(Mode::Immediate);
        match mode {
            Mode::Immediate => {
                self.script.in_flight.lock().unwrap().remove(&(lun, request.token));
                self.sink
                    .complete(request.token, PeripheralStatus::Ok, request.transfer_length);
            }
            Mode::Hold => self.script.held.lock().unwrap().push(Held {
                sink: self.sink.clone(),
                token: request.token,
                tag: request.tag,
            }),
            Mode::Delayed => {
                let max = TEST_CONFIG.max_completion_delay.as_micros() as u64;
                let delay = Duration::from_micros(rand::thread_rng().gen_range(0..=max));
                let sink = self.sink.clone();
                let script = Arc::clone(&self.script);
                thread::spawn(move || {
                    thread::sleep(delay);
                    script.in_flight.lock().unwrap().remove(&(lun, request.token));
                    sink.complete(request.token, PeripheralStatus::Ok, request.transfer_length);
                });
            }
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.script.closes.fetch_add(1, Ordering::SeqCst);
    }
}
