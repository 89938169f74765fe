//! LUN state machine
//!
//! A [`Lun`] owns its continuation queue, the peripheral session used to
//! reach its backing device, its worker threads and its completion
//! context. Its configuration state moves through:
//!
//! ```text
//! Unconfigured ──open ok──▶ Ready ──destroy──▶ Waiting ──drained──▶ (removed)
//!      │                      ▲                   │
//!      └──open failed──▶ ConfigError              └──timeout──▶ Ready
//! ```
//!
//! Only the registry and the drain operation change the state; workers
//! only move commands through the queue.

use crate::command::{CommandDescriptor, CommandResult};
use crate::error::{BackendError, BackendResult, SubmitError};
use crate::peripheral::{CompletionSink, Peripheral, PeripheralSession, PeripheralStatus};
use crate::queue::ContinuationQueue;
use crate::token::Token;
use crate::target::{CapacityDescriptor, TargetCore};
use crate::worker::{self, CompletionContext};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Smallest supported logical block size
pub const MIN_BLOCK_SIZE: u32 = 512;
/// Largest supported logical block size
pub const MAX_BLOCK_SIZE: u32 = 65536;

/// LUN number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LunId(pub u32);

impl fmt::Display for LunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration state of a LUN
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LunState {
    /// Created, peripheral session not yet open
    Unconfigured,
    /// Peripheral session could not be set up; accepts no I/O
    ConfigError(String),
    /// Normal operation
    Ready,
    /// Teardown in progress; no new work, existing work draining
    Waiting,
}

impl LunState {
    pub fn name(&self) -> &'static str {
        match self {
            LunState::Unconfigured => "unconfigured",
            LunState::ConfigError(_) => "config-error",
            LunState::Ready => "ready",
            LunState::Waiting => "waiting",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, LunState::Ready)
    }
}

impl fmt::Display for LunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LunState::ConfigError(reason) => write!(f, "config-error ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// Creation parameters for a LUN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LunParams {
    /// Requested LUN number; the registry picks one when `None`
    pub id: Option<LunId>,
    pub name: String,
    pub size_blocks: u64,
    pub block_size: u32,
    /// Worker threads draining the queue
    pub threads: usize,
    /// Limit on dispatched-but-unresolved commands (defaults to `threads`)
    pub queue_depth: Option<usize>,
    /// Identifier the peripheral resolves to a backing device
    pub backing_id: String,
}

impl LunParams {
    pub fn builder() -> LunParamsBuilder {
        LunParamsBuilder::new()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.unwrap_or(self.threads)
    }

    /// Check the parameters, allowing at most `max_threads` workers
    pub fn validate(&self, max_threads: usize) -> BackendResult<()> {
        if self.size_blocks == 0 {
            return Err(BackendError::Config("size must be non-zero".to_string()));
        }
        if !self.block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
        {
            return Err(BackendError::Config(format!(
                "invalid block size {} (power of two in {}..={})",
                self.block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        if self.threads == 0 || self.threads > max_threads {
            return Err(BackendError::Config(format!(
                "thread count {} out of range 1..={}",
                self.threads, max_threads
            )));
        }
        if self.queue_depth() == 0 {
            return Err(BackendError::Config("queue depth must be non-zero".to_string()));
        }
        if self.backing_id.is_empty() {
            return Err(BackendError::Config("backing device identifier required".to_string()));
        }
        Ok(())
    }
}

/// Builder for [`LunParams`]
#[derive(Debug, Default)]
pub struct LunParamsBuilder {
    id: Option<LunId>,
    name: Option<String>,
    size_blocks: u64,
    block_size: Option<u32>,
    threads: Option<usize>,
    queue_depth: Option<usize>,
    backing_id: String,
}

impl LunParamsBuilder {
    fn new() -> Self {
        Self::default()
    }

    /// Request a specific LUN number
    pub fn id(mut self, id: u32) -> Self {
        self.id = Some(LunId(id));
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Size in logical blocks
    pub fn size_blocks(mut self, blocks: u64) -> Self {
        self.size_blocks = blocks;
        self
    }

    /// Block size in bytes (default: 512)
    pub fn block_size(mut self, size: u32) -> Self {
        self.block_size = Some(size);
        self
    }

    /// Worker thread count (default: 1)
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = Some(depth);
        self
    }

    pub fn backing_id(mut self, id: &str) -> Self {
        self.backing_id = id.to_string();
        self
    }

    pub fn build(self) -> BackendResult<LunParams> {
        let params = LunParams {
            id: self.id,
            name: self.name.unwrap_or_else(|| self.backing_id.clone()),
            size_blocks: self.size_blocks,
            block_size: self.block_size.unwrap_or(MIN_BLOCK_SIZE),
            threads: self.threads.unwrap_or(1),
            queue_depth: self.queue_depth,
            backing_id: self.backing_id,
        };
        params.validate(usize::MAX)?;
        Ok(params)
    }
}

/// Snapshot of a LUN for the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LunStatus {
    pub id: LunId,
    pub name: String,
    pub state: LunState,
    /// Commands dispatched to the peripheral and not yet resolved
    pub outstanding: usize,
    /// Commands waiting for a worker
    pub queued: usize,
    pub size_blocks: u64,
    pub block_size: u32,
    pub backing_id: String,
}

impl fmt::Display for LunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lun={} name={} state={} outstanding={} queued={} size={} blocksize={} backing={}",
            self.id,
            self.name,
            self.state,
            self.outstanding,
            self.queued,
            self.size_blocks,
            self.block_size,
            self.backing_id
        )
    }
}

/// State guarded by the per-LUN lock
#[derive(Debug)]
pub(crate) struct LunShared {
    pub(crate) state: LunState,
    pub(crate) queue: ContinuationQueue,
    /// Workers that have not yet decided to exit
    pub(crate) live_workers: usize,
}

/// Shared handle to a LUN
pub type LunHandle = Arc<Lun>;

/// A virtual logical unit backed by a peripheral session
pub struct Lun {
    id: LunId,
    params: LunParams,
    core: Arc<dyn TargetCore>,
    shared: Mutex<LunShared>,
    /// Signalled when work arrives, a dispatch slot frees, or the state changes
    work_ready: Condvar,
    /// Signalled when the queue becomes idle
    idle: Condvar,
    session: Mutex<Option<Arc<dyn PeripheralSession>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    completion: Mutex<Option<CompletionContext>>,
    /// Held for the whole of a destroy attempt, including the respawn after
    /// a timed-out drain
    teardown: Mutex<()>,
    next_worker: AtomicUsize,
}

impl fmt::Debug for Lun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lun")
            .field("id", &self.id)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Lun {
    pub(crate) fn new(id: LunId, mut params: LunParams, core: Arc<dyn TargetCore>) -> LunHandle {
        params.id = Some(id);
        Arc::new(Lun {
            id,
            params,
            core,
            shared: Mutex::new(LunShared {
                state: LunState::Unconfigured,
                queue: ContinuationQueue::new(id),
                live_workers: 0,
            }),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
            session: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            completion: Mutex::new(None),
            teardown: Mutex::new(()),
            next_worker: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> LunId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn params(&self) -> &LunParams {
        &self.params
    }

    pub fn state(&self) -> LunState {
        self.lock_shared().state.clone()
    }

    pub fn status(&self) -> LunStatus {
        let shared = self.lock_shared();
        LunStatus {
            id: self.id,
            name: self.params.name.clone(),
            state: shared.state.clone(),
            outstanding: shared.queue.outstanding(),
            queued: shared.queue.queued(),
            size_blocks: self.params.size_blocks,
            block_size: self.params.block_size,
            backing_id: self.params.backing_id.clone(),
        }
    }

    pub fn capacity(&self) -> CapacityDescriptor {
        CapacityDescriptor {
            lun: self.id,
            name: self.params.name.clone(),
            blocks: self.params.size_blocks,
            block_size: self.params.block_size,
        }
    }

    /// Queue a command for dispatch
    ///
    /// Never blocks. Fails with `NotReady` unless the LUN is `Ready`, handing
    /// the descriptor back inside the error.
    pub fn submit(&self, desc: CommandDescriptor) -> Result<Token, SubmitError> {
        let tag = desc.tag();
        let cdb = if log::log_enabled!(log::Level::Debug) {
            hex::encode(desc.cdb())
        } else {
            String::new()
        };

        let mut shared = self.lock_shared();
        if !shared.state.is_ready() {
            let state = shared.state.name();
            drop(shared);
            log::debug!("LUN {}: refused tag {} while {}", self.id, tag, state);
            return Err(SubmitError::new(BackendError::NotReady(self.id), desc));
        }
        let token = shared.queue.push(desc);
        self.work_ready.notify_one();
        drop(shared);

        log::debug!("LUN {}: queued tag {} as {} cdb={}", self.id, tag, token, cdb);
        Ok(token)
    }

    /// Resolve a dispatched command from a peripheral completion
    ///
    /// A token that is unknown, stale or already resolved is reported as a
    /// `ProtocolViolation` and otherwise ignored.
    pub fn on_complete(
        &self,
        token: Token,
        status: PeripheralStatus,
        bytes_transferred: usize,
    ) -> BackendResult<()> {
        log::trace!(
            "LUN {}: completion {} status={:?} bytes={}",
            self.id,
            token,
            status,
            bytes_transferred
        );
        let result = CommandResult::new(status.into(), bytes_transferred);
        self.resolve(token, result).map_err(|err| {
            log::warn!("LUN {}: discarding completion: {}", self.id, err);
            err
        })
    }

    /// Resolve `token` under the lock, then report it to the core
    pub(crate) fn resolve(&self, token: Token, result: CommandResult) -> BackendResult<()> {
        let desc = {
            let mut shared = self.lock_shared();
            let desc = shared.queue.resolve(token, result.clone())?;
            self.work_ready.notify_all();
            if shared.queue.is_idle() {
                self.idle.notify_all();
            }
            desc
        };
        self.core.complete(desc, result);
        Ok(())
    }

    pub(crate) fn lock_shared(&self) -> MutexGuard<'_, LunShared> {
        lock(&self.shared)
    }

    /// Block until `work_ready` is signalled
    pub(crate) fn wait_for_work<'a>(
        &self,
        guard: MutexGuard<'a, LunShared>,
    ) -> MutexGuard<'a, LunShared> {
        self.work_ready
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wake_workers(&self) {
        self.work_ready.notify_all();
    }

    /// Open the peripheral session and start the workers
    ///
    /// The LUN stays `Unconfigured` until [`Lun::publish`], so a destroy
    /// racing with creation is refused with `Busy`. On failure the LUN is
    /// left in `ConfigError` with every resource it acquired released.
    pub(crate) fn configure(self: &Arc<Self>, peripheral: &dyn Peripheral) -> BackendResult<()> {
        let (tx, rx) = mpsc::channel();
        let sink = CompletionSink::new(self.id, tx.clone());

        let session: Arc<dyn PeripheralSession> =
            match peripheral.open(&self.params.backing_id, sink) {
                Ok(session) => Arc::from(session),
                Err(err) => {
                    return Err(self.config_failed(format!(
                        "cannot open backing device {}: {}",
                        self.params.backing_id, err
                    )));
                }
            };

        if let Err(reason) = self.check_geometry(session.as_ref()) {
            session.close();
            return Err(self.config_failed(reason));
        }

        let completion = match CompletionContext::spawn(Arc::clone(self), tx, rx) {
            Ok(ctx) => ctx,
            Err(err) => {
                session.close();
                return Err(self.config_failed(format!("cannot start completion context: {}", err)));
            }
        };
        *lock(&self.completion) = Some(completion);
        *lock(&self.session) = Some(session);

        // Workers park while the LUN is still Unconfigured
        if let Err(err) = self.ensure_workers() {
            let err = self.config_failed(err.to_string());
            self.release();
            return Err(err);
        }
        Ok(())
    }

    /// Move a configured LUN to `Ready`
    ///
    /// Called once the core knows about the LUN.
    pub(crate) fn publish(&self) {
        {
            let mut shared = self.lock_shared();
            if shared.state != LunState::Unconfigured {
                return;
            }
            shared.state = LunState::Ready;
        }
        self.wake_workers();
        log::info!(
            "LUN {} ({}) ready: {} blocks of {} bytes on {}, {} worker(s), depth {}",
            self.id,
            self.params.name,
            self.params.size_blocks,
            self.params.block_size,
            self.params.backing_id,
            self.params.threads,
            self.params.queue_depth()
        );
    }

    fn check_geometry(&self, session: &dyn PeripheralSession) -> Result<(), String> {
        let Some(geometry) = session.geometry() else {
            return Ok(());
        };
        if geometry.block_size != self.params.block_size {
            return Err(format!(
                "backing {} block size {} disagrees with configured {}",
                self.params.backing_id, geometry.block_size, self.params.block_size
            ));
        }
        if self.params.size_blocks > geometry.blocks {
            return Err(format!(
                "backing {} holds {} blocks, {} requested",
                self.params.backing_id, geometry.blocks, self.params.size_blocks
            ));
        }
        Ok(())
    }

    fn config_failed(&self, reason: String) -> BackendError {
        log::warn!("LUN {}: configuration failed: {}", self.id, reason);
        self.lock_shared().state = LunState::ConfigError(reason.clone());
        self.wake_workers();
        BackendError::Config(reason)
    }

    /// Spawn workers until `threads` are live
    fn ensure_workers(self: &Arc<Self>) -> BackendResult<()> {
        let session = lock(&self.session)
            .clone()
            .ok_or_else(|| BackendError::Config("no peripheral session".to_string()))?;

        let missing = {
            let mut shared = self.lock_shared();
            let missing = self.params.threads.saturating_sub(shared.live_workers);
            shared.live_workers += missing;
            missing
        };

        let mut workers = lock(&self.workers);
        workers.retain(|handle| !handle.is_finished());
        for spawned in 0..missing {
            let index = self.next_worker.fetch_add(1, Ordering::Relaxed);
            match worker::spawn_worker(Arc::clone(self), Arc::clone(&session), index) {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    self.lock_shared().live_workers -= missing - spawned;
                    return Err(BackendError::Config(format!("cannot spawn worker: {}", err)));
                }
            }
        }
        Ok(())
    }

    /// Stop accepting work and wait until nothing is queued or in flight
    ///
    /// Returns whether the LUN was serving (and so known to the core). On
    /// timeout the LUN goes back to `Ready`, any worker that exited
    /// meanwhile is replaced, and `Busy` is returned. Callers hold the
    /// teardown guard.
    fn drain(self: &Arc<Self>, timeout: Duration) -> BackendResult<bool> {
        let mut shared = self.lock_shared();
        match &shared.state {
            LunState::Ready => {}
            LunState::ConfigError(_) => return Ok(false),
            LunState::Unconfigured | LunState::Waiting => {
                return Err(BackendError::Busy {
                    lun: self.id,
                    outstanding: shared.queue.outstanding() + shared.queue.queued(),
                });
            }
        }
        shared.state = LunState::Waiting;
        log::debug!(
            "LUN {}: draining {} queued, {} outstanding",
            self.id,
            shared.queue.queued(),
            shared.queue.outstanding()
        );
        self.work_ready.notify_all();

        let (mut shared, _) = self
            .idle
            .wait_timeout_while(shared, timeout, |shared| !shared.queue.is_idle())
            .unwrap_or_else(PoisonError::into_inner);
        if shared.queue.is_idle() {
            log::debug!("LUN {}: drained", self.id);
            return Ok(true);
        }

        let outstanding = shared.queue.outstanding() + shared.queue.queued();
        shared.state = LunState::Ready;
        self.work_ready.notify_all();
        drop(shared);

        log::warn!(
            "LUN {}: drain timed out after {:?} with {} command(s) unresolved",
            self.id,
            timeout,
            outstanding
        );
        if let Err(err) = self.ensure_workers() {
            log::error!("LUN {}: cannot restore workers: {}", self.id, err);
        }
        Err(BackendError::Busy {
            lun: self.id,
            outstanding,
        })
    }

    /// Drain, then release every resource the LUN holds
    ///
    /// Returns whether the LUN had been registered with the core. Only one
    /// teardown runs at a time; a concurrent attempt gets `Busy` at once.
    pub(crate) fn teardown(self: &Arc<Self>, timeout: Duration) -> BackendResult<bool> {
        let _guard = match self.teardown.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                let shared = self.lock_shared();
                return Err(BackendError::Busy {
                    lun: self.id,
                    outstanding: shared.queue.outstanding() + shared.queue.queued(),
                });
            }
        };
        let registered = self.drain(timeout)?;
        self.release();
        Ok(registered)
    }

    /// Join workers, close the session and stop the completion context
    fn release(&self) {
        {
            let _shared = self.lock_shared();
            self.work_ready.notify_all();
        }

        let workers = std::mem::take(&mut *lock(&self.workers));
        for handle in workers {
            if handle.join().is_err() {
                log::error!("LUN {}: worker thread panicked", self.id);
            }
        }

        if let Some(session) = lock(&self.session).take() {
            session.close();
        }
        if let Some(completion) = lock(&self.completion).take() {
            completion.stop();
        }
        log::debug!("LUN {}: resources released", self.id);
    }
}
