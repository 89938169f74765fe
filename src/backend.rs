//! Passthrough backend: the LUN registry
//!
//! The registry is the only component that creates or removes LUNs. Its
//! lock guards the id → LUN map alone and is only ever held for lookups
//! and insertions; peripheral calls, drains and core callbacks all happen
//! with it released. When both locks are needed the registry lock is taken
//! first.

use crate::command::CommandDescriptor;
use crate::error::{BackendError, BackendResult, SubmitError};
use crate::lun::{lock, Lun, LunHandle, LunId, LunParams, LunStatus};
use crate::peripheral::Peripheral;
use crate::token::Token;
use crate::target::TargetCore;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Backend-wide settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Drain timeout used when `destroy_lun` is given none
    pub default_drain_timeout: Duration,
    /// Number of LUN ids available (ids are `0..max_luns`)
    pub max_luns: u32,
    pub max_threads_per_lun: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            default_drain_timeout: Duration::from_secs(5),
            max_luns: 1024,
            max_threads_per_lun: 64,
        }
    }
}

/// Passthrough backend
pub struct PassthroughBackend {
    config: BackendConfig,
    peripheral: Arc<dyn Peripheral>,
    core: Arc<dyn TargetCore>,
    luns: Mutex<BTreeMap<LunId, LunHandle>>,
}

impl PassthroughBackend {
    /// Create a new builder for configuring the backend
    pub fn builder() -> PassthroughBackendBuilder {
        PassthroughBackendBuilder::new()
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Create a LUN and open its peripheral session
    ///
    /// The id is reserved in the registry (state `Unconfigured`) before the
    /// session is opened. If the session cannot be set up the LUN stays
    /// registered in `ConfigError` so its failure can be queried, and the
    /// error is returned.
    pub fn create_lun(&self, params: LunParams) -> BackendResult<LunHandle> {
        params.validate(self.config.max_threads_per_lun)?;

        let lun = {
            let mut luns = lock(&self.luns);
            let id = match params.id {
                Some(id) if id.0 >= self.config.max_luns => {
                    return Err(BackendError::Config(format!(
                        "LUN {} out of range 0..{}",
                        id, self.config.max_luns
                    )));
                }
                Some(id) if luns.contains_key(&id) => {
                    return Err(BackendError::Config(format!("LUN {} already exists", id)));
                }
                Some(id) => id,
                None => Self::free_id(&luns, self.config.max_luns).ok_or_else(|| {
                    BackendError::Config(format!("all {} LUN ids in use", self.config.max_luns))
                })?,
            };
            let lun = Lun::new(id, params, Arc::clone(&self.core));
            luns.insert(id, Arc::clone(&lun));
            lun
        };

        lun.configure(self.peripheral.as_ref())?;
        // Still Unconfigured here, so a racing destroy gets Busy and the
        // core never sees an unregister before this register
        self.core.register_lun(lun.id(), &lun.capacity());
        lun.publish();
        Ok(lun)
    }

    fn free_id(luns: &BTreeMap<LunId, LunHandle>, max_luns: u32) -> Option<LunId> {
        (0..max_luns).map(LunId).find(|id| !luns.contains_key(id))
    }

    /// Drain and remove a LUN
    ///
    /// Fails with `Busy` if commands are still unresolved when `timeout`
    /// (or the configured default) elapses; the LUN then stays `Ready`.
    pub fn destroy_lun(&self, id: LunId, timeout: Option<Duration>) -> BackendResult<()> {
        let lun = self.lookup(id).ok_or(BackendError::UnknownLun(id))?;
        let registered = lun.teardown(timeout.unwrap_or(self.config.default_drain_timeout))?;

        lock(&self.luns).remove(&id);
        if registered {
            self.core.unregister_lun(id);
        }
        log::info!("LUN {} ({}) destroyed", id, lun.name());
        Ok(())
    }

    pub fn lookup(&self, id: LunId) -> Option<LunHandle> {
        lock(&self.luns).get(&id).cloned()
    }

    /// Submit a command from the core to a LUN
    ///
    /// Unknown LUNs and LUNs not in `Ready` both refuse with `NotReady`.
    pub fn submit(&self, id: LunId, desc: CommandDescriptor) -> Result<Token, SubmitError> {
        match self.lookup(id) {
            Some(lun) => lun.submit(desc),
            None => Err(SubmitError::new(BackendError::NotReady(id), desc)),
        }
    }

    pub fn lun_status(&self, id: LunId) -> Option<LunStatus> {
        self.lookup(id).map(|lun| lun.status())
    }

    /// Status of every LUN, ordered by id
    pub fn list_luns(&self) -> Vec<LunStatus> {
        let luns: Vec<LunHandle> = lock(&self.luns).values().cloned().collect();
        luns.iter().map(|lun| lun.status()).collect()
    }

    /// Destroy every LUN, returning the ids that could not be drained
    pub fn shutdown(&self, timeout: Duration) -> Vec<LunId> {
        let ids: Vec<LunId> = lock(&self.luns).keys().copied().collect();
        let mut busy = Vec::new();
        for id in ids {
            match self.destroy_lun(id, Some(timeout)) {
                Ok(()) | Err(BackendError::UnknownLun(_)) => {}
                Err(err) => {
                    log::warn!("shutdown: {}", err);
                    busy.push(id);
                }
            }
        }
        busy
    }
}

/// Dropping the backend shuts every LUN down with the default drain timeout.
/// A LUN still busy after that is abandoned, not released: its session
/// stays open and its worker and completion threads stay parked for the
/// life of the process, each holding a reference to the LUN. Call
/// [`PassthroughBackend::shutdown`] first to find and retry such LUNs.
impl Drop for PassthroughBackend {
    fn drop(&mut self) {
        let busy = self.shutdown(self.config.default_drain_timeout);
        if !busy.is_empty() {
            log::error!("backend dropped with LUN(s) {:?} still busy", busy);
        }
    }
}

/// Builder for configuring a passthrough backend
pub struct PassthroughBackendBuilder {
    config: BackendConfig,
}

impl PassthroughBackendBuilder {
    fn new() -> Self {
        Self {
            config: BackendConfig::default(),
        }
    }

    /// Set the drain timeout used by `destroy_lun` (default: 5s)
    pub fn default_drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_drain_timeout = timeout;
        self
    }

    /// Set how many LUN ids are available (default: 1024)
    pub fn max_luns(mut self, max: u32) -> Self {
        self.config.max_luns = max;
        self
    }

    /// Set the worker limit per LUN (default: 64)
    pub fn max_threads_per_lun(mut self, max: usize) -> Self {
        self.config.max_threads_per_lun = max;
        self
    }

    /// Build the backend on top of a peripheral driver and a target core
    pub fn build(
        self,
        peripheral: Arc<dyn Peripheral>,
        core: Arc<dyn TargetCore>,
    ) -> BackendResult<PassthroughBackend> {
        if self.config.max_luns == 0 {
            return Err(BackendError::Config("max_luns must be non-zero".to_string()));
        }
        if self.config.max_threads_per_lun == 0 {
            return Err(BackendError::Config(
                "max_threads_per_lun must be non-zero".to_string(),
            ));
        }

        log::info!(
            "passthrough backend: {} LUN ids, up to {} workers per LUN, drain timeout {:?}",
            self.config.max_luns,
            self.config.max_threads_per_lun,
            self.config.default_drain_timeout
        );
        Ok(PassthroughBackend {
            config: self.config,
            peripheral,
            core,
            luns: Mutex::new(BTreeMap::new()),
        })
    }
}
