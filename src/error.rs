//! Error types for passthrough backend operations

use crate::command::CommandDescriptor;
use crate::lun::LunId;
use crate::scsi::SenseData;
use thiserror::Error;

/// Passthrough backend errors
#[derive(Debug, Error)]
pub enum BackendError {
    /// Parameters rejected or backing resource unreachable at creation time
    #[error("Configuration error: {0}")]
    Config(String),

    /// Command submitted against a LUN that is not `Ready`
    #[error("LUN {0} not available")]
    NotReady(LunId),

    /// Destroy requested but the drain did not finish in time
    #[error("LUN {lun} busy: {outstanding} command(s) still unresolved")]
    Busy { lun: LunId, outstanding: usize },

    /// Completion for an unknown or already-resolved token
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Unknown LUN {0}")]
    UnknownLun(LunId),

    /// Malformed control-plane request
    #[error("Control error: {0}")]
    Control(String),
}

/// Errors reported by a peripheral driver
#[derive(Debug, Clone, Error)]
pub enum PeripheralError {
    #[error("backing device {0} not found")]
    NotFound(String),

    #[error("session lost: {0}")]
    SessionLost(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

/// A refused submission; ownership of the descriptor returns to the caller
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SubmitError {
    pub error: BackendError,
    descriptor: CommandDescriptor,
}

impl SubmitError {
    pub(crate) fn new(error: BackendError, descriptor: CommandDescriptor) -> Self {
        SubmitError { error, descriptor }
    }

    pub fn descriptor(&self) -> &CommandDescriptor {
        &self.descriptor
    }

    pub fn into_descriptor(self) -> CommandDescriptor {
        self.descriptor
    }

    /// Sense data a core can return to the initiator for the refused command
    pub fn sense(&self) -> SenseData {
        SenseData::lun_not_available()
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;
