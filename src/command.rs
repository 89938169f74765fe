//! Command descriptors flowing between the target core and the backend

use crate::lun::LunId;
use crate::scsi::CommandStatus;
use crate::token::Token;
use std::sync::{Arc, Mutex};

/// Data buffer shared between the core and the backend
///
/// The core owns the allocation; the backend and the peripheral only read
/// from or write into it while the command is in flight.
pub type DataBuffer = Arc<Mutex<Vec<u8>>>;

/// Direction of the data phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataDirection {
    #[default]
    None,
    /// Initiator to device (WRITE)
    ToDevice,
    /// Device to initiator (READ)
    FromDevice,
}

/// Lifecycle of a command inside the backend
///
/// Transitions only move forward: `Queued` → `Dispatched` → `Completed`
/// or `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CommandState {
    Queued,
    Dispatched,
    Completed,
    Cancelled,
}

impl CommandState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandState::Completed | CommandState::Cancelled)
    }
}

/// Result attached to a command on its terminal transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub status: CommandStatus,
    pub bytes_transferred: usize,
}

impl CommandResult {
    pub fn new(status: CommandStatus, bytes_transferred: usize) -> Self {
        CommandResult {
            status,
            bytes_transferred,
        }
    }
}

/// One SCSI command moving through the backend
#[derive(Debug)]
pub struct CommandDescriptor {
    tag: u64,
    cdb: Vec<u8>,
    direction: DataDirection,
    buffer: DataBuffer,
    transfer_length: usize,
    lun: Option<LunId>,
    token: Option<Token>,
    state: CommandState,
    result: Option<CommandResult>,
}

impl CommandDescriptor {
    /// Create a command with no data phase
    ///
    /// `tag` is the core's identifier for the command; the backend echoes
    /// it back untouched and never interprets it.
    pub fn new(tag: u64, cdb: &[u8]) -> Self {
        CommandDescriptor {
            tag,
            cdb: cdb.to_vec(),
            direction: DataDirection::None,
            buffer: Arc::new(Mutex::new(Vec::new())),
            transfer_length: 0,
            lun: None,
            token: None,
            state: CommandState::Queued,
            result: None,
        }
    }

    /// Attach a buffer carrying data to the device
    pub fn with_data_out(mut self, buffer: DataBuffer) -> Self {
        self.transfer_length = buffer.lock().map(|b| b.len()).unwrap_or_default();
        self.direction = DataDirection::ToDevice;
        self.buffer = buffer;
        self
    }

    /// Attach a buffer that receives `length` bytes from the device
    pub fn with_data_in(mut self, buffer: DataBuffer, length: usize) -> Self {
        self.direction = DataDirection::FromDevice;
        self.buffer = buffer;
        self.transfer_length = length;
        self
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn cdb(&self) -> &[u8] {
        &self.cdb
    }

    pub fn direction(&self) -> DataDirection {
        self.direction
    }

    pub fn buffer(&self) -> &DataBuffer {
        &self.buffer
    }

    pub fn transfer_length(&self) -> usize {
        self.transfer_length
    }

    /// LUN the command was submitted to, once accepted
    pub fn lun(&self) -> Option<LunId> {
        self.lun
    }

    /// Backend token, once accepted
    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    /// Result, populated on the terminal transition
    pub fn result(&self) -> Option<&CommandResult> {
        self.result.as_ref()
    }

    pub(crate) fn bind(&mut self, lun: LunId, token: Token) {
        self.lun = Some(lun);
        self.token = Some(token);
        self.state = CommandState::Queued;
    }

    pub(crate) fn mark_dispatched(&mut self) {
        debug_assert_eq!(self.state, CommandState::Queued);
        self.state = CommandState::Dispatched;
    }

    /// Move to the terminal state matching `result`
    pub(crate) fn finish(&mut self, result: CommandResult) {
        debug_assert!(!self.state.is_terminal());
        self.state = match result.status {
            CommandStatus::Aborted => CommandState::Cancelled,
            _ => CommandState::Completed,
        };
        self.result = Some(result);
    }
}
