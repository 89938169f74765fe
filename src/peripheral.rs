//! Interface to the peripheral/transport driver behind each LUN
//!
//! The backend opens one session per LUN, issues requests on it from
//! worker threads, and receives completions through a [`CompletionSink`]
//! the peripheral may call from any thread it likes.

use crate::command::{CommandDescriptor, DataBuffer, DataDirection};
use crate::error::PeripheralError;
use crate::lun::LunId;
use crate::scsi::{CommandStatus, SenseData};
use crate::token::Token;
use crate::worker::InboxMessage;
use std::sync::mpsc::Sender;

/// Request handed to the peripheral for one dispatched command
#[derive(Debug, Clone)]
pub struct PeripheralRequest {
    pub token: Token,
    /// Core tag, carried for diagnostics only
    pub tag: u64,
    pub cdb: Vec<u8>,
    pub direction: DataDirection,
    pub buffer: DataBuffer,
    pub transfer_length: usize,
}

impl PeripheralRequest {
    pub(crate) fn from_descriptor(token: Token, desc: &CommandDescriptor) -> Self {
        PeripheralRequest {
            token,
            tag: desc.tag(),
            cdb: desc.cdb().to_vec(),
            direction: desc.direction(),
            buffer: desc.buffer().clone(),
            transfer_length: desc.transfer_length(),
        }
    }
}

/// Outcome of a request as reported by the peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralStatus {
    Ok,
    CheckCondition(SenseData),
    Failed(String),
    Aborted,
}

impl From<PeripheralStatus> for CommandStatus {
    fn from(status: PeripheralStatus) -> Self {
        match status {
            PeripheralStatus::Ok => CommandStatus::Good,
            PeripheralStatus::CheckCondition(sense) => CommandStatus::CheckCondition(sense),
            PeripheralStatus::Failed(reason) => CommandStatus::IoError(reason),
            PeripheralStatus::Aborted => CommandStatus::Aborted,
        }
    }
}

/// Geometry of a backing device, when the peripheral knows it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGeometry {
    pub blocks: u64,
    pub block_size: u32,
}

/// Peripheral/transport driver
pub trait Peripheral: Send + Sync {
    /// Open a session to the backing device named `backing_id`
    ///
    /// Completions for requests issued on the session must be posted
    /// through `sink`.
    fn open(
        &self,
        backing_id: &str,
        sink: CompletionSink,
    ) -> Result<Box<dyn PeripheralSession>, PeripheralError>;
}

/// An open session to one backing device
pub trait PeripheralSession: Send + Sync {
    /// Issue a request
    ///
    /// May block, or return at once and complete later through the sink.
    /// An `Err` means the request was never accepted; no completion will
    /// follow for it.
    fn issue(&self, request: PeripheralRequest) -> Result<(), PeripheralError>;

    fn geometry(&self) -> Option<DeviceGeometry> {
        None
    }

    /// Release the session; no requests are issued after this call
    fn close(&self);
}

/// Posts peripheral completions into a LUN's inbox
#[derive(Debug, Clone)]
pub struct CompletionSink {
    lun: LunId,
    inbox: Sender<InboxMessage>,
}

impl CompletionSink {
    pub(crate) fn new(lun: LunId, inbox: Sender<InboxMessage>) -> Self {
        CompletionSink { lun, inbox }
    }

    pub fn lun(&self) -> LunId {
        self.lun
    }

    /// Report that the request addressed by `token` finished
    pub fn complete(&self, token: Token, status: PeripheralStatus, bytes_transferred: usize) {
        let message = InboxMessage::Complete {
            token,
            status,
            bytes_transferred,
        };
        if self.inbox.send(message).is_err() {
            log::warn!(
                "LUN {}: completion for token {} arrived after teardown, discarded",
                self.lun,
                token
            );
        }
    }
}
