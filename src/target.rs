//! Interface to the target-emulation core
//!
//! The core decodes initiator commands, hands them to the backend as
//! [`CommandDescriptor`]s, and receives them back through
//! [`TargetCore::complete`] once resolved.

use crate::command::{CommandDescriptor, CommandResult};
use crate::lun::LunId;
use crate::scsi::{read_capacity_10_data, read_capacity_16_data};
use std::sync::mpsc::{self, Receiver, Sender};

/// Capacity advertised to the core when a LUN comes online
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityDescriptor {
    pub lun: LunId,
    pub name: String,
    pub blocks: u64,
    pub block_size: u32,
}

impl CapacityDescriptor {
    pub fn size_bytes(&self) -> u64 {
        self.blocks * self.block_size as u64
    }

    /// READ CAPACITY (10) parameter data for this LUN
    pub fn read_capacity_10(&self) -> Vec<u8> {
        read_capacity_10_data(self.blocks, self.block_size)
    }

    /// READ CAPACITY (16) parameter data for this LUN
    pub fn read_capacity_16(&self) -> Vec<u8> {
        read_capacity_16_data(self.blocks, self.block_size)
    }
}

/// Callbacks the backend makes into the target core
///
/// None of these are invoked with a backend lock held.
pub trait TargetCore: Send + Sync {
    /// A LUN is ready; commands may now be submitted to it
    fn register_lun(&self, lun: LunId, capacity: &CapacityDescriptor);

    /// A LUN has been torn down; no further completions will arrive for it
    fn unregister_lun(&self, lun: LunId);

    /// A command resolved; ownership of the descriptor returns to the core
    fn complete(&self, descriptor: CommandDescriptor, result: CommandResult);
}

/// Event forwarded by [`ChannelCore`]
#[derive(Debug)]
pub enum CoreEvent {
    Registered(CapacityDescriptor),
    Unregistered(LunId),
    Completed(CommandDescriptor, CommandResult),
}

/// A [`TargetCore`] that forwards every callback over a channel
///
/// Useful for embedding the backend behind an event loop, and for tests.
#[derive(Debug)]
pub struct ChannelCore {
    tx: Sender<CoreEvent>,
}

impl ChannelCore {
    pub fn new() -> (Self, Receiver<CoreEvent>) {
        let (tx, rx) = mpsc::channel();
        (ChannelCore { tx }, rx)
    }

    fn forward(&self, event: CoreEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("core event receiver dropped");
        }
    }
}

impl TargetCore for ChannelCore {
    fn register_lun(&self, _lun: LunId, capacity: &CapacityDescriptor) {
        self.forward(CoreEvent::Registered(capacity.clone()));
    }

    fn unregister_lun(&self, lun: LunId) {
        self.forward(CoreEvent::Unregistered(lun));
    }

    fn complete(&self, descriptor: CommandDescriptor, result: CommandResult) {
        self.forward(CoreEvent::Completed(descriptor, result));
    }
}
