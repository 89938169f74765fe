//! A SCSI target passthrough backend
//!
//! This library exposes backing devices reached through a peripheral driver
//! as virtual logical units. The target core submits already-decoded
//! command descriptors; the backend queues them per LUN, dispatches them to
//! the peripheral from a bounded pool of worker threads, and hands each one
//! back to the core with its result once the peripheral reports completion.
//!
//! Users implement [`Peripheral`] for their transport and [`TargetCore`]
//! for their command front end.
//!
//! # Example
//!
//! ```no_run
//! use scsi_passthrough::{
//!     ChannelCore, CommandDescriptor, CoreEvent, LunParams, MemoryPeripheral,
//!     PassthroughBackend,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let peripheral = Arc::new(MemoryPeripheral::new());
//! peripheral.add_device("mem0", 2048, 512);
//!
//! let (core, events) = ChannelCore::new();
//! let backend = PassthroughBackend::builder().build(peripheral, Arc::new(core))?;
//!
//! let lun = backend.create_lun(
//!     LunParams::builder()
//!         .name("disk0")
//!         .size_blocks(2048)
//!         .block_size(512)
//!         .threads(2)
//!         .backing_id("mem0")
//!         .build()?,
//! )?;
//!
//! // TEST UNIT READY
//! backend.submit(lun.id(), CommandDescriptor::new(1, &[0u8; 6]))?;
//! for event in events.iter() {
//!     if let CoreEvent::Completed(desc, result) = event {
//!         println!("tag {} -> {:?}", desc.tag(), result.status);
//!         break;
//!     }
//! }
//!
//! backend.destroy_lun(lun.id(), None)?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod command;
pub mod control;
pub mod error;
pub mod lun;
pub mod memory;
pub mod peripheral;
pub mod queue;
pub mod scsi;
pub mod target;
pub mod token;
mod worker;

pub use backend::{BackendConfig, PassthroughBackend, PassthroughBackendBuilder};
pub use command::{CommandDescriptor, CommandResult, CommandState, DataBuffer, DataDirection};
pub use control::{ControlCommand, ControlReply};
pub use error::{BackendError, BackendResult, PeripheralError, SubmitError};
pub use lun::{Lun, LunHandle, LunId, LunParams, LunState, LunStatus};
pub use memory::MemoryPeripheral;
pub use peripheral::{
    CompletionSink, DeviceGeometry, Peripheral, PeripheralRequest, PeripheralSession,
    PeripheralStatus,
};
pub use scsi::{CommandStatus, SenseData};
pub use target::{CapacityDescriptor, ChannelCore, CoreEvent, TargetCore};
pub use token::Token;

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
