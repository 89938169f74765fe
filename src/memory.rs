//! RAM-backed reference peripheral
//!
//! Serves block devices held in memory, keyed by backing id. Each open
//! session runs its own completion thread, so requests complete
//! asynchronously with respect to `issue`, the way a real transport
//! driver's interrupt path would.

use crate::command::DataDirection;
use crate::error::PeripheralError;
use crate::lun::lock;
use crate::peripheral::{
    CompletionSink, DeviceGeometry, Peripheral, PeripheralRequest, PeripheralSession,
    PeripheralStatus,
};
use crate::scsi::{parse_rw_cdb, read_capacity_10_data, ScsiOpcode, SenseData};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

struct MemoryDevice {
    block_size: u32,
    blocks: u64,
    data: RwLock<Vec<u8>>,
    online: AtomicBool,
}

impl MemoryDevice {
    fn execute(&self, request: &PeripheralRequest) -> (PeripheralStatus, usize) {
        let opcode = match request.cdb.first().copied().and_then(ScsiOpcode::from_u8) {
            Some(opcode) => opcode,
            None => {
                return (
                    PeripheralStatus::CheckCondition(SenseData::invalid_command()),
                    0,
                )
            }
        };

        match opcode {
            ScsiOpcode::TestUnitReady
            | ScsiOpcode::SynchronizeCache10
            | ScsiOpcode::SynchronizeCache16 => (PeripheralStatus::Ok, 0),
            ScsiOpcode::ReadCapacity10 => {
                let data = read_capacity_10_data(self.blocks, self.block_size);
                self.copy_in(request, &data)
            }
            ScsiOpcode::Read10 | ScsiOpcode::Read16 => self.read(request),
            ScsiOpcode::Write10 | ScsiOpcode::Write16 => self.write(request),
            ScsiOpcode::ServiceActionIn16 => (
                PeripheralStatus::CheckCondition(SenseData::invalid_command()),
                0,
            ),
        }
    }

    /// Byte range of a READ/WRITE, or the CHECK CONDITION to report
    fn extent(&self, request: &PeripheralRequest) -> Result<(usize, usize), PeripheralStatus> {
        let (lba, blocks) = parse_rw_cdb(&request.cdb)
            .ok_or_else(|| PeripheralStatus::CheckCondition(SenseData::invalid_command()))?;
        if lba.saturating_add(blocks as u64) > self.blocks {
            return Err(PeripheralStatus::CheckCondition(SenseData::lba_out_of_range(lba)));
        }
        let offset = (lba * self.block_size as u64) as usize;
        let len = blocks as usize * self.block_size as usize;
        Ok((offset, len))
    }

    fn read(&self, request: &PeripheralRequest) -> (PeripheralStatus, usize) {
        let (offset, len) = match self.extent(request) {
            Ok(extent) => extent,
            Err(status) => return (status, 0),
        };
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        let bytes = data[offset..offset + len].to_vec();
        drop(data);
        self.copy_in(request, &bytes)
    }

    fn write(&self, request: &PeripheralRequest) -> (PeripheralStatus, usize) {
        let (offset, len) = match self.extent(request) {
            Ok(extent) => extent,
            Err(status) => return (status, 0),
        };
        if request.direction != DataDirection::ToDevice {
            return (
                PeripheralStatus::Failed("write without data-out buffer".to_string()),
                0,
            );
        }
        let buffer = lock(&request.buffer);
        if buffer.len() < len {
            return (
                PeripheralStatus::Failed(format!(
                    "write needs {} bytes, buffer holds {}",
                    len,
                    buffer.len()
                )),
                0,
            );
        }
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data[offset..offset + len].copy_from_slice(&buffer[..len]);
        (PeripheralStatus::Ok, len)
    }

    /// Copy device data into the request's buffer, bounded by its length
    fn copy_in(&self, request: &PeripheralRequest, bytes: &[u8]) -> (PeripheralStatus, usize) {
        let len = bytes.len().min(request.transfer_length);
        let mut buffer = lock(&request.buffer);
        if buffer.len() < len {
            buffer.resize(len, 0);
        }
        buffer[..len].copy_from_slice(&bytes[..len]);
        (PeripheralStatus::Ok, len)
    }
}

/// In-memory peripheral driver
#[derive(Default)]
pub struct MemoryPeripheral {
    devices: Mutex<HashMap<String, Arc<MemoryDevice>>>,
}

impl MemoryPeripheral {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a zero-filled device
    pub fn add_device(&self, backing_id: &str, blocks: u64, block_size: u32) {
        let device = MemoryDevice {
            block_size,
            blocks,
            data: RwLock::new(vec![0u8; (blocks * block_size as u64) as usize]),
            online: AtomicBool::new(true),
        };
        lock(&self.devices).insert(backing_id.to_string(), Arc::new(device));
        log::debug!(
            "memory peripheral: added {} ({} x {} bytes)",
            backing_id,
            blocks,
            block_size
        );
    }

    /// Take a device on- or offline; issues to an offline device fail
    /// synchronously as if the session were lost
    pub fn set_online(&self, backing_id: &str, online: bool) -> Result<(), PeripheralError> {
        let devices = lock(&self.devices);
        let device = devices
            .get(backing_id)
            .ok_or_else(|| PeripheralError::NotFound(backing_id.to_string()))?;
        device.online.store(online, Ordering::SeqCst);
        Ok(())
    }
}

impl Peripheral for MemoryPeripheral {
    fn open(
        &self,
        backing_id: &str,
        sink: CompletionSink,
    ) -> Result<Box<dyn PeripheralSession>, PeripheralError> {
        let device = lock(&self.devices)
            .get(backing_id)
            .cloned()
            .ok_or_else(|| PeripheralError::NotFound(backing_id.to_string()))?;

        let (tx, rx) = mpsc::channel::<PeripheralRequest>();
        let worker_device = Arc::clone(&device);
        let handle = thread::Builder::new()
            .name(format!("mem-{}", backing_id))
            .spawn(move || {
                while let Ok(request) = rx.recv() {
                    let (status, bytes) = worker_device.execute(&request);
                    sink.complete(request.token, status, bytes);
                }
            })
            .map_err(|e| PeripheralError::SessionLost(e.to_string()))?;

        Ok(Box::new(MemorySession {
            backing_id: backing_id.to_string(),
            device,
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        }))
    }
}

struct MemorySession {
    backing_id: String,
    device: Arc<MemoryDevice>,
    tx: Mutex<Option<Sender<PeripheralRequest>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeripheralSession for MemorySession {
    fn issue(&self, request: PeripheralRequest) -> Result<(), PeripheralError> {
        if !self.device.online.load(Ordering::SeqCst) {
            return Err(PeripheralError::SessionLost(format!(
                "{} is offline",
                self.backing_id
            )));
        }
        let tx = lock(&self.tx);
        let tx = tx
            .as_ref()
            .ok_or_else(|| PeripheralError::SessionLost(format!("{} closed", self.backing_id)))?;
        tx.send(request)
            .map_err(|_| PeripheralError::SessionLost(format!("{} stopped", self.backing_id)))
    }

    fn geometry(&self) -> Option<DeviceGeometry> {
        Some(DeviceGeometry {
            blocks: self.device.blocks,
            block_size: self.device.block_size,
        })
    }

    fn close(&self) {
        lock(&self.tx).take();
        if let Some(handle) = lock(&self.handle).take() {
            if handle.join().is_err() {
                log::error!("memory peripheral: {} completion thread panicked", self.backing_id);
            }
        }
    }
}
