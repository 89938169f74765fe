//! Drive a RAM-backed LUN through its whole lifecycle
//!
//! Run with: RUST_LOG=debug cargo run --example memory_target

use scsi_passthrough::scsi::{read10_cdb, write10_cdb};
use scsi_passthrough::{
    BackendError, ChannelCore, CommandDescriptor, CoreEvent, LunParams, MemoryPeripheral,
    PassthroughBackend,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BLOCKS: u64 = 2048;
const BLOCK_SIZE: u32 = 512;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let peripheral = Arc::new(MemoryPeripheral::new());
    peripheral.add_device("mem0", BLOCKS, BLOCK_SIZE);

    let (core, events) = ChannelCore::new();
    let backend = PassthroughBackend::builder()
        .default_drain_timeout(Duration::from_secs(2))
        .build(peripheral, Arc::new(core))?;

    // A LUN whose backing device does not exist stays visible in ConfigError
    let broken = LunParams::builder()
        .name("broken")
        .size_blocks(BLOCKS)
        .backing_id("mem9")
        .build()?;
    if let Err(err) = backend.create_lun(broken) {
        println!("create broken: {}", err);
    }

    let lun = backend.create_lun(
        LunParams::builder()
            .name("disk0")
            .size_blocks(BLOCKS)
            .block_size(BLOCK_SIZE)
            .threads(4)
            .backing_id("mem0")
            .build()?,
    )?;
    println!("capacity: {:?}", lun.capacity());

    let payload: Vec<u8> = (0..BLOCK_SIZE as usize * 4).map(|i| i as u8).collect();
    let data_in = Arc::new(Mutex::new(Vec::new()));
    backend.submit(
        lun.id(),
        CommandDescriptor::new(1, &write10_cdb(100, 4)).with_data_out(Arc::new(Mutex::new(payload.clone()))),
    )?;
    backend.submit(
        lun.id(),
        CommandDescriptor::new(2, &read10_cdb(100, 4)).with_data_in(data_in.clone(), payload.len()),
    )?;
    backend.submit(lun.id(), CommandDescriptor::new(3, &read10_cdb(BLOCKS as u32, 1)))?;

    let mut pending = 3;
    for event in events.iter() {
        match event {
            CoreEvent::Completed(desc, result) => {
                println!(
                    "tag {} -> {:?}, {} bytes, status 0x{:02x}",
                    desc.tag(),
                    desc.state(),
                    result.bytes_transferred,
                    result.status.scsi_status()
                );
                pending -= 1;
                if pending == 0 {
                    break;
                }
            }
            other => println!("core: {:?}", other),
        }
    }
    let matches = *data_in.lock().map_err(|_| "buffer lock poisoned")? == payload;
    println!("read back matches write: {}", matches);

    for status in backend.list_luns() {
        println!("{}", status);
    }

    match backend.destroy_lun(lun.id(), None) {
        Ok(()) => println!("destroyed LUN {}", lun.id()),
        Err(BackendError::Busy { outstanding, .. }) => {
            println!("LUN {} still has {} command(s) in flight", lun.id(), outstanding)
        }
        Err(err) => return Err(err.into()),
    }

    let busy = backend.shutdown(Duration::from_secs(1));
    println!("shutdown complete, busy: {:?}", busy);
    Ok(())
}
