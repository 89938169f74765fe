//! Line-oriented control plane over a RAM-backed peripheral
//!
//! Reads one command per line from stdin:
//!
//! ```text
//! create name=disk0 size=2048 blocksize=512 threads=2 backing=mem0
//! status lun=0
//! list
//! destroy lun=0 timeout_ms=500
//! ```
//!
//! Backing devices `mem0` to `mem3` exist, each 2048 blocks of 512 bytes.

use scsi_passthrough::{ChannelCore, ControlCommand, CoreEvent, MemoryPeripheral, PassthroughBackend};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let peripheral = Arc::new(MemoryPeripheral::new());
    for i in 0..4 {
        peripheral.add_device(&format!("mem{}", i), 2048, 512);
    }

    let (core, events) = ChannelCore::new();
    let backend = PassthroughBackend::builder().build(peripheral, Arc::new(core))?;

    // Core side: report registrations as they happen
    thread::spawn(move || {
        for event in events {
            match event {
                CoreEvent::Registered(cap) => {
                    log::info!("core: LUN {} online, {} bytes", cap.lun, cap.size_bytes())
                }
                CoreEvent::Unregistered(lun) => log::info!("core: LUN {} offline", lun),
                CoreEvent::Completed(desc, result) => {
                    log::info!("core: tag {} {:?}", desc.tag(), result.status)
                }
            }
        }
    });

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    write!(stdout, "> ")?;
    stdout.flush()?;
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            write!(stdout, "> ")?;
            stdout.flush()?;
            continue;
        }
        if matches!(line.trim(), "quit" | "exit") {
            break;
        }

        match ControlCommand::parse(&line).and_then(|cmd| cmd.execute(&backend)) {
            Ok(reply) => writeln!(stdout, "{}", reply)?,
            Err(err) => writeln!(stdout, "error: {}", err)?,
        }
        write!(stdout, "> ")?;
        stdout.flush()?;
    }

    let busy = backend.shutdown(backend.config().default_drain_timeout);
    if !busy.is_empty() {
        writeln!(stdout, "LUNs still busy at exit: {:?}", busy)?;
    }
    Ok(())
}
