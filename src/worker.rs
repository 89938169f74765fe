//! Worker threads and the per-LUN completion context
//!
//! Each LUN runs `threads` workers. A worker takes the head of the queue,
//! issues it to the peripheral with no lock held, and goes back for more.
//! Completions never run peripheral-supplied code under the LUN lock: the
//! peripheral posts them to the LUN's inbox and a dedicated completion
//! thread resolves them.

use crate::command::CommandResult;
use crate::lun::{Lun, LunState};
use crate::peripheral::{PeripheralRequest, PeripheralSession, PeripheralStatus};
use crate::scsi::CommandStatus;
use crate::token::Token;
use std::io;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Message delivered to a LUN's completion inbox
#[derive(Debug)]
pub(crate) enum InboxMessage {
    Complete {
        token: Token,
        status: PeripheralStatus,
        bytes_transferred: usize,
    },
    Stop,
}

/// Thread draining a LUN's completion inbox
#[derive(Debug)]
pub(crate) struct CompletionContext {
    inbox: Sender<InboxMessage>,
    handle: JoinHandle<()>,
}

impl CompletionContext {
    pub(crate) fn spawn(
        lun: Arc<Lun>,
        inbox: Sender<InboxMessage>,
        rx: Receiver<InboxMessage>,
    ) -> io::Result<Self> {
        let handle = thread::Builder::new()
            .name(format!("lun{}-completion", lun.id()))
            .spawn(move || completion_loop(lun, rx))?;
        Ok(CompletionContext { inbox, handle })
    }

    /// Deliver everything already posted, then stop the thread
    pub(crate) fn stop(self) {
        // Stop queues behind any completion already in the inbox
        let _ = self.inbox.send(InboxMessage::Stop);
        if self.handle.join().is_err() {
            log::error!("completion thread panicked");
        }
    }
}

fn completion_loop(lun: Arc<Lun>, rx: Receiver<InboxMessage>) {
    log::debug!("LUN {}: completion context started", lun.id());
    while let Ok(message) = rx.recv() {
        match message {
            InboxMessage::Complete {
                token,
                status,
                bytes_transferred,
            } => {
                // Stale or duplicate completions are logged inside on_complete
                let _ = lun.on_complete(token, status, bytes_transferred);
            }
            InboxMessage::Stop => break,
        }
    }
    log::debug!("LUN {}: completion context exiting", lun.id());
}

pub(crate) fn spawn_worker(
    lun: Arc<Lun>,
    session: Arc<dyn PeripheralSession>,
    index: usize,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("lun{}-worker{}", lun.id(), index))
        .spawn(move || worker_loop(lun, session, index))
}

fn worker_loop(lun: Arc<Lun>, session: Arc<dyn PeripheralSession>, index: usize) {
    log::debug!("LUN {}: worker {} started", lun.id(), index);

    while let Some(request) = next_request(&lun) {
        let token = request.token;
        let tag = request.tag;
        log::debug!(
            "LUN {}: worker {} dispatching tag {} ({})",
            lun.id(),
            index,
            tag,
            token
        );

        if let Err(err) = session.issue(request) {
            // Synchronous failure: no completion will follow, resolve here.
            // The core owns retry policy, so the command is not re-queued.
            log::warn!("LUN {}: issue of tag {} failed: {}", lun.id(), tag, err);
            let result = CommandResult::new(CommandStatus::IoError(err.to_string()), 0);
            if let Err(err) = lun.resolve(token, result) {
                log::warn!("LUN {}: {}", lun.id(), err);
            }
        }
    }

    log::debug!("LUN {}: worker {} exiting", lun.id(), index);
}

/// Wait for the next command this worker may dispatch
///
/// Returns `None` once the LUN is `Waiting` with an empty queue, or has
/// failed configuration; the worker must then exit.
fn next_request(lun: &Lun) -> Option<PeripheralRequest> {
    let depth = lun.params().queue_depth();
    let mut shared = lun.lock_shared();

    loop {
        let dispatchable = matches!(shared.state, LunState::Ready | LunState::Waiting)
            && shared.queue.queued() > 0
            && shared.queue.outstanding() < depth;
        if dispatchable {
            if let Some(request) = shared.queue.pop_for_dispatch() {
                if shared.state == LunState::Waiting && shared.queue.queued() == 0 {
                    // Let idle peers see the empty queue and exit
                    lun.wake_workers();
                }
                return Some(request);
            }
        }

        let exit = match shared.state {
            LunState::Waiting => shared.queue.queued() == 0,
            LunState::ConfigError(_) => true,
            LunState::Ready | LunState::Unconfigured => false,
        };
        if exit {
            shared.live_workers -= 1;
            return None;
        }

        shared = lun.wait_for_work(shared);
    }
}
