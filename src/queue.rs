//! Per-LUN continuation queue
//!
//! Holds every command a LUN has accepted and not yet resolved. Queued
//! commands sit in FIFO order waiting for a worker; dispatched commands
//! stay in the slab until the peripheral reports back. The whole structure
//! lives under the LUN's lock, so a command's state and its position
//! (pending list or dispatched set) always change together.

use crate::command::{CommandDescriptor, CommandResult, CommandState};
use crate::error::{BackendError, BackendResult};
use crate::lun::LunId;
use crate::peripheral::PeripheralRequest;
use crate::token::Token;
use slab::Slab;
use std::collections::VecDeque;
use std::num::Wrapping;

#[derive(Debug)]
struct PendingCommand {
    /// Sequence number the entry was inserted under
    generation: u32,
    desc: CommandDescriptor,
}

#[derive(Debug)]
pub struct ContinuationQueue {
    lun: LunId,
    pending: VecDeque<Token>,
    commands: Slab<PendingCommand>,
    next_generation: Wrapping<u32>,
    dispatched: usize,
}

impl ContinuationQueue {
    pub fn new(lun: LunId) -> Self {
        ContinuationQueue {
            lun,
            pending: VecDeque::new(),
            commands: Slab::new(),
            next_generation: Wrapping(0),
            dispatched: 0,
        }
    }

    /// Commands waiting for a worker
    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    /// Commands handed to the peripheral and not yet resolved
    pub fn outstanding(&self) -> usize {
        self.dispatched
    }

    /// True when nothing is queued and nothing is in flight
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.dispatched == 0
    }

    fn entry(&self, token: Token) -> Option<&PendingCommand> {
        self.commands
            .get(token.slot() as usize)
            .filter(|entry| entry.generation == token.generation())
    }

    /// Append a command at the tail
    pub fn push(&mut self, mut desc: CommandDescriptor) -> Token {
        let entry = self.commands.vacant_entry();
        let token = Token::new(entry.key() as u32, self.next_generation.0);
        self.next_generation += 1;
        desc.bind(self.lun, token);
        entry.insert(PendingCommand {
            generation: token.generation(),
            desc,
        });
        self.pending.push_back(token);
        token
    }

    /// Take the head command for dispatch
    ///
    /// Marks it `Dispatched` and returns the request to hand to the
    /// peripheral. The descriptor itself stays here until resolved.
    pub fn pop_for_dispatch(&mut self) -> Option<PeripheralRequest> {
        let token = self.pending.pop_front()?;
        let entry = self.commands.get_mut(token.slot() as usize)?;
        entry.desc.mark_dispatched();
        self.dispatched += 1;
        Some(PeripheralRequest::from_descriptor(token, &entry.desc))
    }

    /// Resolve a dispatched command, removing it from the queue
    ///
    /// Unknown, stale or never-dispatched tokens are rejected as a
    /// protocol violation and leave the queue untouched.
    pub fn resolve(
        &mut self,
        token: Token,
        result: CommandResult,
    ) -> BackendResult<CommandDescriptor> {
        match self.state_of(token) {
            Some(CommandState::Dispatched) => {}
            Some(state) => {
                return Err(BackendError::ProtocolViolation(format!(
                    "LUN {}: completion for token {} in state {:?}",
                    self.lun, token, state
                )));
            }
            None => {
                return Err(BackendError::ProtocolViolation(format!(
                    "LUN {}: completion for unknown token {}",
                    self.lun, token
                )));
            }
        }

        let mut desc = self.commands.remove(token.slot() as usize).desc;
        desc.finish(result);
        self.dispatched -= 1;
        Ok(desc)
    }

    /// State of the command addressed by `token`, if still held
    pub fn state_of(&self, token: Token) -> Option<CommandState> {
        self.entry(token).map(|entry| entry.desc.state())
    }

    /// Check the ownership invariants; returns a description of the first
    /// violation found
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for token in &self.pending {
            if !seen.insert(*token) {
                return Err(format!("token {} queued twice", token));
            }
            if self.state_of(*token) != Some(CommandState::Queued) {
                return Err(format!("pending token {} is not Queued", token));
            }
        }

        let mut dispatched = 0;
        for (key, entry) in self.commands.iter() {
            let token = Token::new(key as u32, entry.generation);
            if entry.desc.token() != Some(token) {
                return Err(format!("entry {} bound to {:?}", token, entry.desc.token()));
            }
            match entry.desc.state() {
                CommandState::Queued if !seen.contains(&token) => {
                    return Err(format!("queued token {} missing from pending list", token));
                }
                CommandState::Dispatched => dispatched += 1,
                CommandState::Completed | CommandState::Cancelled => {
                    return Err(format!("resolved token {} still held", token));
                }
                _ => {}
            }
        }
        if dispatched != self.dispatched {
            return Err(format!(
                "dispatched count {} disagrees with {} dispatched entries",
                self.dispatched, dispatched
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::CommandStatus;
    use rand::Rng;

    fn desc(tag: u64) -> CommandDescriptor {
        CommandDescriptor::new(tag, &[0x00, 0, 0, 0, 0, 0])
    }

    fn ok() -> CommandResult {
        CommandResult::new(CommandStatus::Good, 0)
    }

    #[test]
    fn test_fifo_dispatch_order() {
        let mut queue = ContinuationQueue::new(LunId(0));
        for tag in 0..8 {
            queue.push(desc(tag));
        }
        let order: Vec<u64> = std::iter::from_fn(|| queue.pop_for_dispatch())
            .map(|req| req.tag)
            .collect();
        assert_eq!(order, (0..8).collect::<Vec<_>>());
        assert_eq!(queue.outstanding(), 8);
        assert_eq!(queue.queued(), 0);
    }

    #[test]
    fn test_resolve_returns_completed_descriptor() {
        let mut queue = ContinuationQueue::new(LunId(2));
        queue.push(desc(42));
        let req = queue.pop_for_dispatch().unwrap();

        let done = queue
            .resolve(req.token, CommandResult::new(CommandStatus::Good, 512))
            .unwrap();
        assert_eq!(done.tag(), 42);
        assert_eq!(done.lun(), Some(LunId(2)));
        assert_eq!(done.state(), CommandState::Completed);
        assert_eq!(done.result().unwrap().bytes_transferred, 512);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_double_resolve_is_protocol_violation() {
        let mut queue = ContinuationQueue::new(LunId(0));
        queue.push(desc(1));
        let req = queue.pop_for_dispatch().unwrap();
        assert!(queue.resolve(req.token, ok()).is_ok());

        let err = queue.resolve(req.token, ok()).unwrap_err();
        assert!(matches!(err, BackendError::ProtocolViolation(_)));
        assert!(queue.is_idle());
    }

    #[test]
    fn test_resolve_of_queued_command_rejected() {
        let mut queue = ContinuationQueue::new(LunId(0));
        let token = queue.push(desc(1));
        let err = queue.resolve(token, ok()).unwrap_err();
        assert!(matches!(err, BackendError::ProtocolViolation(_)));
        assert_eq!(queue.state_of(token), Some(CommandState::Queued));
        assert_eq!(queue.queued(), 1);
    }

    #[test]
    fn test_stale_token_does_not_resolve_reused_slot() {
        let mut queue = ContinuationQueue::new(LunId(0));
        queue.push(desc(1));
        let first = queue.pop_for_dispatch().unwrap().token;
        queue.resolve(first, ok()).unwrap();

        queue.push(desc(2));
        let second = queue.pop_for_dispatch().unwrap().token;
        assert_eq!(first.slot(), second.slot());

        assert_ne!(first.generation(), second.generation());

        assert!(queue.resolve(first, ok()).is_err());
        assert_eq!(queue.state_of(first), None);
        assert_eq!(queue.state_of(second), Some(CommandState::Dispatched));
    }

    #[test]
    fn test_randomized_ownership_invariant() {
        let mut rng = rand::thread_rng();
        let mut queue = ContinuationQueue::new(LunId(0));
        let mut in_flight: Vec<Token> = Vec::new();
        let mut next_tag = 0u64;
        let mut resolved = std::collections::HashSet::new();

        for _ in 0..5000 {
            match rng.gen_range(0..3) {
                0 => {
                    queue.push(desc(next_tag));
                    next_tag += 1;
                }
                1 => {
                    if let Some(req) = queue.pop_for_dispatch() {
                        in_flight.push(req.token);
                    }
                }
                _ => {
                    if !in_flight.is_empty() {
                        let idx = rng.gen_range(0..in_flight.len());
                        let token = in_flight.swap_remove(idx);
                        let done = queue.resolve(token, ok()).unwrap();
                        assert!(resolved.insert(done.tag()), "tag resolved twice");
                    }
                }
            }
            queue.check_invariants().unwrap();
            assert_eq!(queue.outstanding(), in_flight.len());
        }
    }
}
