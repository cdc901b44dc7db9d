//! Cross-layer messaging
//!
//! L1-originated messages queue for execution in the following L2 block,
//! never the current one, and each execution runs under a per-message
//! reentrancy guard scoped to the executing thread. L2-originated
//! messages sit behind a challenge window and finalize only when the
//! deadline passes unchallenged.

use crate::types::{Address, BlockNumber, L1ToL2Message, L2ToL1Message, Timestamp};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};

/// Executions attempted before a message is terminally failed
pub const MAX_MESSAGE_RETRIES: u32 = 3;

/// Challenge window for L2 -> L1 messages
pub const CHALLENGE_PERIOD_SECS: u64 = 7 * 24 * 3600;

thread_local! {
    static EXECUTING: RefCell<HashSet<u64>> = RefCell::new(HashSet::new());
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessagingError {
    #[error("Reentrancy detected")]
    Reentrancy,

    #[error("unknown message {0}")]
    UnknownMessage(u64),

    #[error("message {0} exhausted its retries")]
    TerminallyFailed(u64),

    #[error("challenge window for message {0} already closed")]
    ChallengeWindowClosed(u64),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("outbound operations are paused by the circuit breaker")]
    OutboundPaused,
}

/// Releases the per-message execution mark on scope exit
struct ReentrancyGuard {
    message_id: u64,
}

impl ReentrancyGuard {
    fn enter(message_id: u64) -> Result<Self, MessagingError> {
        let entered = EXECUTING.with(|set| set.borrow_mut().insert(message_id));
        if !entered {
            return Err(MessagingError::Reentrancy);
        }
        Ok(Self { message_id })
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        EXECUTING.with(|set| {
            set.borrow_mut().remove(&self.message_id);
        });
    }
}

/// Run `f` with `message_id` marked executing on this thread. A nested
/// call for the same id fails with `Reentrancy` before `f` runs; the
/// mark is released on scope exit either way.
pub fn with_reentrancy_guard<R>(
    message_id: u64,
    f: impl FnOnce() -> Result<R, MessagingError>,
) -> Result<R, MessagingError> {
    let _guard = ReentrancyGuard::enter(message_id)?;
    f()
}

/// Inbound message lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InboundStatus {
    Queued,
    Executed,
    /// Failed but still retryable
    Retrying,
    TerminallyFailed,
}

/// Outbound message lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutboundStatus {
    AwaitingChallenge,
    Finalized,
    Challenged,
}

#[derive(Clone, Debug)]
pub struct InboundEntry {
    pub message: L1ToL2Message,
    pub status: InboundStatus,
    pub attempts: u32,
    /// Earliest L2 block this message may execute in
    pub execute_at_block: BlockNumber,
}

#[derive(Clone, Debug)]
pub struct OutboundEntry {
    pub message: L2ToL1Message,
    pub status: OutboundStatus,
}

/// The cross-layer message queue
pub struct CrossLayerQueue {
    inbound: BTreeMap<u64, InboundEntry>,
    outbound: BTreeMap<u64, OutboundEntry>,
    next_outbound_id: u64,
}

impl CrossLayerQueue {
    pub fn new() -> Self {
        Self {
            inbound: BTreeMap::new(),
            outbound: BTreeMap::new(),
            next_outbound_id: 1,
        }
    }

    pub fn inbound(&self, message_id: u64) -> Option<&InboundEntry> {
        self.inbound.get(&message_id)
    }

    pub fn outbound(&self, message_id: u64) -> Option<&OutboundEntry> {
        self.outbound.get(&message_id)
    }

    /// Queue an L1 message for execution in the next block, never the
    /// current one. Re-enqueuing a known id is a no-op.
    pub fn enqueue_inbound(&mut self, message: L1ToL2Message, current_block: BlockNumber) {
        self.inbound
            .entry(message.message_id)
            .or_insert_with(|| InboundEntry {
                execute_at_block: current_block + 1,
                message,
                status: InboundStatus::Queued,
                attempts: 0,
            });
    }

    /// Execute every message due at `current_block` through `executor`.
    /// Failures retry on later calls up to the retry bound. Returns the
    /// ids executed this pass.
    pub fn execute_ready(
        &mut self,
        current_block: BlockNumber,
        mut executor: impl FnMut(&L1ToL2Message) -> Result<(), MessagingError>,
    ) -> Vec<u64> {
        let due: Vec<u64> = self
            .inbound
            .iter()
            .filter(|(_, e)| {
                matches!(e.status, InboundStatus::Queued | InboundStatus::Retrying)
                    && e.execute_at_block <= current_block
            })
            .map(|(id, _)| *id)
            .collect();

        let mut executed = Vec::new();
        for id in due {
            let entry = match self.inbound.get_mut(&id) {
                Some(e) => e,
                None => continue,
            };
            entry.attempts += 1;
            let message = entry.message.clone();

            let result = with_reentrancy_guard(id, || executor(&message));
            let entry = match self.inbound.get_mut(&id) {
                Some(e) => e,
                None => continue,
            };
            match result {
                Ok(()) => {
                    entry.status = InboundStatus::Executed;
                    executed.push(id);
                }
                Err(err) => {
                    if entry.attempts >= MAX_MESSAGE_RETRIES {
                        entry.status = InboundStatus::TerminallyFailed;
                        tracing::warn!(message_id = id, %err, "message terminally failed");
                    } else {
                        entry.status = InboundStatus::Retrying;
                        tracing::debug!(
                            message_id = id,
                            attempt = entry.attempts,
                            %err,
                            "message execution failed, will retry"
                        );
                    }
                }
            }
        }
        executed
    }

    /// Send an L2 -> L1 message; it finalizes after the challenge window.
    pub fn send_outbound(
        &mut self,
        sender: Address,
        target: Address,
        payload: Vec<u8>,
        current_block: BlockNumber,
        now: Timestamp,
    ) -> u64 {
        let message_id = self.next_outbound_id;
        self.next_outbound_id += 1;
        self.outbound.insert(
            message_id,
            OutboundEntry {
                message: L2ToL1Message {
                    message_id,
                    sender,
                    target,
                    payload,
                    sent_at_block: current_block,
                    challenge_deadline: now + CHALLENGE_PERIOD_SECS,
                },
                status: OutboundStatus::AwaitingChallenge,
            },
        );
        message_id
    }

    /// A valid challenge lands before the deadline.
    pub fn challenge_outbound(
        &mut self,
        message_id: u64,
        now: Timestamp,
    ) -> Result<(), MessagingError> {
        let entry = self
            .outbound
            .get_mut(&message_id)
            .ok_or(MessagingError::UnknownMessage(message_id))?;
        if entry.status != OutboundStatus::AwaitingChallenge
            || now >= entry.message.challenge_deadline
        {
            return Err(MessagingError::ChallengeWindowClosed(message_id));
        }
        entry.status = OutboundStatus::Challenged;
        Ok(())
    }

    /// Finalize every outbound message whose deadline passed without an
    /// accepted challenge. Returns how many finalized.
    pub fn process_timeouts(&mut self, now: Timestamp) -> usize {
        let mut finalized = 0;
        for entry in self.outbound.values_mut() {
            if entry.status == OutboundStatus::AwaitingChallenge
                && now >= entry.message.challenge_deadline
            {
                entry.status = OutboundStatus::Finalized;
                finalized += 1;
            }
        }
        finalized
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbound
            .values()
            .filter(|e| matches!(e.status, InboundStatus::Queued | InboundStatus::Retrying))
            .count()
    }
}

impl Default for CrossLayerQueue {
    fn default() -> Self {
        Self::new()
    }
}
