//! Transport surface
//!
//! The P2P layer is an external collaborator; the core only needs a way
//! to hand it outbound messages. Everything it carries is one of the
//! signed message types, and "broadcast" is fire-and-forget.

use crate::types::{
    BlockProposal, L1ToL2Message, L2ToL1Message, LeadershipClaim, MintConfirmation, SeqAnnounce,
    SequencerAttestation, SequencerVote, Transaction,
};
use std::sync::Mutex;

/// Any message the transport carries between sequencers
#[derive(Clone, Debug)]
pub enum WireMessage {
    Announce(SeqAnnounce),
    Attestation(SequencerAttestation),
    /// Proposals travel with their transaction bodies so voters can
    /// re-execute without a fetch round-trip
    Proposal {
        proposal: BlockProposal,
        transactions: Vec<Transaction>,
    },
    Vote(SequencerVote),
    Claim(LeadershipClaim),
    MintConfirmation(MintConfirmation),
    Inbound(L1ToL2Message),
    Outbound(L2ToL1Message),
}

/// Fire-and-forget broadcast; the transport owns its own synchronization.
pub trait Transport: Send + Sync {
    fn broadcast(&self, message: WireMessage);
}

/// Drops everything; for nodes running without a network.
pub struct NullTransport;

impl Transport for NullTransport {
    fn broadcast(&self, _message: WireMessage) {}
}

/// Collects broadcasts in memory so a devnet driver (or a test) can relay
/// them between in-process nodes.
#[derive(Default)]
pub struct LoopbackTransport {
    sent: Mutex<Vec<WireMessage>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every message broadcast since the last drain.
    pub fn drain(&self) -> Vec<WireMessage> {
        match self.sent.lock() {
            Ok(mut sent) => sent.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl Transport for LoopbackTransport {
    fn broadcast(&self, message: WireMessage) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message);
        }
    }
}
