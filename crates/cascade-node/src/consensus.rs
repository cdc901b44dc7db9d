//! Propose/vote block consensus
//!
//! One round runs at a time: the slot's acting leader broadcasts a
//! proposal, every other sequencer re-executes it and votes, and the
//! round finalizes once weighted ACCEPT reaches the consensus threshold
//! of the eligible set. Weighted REJECT beyond one third, or the vote
//! timeout, fails the round and triggers failover.
//!
//! Equivocation (a second, different proposal for the same slot from the
//! same proposer) is rejected and kept as structured evidence.

use crate::config::Fraction;
use crate::sequencer::SequencerInfo;
use crate::types::{
    compute_transactions_root, verify_signature, Address, BlockNumber, BurnRecord, ChainId, Hash,
    BlockProposal, SequencerVote, Slot, Timestamp, VoteChoice, ZERO_ADDRESS, ZERO_HASH,
};
use std::collections::BTreeMap;

/// Proposal timestamps may run at most this far ahead of local time
pub const MAX_TIMESTAMP_AHEAD_SECS: u64 = 60;

/// Proposal timestamps must sit within this window of the L1 clock
pub const MAX_L1_DRIFT_SECS: u64 = 900;

/// Accepted-block timestamps may exceed the validator clock by this much
pub const MAX_FINAL_CLOCK_AHEAD_SECS: u64 = 30;

/// Where a consensus round stands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotPhase {
    Idle,
    AwaitingVotes,
    Finalized,
    Failed,
}

/// Why a round failed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailReason {
    /// Weighted REJECT alone exceeded one third
    Rejected,
    /// The vote timeout expired before ACCEPT reached threshold
    Timeout,
}

/// A finalized block: the proposal plus the ACCEPT votes that carried it
#[derive(Clone, Debug)]
pub struct FinalizedBlock {
    pub proposal: BlockProposal,
    pub block_hash: Hash,
    pub accept_votes: Vec<SequencerVote>,
    pub accept_weight: u64,
    pub total_weight: u64,
    /// Mints credited by this block, for bridge bookkeeping
    pub minted: Vec<BurnRecord>,
}

/// Evidence that a proposer signed two different blocks for one slot
#[derive(Clone, Debug)]
pub struct EquivocationEvidence {
    pub slot: Slot,
    pub proposer: Address,
    pub first_hash: Hash,
    pub second_hash: Hash,
    pub timestamp: Timestamp,
}

/// Emitted by the round; the runtime fires callbacks outside the lock
#[derive(Clone, Debug)]
pub enum ConsensusEvent {
    Finalized(FinalizedBlock),
    Failed {
        block_hash: Hash,
        slot: Slot,
        proposer: Address,
        reason: FailReason,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsensusError {
    #[error("a round is already in progress")]
    RoundInProgress,

    #[error("no round awaiting votes")]
    NoActiveRound,

    #[error("parent hash does not extend the finalized chain")]
    BadParent,

    #[error("block number {got} does not follow {expected}")]
    BadBlockNumber { expected: BlockNumber, got: BlockNumber },

    #[error("timestamp not strictly after the previous block")]
    NonMonotonicTimestamp,

    #[error("timestamp too far ahead of local clock")]
    TimestampAhead,

    #[error("timestamp drifts more than {MAX_L1_DRIFT_SECS}s from the L1 anchor")]
    TimestampL1Drift,

    #[error("gas used {used} exceeds limit {limit}")]
    GasExceeded { used: u64, limit: u64 },

    #[error("null proposer")]
    NullProposer,

    #[error("wrong chain id: expected {expected}, got {got}")]
    WrongChain { expected: ChainId, got: ChainId },

    #[error("proposal signature invalid")]
    BadSignature,

    #[error("proposer is not the acting leader for this slot")]
    NotTheLeader,

    #[error("proposal slot {got} does not match the active slot {expected}")]
    WrongSlot { expected: Slot, got: Slot },

    #[error("transactions root does not match the transaction list")]
    TxRootMismatch,

    #[error("equivocating proposal for slot {0}")]
    Equivocation(Slot),

    #[error("duplicate proposal")]
    DuplicateProposal,

    #[error("vote references an unknown block")]
    UnknownBlock,

    #[error("vote is not newer than the voter's previous vote")]
    StaleVote,

    #[error("voter is not in the eligible set")]
    VoterNotEligible,

    #[error("vote signature invalid")]
    BadVoteSignature,
}

struct Round {
    proposal: BlockProposal,
    block_hash: Hash,
    votes: BTreeMap<Address, (SequencerVote, u64 /* weight */)>,
    total_weight: u64,
    started_at_ms: u64,
    /// Mints the proposal credits, carried into the finalized record
    minted: Vec<BurnRecord>,
}

/// Per-node consensus engine over one chain of finalized blocks
pub struct BlockConsensus {
    chain_id: ChainId,
    threshold: Fraction,
    vote_timeout_ms: u64,
    phase: SlotPhase,
    round: Option<Round>,
    chain: Vec<FinalizedBlock>,
    genesis_hash: Hash,
    genesis_timestamp: Timestamp,
    last_hash: Hash,
    last_block_number: BlockNumber,
    last_timestamp: Timestamp,
    equivocations: Vec<EquivocationEvidence>,
}

impl BlockConsensus {
    /// Start above a genesis anchor: the first proposal must be block 1
    /// with `genesis_hash` as its parent.
    pub fn new(
        chain_id: ChainId,
        threshold: Fraction,
        vote_timeout_ms: u64,
        genesis_hash: Hash,
        genesis_timestamp: Timestamp,
    ) -> Self {
        Self {
            chain_id,
            threshold,
            vote_timeout_ms,
            phase: SlotPhase::Idle,
            round: None,
            chain: Vec::new(),
            genesis_hash,
            genesis_timestamp,
            last_hash: genesis_hash,
            last_block_number: 0,
            last_timestamp: genesis_timestamp,
            equivocations: Vec::new(),
        }
    }

    pub fn phase(&self) -> SlotPhase {
        self.phase
    }

    pub fn last_finalized_hash(&self) -> Hash {
        self.last_hash
    }

    pub fn last_block_number(&self) -> BlockNumber {
        self.last_block_number
    }

    pub fn last_finalized_timestamp(&self) -> Timestamp {
        self.last_timestamp
    }

    pub fn finalized_chain(&self) -> &[FinalizedBlock] {
        &self.chain
    }

    pub fn equivocations(&self) -> &[EquivocationEvidence] {
        &self.equivocations
    }

    pub fn current_proposal(&self) -> Option<&BlockProposal> {
        self.round.as_ref().map(|r| &r.proposal)
    }

    /// Structural validation and round start for a leader's proposal.
    ///
    /// `minted` carries the burn records the proposal's mint transactions
    /// credit, so the bridge can transition them once the block finalizes.
    #[allow(clippy::too_many_arguments)]
    pub fn receive_proposal(
        &mut self,
        proposal: BlockProposal,
        acting_leader: &Address,
        leader_pubkey: &[u8; 32],
        active_slot: Slot,
        eligible_total_weight: u64,
        l1_timestamp: Option<Timestamp>,
        minted: Vec<BurnRecord>,
        now: Timestamp,
        now_ms: u64,
    ) -> Result<Hash, ConsensusError> {
        let block_hash = proposal.hash();

        if let Some(round) = &self.round {
            if round.block_hash == block_hash {
                return Err(ConsensusError::DuplicateProposal);
            }
            if round.proposal.slot_number == proposal.slot_number
                && round.proposal.proposer_address == proposal.proposer_address
            {
                self.equivocations.push(EquivocationEvidence {
                    slot: proposal.slot_number,
                    proposer: proposal.proposer_address,
                    first_hash: round.block_hash,
                    second_hash: block_hash,
                    timestamp: now,
                });
                tracing::warn!(
                    slot = proposal.slot_number,
                    proposer = %hex::encode(proposal.proposer_address),
                    "equivocating proposal"
                );
                return Err(ConsensusError::Equivocation(proposal.slot_number));
            }
            return Err(ConsensusError::RoundInProgress);
        }

        if proposal.chain_id != self.chain_id {
            return Err(ConsensusError::WrongChain {
                expected: self.chain_id,
                got: proposal.chain_id,
            });
        }
        if proposal.block_number != self.last_block_number + 1 {
            return Err(ConsensusError::BadBlockNumber {
                expected: self.last_block_number + 1,
                got: proposal.block_number,
            });
        }
        if !proposal.is_genesis() && proposal.parent_hash == ZERO_HASH {
            return Err(ConsensusError::BadParent);
        }
        if proposal.parent_hash != self.last_hash {
            return Err(ConsensusError::BadParent);
        }
        if proposal.timestamp <= self.last_timestamp {
            return Err(ConsensusError::NonMonotonicTimestamp);
        }
        if proposal.timestamp > now + MAX_TIMESTAMP_AHEAD_SECS {
            return Err(ConsensusError::TimestampAhead);
        }
        if let Some(l1_ts) = l1_timestamp {
            if proposal.timestamp.abs_diff(l1_ts) > MAX_L1_DRIFT_SECS {
                return Err(ConsensusError::TimestampL1Drift);
            }
        }
        if proposal.gas_used > proposal.gas_limit {
            return Err(ConsensusError::GasExceeded {
                used: proposal.gas_used,
                limit: proposal.gas_limit,
            });
        }
        if proposal.proposer_address == ZERO_ADDRESS {
            return Err(ConsensusError::NullProposer);
        }
        if proposal.slot_number != active_slot {
            return Err(ConsensusError::WrongSlot {
                expected: active_slot,
                got: proposal.slot_number,
            });
        }
        if proposal.proposer_address != *acting_leader {
            return Err(ConsensusError::NotTheLeader);
        }
        if proposal.transactions_root != compute_transactions_root(&proposal.tx_hashes) {
            return Err(ConsensusError::TxRootMismatch);
        }
        if !verify_signature(leader_pubkey, &proposal.signing_bytes(), &proposal.proposer_signature)
        {
            return Err(ConsensusError::BadSignature);
        }

        self.round = Some(Round {
            proposal,
            block_hash,
            votes: BTreeMap::new(),
            total_weight: eligible_total_weight,
            started_at_ms: now_ms,
            minted,
        });
        self.phase = SlotPhase::AwaitingVotes;
        Ok(block_hash)
    }

    /// Record a sequencer's vote. Replays never count twice; a voter's
    /// newer vote replaces its older one. Returns a consensus event once
    /// the threshold resolves the round either way.
    pub fn record_vote(
        &mut self,
        vote: SequencerVote,
        voter: &SequencerInfo,
    ) -> Result<Option<ConsensusEvent>, ConsensusError> {
        if self.phase != SlotPhase::AwaitingVotes {
            return Err(ConsensusError::NoActiveRound);
        }
        let round = self.round.as_mut().ok_or(ConsensusError::NoActiveRound)?;

        if vote.block_hash != round.block_hash {
            return Err(ConsensusError::UnknownBlock);
        }
        if vote.voter_address != voter.address || !voter.is_eligible {
            return Err(ConsensusError::VoterNotEligible);
        }
        if !verify_signature(&voter.pubkey, &vote.signing_bytes(), &vote.signature) {
            return Err(ConsensusError::BadVoteSignature);
        }
        if let Some((existing, _)) = round.votes.get(&vote.voter_address) {
            if vote.timestamp <= existing.timestamp {
                return Err(ConsensusError::StaleVote);
            }
        }
        round
            .votes
            .insert(vote.voter_address, (vote, voter.weight()));

        Ok(self.evaluate())
    }

    fn weight_of(round: &Round, choice: VoteChoice) -> u64 {
        round
            .votes
            .values()
            .filter(|(v, _)| v.vote == choice)
            .map(|(_, w)| w)
            .sum()
    }

    fn evaluate(&mut self) -> Option<ConsensusEvent> {
        let round = self.round.as_ref()?;
        let accept = Self::weight_of(round, VoteChoice::Accept);
        let reject = Self::weight_of(round, VoteChoice::Reject);

        if self.threshold.met_by(accept, round.total_weight) {
            return Some(self.conclude_finalized(accept));
        }
        if self.threshold.complement_exceeded_by(reject, round.total_weight) {
            return Some(self.conclude_failed(FailReason::Rejected));
        }
        None
    }

    fn conclude_finalized(&mut self, accept_weight: u64) -> ConsensusEvent {
        let round = self.round.take().expect("round present when concluding");
        let accept_votes: Vec<SequencerVote> = round
            .votes
            .values()
            .filter(|(v, _)| v.vote == VoteChoice::Accept)
            .map(|(v, _)| v.clone())
            .collect();

        let block = FinalizedBlock {
            block_hash: round.block_hash,
            accept_votes,
            accept_weight,
            total_weight: round.total_weight,
            minted: round.minted,
            proposal: round.proposal,
        };

        self.last_hash = block.block_hash;
        self.last_block_number = block.proposal.block_number;
        self.last_timestamp = block.proposal.timestamp;
        self.chain.push(block.clone());
        self.phase = SlotPhase::Idle;

        tracing::info!(
            block = block.proposal.block_number,
            hash = %hex::encode(block.block_hash),
            accept_weight,
            total_weight = block.total_weight,
            "block finalized"
        );
        ConsensusEvent::Finalized(block)
    }

    fn conclude_failed(&mut self, reason: FailReason) -> ConsensusEvent {
        let round = self.round.take().expect("round present when concluding");
        self.phase = SlotPhase::Idle;

        tracing::warn!(
            block = round.proposal.block_number,
            slot = round.proposal.slot_number,
            ?reason,
            "consensus round failed"
        );
        ConsensusEvent::Failed {
            block_hash: round.block_hash,
            slot: round.proposal.slot_number,
            proposer: round.proposal.proposer_address,
            reason,
        }
    }

    /// Rewind the finalized chain to `block_number` after an L1 reorg
    /// invalidated everything above it. Any in-flight round is dropped.
    pub fn rewind_to(&mut self, block_number: BlockNumber) {
        self.round = None;
        self.phase = SlotPhase::Idle;
        while self
            .chain
            .last()
            .map_or(false, |b| b.proposal.block_number > block_number)
        {
            self.chain.pop();
        }
        if let Some(last) = self.chain.last() {
            self.last_hash = last.block_hash;
            self.last_block_number = last.proposal.block_number;
            self.last_timestamp = last.proposal.timestamp;
        } else {
            self.last_hash = self.genesis_hash;
            self.last_block_number = 0;
            self.last_timestamp = self.genesis_timestamp;
        }
        tracing::warn!(block = self.last_block_number, "consensus chain rewound");
    }

    /// Fail the round if its vote timeout has expired.
    pub fn process_timeout(&mut self, now_ms: u64) -> Option<ConsensusEvent> {
        let round = self.round.as_ref()?;
        if now_ms.saturating_sub(round.started_at_ms) < self.vote_timeout_ms {
            return None;
        }
        Some(self.conclude_failed(FailReason::Timeout))
    }
}
