//! Burn-and-mint bridge
//!
//! Assets enter the L2 only by destroying L1 coins under a recognizable
//! marker. Every sequencer scans finalized L1 blocks independently,
//! broadcasts a signed confirmation per detected burn, and a burn is
//! credited once the distinct-signer confirmation weight reaches the
//! consensus threshold: PENDING -> REACHED -> MINTED, with FAILED and
//! REJECTED as terminal failures.
//!
//! The at-most-once guarantee lives in the state manager's burn registry;
//! this module owns the confirmation bookkeeping and the mint queue the
//! next leader drains.

use crate::config::Fraction;
use crate::l1::{detect_burn, L1Block};
use crate::sequencer::SequencerInfo;
use crate::types::{verify_signature, Address, ChainId, Hash, MintConfirmation, Timestamp};
use std::collections::BTreeMap;

/// Confirmations older than this are dropped on arrival
pub const CONFIRMATION_MAX_AGE_SECS: u64 = 3600;

/// Consensus states time out of PENDING, and terminal states are pruned,
/// after this age
pub const CONSENSUS_EXPIRY_SECS: u64 = 3600;

/// Mint consensus status for one L1 burn
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MintStatus {
    Pending,
    Reached,
    Minted,
    Failed,
    Rejected,
}

/// Everything observed about one burn's path to a mint
#[derive(Clone, Debug)]
pub struct MintConsensusState {
    pub l1_tx_hash: Hash,
    pub amount: u64,
    pub l2_recipient: Address,
    /// L1 block the burn was locally observed in (zero until scanned)
    pub l1_block_number: u64,
    pub l1_block_hash: Hash,
    pub status: MintStatus,
    pub first_seen: Timestamp,
    confirmations: BTreeMap<Address, MintConfirmation>,
    /// Disagreeing confirmations: recorded as evidence, never counted
    pub invalid_confirmations: Vec<MintConfirmation>,
}

impl MintConsensusState {
    pub fn confirmation_count(&self) -> usize {
        self.confirmations.len()
    }

    pub fn confirmation_weight(&self, weight_of: impl Fn(&Address) -> u64) -> u64 {
        self.confirmations.keys().map(weight_of).sum()
    }
}

/// A burn found while scanning an L1 block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetectedBurn {
    pub l1_tx_hash: Hash,
    pub l1_block_number: u64,
    pub l1_block_hash: Hash,
    pub l2_recipient: Address,
    pub amount: u64,
}

/// A burn cleared for minting, in canonical inclusion order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadyMint {
    pub l1_tx_hash: Hash,
    pub l2_recipient: Address,
    pub amount: u64,
    pub l1_block_number: u64,
    pub l1_block_hash: Hash,
}

/// Emitted when a burn crosses the confirmation threshold; the runtime
/// hands it to the block producer outside the bridge lock.
#[derive(Clone, Debug)]
pub struct ConsensusReached {
    pub l1_tx_hash: Hash,
    pub l2_recipient: Address,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("wrong chain id: expected {expected}, got {got}")]
    WrongChain { expected: ChainId, got: ChainId },

    #[error("confirmation signer is not an eligible sequencer")]
    SignerNotEligible,

    #[error("invalid confirmation signature")]
    BadSignature,

    #[error("confirmation older than {CONFIRMATION_MAX_AGE_SECS}s")]
    ConfirmationTooOld,

    #[error("duplicate confirmation from signer")]
    DuplicateConfirmation,

    #[error("confirmation disagrees with first-seen amount or recipient")]
    ConfirmationMismatch,

    #[error("burn {} is in a terminal state", hex::encode(.0))]
    TerminalState(Hash),

    #[error("operation retired: {0}")]
    Deprecated(&'static str),
}

/// Mint consensus tracker, one entry per distinct L1 burn transaction
pub struct MintConsensus {
    chain_id: ChainId,
    threshold: Fraction,
    states: BTreeMap<Hash, MintConsensusState>,
    /// Hash of every L1 block already scanned, for reorg detection
    scanned_blocks: BTreeMap<u64, Hash>,
}

impl MintConsensus {
    pub fn new(chain_id: ChainId, threshold: Fraction) -> Self {
        Self {
            chain_id,
            threshold,
            states: BTreeMap::new(),
            scanned_blocks: BTreeMap::new(),
        }
    }

    pub fn get(&self, l1_tx_hash: &Hash) -> Option<&MintConsensusState> {
        self.states.get(l1_tx_hash)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Scan one finalized L1 block for burn markers. Re-scanning the same
    /// height with the same hash is a no-op; a different hash means the L1
    /// reorged under us and is rejected until `handle_reorg` runs.
    pub fn scan_l1_block(&mut self, block: &L1Block, now: Timestamp) -> Vec<DetectedBurn> {
        if let Some(known) = self.scanned_blocks.get(&block.block_number) {
            if *known == block.block_hash {
                return Vec::new();
            }
        }
        self.scanned_blocks.insert(block.block_number, block.block_hash);

        let mut detected = Vec::new();
        for tx in &block.txs {
            let Some((recipient, amount)) = detect_burn(tx, self.chain_id) else {
                continue;
            };
            if amount == 0 {
                continue;
            }

            let entry = self
                .states
                .entry(tx.txid)
                .or_insert_with(|| MintConsensusState {
                    l1_tx_hash: tx.txid,
                    amount,
                    l2_recipient: recipient,
                    l1_block_number: block.block_number,
                    l1_block_hash: block.block_hash,
                    status: MintStatus::Pending,
                    first_seen: now,
                    confirmations: BTreeMap::new(),
                    invalid_confirmations: Vec::new(),
                });
            entry.l1_block_number = block.block_number;
            entry.l1_block_hash = block.block_hash;

            detected.push(DetectedBurn {
                l1_tx_hash: tx.txid,
                l1_block_number: block.block_number,
                l1_block_hash: block.block_hash,
                l2_recipient: recipient,
                amount,
            });
        }
        detected
    }

    /// Validate a confirmation and count it toward consensus. Returns the
    /// reached event once the threshold is crossed.
    pub fn receive_confirmation(
        &mut self,
        confirmation: &MintConfirmation,
        signer: &SequencerInfo,
        eligible_total_weight: u64,
        weight_of: impl Fn(&Address) -> u64,
        now: Timestamp,
    ) -> Result<Option<ConsensusReached>, BridgeError> {
        if confirmation.chain_id != self.chain_id {
            return Err(BridgeError::WrongChain {
                expected: self.chain_id,
                got: confirmation.chain_id,
            });
        }
        if !signer.is_eligible || signer.address != confirmation.sequencer_address {
            return Err(BridgeError::SignerNotEligible);
        }
        if !verify_signature(
            &signer.pubkey,
            &confirmation.signing_bytes(),
            &confirmation.signature,
        ) {
            return Err(BridgeError::BadSignature);
        }
        if now.saturating_sub(confirmation.timestamp) > CONFIRMATION_MAX_AGE_SECS {
            return Err(BridgeError::ConfirmationTooOld);
        }

        let state = self
            .states
            .entry(confirmation.l1_tx_hash)
            .or_insert_with(|| MintConsensusState {
                l1_tx_hash: confirmation.l1_tx_hash,
                amount: confirmation.amount,
                l2_recipient: confirmation.l2_recipient,
                l1_block_number: 0,
                l1_block_hash: [0u8; 32],
                status: MintStatus::Pending,
                first_seen: now,
                confirmations: BTreeMap::new(),
                invalid_confirmations: Vec::new(),
            });

        match state.status {
            MintStatus::Pending => {}
            MintStatus::Reached => return Ok(None), // already over threshold
            _ => return Err(BridgeError::TerminalState(confirmation.l1_tx_hash)),
        }

        if state
            .confirmations
            .contains_key(&confirmation.sequencer_address)
        {
            return Err(BridgeError::DuplicateConfirmation);
        }

        // disagreement with the first observation is protocol-level
        // evidence of a buggy or malicious signer: record, do not count
        if confirmation.amount != state.amount
            || confirmation.l2_recipient != state.l2_recipient
        {
            state.invalid_confirmations.push(confirmation.clone());
            state.status = MintStatus::Rejected;
            tracing::warn!(
                l1_tx = %hex::encode(confirmation.l1_tx_hash),
                signer = %hex::encode(confirmation.sequencer_address),
                "conflicting mint confirmation, burn rejected"
            );
            return Err(BridgeError::ConfirmationMismatch);
        }

        state
            .confirmations
            .insert(confirmation.sequencer_address, confirmation.clone());

        let weight = state.confirmation_weight(&weight_of);
        if self.threshold.met_by(weight, eligible_total_weight) {
            state.status = MintStatus::Reached;
            tracing::info!(
                l1_tx = %hex::encode(confirmation.l1_tx_hash),
                weight,
                total = eligible_total_weight,
                "mint consensus reached"
            );
            return Ok(Some(ConsensusReached {
                l1_tx_hash: state.l1_tx_hash,
                l2_recipient: state.l2_recipient,
                amount: state.amount,
            }));
        }
        Ok(None)
    }

    /// REACHED burns not yet minted, ordered by first-seen time then L1 tx
    /// hash: the exact order the next leader must include them in.
    pub fn ready_mints(&self) -> Vec<ReadyMint> {
        let mut ready: Vec<&MintConsensusState> = self
            .states
            .values()
            .filter(|s| s.status == MintStatus::Reached)
            .collect();
        ready.sort_by(|a, b| {
            a.first_seen
                .cmp(&b.first_seen)
                .then(a.l1_tx_hash.cmp(&b.l1_tx_hash))
        });
        ready
            .into_iter()
            .map(|s| ReadyMint {
                l1_tx_hash: s.l1_tx_hash,
                l2_recipient: s.l2_recipient,
                amount: s.amount,
                l1_block_number: s.l1_block_number,
                l1_block_hash: s.l1_block_hash,
            })
            .collect()
    }

    /// The block carrying this burn's mint was finalized.
    pub fn mark_minted(&mut self, l1_tx_hash: &Hash) {
        if let Some(state) = self.states.get_mut(l1_tx_hash) {
            state.status = MintStatus::Minted;
        }
    }

    /// Expire stale states: PENDING past the window becomes FAILED, and
    /// non-PENDING states past the window are pruned.
    pub fn process_timeouts(&mut self, now: Timestamp) {
        for state in self.states.values_mut() {
            if state.status == MintStatus::Pending
                && now.saturating_sub(state.first_seen) > CONSENSUS_EXPIRY_SECS
            {
                state.status = MintStatus::Failed;
                tracing::debug!(
                    l1_tx = %hex::encode(state.l1_tx_hash),
                    "mint consensus timed out"
                );
            }
        }
        self.states.retain(|_, s| {
            s.status == MintStatus::Pending
                || now.saturating_sub(s.first_seen) <= CONSENSUS_EXPIRY_SECS
        });
    }

    /// The L1 reorged at `from_height`: burns observed at or above it drop
    /// back to PENDING and must reacquire their confirmation quorum.
    /// Returns the L1 tx hashes that reverted.
    pub fn handle_reorg(&mut self, from_height: u64, now: Timestamp) -> Vec<Hash> {
        self.scanned_blocks.retain(|height, _| *height < from_height);

        let mut reverted = Vec::new();
        for state in self.states.values_mut() {
            if state.l1_block_number >= from_height && state.l1_block_number != 0 {
                state.status = MintStatus::Pending;
                state.confirmations.clear();
                state.first_seen = now;
                reverted.push(state.l1_tx_hash);
            }
        }
        if !reverted.is_empty() {
            tracing::warn!(from_height, count = reverted.len(), "burns reverted by L1 reorg");
        }
        reverted
    }

    /// Hash previously scanned at `height`, if any
    pub fn scanned_hash(&self, height: u64) -> Option<Hash> {
        self.scanned_blocks.get(&height).copied()
    }
}

/// The deposit/withdrawal bridge was retired in favor of burn-and-mint.
pub fn legacy_deposit(_amount: u64) -> Result<(), BridgeError> {
    Err(BridgeError::Deprecated("deposit bridge"))
}

/// The withdrawal path was retired; exits are out of scope for the core.
pub fn legacy_withdraw(_amount: u64) -> Result<(), BridgeError> {
    Err(BridgeError::Deprecated("withdrawal bridge"))
}

/// Fee-oracle minting was retired; the bridge is the only issuance path.
pub fn fee_oracle_mint(_amount: u64) -> Result<(), BridgeError> {
    Err(BridgeError::Deprecated("fee-oracle minting"))
}

/// Build this node's own confirmation for a detected burn.
pub fn make_confirmation(
    key: &ed25519_dalek::SigningKey,
    chain_id: ChainId,
    burn: &DetectedBurn,
    now: Timestamp,
) -> MintConfirmation {
    use ed25519_dalek::Signer;

    let pubkey = key.verifying_key().to_bytes();
    let mut confirmation = MintConfirmation {
        l1_tx_hash: burn.l1_tx_hash,
        chain_id,
        sequencer_address: crate::types::address_from_pubkey(&pubkey),
        amount: burn.amount,
        l2_recipient: burn.l2_recipient,
        timestamp: now,
        signature: [0u8; 64],
    };
    confirmation.signature = key.sign(&confirmation.signing_bytes()).to_bytes();
    confirmation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l1::{encode_burn_marker, L1Transaction, L1TxOut};
    use crate::sequencer::test_support::{registry_with, seq_address, seq_key};
    use crate::sequencer::SequencerRegistry;

    const NOW: Timestamp = 1_700_000_000;

    fn burn_block(height: u64, txid: Hash, recipient: Address, amount: u64) -> L1Block {
        L1Block {
            block_number: height,
            block_hash: [height as u8 + 1; 32],
            timestamp: NOW,
            txs: vec![L1Transaction {
                txid,
                outputs: vec![L1TxOut {
                    value: amount,
                    script: encode_burn_marker(88, &recipient),
                }],
            }],
        }
    }

    fn confirm(
        consensus: &mut MintConsensus,
        registry: &SequencerRegistry,
        seed: u8,
        burn: &DetectedBurn,
    ) -> Result<Option<ConsensusReached>, BridgeError> {
        let confirmation = make_confirmation(&seq_key(seed), 88, burn, NOW);
        let signer = registry.get(&seq_address(seed)).unwrap();
        let weight_of = |addr: &Address| registry.get(addr).map_or(0, |s| s.weight());
        consensus.receive_confirmation(
            &confirmation,
            signer,
            registry.total_weight(NOW),
            weight_of,
            NOW,
        )
    }

    #[test]
    fn test_scan_detects_burn() {
        let mut consensus = MintConsensus::new(88, Fraction::TWO_THIRDS);
        let recipient = [7u8; 20];
        let block = burn_block(100, [0xAA; 32], recipient, 500);

        let detected = consensus.scan_l1_block(&block, NOW);
        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].amount, 500);
        assert_eq!(detected[0].l2_recipient, recipient);

        let state = consensus.get(&[0xAA; 32]).unwrap();
        assert_eq!(state.status, MintStatus::Pending);
        assert_eq!(state.l1_block_number, 100);

        // rescanning the same block is a no-op
        assert!(consensus.scan_l1_block(&block, NOW).is_empty());
    }

    #[test]
    fn test_consensus_at_three_of_four() {
        // four sequencers of equal weight; threshold needs three of them
        let registry = registry_with(4, NOW);
        let mut consensus = MintConsensus::new(88, Fraction::TWO_THIRDS);

        let block = burn_block(100, [0xAA; 32], [7u8; 20], 100);
        let burn = consensus.scan_l1_block(&block, NOW).remove(0);

        assert!(confirm(&mut consensus, &registry, 1, &burn).unwrap().is_none());
        assert!(confirm(&mut consensus, &registry, 2, &burn).unwrap().is_none());
        assert_eq!(
            consensus.get(&burn.l1_tx_hash).unwrap().status,
            MintStatus::Pending
        );

        // third confirmation crosses 75% >= 2/3
        let reached = confirm(&mut consensus, &registry, 3, &burn).unwrap().unwrap();
        assert_eq!(reached.amount, 100);
        assert_eq!(
            consensus.get(&burn.l1_tx_hash).unwrap().status,
            MintStatus::Reached
        );

        let ready = consensus.ready_mints();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].l1_tx_hash, burn.l1_tx_hash);
    }

    #[test]
    fn test_duplicate_confirmation_rejected() {
        let registry = registry_with(4, NOW);
        let mut consensus = MintConsensus::new(88, Fraction::TWO_THIRDS);
        let block = burn_block(100, [0xAA; 32], [7u8; 20], 100);
        let burn = consensus.scan_l1_block(&block, NOW).remove(0);

        confirm(&mut consensus, &registry, 1, &burn).unwrap();
        assert!(matches!(
            confirm(&mut consensus, &registry, 1, &burn),
            Err(BridgeError::DuplicateConfirmation)
        ));
        assert_eq!(consensus.get(&burn.l1_tx_hash).unwrap().confirmation_count(), 1);
    }

    #[test]
    fn test_amount_mismatch_rejects_burn() {
        let registry = registry_with(4, NOW);
        let mut consensus = MintConsensus::new(88, Fraction::TWO_THIRDS);
        let block = burn_block(100, [0xAA; 32], [7u8; 20], 100);
        let burn = consensus.scan_l1_block(&block, NOW).remove(0);

        confirm(&mut consensus, &registry, 1, &burn).unwrap();

        // second signer claims a different amount
        let mut lying = burn.clone();
        lying.amount = 900;
        assert!(matches!(
            confirm(&mut consensus, &registry, 2, &lying),
            Err(BridgeError::ConfirmationMismatch)
        ));

        let state = consensus.get(&burn.l1_tx_hash).unwrap();
        assert_eq!(state.status, MintStatus::Rejected);
        assert_eq!(state.invalid_confirmations.len(), 1);
        // rejected burns never mint
        assert!(consensus.ready_mints().is_empty());
    }

    #[test]
    fn test_ineligible_signer_rejected() {
        let registry = registry_with(2, NOW);
        let mut consensus = MintConsensus::new(88, Fraction::TWO_THIRDS);
        let block = burn_block(100, [0xAA; 32], [7u8; 20], 100);
        let burn = consensus.scan_l1_block(&block, NOW).remove(0);

        // seed 9 is not registered; borrow an eligible signer's info with
        // a mismatched confirmation address
        let confirmation = make_confirmation(&seq_key(9), 88, &burn, NOW);
        let signer = registry.get(&seq_address(1)).unwrap();
        let weight_of = |addr: &Address| registry.get(addr).map_or(0, |s| s.weight());
        assert!(matches!(
            consensus.receive_confirmation(
                &confirmation,
                signer,
                registry.total_weight(NOW),
                weight_of,
                NOW
            ),
            Err(BridgeError::SignerNotEligible)
        ));
    }

    #[test]
    fn test_old_confirmation_rejected() {
        let registry = registry_with(4, NOW);
        let mut consensus = MintConsensus::new(88, Fraction::TWO_THIRDS);
        let block = burn_block(100, [0xAA; 32], [7u8; 20], 100);
        let burn = consensus.scan_l1_block(&block, NOW).remove(0);

        let confirmation = make_confirmation(&seq_key(1), 88, &burn, NOW - 7200);
        let signer = registry.get(&seq_address(1)).unwrap();
        let weight_of = |addr: &Address| registry.get(addr).map_or(0, |s| s.weight());
        assert!(matches!(
            consensus.receive_confirmation(
                &confirmation,
                signer,
                registry.total_weight(NOW),
                weight_of,
                NOW
            ),
            Err(BridgeError::ConfirmationTooOld)
        ));
    }

    #[test]
    fn test_pending_expires_to_failed() {
        let mut consensus = MintConsensus::new(88, Fraction::TWO_THIRDS);
        let block = burn_block(100, [0xAA; 32], [7u8; 20], 100);
        consensus.scan_l1_block(&block, NOW);

        consensus.process_timeouts(NOW + CONSENSUS_EXPIRY_SECS + 1);
        assert_eq!(
            consensus.get(&[0xAA; 32]).unwrap().status,
            MintStatus::Failed
        );

        // terminal states get pruned on the next sweep past the window
        consensus.process_timeouts(NOW + 2 * CONSENSUS_EXPIRY_SECS + 2);
        assert!(consensus.get(&[0xAA; 32]).is_none());
    }

    #[test]
    fn test_mint_order_by_first_seen_then_hash() {
        let registry = registry_with(3, NOW);
        let mut consensus = MintConsensus::new(88, Fraction::TWO_THIRDS);

        // two burns in one block share first_seen, a third arrives later
        let block_a = L1Block {
            block_number: 100,
            block_hash: [1u8; 32],
            timestamp: NOW,
            txs: vec![
                L1Transaction {
                    txid: [0xBB; 32],
                    outputs: vec![L1TxOut {
                        value: 10,
                        script: encode_burn_marker(88, &[1u8; 20]),
                    }],
                },
                L1Transaction {
                    txid: [0xAA; 32],
                    outputs: vec![L1TxOut {
                        value: 20,
                        script: encode_burn_marker(88, &[2u8; 20]),
                    }],
                },
            ],
        };
        let burns = consensus.scan_l1_block(&block_a, NOW);
        let block_b = burn_block(101, [0x01; 32], [3u8; 20], 30);
        let late = consensus.scan_l1_block(&block_b, NOW + 10).remove(0);

        for burn in burns.iter().chain(std::iter::once(&late)) {
            for seed in 1..=3u8 {
                let _ = confirm(&mut consensus, &registry, seed, burn);
            }
        }

        let ready = consensus.ready_mints();
        assert_eq!(ready.len(), 3);
        // same first_seen: ordered by tx hash; later burn comes last
        assert_eq!(ready[0].l1_tx_hash, [0xAA; 32]);
        assert_eq!(ready[1].l1_tx_hash, [0xBB; 32]);
        assert_eq!(ready[2].l1_tx_hash, [0x01; 32]);
    }

    #[test]
    fn test_reorg_reverts_to_pending() {
        let registry = registry_with(3, NOW);
        let mut consensus = MintConsensus::new(88, Fraction::TWO_THIRDS);
        let block = burn_block(100, [0xAA; 32], [7u8; 20], 100);
        let burn = consensus.scan_l1_block(&block, NOW).remove(0);

        for seed in 1..=3u8 {
            let _ = confirm(&mut consensus, &registry, seed, &burn);
        }
        assert_eq!(
            consensus.get(&burn.l1_tx_hash).unwrap().status,
            MintStatus::Reached
        );

        let reverted = consensus.handle_reorg(100, NOW + 50);
        assert_eq!(reverted, vec![burn.l1_tx_hash]);

        let state = consensus.get(&burn.l1_tx_hash).unwrap();
        assert_eq!(state.status, MintStatus::Pending);
        assert_eq!(state.confirmation_count(), 0);
        assert!(consensus.scanned_hash(100).is_none());
    }

    #[test]
    fn test_retired_paths_stay_retired() {
        assert!(matches!(
            legacy_deposit(100),
            Err(BridgeError::Deprecated("deposit bridge"))
        ));
        assert!(matches!(
            legacy_withdraw(100),
            Err(BridgeError::Deprecated("withdrawal bridge"))
        ));
        assert!(matches!(
            fee_oracle_mint(100),
            Err(BridgeError::Deprecated("fee-oracle minting"))
        ));
    }
}
