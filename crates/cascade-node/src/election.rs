//! Leader election and failover
//!
//! Time is divided into slots of `blocks_per_leader` L2 blocks. Each slot
//! gets a leader by weighted random selection over the eligible set,
//! seeded from an L1 block hash old enough to be final, plus an ordered
//! backup list for failover. Election is a pure function of its inputs:
//! the same slot, candidate set, and seed always produce the same leader
//! and backup order.

use crate::types::{
    double_sha256, verify_signature, Address, BlockNumber, ChainId, Hash, LeadershipClaim, Slot,
    Timestamp,
};
use crate::sequencer::SequencerInfo;

/// Domain separator mixed into every election seed
pub const ELECTION_SEED_TAG: &[u8] = b"CASCOIN_L2_ELECTION_SEED_V1";

/// Backups kept per slot
pub const MAX_BACKUPS: usize = 10;

/// The seed anchors this many L1 blocks before the slot start, deep
/// enough that the hash is final when the slot begins
pub const SEED_LOOKBACK_BLOCKS: u64 = 6;

/// Tolerated clock skew on leadership claims
pub const CLAIM_MAX_SKEW_SECS: u64 = 60;

/// L1 height whose hash seeds the election for `slot`
pub fn seed_anchor_height(slot: Slot, blocks_per_leader: u64) -> u64 {
    (slot * blocks_per_leader).saturating_sub(SEED_LOOKBACK_BLOCKS)
}

/// `H(slot || l1_block_hash || chain_id || tag)`
pub fn election_seed(slot: Slot, l1_block_hash: &Hash, chain_id: ChainId) -> Hash {
    let mut preimage = Vec::with_capacity(8 + 32 + 8 + ELECTION_SEED_TAG.len());
    preimage.extend_from_slice(&slot.to_le_bytes());
    preimage.extend_from_slice(l1_block_hash);
    preimage.extend_from_slice(&chain_id.to_le_bytes());
    preimage.extend_from_slice(ELECTION_SEED_TAG);
    double_sha256(&preimage)
}

/// First 8 seed bytes as a little-endian integer
fn low64(seed: &Hash) -> u64 {
    u64::from_le_bytes(seed[0..8].try_into().unwrap_or([0u8; 8]))
}

/// Outcome of electing a slot leader
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ElectionResult {
    pub slot: Slot,
    pub leader: Address,
    /// Failover order; position 1 is `backups[0]`
    pub backups: Vec<Address>,
    pub valid_until_block: BlockNumber,
}

impl ElectionResult {
    /// Failover position of an address: 0 for the leader, n for the nth
    /// backup, `None` for everyone else.
    pub fn position_of(&self, address: &Address) -> Option<u32> {
        if self.leader == *address {
            return Some(0);
        }
        self.backups
            .iter()
            .position(|b| b == address)
            .map(|i| i as u32 + 1)
    }
}

/// Elect the leader and backups for `slot`.
///
/// `candidates` must already be in canonical order (weight descending,
/// address ascending); weighted random selection walks their cumulative
/// weights until it passes `low64(seed) % total_weight`. A zero total
/// weight falls back to uniform selection.
pub fn elect_leader(
    slot: Slot,
    blocks_per_leader: u64,
    candidates: &[SequencerInfo],
    seed: &Hash,
) -> Option<ElectionResult> {
    if candidates.is_empty() {
        return None;
    }
    let valid_until_block = (slot + 1) * blocks_per_leader;

    let leader_idx = if candidates.len() == 1 {
        0
    } else {
        let total_weight: u64 = candidates.iter().map(|c| c.weight()).sum();
        if total_weight == 0 {
            (low64(seed) % candidates.len() as u64) as usize
        } else {
            let r = low64(seed) % total_weight;
            let mut cumulative = 0u64;
            let mut chosen = candidates.len() - 1;
            for (i, candidate) in candidates.iter().enumerate() {
                cumulative += candidate.weight();
                if cumulative > r {
                    chosen = i;
                    break;
                }
            }
            chosen
        }
    };

    let leader = candidates[leader_idx].address;
    let backups: Vec<Address> = candidates
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != leader_idx)
        .map(|(_, c)| c.address)
        .take(MAX_BACKUPS)
        .collect();

    Some(ElectionResult {
        slot,
        leader,
        backups,
        valid_until_block,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ElectionError {
    #[error("no election is active")]
    NoActiveSlot,

    #[error("claim is for slot {got}, active slot is {active}")]
    WrongSlot { active: Slot, got: Slot },

    #[error("claimant is not the leader or a backup for this slot")]
    NotACandidate,

    #[error("claimed position {claimed} does not match the claimant's position {actual}")]
    WrongPosition { claimed: u32, actual: u32 },

    #[error("claimed position {claimed} is beyond the failover window at {current}")]
    PositionTooFar { claimed: u32, current: u32 },

    #[error("claim timestamp outside the allowed window")]
    StaleClaim,

    #[error("invalid claim signature")]
    BadSignature,
}

/// Per-slot failover bookkeeping: who currently acts as leader, how many
/// failovers have happened, and which leadership claims were accepted.
#[derive(Clone, Debug)]
pub struct FailoverTracker {
    election: ElectionResult,
    current_failover_position: u32,
    acting_leader: Address,
    accepted_claims: Vec<(LeadershipClaim, u32 /* claimant hat */)>,
}

impl FailoverTracker {
    pub fn new(election: ElectionResult) -> Self {
        let acting_leader = election.leader;
        Self {
            election,
            current_failover_position: 0,
            acting_leader,
            accepted_claims: Vec::new(),
        }
    }

    pub fn slot(&self) -> Slot {
        self.election.slot
    }

    pub fn acting_leader(&self) -> Address {
        self.acting_leader
    }

    pub fn current_failover_position(&self) -> u32 {
        self.current_failover_position
    }

    pub fn election(&self) -> &ElectionResult {
        &self.election
    }

    /// Leader timed out: advance the failover position and hand leadership
    /// to the next backup. Returns the new acting leader, or `None` when
    /// the backup list is exhausted.
    pub fn advance_failover(&mut self) -> Option<Address> {
        let next = self
            .election
            .backups
            .get(self.current_failover_position as usize)
            .copied()?;
        self.current_failover_position += 1;
        self.acting_leader = next;
        tracing::warn!(
            slot = self.election.slot,
            position = self.current_failover_position,
            leader = %hex::encode(next),
            "leader failover"
        );
        Some(next)
    }

    /// Validate a proactive leadership claim. Accepted claims re-resolve
    /// the acting leader by (position, reputation, timestamp, address).
    pub fn submit_claim(
        &mut self,
        claim: &LeadershipClaim,
        claimant: &SequencerInfo,
        now: Timestamp,
    ) -> Result<Address, ElectionError> {
        if claim.slot != self.election.slot {
            return Err(ElectionError::WrongSlot {
                active: self.election.slot,
                got: claim.slot,
            });
        }
        let actual = self
            .election
            .position_of(&claim.address)
            .ok_or(ElectionError::NotACandidate)?;
        if claim.failover_position != actual {
            return Err(ElectionError::WrongPosition {
                claimed: claim.failover_position,
                actual,
            });
        }
        if claim.failover_position > self.current_failover_position + 1 {
            return Err(ElectionError::PositionTooFar {
                claimed: claim.failover_position,
                current: self.current_failover_position,
            });
        }
        if claim.timestamp > now + CLAIM_MAX_SKEW_SECS
            || now.saturating_sub(claim.timestamp) > CLAIM_MAX_SKEW_SECS
        {
            return Err(ElectionError::StaleClaim);
        }
        if !verify_signature(&claimant.pubkey, &claim.signing_bytes(), &claim.signature) {
            return Err(ElectionError::BadSignature);
        }

        // idempotent under replay: same claimant and position only once
        if !self
            .accepted_claims
            .iter()
            .any(|(c, _)| c.address == claim.address && c.failover_position == claim.failover_position)
        {
            self.accepted_claims
                .push((claim.clone(), claimant.verified_hat_score));
        }
        self.resolve();
        Ok(self.acting_leader)
    }

    /// Conflicting valid claims resolve by lower failover position, then
    /// higher reputation, then earlier timestamp, then lower address.
    fn resolve(&mut self) {
        let winner = self.accepted_claims.iter().min_by(|(a, a_hat), (b, b_hat)| {
            a.failover_position
                .cmp(&b.failover_position)
                .then(b_hat.cmp(a_hat))
                .then(a.timestamp.cmp(&b.timestamp))
                .then(a.address.cmp(&b.address))
        });
        if let Some((claim, _)) = winner {
            if claim.failover_position > self.current_failover_position {
                self.current_failover_position = claim.failover_position;
            }
            self.acting_leader = claim.address;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::test_support::{registry_with, seq_address, seq_key};
    use crate::types::COIN;
    use ed25519_dalek::Signer;

    const NOW: Timestamp = 1_700_000_000;

    fn candidates(n: u8) -> Vec<SequencerInfo> {
        registry_with(n, NOW).eligible_set(NOW)
    }

    fn signed_claim(seed: u8, slot: Slot, position: u32, timestamp: Timestamp) -> LeadershipClaim {
        let key = seq_key(seed);
        let mut claim = LeadershipClaim {
            address: seq_address(seed),
            slot,
            failover_position: position,
            timestamp,
            previous_leader: [0u8; 20],
            reason: "leader timeout".into(),
            signature: [0u8; 64],
        };
        claim.signature = key.sign(&claim.signing_bytes()).to_bytes();
        claim
    }

    #[test]
    fn test_seed_is_domain_separated() {
        let a = election_seed(5, &[1u8; 32], 88);
        let b = election_seed(6, &[1u8; 32], 88);
        let c = election_seed(5, &[2u8; 32], 88);
        let d = election_seed(5, &[1u8; 32], 89);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_seed_anchor_height() {
        assert_eq!(seed_anchor_height(0, 10), 0);
        assert_eq!(seed_anchor_height(1, 10), 4);
        assert_eq!(seed_anchor_height(5, 10), 44);
    }

    #[test]
    fn test_election_pure_function() {
        let set = candidates(6);
        let seed = election_seed(5, &[7u8; 32], 88);

        let a = elect_leader(5, 10, &set, &seed).unwrap();
        let b = elect_leader(5, 10, &set, &seed).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.valid_until_block, 60);
    }

    #[test]
    fn test_empty_and_singleton_sets() {
        let seed = election_seed(1, &[1u8; 32], 88);
        assert!(elect_leader(1, 10, &[], &seed).is_none());

        let set = candidates(1);
        let result = elect_leader(1, 10, &set, &seed).unwrap();
        assert_eq!(result.leader, set[0].address);
        assert!(result.backups.is_empty());
    }

    #[test]
    fn test_backups_exclude_leader_and_cap() {
        let set = candidates(15);
        let seed = election_seed(3, &[9u8; 32], 88);
        let result = elect_leader(3, 10, &set, &seed).unwrap();

        assert_eq!(result.backups.len(), MAX_BACKUPS);
        assert!(!result.backups.contains(&result.leader));
    }

    #[test]
    fn test_weighted_selection_tracks_weight() {
        // one whale against three minnows: over many seeds the whale must
        // win far more often than any minnow
        let mut set = candidates(4);
        set[0].verified_stake = 90_000 * COIN;
        set[0].verified_hat_score = 100;
        set.sort_by(|a, b| b.weight().cmp(&a.weight()).then(a.address.cmp(&b.address)));
        let whale = set[0].address;

        let mut whale_wins = 0;
        let rounds = 2000;
        for i in 0..rounds {
            let seed = election_seed(i, &double_sha256(&i.to_le_bytes()), 88);
            let result = elect_leader(i, 10, &set, &seed).unwrap();
            if result.leader == whale {
                whale_wins += 1;
            }
        }

        let whale_weight = set[0].weight() as f64;
        let total: f64 = set.iter().map(|c| c.weight() as f64).sum();
        let expected = rounds as f64 * whale_weight / total;
        let actual = whale_wins as f64;
        // within 10% of the expected frequency
        assert!(
            (actual - expected).abs() < expected * 0.10,
            "expected ~{expected}, got {actual}"
        );
    }

    #[test]
    fn test_zero_weight_uniform_fallback() {
        let mut set = candidates(4);
        for c in &mut set {
            c.verified_hat_score = 0;
        }
        let seed = election_seed(2, &[3u8; 32], 88);
        let result = elect_leader(2, 10, &set, &seed).unwrap();
        assert!(set.iter().any(|c| c.address == result.leader));
    }

    #[test]
    fn test_failover_advances_through_backups() {
        let set = candidates(4);
        let seed = election_seed(5, &[7u8; 32], 88);
        let election = elect_leader(5, 10, &set, &seed).unwrap();
        let backups = election.backups.clone();

        let mut tracker = FailoverTracker::new(election);
        assert_eq!(tracker.current_failover_position(), 0);

        let first = tracker.advance_failover().unwrap();
        assert_eq!(first, backups[0]);
        assert_eq!(tracker.current_failover_position(), 1);

        let second = tracker.advance_failover().unwrap();
        assert_eq!(second, backups[1]);

        tracker.advance_failover().unwrap();
        assert!(tracker.advance_failover().is_none());
    }

    #[test]
    fn test_claim_accepted_at_next_position() {
        let registry = registry_with(4, NOW);
        let set = registry.eligible_set(NOW);
        let seed = election_seed(5, &[7u8; 32], 88);
        let election = elect_leader(5, 10, &set, &seed).unwrap();
        let first_backup = election.backups[0];

        let mut tracker = FailoverTracker::new(election);

        // find the key seed of the first backup
        let claimant_seed = (1..=4u8).find(|s| seq_address(*s) == first_backup).unwrap();
        let claim = signed_claim(claimant_seed, 5, 1, NOW);
        let claimant = registry.get(&first_backup).unwrap();

        let acting = tracker.submit_claim(&claim, claimant, NOW).unwrap();
        assert_eq!(acting, first_backup);
        assert_eq!(tracker.current_failover_position(), 1);
    }

    #[test]
    fn test_claim_too_far_ahead_rejected() {
        let registry = registry_with(5, NOW);
        let set = registry.eligible_set(NOW);
        let seed = election_seed(5, &[7u8; 32], 88);
        let election = elect_leader(5, 10, &set, &seed).unwrap();
        let third_backup = election.backups[2];

        let mut tracker = FailoverTracker::new(election);
        let claimant_seed = (1..=5u8).find(|s| seq_address(*s) == third_backup).unwrap();
        let claim = signed_claim(claimant_seed, 5, 3, NOW);
        let claimant = registry.get(&third_backup).unwrap();

        assert!(matches!(
            tracker.submit_claim(&claim, claimant, NOW),
            Err(ElectionError::PositionTooFar { .. })
        ));
    }

    #[test]
    fn test_claim_wrong_slot_and_stale_rejected() {
        let registry = registry_with(4, NOW);
        let set = registry.eligible_set(NOW);
        let seed = election_seed(5, &[7u8; 32], 88);
        let election = elect_leader(5, 10, &set, &seed).unwrap();
        let first_backup = election.backups[0];
        let claimant_seed = (1..=4u8).find(|s| seq_address(*s) == first_backup).unwrap();

        let mut tracker = FailoverTracker::new(election);
        let claimant = registry.get(&first_backup).unwrap();

        let wrong_slot = signed_claim(claimant_seed, 6, 1, NOW);
        assert!(matches!(
            tracker.submit_claim(&wrong_slot, claimant, NOW),
            Err(ElectionError::WrongSlot { .. })
        ));

        let stale = signed_claim(claimant_seed, 5, 1, NOW - 300);
        assert!(matches!(
            tracker.submit_claim(&stale, claimant, NOW),
            Err(ElectionError::StaleClaim)
        ));
    }

    #[test]
    fn test_conflicting_claims_lower_position_wins() {
        let registry = registry_with(5, NOW);
        let set = registry.eligible_set(NOW);
        let seed = election_seed(5, &[7u8; 32], 88);
        let election = elect_leader(5, 10, &set, &seed).unwrap();
        let b1 = election.backups[0];
        let b2 = election.backups[1];

        let mut tracker = FailoverTracker::new(election);
        // both backups claim after the leader went quiet
        tracker.advance_failover();

        let s2 = (1..=5u8).find(|s| seq_address(*s) == b2).unwrap();
        let claim2 = signed_claim(s2, 5, 2, NOW);
        tracker
            .submit_claim(&claim2, registry.get(&b2).unwrap(), NOW)
            .unwrap();
        assert_eq!(tracker.acting_leader(), b2);

        let s1 = (1..=5u8).find(|s| seq_address(*s) == b1).unwrap();
        let claim1 = signed_claim(s1, 5, 1, NOW + 1);
        tracker
            .submit_claim(&claim1, registry.get(&b1).unwrap(), NOW + 1)
            .unwrap();

        // position 1 beats position 2 regardless of arrival order
        assert_eq!(tracker.acting_leader(), b1);
    }
}
