//! Sequencer registry
//!
//! Tracks every sequencer known through signed announcements, validates
//! peer attestations of stake and reputation, and derives the eligible
//! set that election and vote weighting run on.
//!
//! Registry rules:
//! - announcements are rejected for wrong chain, future clocks, expiry,
//!   newer protocol versions, or bad signatures
//! - a duplicate address only updates on a strictly newer timestamp
//! - the registry is capped; the stalest entry is evicted when full
//! - `is_verified` flips only after enough distinct peers attest, and the
//!   attested mean becomes the authoritative stake and reputation

use crate::config::GenesisConfig;
use crate::types::{
    address_from_pubkey, sequencer_weight, verify_signature, Address, BlockNumber, ChainId,
    PublicKey, SeqAnnounce, SequencerAttestation, Timestamp,
};
use std::collections::{BTreeMap, HashMap};

/// Registry capacity
pub const MAX_SEQUENCERS: usize = 100;

/// Announcements older than this are dead
pub const ANNOUNCEMENT_EXPIRY_SECS: u64 = 3600;

/// Tolerated clock skew for incoming messages
pub const MAX_CLOCK_SKEW_SECS: u64 = 60;

/// Distinct attesters required before an entry is verified
pub const MIN_ATTESTATIONS: usize = 3;

/// Attestations kept per target; oldest pruned beyond this
pub const MAX_ATTESTATIONS_PER_TARGET: usize = 32;

/// Protocol version spoken by this node
pub const PROTOCOL_VERSION: u32 = 1;

/// Everything the registry knows about one sequencer
#[derive(Clone, Debug)]
pub struct SequencerInfo {
    pub address: Address,
    pub pubkey: PublicKey,
    /// Stake in satoshi units; attested mean once verified
    pub verified_stake: u64,
    /// HAT reputation; attested mean once verified
    pub verified_hat_score: u32,
    pub peer_count: u32,
    pub public_endpoint: String,
    pub last_announcement: Timestamp,
    pub last_block_produced: BlockNumber,
    pub blocks_produced: u64,
    pub blocks_missed: u64,
    pub is_verified: bool,
    pub is_eligible: bool,
    pub attestation_count: u32,
    pub chain_id: ChainId,
}

impl SequencerInfo {
    /// Election and vote weight: `hat * ceil(sqrt(stake in whole coins))`
    pub fn weight(&self) -> u64 {
        sequencer_weight(self.verified_hat_score, self.verified_stake)
    }

    /// Produced / (produced + missed); 1.0 with no history
    pub fn uptime_ratio(&self) -> f64 {
        let total = self.blocks_produced + self.blocks_missed;
        if total == 0 {
            return 1.0;
        }
        self.blocks_produced as f64 / total as f64
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now.saturating_sub(self.last_announcement) > ANNOUNCEMENT_EXPIRY_SECS
    }
}

/// Control-plane summary of the registry
#[derive(Clone, Debug, Default)]
pub struct RegistryStats {
    pub total: usize,
    pub eligible: usize,
    pub verified: usize,
    pub total_weight: u64,
    pub rejected_announcements: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("wrong chain id: expected {expected}, got {got}")]
    WrongChain { expected: ChainId, got: ChainId },

    #[error("timestamp too far in the future")]
    FutureTimestamp,

    #[error("announcement expired")]
    Expired,

    #[error("protocol version {0} is newer than ours")]
    VersionTooNew(u32),

    #[error("invalid signature")]
    BadSignature,

    #[error("stale announcement for known sequencer")]
    Stale,

    #[error("unknown sequencer {}", hex::encode(.0))]
    UnknownSequencer(Address),

    #[error("duplicate attestation is not newer")]
    StaleAttestation,
}

/// The sequencer registry
pub struct SequencerRegistry {
    chain_id: ChainId,
    min_hat: u32,
    min_stake: u64,
    min_peers: u32,
    sequencers: BTreeMap<Address, SequencerInfo>,
    attestations: HashMap<Address, Vec<SequencerAttestation>>,
    rejected_announcements: u64,
}

impl SequencerRegistry {
    pub fn new(config: &GenesisConfig) -> Self {
        Self {
            chain_id: config.chain_id,
            min_hat: config.min_hat,
            min_stake: config.min_stake,
            min_peers: config.min_peers,
            sequencers: BTreeMap::new(),
            attestations: HashMap::new(),
            rejected_announcements: 0,
        }
    }

    pub fn get(&self, address: &Address) -> Option<&SequencerInfo> {
        self.sequencers.get(address)
    }

    pub fn pubkey_of(&self, address: &Address) -> Option<PublicKey> {
        self.sequencers.get(address).map(|s| s.pubkey)
    }

    pub fn len(&self) -> usize {
        self.sequencers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequencers.is_empty()
    }

    /// Validate and ingest a signed announcement. Replays and older
    /// duplicates never affect state.
    pub fn register_announcement(
        &mut self,
        announce: &SeqAnnounce,
        now: Timestamp,
    ) -> Result<(), RegistryError> {
        let result = self.validate_and_apply(announce, now);
        if result.is_err() {
            self.rejected_announcements += 1;
        }
        result
    }

    fn validate_and_apply(
        &mut self,
        announce: &SeqAnnounce,
        now: Timestamp,
    ) -> Result<(), RegistryError> {
        if announce.chain_id != self.chain_id {
            return Err(RegistryError::WrongChain {
                expected: self.chain_id,
                got: announce.chain_id,
            });
        }
        if announce.timestamp > now + MAX_CLOCK_SKEW_SECS {
            return Err(RegistryError::FutureTimestamp);
        }
        if now.saturating_sub(announce.timestamp) > ANNOUNCEMENT_EXPIRY_SECS {
            return Err(RegistryError::Expired);
        }
        if announce.protocol_version > PROTOCOL_VERSION {
            return Err(RegistryError::VersionTooNew(announce.protocol_version));
        }
        if address_from_pubkey(&announce.pubkey) != announce.address
            || !verify_signature(
                &announce.pubkey,
                &announce.signing_bytes(),
                &announce.signature,
            )
        {
            return Err(RegistryError::BadSignature);
        }

        if let Some(existing) = self.sequencers.get(&announce.address) {
            if announce.timestamp <= existing.last_announcement {
                return Err(RegistryError::Stale);
            }
        } else if self.sequencers.len() >= MAX_SEQUENCERS {
            self.evict_stalest();
        }

        let previous = self.sequencers.get(&announce.address);
        let mut info = SequencerInfo {
            address: announce.address,
            pubkey: announce.pubkey,
            verified_stake: announce.stake,
            verified_hat_score: announce.hat_score,
            peer_count: announce.peer_count,
            public_endpoint: announce.public_endpoint.clone(),
            last_announcement: announce.timestamp,
            last_block_produced: previous.map_or(0, |p| p.last_block_produced),
            blocks_produced: previous.map_or(0, |p| p.blocks_produced),
            blocks_missed: previous.map_or(0, |p| p.blocks_missed),
            is_verified: false,
            is_eligible: false,
            attestation_count: previous.map_or(0, |p| p.attestation_count),
            chain_id: announce.chain_id,
        };
        self.apply_attestation_consensus(&mut info);
        info.is_eligible = self.meets_minimums(&info);
        self.sequencers.insert(announce.address, info);
        Ok(())
    }

    fn evict_stalest(&mut self) {
        let stalest = self
            .sequencers
            .values()
            .min_by_key(|s| (s.last_announcement, s.address))
            .map(|s| s.address);
        if let Some(addr) = stalest {
            self.sequencers.remove(&addr);
            self.attestations.remove(&addr);
            tracing::debug!(address = %hex::encode(addr), "evicted stalest sequencer");
        }
    }

    fn meets_minimums(&self, info: &SequencerInfo) -> bool {
        info.verified_hat_score >= self.min_hat
            && info.verified_stake >= self.min_stake
            && info.peer_count >= self.min_peers
    }

    /// Validate and store a peer attestation; re-derives the target's
    /// verified values when enough distinct attesters agree.
    pub fn record_attestation(
        &mut self,
        attestation: &SequencerAttestation,
        now: Timestamp,
    ) -> Result<(), RegistryError> {
        if !self.sequencers.contains_key(&attestation.sequencer) {
            return Err(RegistryError::UnknownSequencer(attestation.sequencer));
        }
        let attester = self
            .sequencers
            .get(&attestation.attester)
            .ok_or(RegistryError::UnknownSequencer(attestation.attester))?;
        if attestation.timestamp > now + MAX_CLOCK_SKEW_SECS {
            return Err(RegistryError::FutureTimestamp);
        }
        if !verify_signature(
            &attester.pubkey,
            &attestation.signing_bytes(),
            &attestation.signature,
        ) {
            return Err(RegistryError::BadSignature);
        }

        let entry = self.attestations.entry(attestation.sequencer).or_default();
        if let Some(existing) = entry
            .iter_mut()
            .find(|a| a.attester == attestation.attester)
        {
            if attestation.timestamp <= existing.timestamp {
                return Err(RegistryError::StaleAttestation);
            }
            *existing = attestation.clone();
        } else {
            entry.push(attestation.clone());
            if entry.len() > MAX_ATTESTATIONS_PER_TARGET {
                // prune oldest-first on overflow
                entry.sort_by_key(|a| a.timestamp);
                let excess = entry.len() - MAX_ATTESTATIONS_PER_TARGET;
                entry.drain(..excess);
            }
        }

        let mut info = self
            .sequencers
            .get(&attestation.sequencer)
            .cloned()
            .ok_or(RegistryError::UnknownSequencer(attestation.sequencer))?;
        self.apply_attestation_consensus(&mut info);
        info.is_eligible = self.meets_minimums(&info);
        self.sequencers.insert(info.address, info);
        Ok(())
    }

    /// With enough distinct attesters, the simple mean of their attested
    /// values becomes authoritative.
    fn apply_attestation_consensus(&self, info: &mut SequencerInfo) {
        let Some(attestations) = self.attestations.get(&info.address) else {
            info.attestation_count = 0;
            return;
        };
        info.attestation_count = attestations.len() as u32;
        if attestations.len() < MIN_ATTESTATIONS {
            info.is_verified = false;
            return;
        }
        let n = attestations.len() as u64;
        info.verified_stake = attestations.iter().map(|a| a.attested_stake).sum::<u64>() / n;
        info.verified_hat_score =
            (attestations.iter().map(|a| a.attested_hat as u64).sum::<u64>() / n) as u32;
        info.is_verified = true;
    }

    /// Drop entries whose announcements went silent past the expiry
    /// window. Returns how many were removed.
    pub fn expire_silent(&mut self, now: Timestamp) -> usize {
        let expired: Vec<Address> = self
            .sequencers
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.address)
            .collect();
        for addr in &expired {
            self.sequencers.remove(addr);
            self.attestations.remove(addr);
        }
        expired.len()
    }

    /// Eligible, unexpired sequencers in canonical order: weight
    /// descending, address ascending. This is the candidate order both
    /// election and failover backups use.
    pub fn eligible_set(&self, now: Timestamp) -> Vec<SequencerInfo> {
        let mut set: Vec<SequencerInfo> = self
            .sequencers
            .values()
            .filter(|s| s.is_eligible && !s.is_expired(now))
            .cloned()
            .collect();
        set.sort_by(|a, b| b.weight().cmp(&a.weight()).then(a.address.cmp(&b.address)));
        set
    }

    /// Summed weight of the eligible set
    pub fn total_weight(&self, now: Timestamp) -> u64 {
        self.eligible_set(now).iter().map(|s| s.weight()).sum()
    }

    pub fn record_block_produced(&mut self, address: &Address, block: BlockNumber) {
        if let Some(info) = self.sequencers.get_mut(address) {
            info.blocks_produced += 1;
            info.last_block_produced = block;
        }
    }

    pub fn record_block_missed(&mut self, address: &Address) {
        if let Some(info) = self.sequencers.get_mut(address) {
            info.blocks_missed += 1;
        }
    }

    pub fn stats(&self, now: Timestamp) -> RegistryStats {
        RegistryStats {
            total: self.sequencers.len(),
            eligible: self
                .sequencers
                .values()
                .filter(|s| s.is_eligible && !s.is_expired(now))
                .count(),
            verified: self.sequencers.values().filter(|s| s.is_verified).count(),
            total_weight: self.total_weight(now),
            rejected_announcements: self.rejected_announcements,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::types::COIN;
    use ed25519_dalek::{Signer, SigningKey};

    /// Deterministic sequencer keypair for tests
    pub fn seq_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    pub fn seq_address(seed: u8) -> Address {
        address_from_pubkey(&seq_key(seed).verifying_key().to_bytes())
    }

    pub fn signed_announce(
        seed: u8,
        stake_coins: u64,
        hat: u32,
        now: Timestamp,
        chain_id: ChainId,
    ) -> SeqAnnounce {
        let key = seq_key(seed);
        let pubkey = key.verifying_key().to_bytes();
        let mut announce = SeqAnnounce {
            address: address_from_pubkey(&pubkey),
            pubkey,
            stake: stake_coins * COIN,
            hat_score: hat,
            peer_count: 8,
            public_endpoint: format!("quic://198.51.100.{seed}:7700"),
            l1_block_height: 1000,
            timestamp: now,
            chain_id,
            protocol_version: PROTOCOL_VERSION,
            signature: [0u8; 64],
        };
        announce.signature = key.sign(&announce.signing_bytes()).to_bytes();
        announce
    }

    /// Registry with `n` eligible sequencers of equal stake and hat
    pub fn registry_with(n: u8, now: Timestamp) -> SequencerRegistry {
        let config = GenesisConfig::default();
        let mut registry = SequencerRegistry::new(&config);
        for seed in 1..=n {
            let announce = signed_announce(seed, 400, 25, now, config.chain_id);
            registry.register_announcement(&announce, now).unwrap();
        }
        registry
    }
}
