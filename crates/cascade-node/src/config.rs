//! Node and genesis configuration

use crate::types::{Address, ChainId};
use serde::{Deserialize, Serialize};

/// Exact consensus fraction, kept as integers so threshold checks never
/// round. `2/3` accepts iff `part * 3 >= total * 2`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fraction {
    pub num: u64,
    pub den: u64,
}

impl Fraction {
    pub const TWO_THIRDS: Fraction = Fraction { num: 2, den: 3 };

    /// True iff `part / total >= num / den`
    pub fn met_by(&self, part: u64, total: u64) -> bool {
        if total == 0 {
            return false;
        }
        (part as u128) * (self.den as u128) >= (total as u128) * (self.num as u128)
    }

    /// True iff `part / total > 1 - num / den` (the complement is strictly
    /// exceeded; with 2/3 this is "more than one third")
    pub fn complement_exceeded_by(&self, part: u64, total: u64) -> bool {
        if total == 0 {
            return false;
        }
        (part as u128) * (self.den as u128) > (total as u128) * ((self.den - self.num) as u128)
    }
}

/// Initial token balance granted at genesis
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisAllocation {
    pub address: Address,
    pub amount: u64,
}

/// L2 token metadata. Supply is governed entirely by the burn-and-mint
/// bridge; there is no other issuance path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenConfig {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            name: "Cascade".into(),
            symbol: "CSC".into(),
            decimals: 8,
        }
    }
}

/// Genesis configuration: the parameters every sequencer must agree on
/// before block zero.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub chain_id: ChainId,
    /// L2 blocks per leader slot
    pub blocks_per_leader: u64,
    pub leader_timeout_ms: u64,
    pub consensus_threshold: Fraction,
    pub vote_timeout_ms: u64,
    /// Minimum HAT score for eligibility
    pub min_hat: u32,
    /// Minimum stake in satoshi units for eligibility
    pub min_stake: u64,
    pub min_peers: u32,
    /// L1 confirmations before a burn may be confirmed
    pub required_l1_confirmations: u64,
    pub genesis_distribution: Vec<GenesisAllocation>,
    pub token_config: TokenConfig,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            chain_id: 88,
            blocks_per_leader: 10,
            leader_timeout_ms: 3000,
            consensus_threshold: Fraction::TWO_THIRDS,
            vote_timeout_ms: 5000,
            min_hat: 10,
            min_stake: 100 * crate::types::COIN,
            min_peers: 3,
            required_l1_confirmations: 6,
            genesis_distribution: Vec::new(),
            token_config: TokenConfig::default(),
        }
    }
}

/// State rent parameters
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RentConfig {
    /// Satoshi per byte per year
    pub rate_per_byte_year: u64,
    /// Blocks per rent year
    pub blocks_per_year: u64,
    /// Accounts younger than this many blocks pay nothing
    pub grace_period_blocks: u64,
    /// Accounts that cannot pay and fall below this balance are archived
    pub min_balance: u64,
}

impl Default for RentConfig {
    fn default() -> Self {
        Self {
            rate_per_byte_year: 10,
            blocks_per_year: 2_100_000,
            grace_period_blocks: 10_000,
            min_balance: 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_thirds_threshold() {
        let t = Fraction::TWO_THIRDS;

        // 30 of 40 = 75% passes, 26 of 40 = 65% does not
        assert!(t.met_by(30, 40));
        assert!(!t.met_by(26, 40));
        // exactly two thirds passes
        assert!(t.met_by(2, 3));
        assert!(t.met_by(20, 30));
        // nothing passes against an empty set
        assert!(!t.met_by(0, 0));
    }

    #[test]
    fn test_complement_strictly_exceeded() {
        let t = Fraction::TWO_THIRDS;

        // exactly one third does not exceed
        assert!(!t.complement_exceeded_by(10, 30));
        assert!(t.complement_exceeded_by(11, 30));
    }

    #[test]
    fn test_genesis_defaults() {
        let genesis = GenesisConfig::default();
        assert_eq!(genesis.blocks_per_leader, 10);
        assert_eq!(genesis.leader_timeout_ms, 3000);
        assert_eq!(genesis.required_l1_confirmations, 6);
        assert_eq!(genesis.consensus_threshold, Fraction::TWO_THIRDS);
    }

    #[test]
    fn test_genesis_json_roundtrip() {
        let genesis = GenesisConfig {
            genesis_distribution: vec![GenesisAllocation {
                address: [7u8; 20],
                amount: 1_000,
            }],
            ..Default::default()
        };

        let json = serde_json::to_string(&genesis).unwrap();
        let back: GenesisConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.chain_id, genesis.chain_id);
        assert_eq!(back.genesis_distribution.len(), 1);
    }
}
