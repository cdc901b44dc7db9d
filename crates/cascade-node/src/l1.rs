//! L1 adapter surface
//!
//! The settlement chain is an external collaborator; this module pins down
//! the data it must deliver (blocks with transactions, in ascending order,
//! final at a configured confirmation depth) and the burn-marker output
//! format that binds destroyed L1 value to an L2 recipient.
//!
//! Burn marker script, canonical form:
//!
//! ```text
//! OP_RETURN
//! PUSH(6)  "L2BURN"
//! PUSH(32) chain_id_u64_be || l2_recipient_20B || version_u32_be
//! ```

use crate::types::{Address, ChainId, Hash};
use cascade_smt::double_sha256;
use serde::{Deserialize, Serialize};

pub const OP_RETURN: u8 = 0x6A;

/// ASCII tag identifying a burn output
pub const BURN_TAG: &[u8; 6] = b"L2BURN";

/// Current burn-marker payload version
pub const BURN_MARKER_VERSION: u32 = 1;

/// Transaction output on the L1 chain
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct L1TxOut {
    /// Value in satoshi units
    pub value: u64,
    pub script: Vec<u8>,
}

/// L1 transaction, reduced to what burn detection needs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct L1Transaction {
    pub txid: Hash,
    pub outputs: Vec<L1TxOut>,
}

/// One L1 block as delivered by the adapter
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct L1Block {
    pub block_number: u64,
    pub block_hash: Hash,
    pub timestamp: u64,
    pub txs: Vec<L1Transaction>,
}

/// Decoded burn-marker payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BurnMarker {
    pub chain_id: ChainId,
    pub l2_recipient: Address,
    pub version: u32,
}

/// Build the canonical burn-marker script.
pub fn encode_burn_marker(chain_id: ChainId, l2_recipient: &Address) -> Vec<u8> {
    let mut script = Vec::with_capacity(2 + 6 + 1 + 32);
    script.push(OP_RETURN);
    script.push(BURN_TAG.len() as u8);
    script.extend_from_slice(BURN_TAG);
    script.push(32);
    script.extend_from_slice(&chain_id.to_be_bytes());
    script.extend_from_slice(l2_recipient);
    script.extend_from_slice(&BURN_MARKER_VERSION.to_be_bytes());
    script
}

/// Parse a script as a burn marker. Returns `None` for anything that is
/// not the exact canonical form.
pub fn decode_burn_marker(script: &[u8]) -> Option<BurnMarker> {
    // OP_RETURN, PUSH(6) tag, PUSH(32) payload
    if script.len() != 1 + 1 + 6 + 1 + 32 {
        return None;
    }
    if script[0] != OP_RETURN || script[1] != 6 || &script[2..8] != BURN_TAG || script[8] != 32 {
        return None;
    }
    let payload = &script[9..41];
    let chain_id = u64::from_be_bytes(payload[0..8].try_into().ok()?);
    let mut recipient = [0u8; 20];
    recipient.copy_from_slice(&payload[8..28]);
    let version = u32::from_be_bytes(payload[28..32].try_into().ok()?);

    Some(BurnMarker {
        chain_id,
        l2_recipient: recipient,
        version,
    })
}

/// A detected burn within one L1 transaction: the summed value of its
/// burn outputs for `chain_id`, or `None` if it carries none.
pub fn detect_burn(tx: &L1Transaction, chain_id: ChainId) -> Option<(Address, u64)> {
    let mut recipient = None;
    let mut amount = 0u64;
    for out in &tx.outputs {
        let Some(marker) = decode_burn_marker(&out.script) else {
            continue;
        };
        if marker.chain_id != chain_id {
            continue;
        }
        match recipient {
            None => recipient = Some(marker.l2_recipient),
            // one recipient per transaction; conflicting markers void it
            Some(existing) if existing != marker.l2_recipient => return None,
            Some(_) => {}
        }
        amount = amount.saturating_add(out.value);
    }
    recipient.map(|r| (r, amount))
}

/// What the L1 adapter must supply: blocks in ascending order plus hash
/// lookups for the election seed and reorg detection.
pub trait L1Client: Send {
    /// Height of the current best block
    fn best_height(&self) -> u64;

    /// Block at `height` on the current best chain
    fn block(&self, height: u64) -> Option<L1Block>;

    /// Hash of the block at `height` on the current best chain
    fn block_hash(&self, height: u64) -> Option<Hash> {
        self.block(height).map(|b| b.block_hash)
    }
}

/// Highest L1 height considered final at `confirmations` depth.
pub fn finalized_height(best: u64, confirmations: u64) -> Option<u64> {
    (best + 1).checked_sub(confirmations)
}

/// In-memory L1 chain for the devnet driver and tests. Supports reorgs by
/// truncating and re-extending the chain with different blocks.
#[derive(Clone, Debug, Default)]
pub struct SimulatedL1 {
    blocks: Vec<L1Block>,
}

impl SimulatedL1 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a block; hash is derived from height, parent, fork tag, and
    /// timestamp so reorged replacements hash differently.
    pub fn push_block(&mut self, timestamp: u64, txs: Vec<L1Transaction>, fork_tag: u8) -> Hash {
        let height = self.blocks.len() as u64;
        let parent = self
            .blocks
            .last()
            .map(|b| b.block_hash)
            .unwrap_or([0u8; 32]);

        let mut preimage = Vec::with_capacity(8 + 32 + 8 + 1);
        preimage.extend_from_slice(&height.to_le_bytes());
        preimage.extend_from_slice(&parent);
        preimage.extend_from_slice(&timestamp.to_le_bytes());
        preimage.push(fork_tag);
        let block_hash = double_sha256(&preimage);

        self.blocks.push(L1Block {
            block_number: height,
            block_hash,
            timestamp,
            txs,
        });
        block_hash
    }

    /// Drop every block at `from_height` and above.
    pub fn truncate(&mut self, from_height: u64) {
        self.blocks.truncate(from_height as usize);
    }
}

impl L1Client for SimulatedL1 {
    fn best_height(&self) -> u64 {
        self.blocks.len().saturating_sub(1) as u64
    }

    fn block(&self, height: u64) -> Option<L1Block> {
        self.blocks.get(height as usize).cloned()
    }
}
