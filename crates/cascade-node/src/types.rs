//! Core types for the Cascade rollup
//!
//! Every message that crosses the transport carries a signature made over
//! `signing_bytes()`: the byte concatenation of its fields in declared
//! order, excluding the signature itself. Fixed integers are little-endian,
//! byte vectors are varint-length-prefixed, hashes are 32 bytes and
//! addresses 20 bytes. Double-SHA-256 is the only hash that enters
//! authenticated structures.

use ed25519_dalek::{Signature as DalekSignature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

pub use cascade_smt::{double_sha256, Hash};

/// 20-byte account address
pub type Address = [u8; 20];

/// 64-byte Ed25519 signature
pub type Signature = [u8; 64];

/// 32-byte Ed25519 public key
pub type PublicKey = [u8; 32];

/// L2 block height
pub type BlockNumber = u64;

/// Leader slot index
pub type Slot = u64;

/// Chain identifier
pub type ChainId = u64;

/// Unix timestamp in seconds
pub type Timestamp = u64;

/// Zero hash constant
pub const ZERO_HASH: Hash = [0u8; 32];

/// Zero address constant
pub const ZERO_ADDRESS: Address = [0u8; 20];

/// Satoshi units per whole coin
pub const COIN: u64 = 100_000_000;

/// Derive an L2 address from an Ed25519 public key:
/// the first 20 bytes of the double-SHA-256 of the key.
pub fn address_from_pubkey(pubkey: &PublicKey) -> Address {
    let digest = double_sha256(pubkey);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&digest[..20]);
    addr
}

/// Verify an Ed25519 signature over `message` under `pubkey`.
pub fn verify_signature(pubkey: &PublicKey, message: &[u8], signature: &Signature) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(pubkey) else {
        return false;
    };
    key.verify(message, &DalekSignature::from_bytes(signature))
        .is_ok()
}

/// Ceiling integer square root via Newton's method.
pub fn ceil_isqrt(n: u64) -> u64 {
    if n == 0 {
        return 0;
    }
    let mut x = n;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + n / x) / 2;
    }
    if x * x == n {
        x
    } else {
        x + 1
    }
}

/// Sequencer weight: `hat_score * ceil(sqrt(stake in whole coins))`.
///
/// Zero hat score means zero weight regardless of stake.
pub fn sequencer_weight(hat_score: u32, stake: u64) -> u64 {
    (hat_score as u64) * ceil_isqrt(stake / COIN)
}

/// Append a varint-length-prefixed byte vector (unsigned LEB128 length).
pub fn write_var_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    let mut len = bytes.len() as u64;
    loop {
        let mut byte = (len & 0x7F) as u8;
        len >>= 7;
        if len != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
    out.extend_from_slice(bytes);
}

// ============================================================================
// Account state
// ============================================================================

/// Per-account record stored in the accounts SMT.
///
/// An account is empty iff all fields are zero; empty accounts are absent
/// from the tree. A contract is any account with a non-zero code hash.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    /// Balance in satoshi units, never negative
    pub balance: i64,
    pub nonce: u64,
    pub code_hash: Hash,
    pub storage_root: Hash,
    /// Reputation score
    pub hat_score: u32,
    /// Last block this account was touched
    pub last_activity: BlockNumber,
}

impl AccountState {
    pub fn is_empty(&self) -> bool {
        self.balance == 0
            && self.nonce == 0
            && self.code_hash == ZERO_HASH
            && self.storage_root == ZERO_HASH
            && self.hat_score == 0
            && self.last_activity == 0
    }

    pub fn is_contract(&self) -> bool {
        self.code_hash != ZERO_HASH
    }

    /// Fixed 92-byte little-endian serialization, the exact bytes stored
    /// under the account's SMT key.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(92);
        out.extend_from_slice(&self.balance.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
        out.extend_from_slice(&self.code_hash);
        out.extend_from_slice(&self.storage_root);
        out.extend_from_slice(&self.hat_score.to_le_bytes());
        out.extend_from_slice(&self.last_activity.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 92 {
            return None;
        }
        let mut h = [0u8; 32];
        let mut s = [0u8; 32];
        h.copy_from_slice(&bytes[16..48]);
        s.copy_from_slice(&bytes[48..80]);
        Some(Self {
            balance: i64::from_le_bytes(bytes[0..8].try_into().ok()?),
            nonce: u64::from_le_bytes(bytes[8..16].try_into().ok()?),
            code_hash: h,
            storage_root: s,
            hat_score: u32::from_le_bytes(bytes[80..84].try_into().ok()?),
            last_activity: u64::from_le_bytes(bytes[84..92].try_into().ok()?),
        })
    }

    /// Approximate on-tree footprint in bytes, used for state rent.
    pub fn approx_size_bytes(&self) -> u64 {
        92 + 32 // serialized record + key
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// What a transaction does. Contract execution beyond plain transfers goes
/// through the pluggable execution hook.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    /// Plain value transfer
    Transfer { to: Address, amount: u64 },
    /// Synthetic bridge mint, only valid when proposer-constructed from a
    /// burn that reached mint consensus
    Mint {
        l1_tx_hash: Hash,
        recipient: Address,
        amount: u64,
    },
    /// Contract call routed through the execution hook
    Call {
        to: Address,
        value: u64,
        data: Vec<u8>,
    },
}

/// An L2 transaction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub from: Address,
    /// Sender key; must hash to `from`
    pub pubkey: PublicKey,
    pub nonce: u64,
    pub gas_limit: u64,
    pub chain_id: ChainId,
    pub kind: TxKind,
    #[serde(with = "BigArray")]
    pub signature: Signature,
}

impl Transaction {
    /// Construct a synthetic mint transaction. Mints carry no sender
    /// signature; they are validated against mint consensus instead.
    pub fn system_mint(chain_id: ChainId, l1_tx_hash: Hash, recipient: Address, amount: u64) -> Self {
        Self {
            from: ZERO_ADDRESS,
            pubkey: [0u8; 32],
            nonce: 0,
            gas_limit: 0,
            chain_id,
            kind: TxKind::Mint {
                l1_tx_hash,
                recipient,
                amount,
            },
            signature: [0u8; 64],
        }
    }

    /// Build and sign a plain transfer.
    pub fn signed_transfer(
        key: &ed25519_dalek::SigningKey,
        nonce: u64,
        chain_id: ChainId,
        to: Address,
        amount: u64,
    ) -> Self {
        use ed25519_dalek::Signer;

        let pubkey = key.verifying_key().to_bytes();
        let mut tx = Self {
            from: address_from_pubkey(&pubkey),
            pubkey,
            nonce,
            gas_limit: 50_000,
            chain_id,
            kind: TxKind::Transfer { to, amount },
            signature: [0u8; 64],
        };
        tx.signature = key.sign(&tx.signing_bytes()).to_bytes();
        tx
    }

    pub fn is_mint(&self) -> bool {
        matches!(self.kind, TxKind::Mint { .. })
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.from);
        out.extend_from_slice(&self.pubkey);
        out.extend_from_slice(&self.nonce.to_le_bytes());
        out.extend_from_slice(&self.gas_limit.to_le_bytes());
        out.extend_from_slice(&self.chain_id.to_le_bytes());
        match &self.kind {
            TxKind::Transfer { to, amount } => {
                out.push(0x01);
                out.extend_from_slice(to);
                out.extend_from_slice(&amount.to_le_bytes());
            }
            TxKind::Mint {
                l1_tx_hash,
                recipient,
                amount,
            } => {
                out.push(0x02);
                out.extend_from_slice(l1_tx_hash);
                out.extend_from_slice(recipient);
                out.extend_from_slice(&amount.to_le_bytes());
            }
            TxKind::Call { to, value, data } => {
                out.push(0x03);
                out.extend_from_slice(to);
                out.extend_from_slice(&value.to_le_bytes());
                write_var_bytes(&mut out, data);
            }
        }
        out
    }

    pub fn hash(&self) -> Hash {
        let mut bytes = self.signing_bytes();
        bytes.extend_from_slice(&self.signature);
        double_sha256(&bytes)
    }
}

/// Merkle root over a transaction list, pairwise double-SHA-256 with the
/// last hash duplicated on odd levels (Bitcoin style).
pub fn compute_transactions_root(tx_hashes: &[Hash]) -> Hash {
    if tx_hashes.is_empty() {
        return ZERO_HASH;
    }
    let mut level: Vec<Hash> = tx_hashes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(&pair[0]);
            buf[32..].copy_from_slice(&right);
            next.push(double_sha256(&buf));
        }
        level = next;
    }
    level[0]
}

// ============================================================================
// Consensus messages
// ============================================================================

/// Block proposal broadcast by the slot leader
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockProposal {
    pub block_number: BlockNumber,
    pub parent_hash: Hash,
    pub state_root: Hash,
    pub transactions_root: Hash,
    pub tx_hashes: Vec<Hash>,
    pub proposer_address: Address,
    pub timestamp: Timestamp,
    #[serde(with = "BigArray")]
    pub proposer_signature: Signature,
    pub chain_id: ChainId,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub slot_number: Slot,
}

impl BlockProposal {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.block_number.to_le_bytes());
        out.extend_from_slice(&self.parent_hash);
        out.extend_from_slice(&self.state_root);
        out.extend_from_slice(&self.transactions_root);
        out.extend_from_slice(&(self.tx_hashes.len() as u64).to_le_bytes());
        for h in &self.tx_hashes {
            out.extend_from_slice(h);
        }
        out.extend_from_slice(&self.proposer_address);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.chain_id.to_le_bytes());
        out.extend_from_slice(&self.gas_limit.to_le_bytes());
        out.extend_from_slice(&self.gas_used.to_le_bytes());
        out.extend_from_slice(&self.slot_number.to_le_bytes());
        out
    }

    /// Block hash: double-SHA-256 over the signed portion.
    pub fn hash(&self) -> Hash {
        double_sha256(&self.signing_bytes())
    }

    pub fn is_genesis(&self) -> bool {
        self.block_number == 0
    }
}

/// How a sequencer voted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteChoice {
    Accept,
    Reject,
    Abstain,
}

/// Short machine-readable rejection reason
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    Parent,
    Root,
    TxOrder,
    Gas,
    Signature,
    Timestamp,
    Other,
}

impl RejectReason {
    fn code(&self) -> u8 {
        match self {
            RejectReason::Parent => 1,
            RejectReason::Root => 2,
            RejectReason::TxOrder => 3,
            RejectReason::Gas => 4,
            RejectReason::Signature => 5,
            RejectReason::Timestamp => 6,
            RejectReason::Other => 7,
        }
    }
}

/// Vote on a proposed block
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencerVote {
    pub block_hash: Hash,
    pub voter_address: Address,
    pub vote: VoteChoice,
    pub reject_reason: Option<RejectReason>,
    #[serde(with = "BigArray")]
    pub signature: Signature,
    pub timestamp: Timestamp,
    pub slot_number: Slot,
}

impl SequencerVote {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.block_hash);
        out.extend_from_slice(&self.voter_address);
        out.push(match self.vote {
            VoteChoice::Accept => 0,
            VoteChoice::Reject => 1,
            VoteChoice::Abstain => 2,
        });
        out.push(self.reject_reason.map_or(0, |r| r.code()));
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.slot_number.to_le_bytes());
        out
    }
}

// ============================================================================
// Sequencer registry messages
// ============================================================================

/// Signed sequencer announcement
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqAnnounce {
    pub address: Address,
    pub pubkey: PublicKey,
    pub stake: u64,
    pub hat_score: u32,
    pub peer_count: u32,
    pub public_endpoint: String,
    pub l1_block_height: u64,
    pub timestamp: Timestamp,
    pub chain_id: ChainId,
    pub protocol_version: u32,
    #[serde(with = "BigArray")]
    pub signature: Signature,
}

impl SeqAnnounce {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.address);
        out.extend_from_slice(&self.pubkey);
        out.extend_from_slice(&self.stake.to_le_bytes());
        out.extend_from_slice(&self.hat_score.to_le_bytes());
        out.extend_from_slice(&self.peer_count.to_le_bytes());
        write_var_bytes(&mut out, self.public_endpoint.as_bytes());
        out.extend_from_slice(&self.l1_block_height.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.chain_id.to_le_bytes());
        out.extend_from_slice(&self.protocol_version.to_le_bytes());
        out
    }
}

/// Peer attestation of another sequencer's stake and reputation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencerAttestation {
    pub sequencer: Address,
    pub attester: Address,
    pub attested_hat: u32,
    pub attested_stake: u64,
    pub l1_block: u64,
    pub timestamp: Timestamp,
    #[serde(with = "BigArray")]
    pub signature: Signature,
}

impl SequencerAttestation {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.sequencer);
        out.extend_from_slice(&self.attester);
        out.extend_from_slice(&self.attested_hat.to_le_bytes());
        out.extend_from_slice(&self.attested_stake.to_le_bytes());
        out.extend_from_slice(&self.l1_block.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out
    }
}

/// Signed claim to take over leadership of a slot after a failover
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipClaim {
    pub address: Address,
    pub slot: Slot,
    pub failover_position: u32,
    pub timestamp: Timestamp,
    pub previous_leader: Address,
    pub reason: String,
    #[serde(with = "BigArray")]
    pub signature: Signature,
}

impl LeadershipClaim {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.address);
        out.extend_from_slice(&self.slot.to_le_bytes());
        out.extend_from_slice(&self.failover_position.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.previous_leader);
        write_var_bytes(&mut out, self.reason.as_bytes());
        out
    }
}

// ============================================================================
// Bridge messages
// ============================================================================

/// A sequencer's independent confirmation of an observed L1 burn
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintConfirmation {
    pub l1_tx_hash: Hash,
    pub chain_id: ChainId,
    pub sequencer_address: Address,
    pub amount: u64,
    pub l2_recipient: Address,
    pub timestamp: Timestamp,
    #[serde(with = "BigArray")]
    pub signature: Signature,
}

impl MintConfirmation {
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.l1_tx_hash);
        out.extend_from_slice(&self.chain_id.to_le_bytes());
        out.extend_from_slice(&self.sequencer_address);
        out.extend_from_slice(&self.amount.to_le_bytes());
        out.extend_from_slice(&self.l2_recipient);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out
    }
}

/// Completed burn-and-mint record, kept forever once minted
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurnRecord {
    pub l1_tx_hash: Hash,
    pub l1_block_number: u64,
    pub l1_block_hash: Hash,
    pub l2_recipient: Address,
    pub amount: u64,
    pub l2_block_number: BlockNumber,
    pub l2_tx_hash: Hash,
    pub timestamp: Timestamp,
}

// ============================================================================
// Cross-layer messages
// ============================================================================

/// L1-originated message queued for execution on L2
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct L1ToL2Message {
    pub message_id: u64,
    pub sender: Address,
    pub target: Address,
    pub payload: Vec<u8>,
    pub enqueued_at_block: BlockNumber,
}

/// L2-originated message awaiting its L1 challenge window
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct L2ToL1Message {
    pub message_id: u64,
    pub sender: Address,
    pub target: Address,
    pub payload: Vec<u8>,
    pub sent_at_block: BlockNumber,
    pub challenge_deadline: Timestamp,
}
