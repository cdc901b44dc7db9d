//! Account state manager
//!
//! Aggregates the accounts SMT with one storage SMT per contract and the
//! burn registry, and offers transactional batch application with
//! all-or-nothing semantics: any failing transaction rolls the whole batch
//! back to its pre-batch state.
//!
//! The burn registry lives here rather than next to mint consensus so that
//! the `processed` flag of a burn flips in the same lock scope as the SMT
//! mutation that credits it, and so that snapshot rollback reverts both
//! together after an L1 reorg.

use crate::config::{GenesisConfig, RentConfig};
use crate::types::{
    address_from_pubkey, verify_signature, AccountState, Address, BlockNumber, BurnRecord, ChainId,
    Hash, Timestamp, Transaction, TxKind,
};
use cascade_smt::{double_sha256, verify_proof, MerkleProof, SparseMerkleTree};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Bound on retained snapshots
pub const MAX_SNAPSHOTS: usize = 100;

/// Gas charged for a plain transfer
pub const TRANSFER_GAS: u64 = 21_000;

/// SMT key of an account: double-SHA-256 of the 20-byte address.
pub fn account_key(address: &Address) -> Hash {
    double_sha256(address)
}

/// Outcome of a contract call executed through the hook
pub struct CallOutcome {
    pub gas_used: u64,
    /// Storage slots written by the call, applied to the target's tree
    pub storage_writes: Vec<(Hash, Vec<u8>)>,
}

/// Pluggable contract execution with deterministic gas accounting.
///
/// The core does not define a VM; anything beyond plain value transfer is
/// delegated here and must be deterministic across sequencers.
pub trait ExecutionHook: Send {
    fn execute(&self, to: &Address, value: u64, data: &[u8]) -> Result<CallOutcome, String>;
}

/// Default hook: charges flat gas plus a per-byte cost, writes nothing.
pub struct TransferOnlyHook;

impl ExecutionHook for TransferOnlyHook {
    fn execute(&self, _to: &Address, _value: u64, data: &[u8]) -> Result<CallOutcome, String> {
        Ok(CallOutcome {
            gas_used: TRANSFER_GAS + 16 * data.len() as u64,
            storage_writes: Vec::new(),
        })
    }
}

/// Result of one transaction inside a batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxResult {
    /// Applied; carries gas used and the post-batch state root
    Applied { gas_used: u64, state_root: Hash },
    /// This transaction failed and aborted the batch
    Failed(String),
    /// A prior transaction aborted the batch before this one ran
    NotExecuted,
}

impl TxResult {
    pub fn success(&self) -> bool {
        matches!(self, TxResult::Applied { .. })
    }
}

/// Reorg-capable checkpoint of the full account state
#[derive(Clone, Debug)]
pub struct StateSnapshot {
    pub state_root: Hash,
    pub block_number: BlockNumber,
    pub l1_anchor_block: u64,
    pub timestamp: Timestamp,
    accounts: BTreeMap<Address, AccountState>,
    storage: HashMap<Address, SparseMerkleTree>,
    burns: BTreeMap<Hash, BurnRecord>,
    total_minted: u64,
    total_fee_burned: u64,
}

/// Snapshot in the persisted key/value layout:
/// `(state_root, block_number, l1_anchor_block, timestamp, entries[(key, value)])`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub state_root: Hash,
    pub block_number: BlockNumber,
    pub l1_anchor_block: u64,
    pub timestamp: Timestamp,
    pub entries: Vec<(Hash, Vec<u8>)>,
}

impl StateSnapshot {
    pub fn to_persisted(&self) -> PersistedSnapshot {
        PersistedSnapshot {
            state_root: self.state_root,
            block_number: self.block_number,
            l1_anchor_block: self.l1_anchor_block,
            timestamp: self.timestamp,
            entries: self
                .accounts
                .iter()
                .map(|(addr, state)| (account_key(addr), state.to_bytes()))
                .collect(),
        }
    }
}

/// Account moved out of the active tree, with the inclusion proof taken
/// against the root at archive time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchivedAccount {
    pub address: Address,
    pub state: AccountState,
    pub archived_at_block: BlockNumber,
    pub archive_state_root: Hash,
    pub proof: MerkleProof,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: u64, available: u64 },

    #[error("balance overflow on credit")]
    BalanceOverflow,

    #[error("invalid nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: u64, got: u64 },

    #[error("invalid transaction signature")]
    BadSignature,

    #[error("wrong chain id: expected {expected}, got {got}")]
    WrongChain { expected: ChainId, got: ChainId },

    #[error("gas limit exceeded: used {used}, limit {limit}")]
    GasExceeded { used: u64, limit: u64 },

    #[error("duplicate mint for l1 tx {}", hex::encode(.0))]
    DuplicateMint(Hash),

    #[error("no snapshot with root {}", hex::encode(.0))]
    UnknownSnapshot(Hash),

    #[error("archived state does not match its proof")]
    ArchiveProofMismatch,

    #[error("execution hook failed: {0}")]
    HookFailed(String),
}

/// The state manager (accounts, storage, burns, snapshots)
pub struct StateManager {
    chain_id: ChainId,
    tree: SparseMerkleTree,
    accounts: BTreeMap<Address, AccountState>,
    storage: HashMap<Address, SparseMerkleTree>,
    /// Processed burns keyed by L1 tx hash; presence means minted
    burns: BTreeMap<Hash, BurnRecord>,
    snapshots: VecDeque<StateSnapshot>,
    archive: HashMap<Address, ArchivedAccount>,
    total_minted: u64,
    total_fee_burned: u64,
}

impl StateManager {
    /// Create the genesis state, crediting the configured distribution.
    /// Genesis allocations count toward total minted so the supply
    /// invariant holds from block zero.
    pub fn genesis(config: &GenesisConfig) -> Self {
        let mut manager = Self {
            chain_id: config.chain_id,
            tree: SparseMerkleTree::new(),
            accounts: BTreeMap::new(),
            storage: HashMap::new(),
            burns: BTreeMap::new(),
            snapshots: VecDeque::new(),
            archive: HashMap::new(),
            total_minted: 0,
            total_fee_burned: 0,
        };
        for alloc in &config.genesis_distribution {
            let state = AccountState {
                balance: alloc.amount as i64,
                ..Default::default()
            };
            manager.set_account(&alloc.address, state);
            manager.total_minted += alloc.amount;
        }
        manager
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Current authenticated state root
    pub fn state_root(&self) -> Hash {
        self.tree.root()
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    /// Total L2 supply: everything minted minus everything burned as fees
    pub fn total_supply(&self) -> u64 {
        self.total_minted - self.total_fee_burned
    }

    pub fn total_minted(&self) -> u64 {
        self.total_minted
    }

    pub fn total_fee_burned(&self) -> u64 {
        self.total_fee_burned
    }

    /// Get an account. Absence means the empty account.
    pub fn get_account(&self, address: &Address) -> Option<AccountState> {
        self.accounts.get(address).cloned()
    }

    /// Write an account; the empty state removes it from the tree.
    pub fn set_account(&mut self, address: &Address, state: AccountState) {
        let key = account_key(address);
        if state.is_empty() {
            self.accounts.remove(address);
            self.tree.delete(&key);
        } else {
            self.tree.set(key, state.to_bytes());
            self.accounts.insert(*address, state);
        }
    }

    /// Read a contract storage slot
    pub fn get_storage(&self, contract: &Address, key: &Hash) -> Option<Vec<u8>> {
        self.storage
            .get(contract)
            .and_then(|t| t.get(key))
            .map(|v| v.to_vec())
    }

    /// Write a contract storage slot and rewrite the contract account's
    /// storage root.
    pub fn set_storage(&mut self, contract: &Address, key: Hash, value: Vec<u8>) {
        let tree = self.storage.entry(*contract).or_default();
        tree.set(key, value);
        let storage_root = tree.root();

        let mut account = self.accounts.get(contract).cloned().unwrap_or_default();
        account.storage_root = storage_root;
        self.set_account(contract, account);
    }

    /// Inclusion proof for a present account, exclusion proof otherwise.
    pub fn generate_account_proof(&self, address: &Address) -> MerkleProof {
        let key = account_key(address);
        if self.tree.exists(&key) {
            self.tree
                .generate_inclusion_proof(&key)
                .expect("key just checked present")
        } else {
            self.tree
                .generate_exclusion_proof(&key)
                .expect("key just checked absent")
        }
    }

    /// Whether a burn has already been minted
    pub fn is_burn_processed(&self, l1_tx_hash: &Hash) -> bool {
        self.burns.contains_key(l1_tx_hash)
    }

    pub fn burn_record(&self, l1_tx_hash: &Hash) -> Option<&BurnRecord> {
        self.burns.get(l1_tx_hash)
    }

    /// Apply a batch of transactions with all-or-nothing semantics.
    ///
    /// Affected keys are backed up before the batch runs; the first failing
    /// transaction restores every mutation, yields a `Failed` result for
    /// itself and `NotExecuted` for everything after it. Entries before the
    /// failure index still read `Applied`, but their effects were rolled
    /// back with the batch.
    pub fn apply_batch(
        &mut self,
        txs: &[Transaction],
        block_number: BlockNumber,
        timestamp: Timestamp,
        hook: &dyn ExecutionHook,
    ) -> Vec<TxResult> {
        let backup = self.backup_for(txs);
        let mut results = Vec::with_capacity(txs.len());
        let mut failure: Option<StateError> = None;

        for tx in txs {
            match self.apply_tx(tx, block_number, timestamp, hook) {
                Ok(gas_used) => results.push(TxResult::Applied {
                    gas_used,
                    state_root: [0u8; 32], // rewritten below once the batch commits
                }),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            self.restore(backup);
            results.push(TxResult::Failed(err.to_string()));
            while results.len() < txs.len() {
                results.push(TxResult::NotExecuted);
            }
            return results;
        }

        let root = self.state_root();
        for result in &mut results {
            if let TxResult::Applied { state_root, .. } = result {
                *state_root = root;
            }
        }
        results
    }

    fn apply_tx(
        &mut self,
        tx: &Transaction,
        block_number: BlockNumber,
        timestamp: Timestamp,
        hook: &dyn ExecutionHook,
    ) -> Result<u64, StateError> {
        if tx.chain_id != self.chain_id {
            return Err(StateError::WrongChain {
                expected: self.chain_id,
                got: tx.chain_id,
            });
        }

        match &tx.kind {
            TxKind::Mint {
                l1_tx_hash,
                recipient,
                amount,
            } => self.apply_mint(*l1_tx_hash, recipient, *amount, block_number, tx.hash(), timestamp),
            TxKind::Transfer { to, amount } => {
                self.check_sender(tx)?;
                self.move_value(&tx.from, to, *amount, TRANSFER_GAS, tx.gas_limit, block_number)?;
                Ok(TRANSFER_GAS)
            }
            TxKind::Call { to, value, data } => {
                self.check_sender(tx)?;
                let outcome = hook
                    .execute(to, *value, data)
                    .map_err(StateError::HookFailed)?;
                self.move_value(&tx.from, to, *value, outcome.gas_used, tx.gas_limit, block_number)?;
                for (key, value) in outcome.storage_writes {
                    self.set_storage(to, key, value);
                }
                Ok(outcome.gas_used)
            }
        }
    }

    fn check_sender(&self, tx: &Transaction) -> Result<(), StateError> {
        if address_from_pubkey(&tx.pubkey) != tx.from
            || !verify_signature(&tx.pubkey, &tx.signing_bytes(), &tx.signature)
        {
            return Err(StateError::BadSignature);
        }
        let nonce = self.accounts.get(&tx.from).map_or(0, |a| a.nonce);
        if tx.nonce != nonce {
            return Err(StateError::InvalidNonce {
                expected: nonce,
                got: tx.nonce,
            });
        }
        Ok(())
    }

    /// Debit sender (value + fee), credit recipient, burn the fee. The fee
    /// equals gas used in satoshi units and leaves total supply via
    /// `total_fee_burned`.
    fn move_value(
        &mut self,
        from: &Address,
        to: &Address,
        amount: u64,
        gas_used: u64,
        gas_limit: u64,
        block_number: BlockNumber,
    ) -> Result<(), StateError> {
        if gas_used > gas_limit {
            return Err(StateError::GasExceeded {
                used: gas_used,
                limit: gas_limit,
            });
        }
        let fee = gas_used;
        let needed = amount
            .checked_add(fee)
            .ok_or(StateError::BalanceOverflow)?;

        let mut sender = self.accounts.get(from).cloned().unwrap_or_default();
        let available = sender.balance as u64;
        if available < needed {
            return Err(StateError::InsufficientBalance { needed, available });
        }

        sender.balance -= needed as i64;
        sender.nonce += 1;
        sender.last_activity = block_number;
        self.set_account(from, sender);

        let mut recipient = self.accounts.get(to).cloned().unwrap_or_default();
        recipient.balance = recipient
            .balance
            .checked_add(amount as i64)
            .ok_or(StateError::BalanceOverflow)?;
        recipient.last_activity = block_number;
        self.set_account(to, recipient);

        self.total_fee_burned += fee;
        Ok(())
    }

    /// Credit a bridged burn exactly once: reject if the L1 tx was already
    /// minted, credit the recipient (creating the account if empty), record
    /// the burn, and advance total supply - all in one lock scope.
    fn apply_mint(
        &mut self,
        l1_tx_hash: Hash,
        recipient: &Address,
        amount: u64,
        block_number: BlockNumber,
        l2_tx_hash: Hash,
        timestamp: Timestamp,
    ) -> Result<u64, StateError> {
        if self.burns.contains_key(&l1_tx_hash) {
            return Err(StateError::DuplicateMint(l1_tx_hash));
        }
        if amount > i64::MAX as u64 {
            return Err(StateError::BalanceOverflow);
        }

        let mut account = self.accounts.get(recipient).cloned().unwrap_or_default();
        account.balance = account
            .balance
            .checked_add(amount as i64)
            .ok_or(StateError::BalanceOverflow)?;
        account.last_activity = block_number;
        self.set_account(recipient, account);

        self.burns.insert(
            l1_tx_hash,
            BurnRecord {
                l1_tx_hash,
                l1_block_number: 0, // filled by the bridge when it has L1 context
                l1_block_hash: [0u8; 32],
                l2_recipient: *recipient,
                amount,
                l2_block_number: block_number,
                l2_tx_hash,
                timestamp,
            },
        );
        self.total_minted += amount;
        Ok(0)
    }

    /// Attach L1 context to a recorded burn (block number and hash the
    /// burn was observed in).
    pub fn annotate_burn(&mut self, l1_tx_hash: &Hash, l1_block_number: u64, l1_block_hash: Hash) {
        if let Some(record) = self.burns.get_mut(l1_tx_hash) {
            record.l1_block_number = l1_block_number;
            record.l1_block_hash = l1_block_hash;
        }
    }

    fn backup_for(&self, txs: &[Transaction]) -> BatchBackup {
        let mut accounts = BTreeMap::new();
        let mut storage = HashMap::new();
        let mut mint_hashes = Vec::new();

        for tx in txs {
            let mut touch = |addr: &Address| {
                accounts
                    .entry(*addr)
                    .or_insert_with(|| self.accounts.get(addr).cloned());
            };
            touch(&tx.from);
            match &tx.kind {
                TxKind::Transfer { to, .. } => touch(to),
                TxKind::Mint {
                    recipient,
                    l1_tx_hash,
                    ..
                } => {
                    touch(recipient);
                    mint_hashes.push(*l1_tx_hash);
                }
                TxKind::Call { to, .. } => {
                    touch(to);
                    storage
                        .entry(*to)
                        .or_insert_with(|| self.storage.get(to).cloned());
                }
            }
        }

        BatchBackup {
            accounts,
            storage,
            mint_hashes,
            total_minted: self.total_minted,
            total_fee_burned: self.total_fee_burned,
        }
    }

    fn restore(&mut self, backup: BatchBackup) {
        for (addr, prior) in backup.accounts {
            match prior {
                Some(state) => self.set_account(&addr, state),
                None => self.set_account(&addr, AccountState::default()),
            }
        }
        for (addr, prior) in backup.storage {
            match prior {
                Some(tree) => {
                    self.storage.insert(addr, tree);
                }
                None => {
                    self.storage.remove(&addr);
                }
            }
        }
        for hash in backup.mint_hashes {
            self.burns.remove(&hash);
        }
        self.total_minted = backup.total_minted;
        self.total_fee_burned = backup.total_fee_burned;
    }

    /// Checkpoint the current state; snapshots are pruned FIFO past the
    /// retention bound.
    pub fn create_snapshot(
        &mut self,
        block_number: BlockNumber,
        l1_anchor_block: u64,
        timestamp: Timestamp,
    ) {
        self.snapshots.push_back(StateSnapshot {
            state_root: self.state_root(),
            block_number,
            l1_anchor_block,
            timestamp,
            accounts: self.accounts.clone(),
            storage: self.storage.clone(),
            burns: self.burns.clone(),
            total_minted: self.total_minted,
            total_fee_burned: self.total_fee_burned,
        });
        while self.snapshots.len() > MAX_SNAPSHOTS {
            self.snapshots.pop_front();
        }
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &StateSnapshot> {
        self.snapshots.iter()
    }

    pub fn latest_snapshot(&self) -> Option<&StateSnapshot> {
        self.snapshots.back()
    }

    /// Most recent snapshot whose L1 anchor is at or below `height`.
    pub fn latest_snapshot_anchored_at_or_below(&self, height: u64) -> Option<&StateSnapshot> {
        self.snapshots
            .iter()
            .rev()
            .find(|s| s.l1_anchor_block <= height)
    }

    /// Restore the snapshot matching `state_root`, discarding everything
    /// newer. Fails if no snapshot carries that root or the rebuilt tree
    /// does not reproduce it.
    pub fn revert_to(&mut self, state_root: &Hash) -> Result<(), StateError> {
        let idx = self
            .snapshots
            .iter()
            .rposition(|s| s.state_root == *state_root)
            .ok_or(StateError::UnknownSnapshot(*state_root))?;

        let snapshot = self.snapshots[idx].clone();
        self.accounts = snapshot.accounts;
        self.storage = snapshot.storage;
        self.burns = snapshot.burns;
        self.total_minted = snapshot.total_minted;
        self.total_fee_burned = snapshot.total_fee_burned;

        let mut tree = SparseMerkleTree::new();
        for (addr, state) in &self.accounts {
            tree.set(account_key(addr), state.to_bytes());
        }
        self.tree = tree;

        if self.state_root() != *state_root {
            return Err(StateError::UnknownSnapshot(*state_root));
        }
        self.snapshots.truncate(idx + 1);

        tracing::info!(
            root = %hex::encode(state_root),
            block = snapshot.block_number,
            "state reverted to snapshot"
        );
        Ok(())
    }

    /// Charge rent from every account outside its grace period. Accounts
    /// that cannot pay and sit below the minimum balance are archived.
    pub fn process_state_rent(&mut self, current_block: BlockNumber, config: &RentConfig) {
        let candidates: Vec<Address> = self
            .accounts
            .iter()
            .filter(|(_, a)| current_block.saturating_sub(a.last_activity) > config.grace_period_blocks)
            .map(|(addr, _)| *addr)
            .collect();

        for addr in candidates {
            let Some(mut account) = self.accounts.get(&addr).cloned() else {
                continue;
            };
            let idle_blocks = current_block.saturating_sub(account.last_activity);
            let rent = (account.approx_size_bytes() as u128
                * config.rate_per_byte_year as u128
                * idle_blocks as u128
                / config.blocks_per_year as u128) as u64;
            if rent == 0 {
                continue;
            }

            if (account.balance as u64) >= rent {
                account.balance -= rent as i64;
                self.total_fee_burned += rent;
                self.set_account(&addr, account);
            } else if (account.balance as u64) < config.min_balance {
                self.archive_account(&addr, current_block);
            }
        }
    }

    /// Archive every account inactive for at least `threshold` blocks.
    pub fn archive_inactive(&mut self, current_block: BlockNumber, threshold: u64) -> usize {
        let idle: Vec<Address> = self
            .accounts
            .iter()
            .filter(|(_, a)| current_block.saturating_sub(a.last_activity) >= threshold)
            .map(|(addr, _)| *addr)
            .collect();

        for addr in &idle {
            self.archive_account(addr, current_block);
        }
        idle.len()
    }

    fn archive_account(&mut self, address: &Address, current_block: BlockNumber) {
        let Some(state) = self.accounts.get(address).cloned() else {
            return;
        };
        let proof = self.generate_account_proof(address);
        let entry = ArchivedAccount {
            address: *address,
            state,
            archived_at_block: current_block,
            archive_state_root: self.state_root(),
            proof,
        };
        self.archive.insert(*address, entry);
        self.set_account(address, AccountState::default());
    }

    pub fn archived(&self, address: &Address) -> Option<&ArchivedAccount> {
        self.archive.get(address)
    }

    /// Restore an archived account after re-verifying its proof against
    /// the recorded archive root.
    pub fn restore_archived(&mut self, entry: &ArchivedAccount) -> Result<(), StateError> {
        let key = account_key(&entry.address);
        let valid = verify_proof(
            &entry.proof,
            &entry.archive_state_root,
            &key,
            &entry.state.to_bytes(),
        );
        if !valid {
            return Err(StateError::ArchiveProofMismatch);
        }
        self.set_account(&entry.address, entry.state.clone());
        self.archive.remove(&entry.address);
        Ok(())
    }

    /// Supply invariant: the sum of balances equals minted minus fee-burned.
    pub fn check_supply_invariant(&self) -> bool {
        let sum: i128 = self.accounts.values().map(|a| a.balance as i128).sum();
        sum == self.total_supply() as i128
    }
}

struct BatchBackup {
    accounts: BTreeMap<Address, Option<AccountState>>,
    storage: HashMap<Address, Option<SparseMerkleTree>>,
    mint_hashes: Vec<Hash>,
    total_minted: u64,
    total_fee_burned: u64,
}
