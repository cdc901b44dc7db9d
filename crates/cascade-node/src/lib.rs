//! Cascade - optimistic L2 rollup core settling on a UTXO L1
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        L1 (UTXO chain)                         │
//! │   burn markers: OP_RETURN "L2BURN" chain_id‖recipient‖version  │
//! └───────────────┬────────────────────────────────┬───────────────┘
//!                 │ finalized blocks               │ election seed
//!                 ▼                                ▼
//! ┌───────────────────────────┐    ┌──────────────────────────────┐
//! │  Bridge (mint consensus)  │    │  Sequencer registry/election │
//! │  PENDING→REACHED→MINTED   │    │  weight = hat·⌈√stake⌉       │
//! └─────────────┬─────────────┘    └──────────────┬───────────────┘
//!               │ ready mints                     │ slot leader
//!               ▼                                 ▼
//! ┌────────────────────────────────────────────────────────────────┐
//! │           Block consensus (propose / vote, 2/3 weight)         │
//! └─────────────────────────────┬──────────────────────────────────┘
//!                               │ finalized blocks
//!                               ▼
//! ┌────────────────────────────────────────────────────────────────┐
//! │   State manager: accounts SMT + storage SMTs + burn registry   │
//! │   snapshots for reorg rollback, rent, archiving                │
//! └────────────────────────────────────────────────────────────────┘
//!
//!   Security supervisor watches everything: detectors, audit log,
//!   circuit breaker gating outbound bridge operations.
//! ```
//!
//! Supply only ever enters through the burn-and-mint bridge: L1 coins
//! destroyed under the marker become L2 balance once two thirds of
//! sequencer weight independently confirms the burn, at most once per L1
//! transaction.
//!
//! The RPC front end, L1 chain client, P2P transport, contract VM, and
//! durable storage backend are external collaborators; see `l1` and
//! `transport` for the seams they plug into.

pub mod bridge;
pub mod config;
pub mod consensus;
pub mod election;
pub mod l1;
pub mod messaging;
pub mod runtime;
pub mod security;
pub mod sequencer;
pub mod state;
pub mod transport;
pub mod types;

pub use config::GenesisConfig;
pub use runtime::{L2Runtime, SequencerIdentity};
pub use state::StateManager;
pub use types::{AccountState, Address, Hash, Transaction};

/// Default L2 block interval for the devnet driver, in milliseconds
pub const BLOCK_TIME_MS: u64 = 1000;
