//! Cascade node - devnet driver and chain info
//!
//! Runs a self-contained multi-sequencer devnet: N in-process sequencers
//! sharing a simulated L1, with burns fed in so the full detect/confirm/
//! mint path runs end to end.

use cascade_node::config::GenesisConfig;
use cascade_node::l1::{encode_burn_marker, L1Client, L1Transaction, L1TxOut, SimulatedL1};
use cascade_node::runtime::{L2Runtime, SequencerIdentity};
use cascade_node::transport::{LoopbackTransport, Transport, WireMessage};
use cascade_node::types::{double_sha256, COIN};
use cascade_node::BLOCK_TIME_MS;
use clap::Parser;
use ed25519_dalek::SigningKey;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "cascade-node")]
#[command(about = "Cascade L2 rollup core - burn-and-mint devnet")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Run an in-process multi-sequencer devnet against a simulated L1
    Devnet {
        /// Number of sequencers
        #[arg(short, long, default_value = "4")]
        sequencers: u8,

        /// Number of L2 blocks to drive
        #[arg(short, long, default_value = "10")]
        blocks: u64,

        /// Feed an L1 burn every this many ticks (0 = never)
        #[arg(long, default_value = "3")]
        burn_every: u64,
    },

    /// Show chain parameters
    Info,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("cascade_node=info".parse().unwrap()))
        .init();

    let cli = Cli::parse();

    let code = match cli.command {
        Command::Devnet {
            sequencers,
            blocks,
            burn_every,
        } => run_devnet(sequencers, blocks, burn_every).await,
        Command::Info => {
            show_info();
            0
        }
    };
    std::process::exit(code);
}

struct DevnetNode {
    runtime: L2Runtime,
    transport: Arc<LoopbackTransport>,
}

async fn run_devnet(sequencers: u8, blocks: u64, burn_every: u64) -> i32 {
    if sequencers == 0 {
        eprintln!("invalid argument: need at least one sequencer");
        return 1;
    }

    let config = GenesisConfig::default();
    let now = chrono::Utc::now().timestamp() as u64;

    let mut l1 = SimulatedL1::new();
    for i in 0..(config.required_l1_confirmations + 1) {
        l1.push_block(now.saturating_sub(60) + i, vec![], 0);
    }

    // one runtime per sequencer, each with its own loopback transport
    let mut nodes = Vec::new();
    for seed in 1..=sequencers {
        let transport = Arc::new(LoopbackTransport::new());
        let identity = SequencerIdentity::from_key(SigningKey::from_bytes(&[seed; 32]));
        let runtime = L2Runtime::new(
            config.clone(),
            Some(identity),
            transport.clone() as Arc<dyn Transport>,
            now.saturating_sub(1),
        );
        runtime.on_finalized(Box::new(|block| {
            tracing::info!(
                block = block.proposal.block_number,
                txs = block.proposal.tx_hashes.len(),
                "finalized"
            );
        }));
        nodes.push(DevnetNode { runtime, transport });
    }

    // every sequencer announces, and announcements reach everyone
    for node in &nodes {
        if let Err(err) = node.runtime.announce(
            400 * COIN,
            25,
            sequencers as u32,
            "quic://127.0.0.1:7700".into(),
            l1.best_height(),
            now,
        ) {
            eprintln!("announce rejected: {err}");
            return err.exit_code();
        }
    }
    relay(&nodes, &l1, now, now * 1000);

    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(BLOCK_TIME_MS));
    let mut burn_count = 0u64;
    let mut tick = 0u64;

    while nodes[0].runtime.status(clock().0).block_number < blocks {
        ticker.tick().await;
        tick += 1;
        let (now, now_ms) = clock();

        // extend the L1, sometimes with a burn
        let txs = if burn_every > 0 && tick % burn_every == 0 {
            burn_count += 1;
            let recipient = [burn_count as u8; 20];
            vec![L1Transaction {
                txid: double_sha256(&burn_count.to_le_bytes()),
                outputs: vec![L1TxOut {
                    value: 100 * burn_count,
                    script: encode_burn_marker(config.chain_id, &recipient),
                }],
            }]
        } else {
            vec![]
        };
        l1.push_block(now, txs, 0);

        for node in &nodes {
            node.runtime.sync_l1(&l1, now);
        }
        relay(&nodes, &l1, now, now_ms);

        // whoever acts as leader produces
        for node in &nodes {
            let Some(leader) = node.runtime.ensure_election(&l1, now, now_ms) else {
                continue;
            };
            if Some(leader) == node.runtime.local_address() {
                match node.runtime.produce_block(&l1, now, now_ms) {
                    Ok(Some(_)) => {}
                    Ok(None) => {}
                    Err(err) => tracing::debug!(%err, "production skipped"),
                }
                break;
            }
        }
        relay(&nodes, &l1, now, now_ms);
        relay(&nodes, &l1, now, now_ms); // votes raised by relayed proposals

        for node in &nodes {
            node.runtime.process_timeouts(now, now_ms);
        }
    }

    let (now, _) = clock();
    let status = nodes[0].runtime.status(now);
    println!("\n=== Devnet Summary ===");
    println!("Blocks finalized:  {}", status.block_number);
    println!("Total supply:      {} sat", status.total_supply);
    println!("Burns tracked:     {}", status.tracked_burns);
    println!("Sequencers:        {} ({} eligible)", status.registry.total, status.registry.eligible);
    println!("Total weight:      {}", status.registry.total_weight);
    println!("Circuit breaker:   {:?}", status.breaker);
    0
}

fn clock() -> (u64, u64) {
    let ms = chrono::Utc::now().timestamp_millis() as u64;
    (ms / 1000, ms)
}

/// Deliver every queued broadcast to every other node.
fn relay(nodes: &[DevnetNode], l1: &SimulatedL1, now: u64, now_ms: u64) {
    for i in 0..nodes.len() {
        for message in nodes[i].transport.drain() {
            for (j, node) in nodes.iter().enumerate() {
                if i == j {
                    continue;
                }
                deliver(&node.runtime, &message, l1, now, now_ms);
            }
        }
    }
}

fn deliver(runtime: &L2Runtime, message: &WireMessage, l1: &SimulatedL1, now: u64, now_ms: u64) {
    match message {
        WireMessage::Announce(announce) => {
            let _ = runtime.handle_announce(announce, now);
        }
        WireMessage::Attestation(attestation) => {
            let _ = runtime.handle_attestation(attestation, now);
        }
        WireMessage::Proposal {
            proposal,
            transactions,
        } => {
            if let Err(err) = runtime.handle_proposal(proposal, transactions, l1, now, now_ms) {
                tracing::debug!(%err, "proposal not accepted");
            }
        }
        WireMessage::Vote(vote) => {
            let _ = runtime.handle_vote(vote, now);
        }
        WireMessage::Claim(claim) => {
            let _ = runtime.handle_claim(claim, now);
        }
        WireMessage::MintConfirmation(confirmation) => {
            let _ = runtime.handle_confirmation(confirmation, now);
        }
        WireMessage::Inbound(message) => {
            runtime.enqueue_l1_message(message.clone());
        }
        WireMessage::Outbound(_) => {}
    }
}

fn show_info() {
    let config = GenesisConfig::default();
    println!("Cascade - optimistic L2 rollup core");
    println!();
    println!("Chain:");
    println!("  Chain id:             {}", config.chain_id);
    println!("  Blocks per leader:    {}", config.blocks_per_leader);
    println!("  Leader timeout:       {}ms", config.leader_timeout_ms);
    println!("  Vote timeout:         {}ms", config.vote_timeout_ms);
    println!(
        "  Consensus threshold:  {}/{} of eligible weight",
        config.consensus_threshold.num, config.consensus_threshold.den
    );
    println!();
    println!("Bridge:");
    println!("  Entry:                burn-and-mint (L1 OP_RETURN marker)");
    println!("  L1 confirmations:     {}", config.required_l1_confirmations);
    println!("  Mint consensus:       2/3 of sequencer weight, at most once");
    println!();
    println!("Sequencers:");
    println!("  Weight:               hat_score * ceil(sqrt(stake))");
    println!("  Min stake:            {} sat", config.min_stake);
    println!("  Min HAT score:        {}", config.min_hat);
    println!("  Min peers:            {}", config.min_peers);
}
