//! Tally Network Simulator
//!
//! Runs a network of consensus engines in one process, exchanging messages
//! through an in-memory router on a simulated clock. One committee member
//! stays silent: it follows the chain but never proposes or approves, so
//! its proposer turns time out and the inactivity penalty removes it from
//! the committee at the next epoch. Random transfers flow throughout.
//! At the end the chain is checked for contiguity, replayable state roots
//! and agreement between all nodes.
//!
//! Usage: cargo run --bin simulator

use std::collections::VecDeque;

use colored::Colorize;
use rand::Rng;

use tally::chain::Blockchain;
use tally::consensus::engine::Engine;
use tally::crypto::keys::SigningKeypair;
use tally::genesis::{ConsensusParams, GenesisConfig};
use tally::network::Message;
use tally::node::storage::MemoryStorage;
use tally::transaction::Transaction;
use tally::Address;

// ── Configuration ──

const NUM_VALIDATORS: usize = 4;
const NUM_USERS: usize = 5;
const TARGET_HEIGHT: u64 = 30;
const VALIDATOR_STAKE: u64 = 1_000;
const USER_BALANCE: u64 = 10_000;
const STEP_MS: u64 = 50;
const MAX_STEPS: u64 = 20_000;
/// Chance per step that a user submits a transfer.
const TX_PROBABILITY: f64 = 0.3;
const TX_FEE: u64 = 1;

fn params() -> ConsensusParams {
    ConsensusParams {
        epoch_length: 5,
        max_committee_size: 3,
        block_interval_ms: 200,
        round_timeout_ms: 2_000,
        inactivity_window: 3,
        ..ConsensusParams::default()
    }
}

/// Result of a single check.
struct TestResult {
    name: String,
    passed: bool,
    detail: String,
}

impl TestResult {
    fn check(name: &str, passed: bool, detail: String) -> Self {
        Self {
            name: name.to_string(),
            passed,
            detail,
        }
    }
}

/// Engines plus the in-flight message queue between them.
struct SimNetwork {
    engines: Vec<Engine>,
    queue: VecDeque<(usize, Message)>,
    delivered: u64,
    rejected: u64,
}

impl SimNetwork {
    fn send(&mut self, from: usize, messages: Vec<Message>) {
        self.queue.extend(messages.into_iter().map(|m| (from, m)));
    }

    /// Deliver queued messages to every other node until the network is quiet.
    fn drain(&mut self, now: u64) {
        while let Some((from, message)) = self.queue.pop_front() {
            for i in 0..self.engines.len() {
                if i == from {
                    continue;
                }
                self.delivered += 1;
                let engine = &mut self.engines[i];
                let produced = match message.clone() {
                    Message::Proposal(block) => engine.on_proposal(*block, now).map_err(|e| e.to_string()),
                    Message::Approval(approval) => engine.on_approval(approval, now).map_err(|e| e.to_string()),
                    Message::FinalizedBlock { block, certificate } => engine
                        .on_finalized_block(*block, certificate, now)
                        .map_err(|e| e.to_string()),
                    Message::NewTransaction(tx) => engine
                        .submit_transaction(tx)
                        .map(|_| Vec::new())
                        .map_err(|e| e.to_string()),
                    _ => Ok(Vec::new()),
                };
                match produced {
                    Ok(out) => self.send(i, out),
                    Err(e) => {
                        self.rejected += 1;
                        tracing::debug!(node = i, error = %e, "message rejected");
                    }
                }
            }
        }
    }

    fn step(&mut self, now: u64) {
        for i in 0..self.engines.len() {
            let out = self.engines[i].tick(now);
            self.send(i, out);
            self.drain(now);
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    println!("\n{}", "========================================".bright_cyan());
    println!("{}", "      TALLY NETWORK SIMULATOR".bright_cyan().bold());
    println!("{}\n", "========================================".bright_cyan());

    match run() {
        Ok(results) => {
            let failed = results.iter().any(|r| !r.passed);
            print_summary(&results);
            if failed {
                std::process::exit(1);
            }
        }
        Err(e) => {
            println!("  {} {}", "FAIL".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn run() -> Result<Vec<TestResult>, Box<dyn std::error::Error>> {
    // ── Phase 1: Genesis ──
    println!("{}", "[Phase 1] Building genesis...".yellow());
    let validators: Vec<SigningKeypair> = (0..NUM_VALIDATORS).map(|_| SigningKeypair::generate()).collect();
    let users: Vec<SigningKeypair> = (0..NUM_USERS).map(|_| SigningKeypair::generate()).collect();
    let genesis_time = tally::now_ms();
    let genesis = GenesisConfig::new(
        "tally-sim",
        genesis_time,
        &users.iter().map(|u| (u.address(), USER_BALANCE)).collect::<Vec<_>>(),
        &validators
            .iter()
            .map(|v| (v.public.clone(), VALIDATOR_STAKE))
            .collect::<Vec<_>>(),
        params(),
    );
    let chain_id = genesis.chain_id()?;

    let reference = Blockchain::from_genesis(&genesis, Box::new(MemoryStorage::new()))?;
    let initial_committee = reference.committee().addresses();
    let initial_supply = reference.state().accounts().total_balance();
    // The member due to propose height 1 stays silent.
    let silent = initial_committee[1 % initial_committee.len()];
    println!(
        "  {} {} validators, {} users, committee of {}",
        "OK".green().bold(),
        NUM_VALIDATORS,
        NUM_USERS,
        initial_committee.len()
    );
    println!("  silent validator: {}", silent.short().red());

    let first_storage = MemoryStorage::new();
    let mut engines = Vec::with_capacity(NUM_VALIDATORS);
    for (i, kp) in validators.iter().enumerate() {
        let storage: Box<dyn tally::node::storage::Storage> = if i == 0 {
            Box::new(first_storage.clone())
        } else {
            Box::new(MemoryStorage::new())
        };
        let chain = Blockchain::from_genesis(&genesis, storage)?;
        let keypair = (kp.address() != silent).then(|| kp.clone());
        engines.push(Engine::new(chain, keypair));
    }
    let mut net = SimNetwork {
        engines,
        queue: VecDeque::new(),
        delivered: 0,
        rejected: 0,
    };

    // ── Phase 2: Consensus with traffic ──
    println!("\n{}", "[Phase 2] Running consensus with random transfers...".yellow());
    let mut rng = rand::rng();
    let mut now = genesis_time;
    let mut steps = 0u64;
    let mut submitted = 0u64;
    let mut refused = 0u64;
    let mut committees: Vec<(u64, Vec<Address>)> = vec![(0, initial_committee.clone())];

    while net.engines[0].chain().height() < TARGET_HEIGHT && steps < MAX_STEPS {
        steps += 1;
        now += STEP_MS;

        if rng.random_bool(TX_PROBABILITY) {
            let sender = &users[rng.random_range(0..users.len())];
            let recipient = users[rng.random_range(0..users.len())].address();
            let entry = rng.random_range(0..net.engines.len());
            let nonce = net.engines[entry].chain().state().accounts().nonce(&sender.address()) + 1;
            let value = rng.random_range(1..=50);
            let tx = Transaction::transfer(sender, recipient, value, TX_FEE, nonce, chain_id);
            match net.engines[entry].submit_transaction(tx.clone()) {
                Ok(_) => {
                    submitted += 1;
                    net.send(entry, vec![Message::NewTransaction(tx)]);
                }
                Err(_) => refused += 1,
            }
        }

        let before = net.engines[0].chain().height();
        net.step(now);
        let after = net.engines[0].chain().height();
        for height in before + 1..=after {
            if let Some(block) = net.engines[0].chain().block(height) {
                let round = if block.header.round > 0 {
                    format!("round {}", block.header.round).red().to_string()
                } else {
                    "round 0".dimmed().to_string()
                };
                println!(
                    "  height {:>3}  {}  proposer {}  txs {:>2}  {}",
                    height,
                    block.header_hash.to_string()[..12].dimmed(),
                    block.header.proposer.short(),
                    block.transactions.len(),
                    round
                );
            }
        }
        let committee = net.engines[0].chain().committee();
        if committees.last().map(|(epoch, _)| *epoch) != Some(committee.epoch) {
            println!(
                "  {} epoch {} committee: {}",
                "->".bright_cyan(),
                committee.epoch,
                committee
                    .addresses()
                    .iter()
                    .map(Address::short)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            committees.push((committee.epoch, committee.addresses()));
        }
    }
    // Let the last finalized blocks reach every node.
    net.drain(now);
    println!(
        "  {} {} steps, {} messages delivered, {} rejected, {} transfers submitted ({} refused by pool)",
        "OK".green().bold(),
        steps,
        net.delivered,
        net.rejected,
        submitted,
        refused
    );

    // ── Phase 3: Verification ──
    println!("\n{}", "[Phase 3] Verifying...".yellow());
    let mut results = Vec::new();
    let lead = net.engines[0].chain();
    let height = lead.height();

    results.push(TestResult::check(
        "Progress",
        height >= TARGET_HEIGHT,
        format!("reached height {} (target {})", height, TARGET_HEIGHT),
    ));

    let agree = net
        .engines
        .iter()
        .all(|e| e.chain().height() == height && e.chain().tip_hash() == lead.tip_hash());
    results.push(TestResult::check(
        "Agreement",
        agree,
        format!("{} nodes share tip {}", net.engines.len(), &lead.tip_hash().to_string()[..12]),
    ));

    let linked = net.engines.iter().all(|e| e.chain().verify_links());
    results.push(TestResult::check(
        "Contiguity",
        linked,
        "heights contiguous, every block links to its parent".into(),
    ));

    let replayed = Blockchain::from_genesis(&genesis, Box::new(first_storage.clone()))?;
    let roots_match = replayed.height() == height && replayed.state().state_root() == lead.state().state_root();
    results.push(TestResult::check(
        "State Replay",
        roots_match,
        format!("replayed {} stored blocks to an identical state root", replayed.height()),
    ));

    let supply = lead.state().accounts().total_balance();
    results.push(TestResult::check(
        "Supply Conserved",
        supply == initial_supply,
        format!("total balance {} (genesis {})", supply, initial_supply),
    ));

    let skipped_rounds = (1..=height)
        .filter_map(|h| lead.block(h))
        .filter(|b| b.header.round > 0)
        .count();
    results.push(TestResult::check(
        "Round Abandonment",
        skipped_rounds > 0,
        format!("{} heights finalized after the silent proposer timed out", skipped_rounds),
    ));

    let excluded = committees
        .iter()
        .skip(1)
        .any(|(_, members)| !members.contains(&silent));
    let reputation = lead
        .state()
        .registry()
        .get(&silent)
        .map(|v| v.reputation)
        .unwrap_or_default();
    results.push(TestResult::check(
        "Inactivity Exclusion",
        excluded,
        format!("silent validator reputation {}, {} committee changes", reputation, committees.len() - 1),
    ));

    let equivocations: usize = net.engines.iter().map(|e| e.equivocations().len()).sum();
    results.push(TestResult::check(
        "No Equivocation",
        equivocations == 0,
        format!("{} conflicting approvals observed", equivocations),
    ));

    let halted = net.engines.iter().filter(|e| e.is_halted()).count();
    results.push(TestResult::check(
        "No Halts",
        halted == 0,
        format!("{} nodes halted", halted),
    ));

    Ok(results)
}

// ── Summary ──

fn print_summary(results: &[TestResult]) {
    println!("\n{}", "========================================".bright_cyan());
    println!("{}", "          SIMULATION RESULTS".bright_cyan().bold());
    println!("{}\n", "========================================".bright_cyan());

    let passed = results.iter().filter(|r| r.passed).count();
    let failed = results.len() - passed;

    for r in results {
        let icon = if r.passed {
            "PASS".green().bold()
        } else {
            "FAIL".red().bold()
        };
        let detail = if r.passed {
            r.detail.dimmed().to_string()
        } else {
            r.detail.red().to_string()
        };
        println!("  [{}] {} - {}", icon, r.name, detail);
    }

    println!();
    if failed == 0 {
        println!("  {} {}/{} checks passed", "ALL PASSED".green().bold(), passed, results.len());
    } else {
        println!(
            "  {} {}/{} passed, {} failed",
            "SOME FAILED".red().bold(),
            passed,
            results.len(),
            failed
        );
    }
    println!();
}
