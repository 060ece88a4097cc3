//! Tally node binary.
//!
//! Runs a delegated-proof-of-stake node with P2P gossip, persistent storage
//! and a JSON RPC API, plus helpers to create keys and a development genesis.
//!
//! Usage:
//!   tally keygen                    # create or show the validator key
//!   tally genesis                   # single-validator dev genesis from the local key
//!   tally node --validator          # run node (default subcommand)

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tally::config::{TallyConfig, GENESIS_FILE};
use tally::genesis::{ConsensusParams, GenesisConfig};
use tokio_util::sync::CancellationToken;

/// Tally delegated-proof-of-stake node.
#[derive(Parser, Debug)]
#[command(name = "tally", version, about = "Tally DPoS blockchain node")]
struct Cli {
    /// Data directory for keys, configuration and the block store.
    #[arg(long, default_value = "./tally-data", global = true)]
    data_dir: PathBuf,

    /// RPC listen address (overrides tally.toml).
    #[arg(long, global = true)]
    rpc_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node.
    Node {
        /// P2P listen address (overrides tally.toml).
        #[arg(long)]
        listen_addr: Option<SocketAddr>,

        /// Bootstrap peer addresses (comma-separated).
        #[arg(long, value_delimiter = ',')]
        peers: Vec<SocketAddr>,

        /// Propose and approve blocks when on the committee.
        #[arg(long)]
        validator: bool,

        /// Genesis file (defaults to <data-dir>/genesis.toml).
        #[arg(long)]
        genesis: Option<PathBuf>,
    },

    /// Create the validator key if missing and print its address.
    Keygen,

    /// Write a single-validator development genesis using the local key.
    Genesis {
        #[arg(long, default_value = "tally-dev")]
        chain_name: String,

        /// Stake bonded by the local validator.
        #[arg(long, default_value_t = 1_000_000)]
        stake: u64,

        /// Spendable balance credited to the local validator's account.
        #[arg(long, default_value_t = 1_000_000)]
        balance: u64,

        /// Output path (defaults to <data-dir>/genesis.toml).
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        None => run_node(&cli.data_dir, cli.rpc_addr, None, vec![], false, None).await,
        Some(Command::Node {
            listen_addr,
            peers,
            validator,
            genesis,
        }) => run_node(&cli.data_dir, cli.rpc_addr, listen_addr, peers, validator, genesis).await,
        Some(Command::Keygen) => {
            let keypair = tally::node::load_or_generate_keypair(&cli.data_dir)?;
            println!("address:    {}", keypair.address());
            println!("public key: {}", hex::encode(keypair.public.as_bytes()));
            Ok(())
        }
        Some(Command::Genesis {
            chain_name,
            stake,
            balance,
            out,
        }) => {
            let keypair = tally::node::load_or_generate_keypair(&cli.data_dir)?;
            let genesis = GenesisConfig::new(
                &chain_name,
                tally::now_ms(),
                &[(keypair.address(), balance)],
                &[(keypair.public.clone(), stake)],
                ConsensusParams::default(),
            );
            let path = out.unwrap_or_else(|| cli.data_dir.join(GENESIS_FILE));
            genesis.save(&path)?;
            println!("wrote {}", path.display());
            println!("chain id: {}", hex::encode(genesis.chain_id()?));
            Ok(())
        }
    }
}

async fn run_node(
    data_dir: &Path,
    rpc_override: Option<SocketAddr>,
    listen_override: Option<SocketAddr>,
    mut peers: Vec<SocketAddr>,
    validator: bool,
    genesis_override: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let file_config = TallyConfig::load(data_dir);
    let listen_addr = match listen_override {
        Some(addr) => addr,
        None => file_config.p2p_addr()?,
    };
    let rpc_addr = match rpc_override {
        Some(addr) => addr,
        None => file_config.rpc_addr()?,
    };
    if peers.is_empty() {
        peers = file_config.parse_bootstrap_peers();
    }
    let genesis_path = genesis_override.unwrap_or_else(|| file_config.genesis_path(data_dir));

    tracing::info!(
        p2p = %listen_addr,
        rpc = %rpc_addr,
        data = %data_dir.display(),
        genesis = %genesis_path.display(),
        "starting Tally node"
    );

    let genesis = GenesisConfig::load(&genesis_path)?;
    let keypair = tally::node::load_or_generate_keypair(data_dir)?;

    let config = tally::node::NodeConfig {
        listen_addr,
        bootstrap_peers: peers,
        data_dir: data_dir.join("chain"),
        rpc_addr,
        keypair,
        validator: validator || file_config.node.validator,
        max_peers: file_config.node.max_peers,
        genesis,
    };

    let mut node = tally::node::Node::new(config).await?;

    let rpc_state = tally::node::rpc::RpcState::new(node.state(), node.p2p_handle());
    tokio::spawn(async move {
        if let Err(e) = tally::node::rpc::serve(rpc_addr, rpc_state).await {
            tracing::error!(error = %e, "RPC server stopped");
        }
    });

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });

    node.run(shutdown).await;
    Ok(())
}
