//! The async node: orchestrator, transaction pool, durable storage and RPC.

pub mod core;
pub mod mempool;
pub mod rpc;
pub mod storage;

pub use self::core::{load_or_generate_keypair, Node, NodeConfig, NodeError, NodeState};
