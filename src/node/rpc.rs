//! JSON HTTP RPC API for the Tally node.
//!
//! Read-only views of the chain plus a single submission endpoint. Nothing
//! here mutates consensus state except `POST /tx`, which goes through the
//! same pool admission as gossiped transactions.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::NodeState;
use crate::consensus::schedule::proposer_for;
use crate::network::p2p::P2pHandle;
use crate::network::Message;
use crate::transaction::Transaction;
use crate::Address;

/// Maximum accepted request body.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared RPC state.
#[derive(Clone)]
pub struct RpcState {
    pub node: Arc<RwLock<NodeState>>,
    pub p2p: P2pHandle,
}

impl RpcState {
    pub fn new(node: Arc<RwLock<NodeState>>, p2p: P2pHandle) -> Self {
        Self { node, p2p }
    }
}

/// Build the RPC router.
pub fn router(rpc_state: RpcState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/committee", get(get_committee))
        .route("/validators", get(get_validators))
        .route("/account/{address}", get(get_account))
        .route("/block/{height}", get(get_block))
        .route("/mempool", get(get_mempool))
        .route("/tx", post(submit_tx))
        .with_state(rpc_state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}

/// Start the RPC server.
pub async fn serve(
    addr: SocketAddr,
    rpc_state: RpcState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(rpc_state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "RPC server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ── Errors ──

/// Body of every non-2xx response.
#[derive(Debug, Serialize)]
struct ErrorBody {
    reason: String,
    message: String,
}

type RpcError = (StatusCode, Json<ErrorBody>);

fn reject(status: StatusCode, reason: &str, message: impl Into<String>) -> RpcError {
    (
        status,
        Json(ErrorBody {
            reason: reason.to_string(),
            message: message.into(),
        }),
    )
}

// ── GET /status ──

#[derive(Serialize)]
struct StatusResponse {
    chain_id: String,
    height: u64,
    tip_hash: String,
    epoch: u64,
    round: u32,
    committee_size: usize,
    validator: Option<String>,
    committee_member: bool,
    pending_proposals: usize,
    mempool_size: usize,
    equivocations: usize,
    halted: bool,
    halt_reason: Option<String>,
    uptime_secs: u64,
}

async fn get_status(State(state): State<RpcState>) -> Json<StatusResponse> {
    let node = state.node.read().await;
    let engine = &node.engine;
    let chain = engine.chain();
    Json(StatusResponse {
        chain_id: hex::encode(chain.chain_id()),
        height: chain.height(),
        tip_hash: chain.tip_hash().to_string(),
        epoch: chain.committee().epoch,
        round: engine.round(),
        committee_size: chain.committee().len(),
        validator: engine.address().map(|a| a.to_string()),
        committee_member: engine.is_committee_member(),
        pending_proposals: engine.pending_proposals(),
        mempool_size: engine.pool().len(),
        equivocations: engine.equivocations().len(),
        halted: engine.is_halted(),
        halt_reason: engine.halt_reason().map(str::to_string),
        uptime_secs: node.node_start_time.elapsed().as_secs(),
    })
}

// ── GET /committee ──

#[derive(Serialize)]
struct CommitteeMemberResponse {
    address: String,
    weight: u64,
}

#[derive(Serialize)]
struct CommitteeResponse {
    epoch: u64,
    /// Height these members vote on.
    height: u64,
    next_proposer: Option<String>,
    total_weight: u128,
    quorum_weight: u128,
    members: Vec<CommitteeMemberResponse>,
}

async fn get_committee(State(state): State<RpcState>) -> Json<CommitteeResponse> {
    let node = state.node.read().await;
    let chain = node.engine.chain();
    let committee = chain.committee();
    let height = chain.height() + 1;
    Json(CommitteeResponse {
        epoch: committee.epoch,
        height,
        next_proposer: proposer_for(committee, height, node.engine.round()).map(|a| a.to_string()),
        total_weight: committee.total_weight(),
        quorum_weight: committee.quorum_weight(),
        members: committee
            .members
            .iter()
            .map(|m| CommitteeMemberResponse {
                address: m.address.to_string(),
                weight: m.weight,
            })
            .collect(),
    })
}

// ── GET /validators ──

#[derive(Serialize)]
struct ValidatorResponse {
    address: String,
    stake: u64,
    delegated_stake: u64,
    reputation: i64,
    effective_weight: u64,
    last_active_height: u64,
    active: bool,
}

async fn get_validators(State(state): State<RpcState>) -> Json<Vec<ValidatorResponse>> {
    let node = state.node.read().await;
    let registry = node.engine.chain().state().registry();
    Json(
        registry
            .iter()
            .map(|v| ValidatorResponse {
                address: v.address.to_string(),
                stake: v.stake,
                delegated_stake: v.delegated_stake,
                reputation: v.reputation,
                effective_weight: v.effective_weight(),
                last_active_height: v.last_active_height,
                active: v.active,
            })
            .collect(),
    )
}

// ── GET /account/{address} ──

#[derive(Serialize)]
struct AccountResponse {
    address: String,
    balance: u64,
    nonce: u64,
    validator: bool,
}

async fn get_account(
    State(state): State<RpcState>,
    Path(address): Path<String>,
) -> Result<Json<AccountResponse>, RpcError> {
    let address: Address = address
        .parse()
        .map_err(|e: crate::AddressParseError| reject(StatusCode::BAD_REQUEST, "invalid_address", e.to_string()))?;
    let node = state.node.read().await;
    let chain_state = node.engine.chain().state();
    let account = chain_state.accounts().get(&address);
    Ok(Json(AccountResponse {
        address: address.to_string(),
        balance: account.balance,
        nonce: account.nonce,
        validator: chain_state.registry().contains(&address),
    }))
}

// ── GET /block/{height} ──

#[derive(Serialize)]
struct BlockResponse {
    height: u64,
    round: u32,
    hash: String,
    previous_hash: String,
    timestamp: u64,
    proposer: String,
    state_root: String,
    transaction_root: String,
    transactions: Vec<String>,
    /// Addresses whose approvals finalized this block.
    approvers: Vec<String>,
}

async fn get_block(
    State(state): State<RpcState>,
    Path(height): Path<u64>,
) -> Result<Json<BlockResponse>, RpcError> {
    let node = state.node.read().await;
    let chain = node.engine.chain();
    let block = chain
        .block(height)
        .ok_or_else(|| reject(StatusCode::NOT_FOUND, "not_found", format!("no block at height {}", height)))?;
    let approvers = chain
        .certificate(height)
        .map(|c| c.signers().iter().map(Address::to_string).collect())
        .unwrap_or_default();
    Ok(Json(BlockResponse {
        height: block.header.height,
        round: block.header.round,
        hash: block.header_hash.to_string(),
        previous_hash: block.header.previous_hash.to_string(),
        timestamp: block.header.timestamp,
        proposer: block.header.proposer.to_string(),
        state_root: hex::encode(block.header.state_root),
        transaction_root: hex::encode(block.header.transaction_root),
        transactions: block.transactions.iter().map(|tx| tx.hash.to_string()).collect(),
        approvers,
    }))
}

// ── GET /mempool ──

async fn get_mempool(State(state): State<RpcState>) -> Json<super::mempool::PoolStats> {
    let node = state.node.read().await;
    Json(node.engine.pool().stats())
}

// ── POST /tx ──

#[derive(Deserialize)]
struct SubmitTxRequest {
    /// Hex-encoded bincode-serialized transaction.
    tx_hex: String,
}

#[derive(Serialize)]
struct SubmitTxResponse {
    tx_hash: String,
}

async fn submit_tx(
    State(state): State<RpcState>,
    Json(req): Json<SubmitTxRequest>,
) -> Result<Json<SubmitTxResponse>, RpcError> {
    let tx_bytes = hex::decode(&req.tx_hex).map_err(|e| {
        tracing::debug!(error = %e, "RPC submit_tx: invalid hex encoding");
        reject(StatusCode::BAD_REQUEST, "invalid_hex", e.to_string())
    })?;
    let tx: Transaction = crate::deserialize(&tx_bytes).map_err(|e| {
        tracing::debug!(error = %e, "RPC submit_tx: failed to decode transaction");
        reject(StatusCode::BAD_REQUEST, "invalid_encoding", e.to_string())
    })?;

    let result = {
        let mut node = state.node.write().await;
        node.engine.submit_transaction(tx.clone())
    };
    let tx_hash = result.map_err(|e| {
        tracing::debug!(error = %e, "RPC submit_tx: transaction rejected by pool");
        reject(StatusCode::BAD_REQUEST, e.reason_code(), e.to_string())
    })?;

    let _ = state.p2p.broadcast(Message::NewTransaction(tx), None).await;
    Ok(Json(SubmitTxResponse {
        tx_hash: tx_hash.to_string(),
    }))
}
