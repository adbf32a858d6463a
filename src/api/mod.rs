//! HTTP API: health checks, the read model, and the transfer command surface
//!
//! This is the only interface the UI layer binds to: balances and supply
//! come from the state cache, the transfer ledger from the store, and
//! outbound transfers are submitted through the chain manager.

use crate::cache::StateCache;
use crate::chain::{ChainId, ChainManager};
use crate::config::ApiConfig;
use crate::error::RelayResult;
use crate::relay::{Transfer, TransferStatus};
use crate::state::TransferStore;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<StateCache>,
    pub store: Arc<dyn TransferStore>,
    pub chains: Arc<ChainManager>,
    pub started_at: DateTime<Utc>,
}

/// Run the HTTP API server
pub async fn run_server(
    config: ApiConfig,
    cache: Arc<StateCache>,
    store: Arc<dyn TransferStore>,
    chains: Arc<ChainManager>,
) -> RelayResult<()> {
    let state = AppState {
        cache,
        store,
        chains,
        started_at: Utc::now(),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/chains/:chain/balance/:account", get(get_balance))
        .route("/chains/:chain/supply", get(get_supply))
        .route("/transfers", get(list_transfers).post(submit_transfer))
        .route("/transfers/:hash", get(get_transfer))
        .route("/transfers/:hash/ack", post(acknowledge_transfer))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| crate::error::RelayError::Internal(e.to_string()))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| crate::error::RelayError::Internal(e.to_string()))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify store and chain connections
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.store.health_check().await.is_ok();

    let chain_health = state.chains.health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let response = ReadinessResponse {
        ready: store_ok && chains_ok,
        store: store_ok,
        chains: chain_health
            .into_iter()
            .map(|(chain, healthy)| ChainHealth { chain, healthy })
            .collect(),
    };

    let code = if response.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}

/// Relayer status: connected chains and transfer statistics
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let chain_health = state.chains.health_check().await;
    let stats = state.store.stats().await.unwrap_or_default();

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds().max(0) as u64,
        // Clients can diff this against the push channel to detect staleness
        read_model_version: *state.cache.subscribe().borrow(),
        connected_chains: state.chains.connected_chains(),
        chain_status: chain_health
            .into_iter()
            .map(|(chain, healthy)| ChainHealth { chain, healthy })
            .collect(),
        transfers: TransferStatsResponse {
            observed: stats.observed,
            dispatched: stats.dispatched,
            settled: stats.settled,
            failed: stats.failed,
        },
    })
}

/// Balance of one account, from the read model with a ledger fallback for
/// accounts the cache has not observed yet
async fn get_balance(
    State(state): State<AppState>,
    Path((chain, account)): Path<(String, String)>,
) -> impl IntoResponse {
    let chain: ChainId = match chain.parse() {
        Ok(c) => c,
        Err(e) => return bad_request(e),
    };
    let account: Address = match account.parse() {
        Ok(a) => a,
        Err(_) => return bad_request(format!("invalid account: {}", account)),
    };

    if let Some(balance) = state.cache.balance(chain, account).await {
        return ok(BalanceResponse {
            chain,
            account: format!("{:?}", account),
            balance: balance.to_string(),
        });
    }

    // Not yet observed: pass the read through to the ledger without
    // mutating the cache (the event path is its only writer)
    match state.chains.get_client(chain) {
        Ok(client) => match client.get_balance(account).await {
            Ok(balance) => ok(BalanceResponse {
                chain,
                account: format!("{:?}", account),
                balance: balance.to_string(),
            }),
            Err(e) => unavailable(e.to_string()),
        },
        Err(e) => bad_request(e.to_string()),
    }
}

/// Total supply held on one chain
async fn get_supply(
    State(state): State<AppState>,
    Path(chain): Path<String>,
) -> impl IntoResponse {
    let chain: ChainId = match chain.parse() {
        Ok(c) => c,
        Err(e) => return bad_request(e),
    };

    let snapshot = state.cache.snapshot(chain).await;
    ok(SupplyResponse {
        chain,
        total_supply: snapshot.total_supply.to_string(),
        last_processed_block: snapshot.last_processed_block,
    })
}

#[derive(Deserialize)]
struct ListQuery {
    status: Option<String>,
}

/// Transfer ledger, optionally filtered by status. Failed transfers stay
/// listed with their reason until acknowledged.
async fn list_transfers(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let status = match query.status.as_deref() {
        Some(s) => match TransferStatus::from_str(s) {
            Some(status) => Some(status),
            None => return bad_request(format!("unknown status: {}", s)),
        },
        None => None,
    };

    match state.store.list(status).await {
        Ok(transfers) => ok(TransfersResponse {
            transfers: transfers.iter().map(TransferView::from).collect(),
        }),
        Err(e) => internal(e.to_string()),
    }
}

/// Single transfer by origin hash
async fn get_transfer(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> impl IntoResponse {
    let hash: H256 = match hash.parse() {
        Ok(h) => h,
        Err(_) => return bad_request(format!("invalid transfer hash: {}", hash)),
    };

    match state.store.get(hash).await {
        Ok(Some(transfer)) => ok(TransferView::from(&transfer)),
        Ok(None) => not_found(format!("transfer {:?} not found", hash)),
        Err(e) => internal(e.to_string()),
    }
}

#[derive(Deserialize)]
struct SubmitTransferRequest {
    destination_chain: ChainId,
    destination_address: String,
    /// Decimal token amount
    amount: String,
}

/// Submit a user-initiated outbound transfer. The resulting on-chain send
/// event flows back through the relay pipeline like any other.
async fn submit_transfer(
    State(state): State<AppState>,
    Json(request): Json<SubmitTransferRequest>,
) -> impl IntoResponse {
    let destination_address: Address = match request.destination_address.parse() {
        Ok(a) => a,
        Err(_) => {
            return bad_request(format!(
                "invalid destination address: {}",
                request.destination_address
            ))
        }
    };
    let amount = match U256::from_dec_str(&request.amount) {
        Ok(a) if !a.is_zero() => a,
        Ok(_) => return bad_request("amount must be positive".to_string()),
        Err(_) => return bad_request(format!("invalid amount: {}", request.amount)),
    };

    let source_chain = request.destination_chain.counterpart();
    match state
        .chains
        .submit_transfer_request(source_chain, destination_address, amount)
        .await
    {
        Ok(tx_hash) => ok(SubmitTransferResponse {
            source_chain,
            destination_chain: request.destination_chain,
            tx_hash: format!("{:?}", tx_hash),
        }),
        Err(e) => unavailable(e.to_string()),
    }
}

/// Operator acknowledgement of a failed transfer
async fn acknowledge_transfer(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> impl IntoResponse {
    let hash: H256 = match hash.parse() {
        Ok(h) => h,
        Err(_) => return bad_request(format!("invalid transfer hash: {}", hash)),
    };

    match state.store.acknowledge(hash).await {
        Ok(true) => ok(AckResponse { acknowledged: true }),
        Ok(false) => not_found(format!("no failed transfer {:?}", hash)),
        Err(e) => internal(e.to_string()),
    }
}

// Response plumbing

fn ok<T: Serialize>(body: T) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(serde_json::json!(body)))
}

fn bad_request(message: String) -> (StatusCode, Json<serde_json::Value>) {
    error_response(StatusCode::BAD_REQUEST, message)
}

fn not_found(message: String) -> (StatusCode, Json<serde_json::Value>) {
    error_response(StatusCode::NOT_FOUND, message)
}

fn unavailable(message: String) -> (StatusCode, Json<serde_json::Value>) {
    error_response(StatusCode::SERVICE_UNAVAILABLE, message)
}

fn internal(message: String) -> (StatusCode, Json<serde_json::Value>) {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, message)
}

fn error_response(code: StatusCode, message: String) -> (StatusCode, Json<serde_json::Value>) {
    (code, Json(serde_json::json!(ErrorResponse { error: message })))
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
    chains: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain: ChainId,
    healthy: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    read_model_version: u64,
    connected_chains: Vec<ChainId>,
    chain_status: Vec<ChainHealth>,
    transfers: TransferStatsResponse,
}

#[derive(Serialize)]
struct TransferStatsResponse {
    observed: u64,
    dispatched: u64,
    settled: u64,
    failed: u64,
}

#[derive(Serialize)]
struct BalanceResponse {
    chain: ChainId,
    account: String,
    balance: String,
}

#[derive(Serialize)]
struct SupplyResponse {
    chain: ChainId,
    total_supply: String,
    last_processed_block: u64,
}

#[derive(Serialize)]
struct TransfersResponse {
    transfers: Vec<TransferView>,
}

#[derive(Serialize)]
struct TransferView {
    origin_tx_hash: String,
    source_chain: ChainId,
    destination_chain: ChainId,
    source_address: String,
    destination_address: String,
    amount: String,
    status: TransferStatus,
    attempts: u32,
    failure_reason: Option<String>,
    acknowledged: bool,
}

impl From<&Transfer> for TransferView {
    fn from(t: &Transfer) -> Self {
        TransferView {
            origin_tx_hash: format!("{:?}", t.origin_tx_hash),
            source_chain: t.source_chain,
            destination_chain: t.destination_chain,
            source_address: format!("{:?}", t.source_address),
            destination_address: format!("{:?}", t.destination_address),
            amount: t.amount.to_string(),
            status: t.status,
            attempts: t.attempts,
            failure_reason: t.failure_reason.clone(),
            acknowledged: t.acknowledged,
        }
    }
}

#[derive(Serialize)]
struct SubmitTransferResponse {
    source_chain: ChainId,
    destination_chain: ChainId,
    tx_hash: String,
}

#[derive(Serialize)]
struct AckResponse {
    acknowledged: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}
