//! HTTP API for submission, transaction status, health and statistics

use crate::chain::ChainManager;
use crate::config::ApiConfig;
use crate::error::{TxmError, TxmResult};
use crate::state::{Attempt, Transaction, TransactionStats, TxRequest, TxState, TxStore};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1_000;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TxStore>,
    pub chains: Arc<ChainManager>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/chains", get(get_chains))
        .route("/chains/:chain_id/stats", get(get_stats))
        .route(
            "/chains/:chain_id/transactions",
            get(list_transactions).post(submit_transaction),
        )
        .route("/chains/:chain_id/transactions/:tx_id", get(get_transaction))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(
    config: ApiConfig,
    store: Arc<dyn TxStore>,
    chains: Arc<ChainManager>,
) -> TxmResult<()> {
    let app = router(AppState { store, chains });

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| TxmError::Config(format!("Failed to bind API server to {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| TxmError::Internal(format!("API server error: {}", e)))?;

    Ok(())
}

/// Error wrapper mapping manager errors onto HTTP status codes
pub struct ApiError(TxmError);

impl From<TxmError> for ApiError {
    fn from(e: TxmError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TxmError::ChainNotFound { .. } | TxmError::TransactionNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            TxmError::UnknownSender { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("API request failed: {}", self.0);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - store and every chain reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.store.health_check().await.is_ok();
    let chain_health = state.chains.health_check().await;
    let chains = chain_health.iter().all(|(_, healthy)| *healthy);
    let ready = database && chains;

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            database,
            chains,
            details: chain_health
                .into_iter()
                .map(|(chain_id, healthy)| ChainHealth { chain_id, healthy })
                .collect(),
        }),
    )
}

async fn get_chains(State(state): State<AppState>) -> impl IntoResponse {
    let chains = state
        .chains
        .connected_chains()
        .into_iter()
        .filter_map(|id| state.chains.get(id).ok())
        .map(|m| ChainInfo {
            chain_id: m.chain_id(),
            name: m.name().to_string(),
        })
        .collect();
    Json(ChainsResponse { chains })
}

async fn get_stats(
    State(state): State<AppState>,
    Path(chain_id): Path<u64>,
) -> Result<Json<TransactionStats>, ApiError> {
    let stats = state.chains.get(chain_id)?.stats().await?;
    Ok(Json(stats))
}

async fn submit_transaction(
    State(state): State<AppState>,
    Path(chain_id): Path<u64>,
    Json(request): Json<TxRequest>,
) -> Result<(StatusCode, Json<Transaction>), ApiError> {
    let tx = state.chains.get(chain_id)?.enqueue(request).await?;
    Ok((StatusCode::CREATED, Json(tx)))
}

async fn list_transactions(
    State(state): State<AppState>,
    Path(chain_id): Path<u64>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Transaction>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
    let txs = state.chains.get(chain_id)?.list(query.state, limit).await?;
    Ok(Json(txs))
}

async fn get_transaction(
    State(state): State<AppState>,
    Path((chain_id, tx_id)): Path<(u64, Uuid)>,
) -> Result<Json<TransactionResponse>, ApiError> {
    let (transaction, attempts) = state.chains.get(chain_id)?.transaction(tx_id).await?;
    Ok(Json(TransactionResponse {
        transaction,
        attempts,
    }))
}

// Request and response types

#[derive(Deserialize)]
struct ListQuery {
    state: Option<TxState>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u64,
    healthy: bool,
}

#[derive(Serialize)]
struct ChainInfo {
    chain_id: u64,
    name: String,
}

#[derive(Serialize)]
struct ChainsResponse {
    chains: Vec<ChainInfo>,
}

#[derive(Serialize)]
struct TransactionResponse {
    transaction: Transaction,
    attempts: Vec<Attempt>,
}
