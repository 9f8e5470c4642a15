//! HTTP API for submitting, approving and inspecting transactions

use crate::chain::ChainRegistry;
use crate::config::ApiConfig;
use crate::controller::{validation::parse_quantity, TransactionController, TxRequest, INTERNAL_ORIGIN};
use crate::error::{TxError, TxResult};
use crate::state::{ChainSelector, StateManager, TransactionRecord, TxFilter, TxStatus};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ethers::types::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<TransactionController>,
    pub chains: Arc<ChainRegistry>,
    /// Present when persistence is enabled
    pub state_manager: Option<Arc<StateManager>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/chains", get(get_chains))
        .route("/stats", get(get_stats))
        .route("/transactions", get(list_transactions).post(create_transaction))
        .route("/transactions/:id", get(get_transaction))
        .route("/transactions/:id/approve", post(approve_transaction))
        .route("/transactions/:id/reject", post(reject_transaction))
        .route("/transactions/:id/cancel", post(cancel_transaction))
        .route("/transactions/:id/speed-up", post(speed_up_transaction))
        .route("/transactions/:id/co-signatures", post(add_co_signatures))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> TxResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| TxError::Config(format!("cannot bind API address {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| TxError::Internal(format!("API server: {}", e)))?;

    Ok(())
}

/// Engine error rendered as a JSON body with a matching status code
pub struct ApiError(TxError);

impl From<TxError> for ApiError {
    fn from(err: TxError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TxError::Validation(_)
            | TxError::ExpiredMultiSig { .. }
            | TxError::WrongSigner { .. }
            | TxError::WrongChain { .. } => StatusCode::BAD_REQUEST,
            TxError::Authorization { .. } => StatusCode::FORBIDDEN,
            TxError::TransactionNotFound { .. } | TxError::ChainNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            TxError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
            TxError::UserRejected { .. } => StatusCode::GONE,
            TxError::ChainConnection { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify all dependencies
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = match &state.state_manager {
        Some(manager) => manager.health_check().await.is_ok(),
        None => true,
    };

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
                .map(|(chain, healthy)| ChainHealth { chain, healthy })
                .collect(),
        }),
    )
}

/// Get connected chains
async fn get_chains(State(state): State<AppState>) -> impl IntoResponse {
    Json(ChainsResponse {
        chains: state.chains.connected_chains(),
    })
}

/// Transaction counts, from the in-memory store
async fn get_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> impl IntoResponse {
    let controller = &state.controller;
    let store = controller.store();

    Json(StatsResponse {
        unapproved: controller.get_unapproved_tx_count().await,
        pending: controller.get_pending_tx_count(query.address).await,
        confirmed: store.get_confirmed_transactions(query.address).await.len(),
        unknown: store.get_unknown_transactions().await.len(),
    })
}

async fn list_transactions(
    State(state): State<AppState>,
    Query(filter): Query<TxFilter>,
) -> Json<Vec<TransactionRecord>> {
    Json(state.controller.store().get_filtered_tx_list(&filter).await)
}

async fn create_transaction(
    State(state): State<AppState>,
    Json(body): Json<CreateTransactionRequest>,
) -> ApiResult<TransactionRecord> {
    let origin = body.origin.as_deref().unwrap_or(INTERNAL_ORIGIN);
    let record = state
        .controller
        .add_unapproved_transaction(body.request, origin)
        .await?;
    Ok(Json(record))
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<TransactionRecord> {
    let record = state
        .controller
        .store()
        .get_tx(id)
        .await
        .ok_or(TxError::TransactionNotFound { id })?;
    Ok(Json(record))
}

async fn approve_transaction(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<StatusResponse> {
    state.controller.approve_transaction(id).await?;
    status_of(&state, id).await
}

async fn reject_transaction(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<StatusResponse> {
    state.controller.cancel_transaction(id).await?;
    status_of(&state, id).await
}

async fn cancel_transaction(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    body: Option<Json<ReplacementRequest>>,
) -> ApiResult<TransactionRecord> {
    let gas_price = replacement_gas_price(body)?;
    let record = state
        .controller
        .create_cancel_transaction(id, gas_price)
        .await?;
    Ok(Json(record))
}

async fn speed_up_transaction(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    body: Option<Json<ReplacementRequest>>,
) -> ApiResult<TransactionRecord> {
    let gas_price = replacement_gas_price(body)?;
    let record = state
        .controller
        .create_speed_up_transaction(id, gas_price)
        .await?;
    Ok(Json(record))
}

async fn add_co_signatures(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(body): Json<CoSignatureRequest>,
) -> ApiResult<TransactionRecord> {
    let record = state
        .controller
        .add_co_signatures(id, body.payload, body.signatures)
        .await?;
    Ok(Json(record))
}

fn replacement_gas_price(body: Option<Json<ReplacementRequest>>) -> TxResult<Option<U256>> {
    body.and_then(|Json(b)| b.gas_price)
        .map(|price| parse_quantity("gasPrice", &price))
        .transpose()
}

async fn status_of(state: &AppState, id: u64) -> ApiResult<StatusResponse> {
    let record = state
        .controller
        .store()
        .get_tx(id)
        .await
        .ok_or(TxError::TransactionNotFound { id })?;
    Ok(Json(StatusResponse {
        id,
        status: record.status,
        hash: record.hash.map(|h| format!("{:?}", h)),
    }))
}

// Request types

#[derive(Deserialize)]
struct CreateTransactionRequest {
    #[serde(flatten)]
    request: TxRequest,
    /// Requesting origin, the wallet itself when absent
    origin: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplacementRequest {
    gas_price: Option<String>,
}

#[derive(Deserialize)]
struct CoSignatureRequest {
    payload: Bytes,
    signatures: u32,
}

#[derive(Deserialize)]
struct StatsQuery {
    address: Option<Address>,
}

// Response types

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
    chain: ChainSelector,
    healthy: bool,
}

#[derive(Serialize)]
struct ChainsResponse {
    chains: Vec<ChainSelector>,
}

#[derive(Serialize)]
struct StatsResponse {
    unapproved: usize,
    pending: usize,
    confirmed: usize,
    unknown: usize,
}

#[derive(Serialize)]
struct StatusResponse {
    id: u64,
    status: TxStatus,
    hash: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::state::TransactionStore;
    use crate::test_utils::{FakeChain, FakeSigner, FakeWallet};

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        let from = Address::repeat_byte(0x11);
        let chains = Arc::new(ChainRegistry::new());
        chains.register(ChainSelector::from("eth:1"), Arc::new(FakeChain::new()));

        let controller = TransactionController::new(
            EngineConfig::default(),
            Arc::new(TransactionStore::new(100)),
            chains.clone(),
            Arc::new(FakeSigner::new()),
            Arc::new(FakeWallet::new(from)),
        );

        router(AppState {
            controller: Arc::new(controller),
            chains,
            state_manager: None,
        })
    }

    async fn send(app: &Router, method: &str, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = send(&app(), "GET", "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_create_approve_and_list() {
        let app = app();
        let create = r#"{
            "from": "0x1111111111111111111111111111111111111111",
            "to": "0x2222222222222222222222222222222222222222",
            "value": "0x1"
        }"#;

        let (status, created) = send(&app, "POST", "/transactions", create).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["status"], "unapproved");
        let id = created["id"].as_u64().unwrap();

        let (status, approved) =
            send(&app, "POST", &format!("/transactions/{}/approve", id), "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(approved["status"], "submitted");

        let (status, listed) = send(&app, "GET", "/transactions?status=submitted", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (_, stats) = send(&app, "GET", "/stats", "").await;
        assert_eq!(stats["pending"], 1);
    }

    #[tokio::test]
    async fn test_errors_map_to_status_codes() {
        let app = app();

        let (status, _) = send(&app, "GET", "/transactions/42", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let forbidden = r#"{
            "from": "0x1111111111111111111111111111111111111111",
            "to": "0x2222222222222222222222222222222222222222",
            "origin": "https://unknown.example"
        }"#;
        let (status, body) = send(&app, "POST", "/transactions", forbidden).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body["error"].as_str().unwrap().contains("not permitted"));

        let invalid = r#"{"from": "0x1111111111111111111111111111111111111111"}"#;
        let (status, _) = send(&app, "POST", "/transactions", invalid).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
