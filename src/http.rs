//! HTTP routes for submitting, sealing and auditing prescriptions.
//!
//! Two independent checks guard every write: the shared network key on the
//! request, and the writer's signature over the prescription itself. There is
//! deliberately no route that produces signatures on a client's behalf.

use axum::{
    body::{Body, Bytes},
    extract::{FromRequest, Path, Query, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::ledger::LedgerError;
use crate::mempool::MempoolError;
use crate::runtime::{Runtime, RuntimeError};
use crate::signature::AdmissionError;
use crate::types::{format_hex, parse_hex, Block, Prescription, Transaction, TransactionClaim};
use crate::validator::{ChainReport, InvalidReason};

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    runtime: Runtime,
    network_key: Arc<str>,
    protect_reads: bool,
    seal_timeout: Option<Duration>,
}

impl AppState {
    pub fn new(runtime: Runtime, config: &NodeConfig) -> Self {
        AppState {
            runtime,
            network_key: Arc::from(config.network.network_key.as_str()),
            protect_reads: config.network.protect_reads,
            seal_timeout: config.seal_timeout(),
        }
    }

    fn authorize(&self, provided: Option<&str>) -> Result<(), ApiError> {
        let provided = provided.unwrap_or_default();
        if bool::from(provided.as_bytes().ct_eq(self.network_key.as_bytes())) {
            Ok(())
        } else {
            Err(ApiError::Unauthorized)
        }
    }

    fn authorize_read(&self, provided: Option<&str>) -> Result<(), ApiError> {
        if self.protect_reads {
            self.authorize(provided)
        } else {
            Ok(())
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/new_transaction", post(new_transaction))
        .route("/mine", get(mine).post(mine))
        .route("/chain", get(full_chain))
        .route("/transactions/get", get(pending_transactions))
        .route("/transaction/:id", get(get_transaction))
        .route("/validate", get(validate_chain))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve<F>(state: AppState, addr: SocketAddr, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized network key")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error("Transaction not found")]
    NotFound,
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Runtime(RuntimeError::AdmissionError(e)) => match e {
                AdmissionError::UnknownWriter(_) => (StatusCode::BAD_REQUEST, "unknown_writer"),
                AdmissionError::UnapprovedCounterparty(_) => {
                    (StatusCode::BAD_REQUEST, "unapproved_counterparty")
                }
                AdmissionError::SignatureMismatch(_) => {
                    (StatusCode::BAD_REQUEST, "signature_mismatch")
                }
            },
            ApiError::Runtime(RuntimeError::LedgerError(e)) => match e {
                LedgerError::MempoolError(MempoolError::Full { .. }) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "mempool_full")
                }
                LedgerError::SealTimeout | LedgerError::SealCancelled => {
                    (StatusCode::SERVICE_UNAVAILABLE, "seal_timeout")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            },
            ApiError::Runtime(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        let body = ErrorBody {
            error: kind,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct KeyQuery {
    #[serde(default)]
    pub network_key: Option<String>,
}

/// Body of `POST /new_transaction`, as JSON or as an urlencoded form.
/// Field names match the hospital client.
#[derive(Debug, Deserialize)]
pub struct NewTransactionRequest {
    #[serde(default)]
    pub network_key: Option<String>,
    pub prescriber_public_key: String,
    #[serde(default)]
    pub pharmacy_public_key: Option<String>,
    pub patient_id: String,
    pub drug_name: String,
    pub dosage: String,
    pub quantity: String,
    pub signature: String,
}

impl NewTransactionRequest {
    fn into_claim(self) -> (TransactionClaim, String) {
        let claim = TransactionClaim {
            writer: self.prescriber_public_key,
            counterparty: self.pharmacy_public_key.filter(|p| !p.is_empty()),
            subject: self.patient_id,
            payload: Prescription {
                drug_name: self.drug_name,
                dosage: self.dosage,
                quantity: self.quantity,
            },
        };
        (claim, self.signature)
    }
}

#[derive(Serialize)]
pub struct NewTransactionResponse {
    pub message: &'static str,
    pub id: String,
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"))
}

/// Decode a buffered body with axum's `Form` or `Json` extractor, chosen by
/// content type.
async fn decode_body<T>(headers: &HeaderMap, body: Bytes) -> Result<T, String>
where
    T: DeserializeOwned,
{
    let mut request = Request::new(Body::from(body));
    *request.method_mut() = Method::POST;
    *request.headers_mut() = headers.clone();
    if is_form(headers) {
        Form::<T>::from_request(request, &())
            .await
            .map(|Form(value)| value)
            .map_err(|e| e.body_text())
    } else {
        Json::<T>::from_request(request, &())
            .await
            .map(|Json(value)| value)
            .map_err(|e| e.body_text())
    }
}

/// POST /new_transaction
///
/// The network key is checked before the rest of the body is parsed, so an
/// unauthenticated caller learns nothing about the expected fields.
pub async fn new_transaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<NewTransactionResponse>, ApiError> {
    let key: KeyQuery = decode_body(&headers, body.clone())
        .await
        .unwrap_or_default();
    state.authorize(key.network_key.as_deref())?;

    let request: NewTransactionRequest = decode_body(&headers, body)
        .await
        .map_err(ApiError::BadRequest)?;

    let (claim, signature) = request.into_claim();
    let drug = claim.payload.drug_name.clone();
    let id = state.runtime.submit(claim, signature)?;
    info!(id = %format_hex(&id), drug = %drug, "new prescription added");

    Ok(Json(NewTransactionResponse {
        message: "Prescription successfully added to pool",
        id: format_hex(&id),
    }))
}

/// GET|POST /mine
pub async fn mine(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
) -> Result<Json<Block>, ApiError> {
    state.authorize(query.network_key.as_deref())?;
    let block = state.runtime.seal_blocking(state.seal_timeout).await?;
    info!(
        index = block.index,
        previous = %format_hex(&block.previous_hash),
        "block mined"
    );
    Ok(Json(block))
}

#[derive(Serialize)]
pub struct ChainResponse {
    pub chain: Vec<Block>,
    pub length: usize,
}

/// GET /chain
pub async fn full_chain(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
) -> Result<Json<ChainResponse>, ApiError> {
    state.authorize_read(query.network_key.as_deref())?;
    let chain = state.runtime.chain()?;
    Ok(Json(ChainResponse {
        length: chain.len(),
        chain,
    }))
}

#[derive(Serialize)]
pub struct PendingResponse {
    pub transactions: Vec<Transaction>,
    pub length: usize,
}

/// GET /transactions/get
pub async fn pending_transactions(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
) -> Result<Json<PendingResponse>, ApiError> {
    state.authorize_read(query.network_key.as_deref())?;
    let transactions = state.runtime.pending()?;
    Ok(Json(PendingResponse {
        length: transactions.len(),
        transactions,
    }))
}

#[derive(Serialize)]
pub struct TransactionResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_index: Option<u64>,
    pub transaction: Transaction,
}

/// GET /transaction/:id
pub async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<KeyQuery>,
) -> Result<Json<TransactionResponse>, ApiError> {
    state.authorize_read(query.network_key.as_deref())?;
    let id = parse_hex(&id).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let record = state.runtime.find_transaction(&id)?.ok_or(ApiError::NotFound)?;
    Ok(Json(TransactionResponse {
        status: if record.block_index.is_some() {
            "sealed"
        } else {
            "pending"
        },
        block_index: record.block_index,
        transaction: record.transaction,
    }))
}

#[derive(Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failing_sequence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<InvalidReason>,
    pub message: String,
}

impl From<ChainReport> for ValidateResponse {
    fn from(report: ChainReport) -> Self {
        match report {
            ChainReport::Valid => ValidateResponse {
                valid: true,
                failing_sequence: None,
                reason: None,
                message: "Blockchain is secure.".to_string(),
            },
            ChainReport::Invalid {
                at_sequence,
                reason,
            } => ValidateResponse {
                valid: false,
                failing_sequence: Some(at_sequence),
                reason: Some(reason),
                message: format!("Blockchain invalid at block #{at_sequence}: {reason}"),
            },
        }
    }
}

/// GET /validate
pub async fn validate_chain(
    State(state): State<AppState>,
    Query(query): Query<KeyQuery>,
) -> Result<Json<ValidateResponse>, ApiError> {
    state.authorize_read(query.network_key.as_deref())?;
    Ok(Json(state.runtime.validate()?.into()))
}

#[derive(Serialize)]
pub struct Health {
    pub status: &'static str,
    pub height: u64,
    pub pending: usize,
    pub tip_hash: String,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Result<Json<Health>, ApiError> {
    let status = state.runtime.status()?;
    Ok(Json(Health {
        status: "ok",
        height: status.height,
        pending: status.pending,
        tip_hash: format_hex(&status.tip_hash),
    }))
}
