use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use crate::errors::EngineError;

use super::Engine;
use super::kyc::KycAction;
use super::models::{Actor, ActorRole, ProgressFlag, ReviewDecision, SignerRole};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub engine: Engine,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateTransactionRequest {
    pub property_ref: String,
    pub value_centavos: i64,
    pub developer_ref: String,
}

#[derive(Deserialize)]
pub struct PatchProgressRequest {
    pub flag: ProgressFlag,
    pub value: bool,
}

#[derive(Deserialize)]
pub struct JoinRequest {
    pub code: String,
}

#[derive(Deserialize)]
pub struct CreateMilestoneRequest {
    pub label: String,
    pub amount_centavos: i64,
    #[serde(default)]
    pub proof_pattern: String,
}

#[derive(Deserialize)]
pub struct ProofRequest {
    pub proof_ref: String,
}

#[derive(Deserialize)]
pub struct PaymentDecisionRequest {
    pub decision: ReviewDecision,
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateDocumentRequest {
    pub title: String,
    pub required_roles: Vec<SignerRole>,
}

#[derive(Deserialize)]
pub struct SignRequest {
    pub role: SignerRole,
    pub signature_ref: String,
}

/// Batch actions on the signing set, tagged so one endpoint carries exactly
/// one action and its payload.
#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SigningBatchRequest {
    SubmitAll,
    Validate,
    Return { reason: String },
}

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HandoffRequest {
    CompleteHandoff,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Engine(EngineError),
    BadRequest(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": msg,
                    "code": "bad_request",
                    "retryable": false,
                })),
            )
                .into_response(),
            ApiError::Engine(err) => {
                let status = match &err {
                    EngineError::Unauthorized { .. } => StatusCode::FORBIDDEN,
                    EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
                    EngineError::PreconditionFailed { .. } => StatusCode::CONFLICT,
                    EngineError::AlreadyTerminal { .. } => StatusCode::CONFLICT,
                    EngineError::ValidationRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    EngineError::ExpiredAccess => StatusCode::GONE,
                    EngineError::AnalyzerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    tracing::error!(error = %err, "request failed on storage");
                }
                (
                    status,
                    Json(serde_json::json!({
                        "error": err.to_string(),
                        "code": err.code(),
                        "retryable": err.is_retryable(),
                    })),
                )
                    .into_response()
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route(
            "/api/transactions",
            get(list_transactions).post(create_transaction),
        )
        .route("/api/transactions/{id}", get(get_snapshot))
        .route(
            "/api/transactions/{id}/progress",
            get(get_progress).patch(patch_progress),
        )
        .route("/api/transactions/{id}/access", get(get_access))
        .route("/api/transactions/{id}/access/code", post(regenerate_access_code))
        .route("/api/transactions/{id}/access/approve", post(approve_access))
        .route("/api/transactions/{id}/access/reject", post(reject_access))
        .route("/api/transactions/{id}/join", post(join_transaction))
        .route("/api/transactions/{id}/milestones", post(create_milestone))
        .route(
            "/api/transactions/{id}/milestones/{milestone_id}/proof",
            post(submit_payment_proof),
        )
        .route(
            "/api/transactions/{id}/milestones/{milestone_id}/decision",
            post(decide_payment),
        )
        .route("/api/transactions/{id}/kyc", post(kyc_action))
        .route("/api/transactions/{id}/documents", post(create_document))
        .route(
            "/api/transactions/{id}/documents/{document_id}/acknowledge",
            post(acknowledge_document),
        )
        .route(
            "/api/transactions/{id}/documents/{document_id}/sign",
            post(sign_document),
        )
        .route("/api/transactions/{id}/signing", post(signing_batch))
        .route("/api/transactions/{id}/transmit", post(transmit))
        .route("/api/transactions/{id}/handoff", post(handoff_action))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// The identity a request acts as, read from the `x-actor-role` and
/// `x-actor-id` headers. Authentication lives in front of the engine; these
/// headers are what the portal's session layer injects.
fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, ApiError> {
    let role = headers
        .get("x-actor-role")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing x-actor-role header".into()))?;
    let role = ActorRole::from_str(role).map_err(ApiError::BadRequest)?;
    let id = headers
        .get("x-actor-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    match (role, id) {
        (ActorRole::System, id) => Ok(Actor {
            role,
            id: id.unwrap_or_else(|| "engine".to_string()),
        }),
        (_, Some(id)) if !id.is_empty() => Ok(Actor { role, id }),
        _ => Err(ApiError::BadRequest("missing x-actor-id header".into())),
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_transaction(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateTransactionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let snap = state
        .engine
        .create_transaction(&actor, req.property_ref, req.value_centavos, req.developer_ref)
        .await?;
    Ok((StatusCode::CREATED, Json(snap)))
}

async fn list_transactions(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let transactions = state.engine.list_transactions(&actor).await?;
    Ok(Json(transactions))
}

async fn get_snapshot(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let snap = state.engine.snapshot(&actor, id).await?;
    Ok(Json(snap))
}

async fn get_progress(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let view = state.engine.progress_view(&actor, id).await?;
    Ok(Json(view))
}

async fn patch_progress(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<PatchProgressRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let snap = state
        .engine
        .patch_progress(&actor, id, req.flag, req.value)
        .await?;
    Ok(Json(snap))
}

async fn get_access(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let access = state.engine.access_view(&actor, id).await?;
    Ok(Json(access))
}

async fn regenerate_access_code(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let access = state.engine.regenerate_code(&actor, id).await?;
    Ok(Json(access))
}

async fn join_transaction(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<JoinRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let access = state.engine.join(&actor, id, &req.code).await?;
    Ok(Json(access))
}

async fn approve_access(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let snap = state.engine.approve_access(&actor, id).await?;
    Ok(Json(snap))
}

async fn reject_access(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let snap = state.engine.reject_access(&actor, id).await?;
    Ok(Json(snap))
}

async fn create_milestone(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<CreateMilestoneRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let snap = state
        .engine
        .create_milestone(&actor, id, req.label, req.amount_centavos, req.proof_pattern)
        .await?;
    Ok((StatusCode::CREATED, Json(snap)))
}

async fn submit_payment_proof(
    State(state): State<SharedState>,
    Path((id, milestone_id)): Path<(i64, i64)>,
    headers: HeaderMap,
    Json(req): Json<ProofRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let snap = state
        .engine
        .submit_proof(&actor, id, milestone_id, req.proof_ref)
        .await?;
    Ok(Json(snap))
}

async fn decide_payment(
    State(state): State<SharedState>,
    Path((id, milestone_id)): Path<(i64, i64)>,
    headers: HeaderMap,
    Json(req): Json<PaymentDecisionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let snap = state
        .engine
        .decide_payment(&actor, id, milestone_id, req.decision, req.reason)
        .await?;
    Ok(Json(snap))
}

async fn kyc_action(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(action): Json<KycAction>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let snap = state.engine.kyc_action(&actor, id, action).await?;
    Ok(Json(snap))
}

async fn create_document(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<CreateDocumentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let snap = state
        .engine
        .create_document(&actor, id, req.title, req.required_roles)
        .await?;
    Ok((StatusCode::CREATED, Json(snap)))
}

async fn acknowledge_document(
    State(state): State<SharedState>,
    Path((id, document_id)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let snap = state
        .engine
        .acknowledge_document(&actor, id, document_id)
        .await?;
    Ok(Json(snap))
}

async fn sign_document(
    State(state): State<SharedState>,
    Path((id, document_id)): Path<(i64, i64)>,
    headers: HeaderMap,
    Json(req): Json<SignRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let snap = state
        .engine
        .sign_document(&actor, id, document_id, req.role, req.signature_ref)
        .await?;
    Ok(Json(snap))
}

async fn signing_batch(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<SigningBatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let snap = match req {
        SigningBatchRequest::SubmitAll => state.engine.submit_documents(&actor, id).await?,
        SigningBatchRequest::Validate => state.engine.validate_documents(&actor, id).await?,
        SigningBatchRequest::Return { reason } => {
            state.engine.return_documents(&actor, id, reason).await?
        }
    };
    Ok(Json(snap))
}

async fn transmit(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let snap = state.engine.transmit(&actor, id).await?;
    Ok(Json(snap))
}

async fn handoff_action(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<HandoffRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor = actor_from_headers(&headers)?;
    let snap = match req {
        HandoffRequest::CompleteHandoff => state.engine.complete_handoff(&actor, id).await?,
    };
    Ok(Json(snap))
}

// ── Tests ─────────────────────────────────────────────────────────────
