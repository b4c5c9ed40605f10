//! HTTP handlers
//!
//! Thin adapters: decode the request, call the component, wrap the result
//! in the `{code, msg, data}` envelope.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, warn};

use super::state::AppState;
use super::types::{ApiError, ApiResponse, ApiResult, error_codes, ok};
use crate::core_types::{Asset, TradeId, UserId};
use crate::escrow::EscrowStatusSnapshot;
use crate::funding::FundingRequest;
use crate::rates::RateQuote;
use crate::reconcile::{PendingObligation, ReconciliationResult, WebhookPayload};
use crate::session::{Session, SessionError, SessionPayload, SessionType};
use crate::trade::{DisputeResolution, EscrowStatus, TradeRecord, TradeStatus, TransitionAxis};

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Server timestamp in milliseconds
    pub timestamp_ms: u64,
    pub version: &'static str,
}

/// Health check
///
/// - Healthy: 200 OK + {code: 0, data: {timestamp_ms, version}}
/// - Database unreachable: 503 + {code: 5001, msg: "unavailable"}
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ApiResponse<HealthResponse>>) {
    if let Some(db) = &state.db {
        if let Err(e) = db.health_check().await {
            error!(error = %e, "Health check: database unreachable");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiResponse {
                    code: error_codes::SERVICE_UNAVAILABLE,
                    msg: "unavailable".to_string(),
                    data: None,
                }),
            );
        }
    }

    let timestamp_ms = state.clock.now().timestamp_millis().max(0) as u64;
    (
        StatusCode::OK,
        Json(ApiResponse::success(HealthResponse {
            timestamp_ms,
            version: env!("CARGO_PKG_VERSION"),
        })),
    )
}

// ============================================================================
// Escrow addresses
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AddressRequest {
    pub trade_id: TradeId,
    pub asset: Asset,
    #[serde(default)]
    pub expected_amount: Option<Decimal>,
}

#[derive(Debug, Serialize)]
pub struct AddressResponse {
    pub address: String,
}

/// POST /api/v1/escrow/address
pub async fn request_address(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddressRequest>,
) -> ApiResult<AddressResponse> {
    let address = state
        .manager
        .get_or_allocate(&req.trade_id, req.asset, req.expected_amount)
        .await?;
    ok(AddressResponse { address })
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub trade_id: TradeId,
    pub asset: Asset,
    pub to_address: String,
    pub amount: Decimal,
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub txid: String,
}

/// POST /api/v1/escrow/release
pub async fn release_escrow(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReleaseRequest>,
) -> ApiResult<ReleaseResponse> {
    let txid = state
        .manager
        .release(&req.trade_id, req.asset, &req.to_address, req.amount)
        .await?;
    // Subscribers learn about the release; a failed publish does not undo it
    if let Err(e) = state.notifier.publish(&req.trade_id).await {
        warn!(trade_id = %req.trade_id, error = %e, "Release status publish failed");
    }
    ok(ReleaseResponse { txid })
}

/// GET /api/v1/escrow/status/{trade_id}
pub async fn escrow_status(
    State(state): State<Arc<AppState>>,
    Path(trade_id): Path<TradeId>,
) -> ApiResult<EscrowStatusSnapshot> {
    match state.notifier.get_status(&trade_id).await? {
        Some(snapshot) => ok(snapshot),
        None => ApiError::not_found(format!("No escrow address for trade {}", trade_id)).into_err(),
    }
}

// ============================================================================
// Funding
// ============================================================================

/// POST /api/v1/funding/obligations
pub async fn open_obligation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FundingRequest>,
) -> ApiResult<PendingObligation> {
    let obligation = state.funding.open(req).await?;
    ok(obligation)
}

// ============================================================================
// Trades
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct OpenTradeRequest {
    /// Generated when absent
    #[serde(default)]
    pub trade_id: Option<TradeId>,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub asset: Asset,
    pub amount_crypto: Decimal,
    #[serde(default)]
    pub amount_fiat: Option<Decimal>,
}

/// POST /api/v1/trades
pub async fn open_trade(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OpenTradeRequest>,
) -> ApiResult<TradeRecord> {
    if req.amount_crypto <= Decimal::ZERO {
        return ApiError::bad_request("amount_crypto must be greater than zero").into_err();
    }
    if req.buyer_id.trim().is_empty() || req.seller_id.trim().is_empty() {
        return ApiError::bad_request("buyer_id and seller_id are required").into_err();
    }

    let id = req
        .trade_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut trade = TradeRecord::new(
        &id,
        &req.buyer_id,
        &req.seller_id,
        req.asset,
        req.amount_crypto,
        state.clock.now(),
    );
    trade.amount_fiat = req.amount_fiat;

    let trade = state.machine.open(trade).await?;
    ok(trade)
}

/// GET /api/v1/trades/{trade_id}
pub async fn get_trade(
    State(state): State<Arc<AppState>>,
    Path(trade_id): Path<TradeId>,
) -> ApiResult<TradeRecord> {
    let trade = state.machine.get(&trade_id).await?;
    ok(trade)
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub axis: TransitionAxis,
    pub to: String,
}

/// POST /api/v1/trades/{trade_id}/transition
///
/// The escrow axis cannot be moved to `crypto_received` here; only a
/// reconciled deposit does that.
pub async fn transition_trade(
    State(state): State<Arc<AppState>>,
    Path(trade_id): Path<TradeId>,
    Json(req): Json<TransitionRequest>,
) -> ApiResult<TradeRecord> {
    let trade = match req.axis {
        TransitionAxis::Trade => {
            let to: TradeStatus = req.to.parse().map_err(ApiError::bad_request)?;
            state.machine.advance(&trade_id, to).await?
        }
        TransitionAxis::Escrow => {
            let to: EscrowStatus = req.to.parse().map_err(ApiError::bad_request)?;
            state.machine.advance_escrow_manual(&trade_id, to).await?
        }
    };
    ok(trade)
}

/// POST /api/v1/trades/{trade_id}/resolve
pub async fn resolve_dispute(
    State(state): State<Arc<AppState>>,
    Path(trade_id): Path<TradeId>,
    Json(resolution): Json<DisputeResolution>,
) -> ApiResult<TradeRecord> {
    let trade = state.machine.resolve_dispute(&trade_id, resolution).await?;
    ok(trade)
}

// ============================================================================
// Custody webhook
// ============================================================================

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub results: Vec<ReconciliationResult>,
}

/// POST /webhooks/custody
///
/// Every business outcome (duplicate, unmatched, mismatched, ignored) is a
/// 200 with the outcome in the body. Only failures to apply the event map
/// to 5xx, which makes the provider redeliver.
pub async fn custody_webhook(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<WebhookResponse> {
    let payload = WebhookPayload::parse(&body).map_err(|e| {
        warn!(error = %e, "Rejected custody notification");
        ApiError::from(e)
    })?;

    let results = state.reconciler.handle_webhook(payload).await.map_err(|e| {
        error!(error = %e, "Custody notification not applied");
        ApiError::from(e)
    })?;
    ok(WebhookResponse { results })
}

// ============================================================================
// Rates
// ============================================================================

/// GET /api/v1/rates/{asset}
pub async fn get_rate(
    State(state): State<Arc<AppState>>,
    Path(asset): Path<Asset>,
) -> ApiResult<RateQuote> {
    let quote = state.rates.quote(asset).await?;
    ok(quote)
}

// ============================================================================
// Sessions
// ============================================================================

fn session_values(sessions: Vec<Session>) -> Result<Vec<Value>, SessionError> {
    sessions.iter().map(Session::to_json).collect()
}

#[derive(Debug, Deserialize)]
pub struct SaveSessionRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub step: u32,
    pub data: Value,
}

/// POST /api/v1/sessions/{user_id}
///
/// Creates or replaces a session in both tiers.
pub async fn save_session(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
    Json(req): Json<SaveSessionRequest>,
) -> ApiResult<Value> {
    if req.id.trim().is_empty() {
        return ApiError::bad_request("session id is required").into_err();
    }
    let kind: SessionType = req.kind.parse()?;
    let payload = SessionPayload::from_value(kind, req.data)?;

    let user = state.sessions.for_user(&user_id)?;
    let session = user.store.create(&req.id, req.step, payload)?;
    user.store.save(&session)?;
    ok(session.to_json()?)
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// GET /api/v1/sessions/{user_id}?type=
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
    Query(query): Query<ListSessionsQuery>,
) -> ApiResult<Vec<Value>> {
    let user = state.sessions.for_user(&user_id)?;
    let sessions = match query.kind {
        Some(kind) => user.store.get(kind.parse()?)?,
        None => user.store.list_live()?,
    };
    ok(session_values(sessions)?)
}

#[derive(Debug, Deserialize)]
pub struct UpdateSessionRequest {
    pub step: u32,
    /// Replacement data, same type as the stored session
    #[serde(default)]
    pub data: Option<Value>,
}

/// POST /api/v1/sessions/{user_id}/{session_id}/step
pub async fn update_session(
    State(state): State<Arc<AppState>>,
    Path((user_id, session_id)): Path<(UserId, String)>,
    Json(req): Json<UpdateSessionRequest>,
) -> ApiResult<Value> {
    let user = state.sessions.for_user(&user_id)?;
    let payload = match req.data {
        Some(data) => {
            let current = user
                .store
                .load(&session_id)?
                .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;
            Some(SessionPayload::from_value(current.session_type(), data)?)
        }
        None => None,
    };
    let session = user.store.update(&session_id, req.step, payload)?;
    ok(session.to_json()?)
}

#[derive(Debug, Deserialize)]
pub struct RecoveryQuery {
    pub route: String,
}

#[derive(Debug, Serialize)]
pub struct RecoveryPrompt {
    /// `None` when no prompt is due on this route today
    pub sessions: Option<Vec<Value>>,
}

/// GET /api/v1/sessions/{user_id}/recovery?route=
pub async fn recovery_prompt(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
    Query(query): Query<RecoveryQuery>,
) -> ApiResult<RecoveryPrompt> {
    let user = state.sessions.for_user(&user_id)?;
    let sessions = match user.recovery.maybe_present_recovery(&query.route) {
        Some(sessions) => Some(session_values(sessions)?),
        None => None,
    };
    ok(RecoveryPrompt { sessions })
}

/// POST /api/v1/sessions/{user_id}/{session_id}/restore
///
/// Returns `{route, session}` for the flow that owns the session.
pub async fn restore_session(
    State(state): State<Arc<AppState>>,
    Path((user_id, session_id)): Path<(UserId, String)>,
) -> ApiResult<Value> {
    let user = state.sessions.for_user(&user_id)?;
    let intent = user.recovery.restore(&session_id)?;
    ok(intent.to_json()?)
}

#[derive(Debug, Serialize)]
pub struct DismissResponse {
    pub dismissed: String,
}

/// DELETE /api/v1/sessions/{user_id}/{session_id}
pub async fn dismiss_session(
    State(state): State<Arc<AppState>>,
    Path((user_id, session_id)): Path<(UserId, String)>,
) -> ApiResult<DismissResponse> {
    let user = state.sessions.for_user(&user_id)?;
    user.recovery.dismiss(&session_id)?;
    ok(DismissResponse {
        dismissed: session_id,
    })
}

/// POST /api/v1/sessions/{user_id}/end
///
/// Logical session end: drops the ephemeral tier, durable copies stay.
pub async fn end_session_scope(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
) -> ApiResult<Vec<Value>> {
    let user = state.sessions.for_user(&user_id)?;
    user.store.end_primary_scope()?;
    ok(session_values(user.store.list_live()?)?)
}
