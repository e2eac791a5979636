use crate::api_error::ApiError;
use crate::models::VoteRequest;
use crate::service::{ConfirmationService, DisputeService, ExpiryService, SettlementService};
use actix_web::{web, HttpResponse, Responder};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

/// Application state holding the settlement core services.
pub struct AppState {
    pub confirmation: Arc<ConfirmationService>,
    pub settlement: Arc<SettlementService>,
    pub dispute: Arc<DisputeService>,
    pub expiry: Arc<ExpiryService>,
}

/// POST /api/matches/:id/vote
/// Record a participant's approval or report for a finished match.
pub async fn record_vote(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    req: web::Json<VoteRequest>,
) -> Result<impl Responder, ApiError> {
    let match_id = path.into_inner();
    Validate::validate(&*req).map_err(|e| ApiError::Validation(e.to_string()))?;

    info!(
        match_id = %match_id,
        player_id = %req.player_id,
        action = ?req.action,
        "Received vote request"
    );

    let outcome = state
        .confirmation
        .record_vote(match_id, req.player_id, req.action, req.reason.clone())
        .await?;

    Ok(HttpResponse::Ok().json(outcome))
}

/// GET /api/matches/:id/confirmation
/// Current confirmation state of a match, per player.
pub async fn confirmation_summary(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<impl Responder, ApiError> {
    let match_id = path.into_inner();
    let summary = state.confirmation.confirmation_summary(match_id).await?;
    Ok(HttpResponse::Ok().json(summary))
}

/// POST /api/matches/:id/settle
/// Compute and store pending rating deltas once scores are final. Called by
/// the score-entry flow; idempotent.
pub async fn settle_match(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<impl Responder, ApiError> {
    let match_id = path.into_inner();

    info!(match_id = %match_id, "Received settle request");

    state.settlement.calculate_and_store(match_id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "match_id": match_id, "status": "pending" })))
}

#[derive(Debug, Deserialize, Validate)]
pub struct DisputeRequest {
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

/// POST /api/matches/:id/dispute
/// Administrative cancellation, reverting applied ratings if necessary.
pub async fn dispute_match(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    req: web::Json<DisputeRequest>,
) -> Result<impl Responder, ApiError> {
    let match_id = path.into_inner();
    Validate::validate(&*req).map_err(|e| ApiError::Validation(e.to_string()))?;

    info!(match_id = %match_id, reason = %req.reason, "Received dispute request");

    let outcome = state.dispute.discard(match_id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "match_id": match_id,
        "outcome": format!("{:?}", outcome)
    })))
}

/// POST /api/settlement/sweep
/// Manual trigger for the expiry sweep; returns the sweep report.
pub async fn run_sweep(state: web::Data<AppState>) -> Result<impl Responder, ApiError> {
    let report = state.expiry.sweep().await;
    Ok(HttpResponse::Ok().json(report))
}
