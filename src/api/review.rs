//! Administrator endpoints: review queue, decisions, reconciliation

use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{ExtractedFields, ReceiptReview, RejectionReason, VisitOutcome},
    services::reconciler::ReconcileReport,
    AppState,
};

use super::{AuthenticatedUser, LimitQuery};

/// Approval, optionally correcting the extracted fields
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ApproveRequest {
    #[serde(default)]
    pub corrected: Option<ExtractedFields>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RejectRequest {
    pub reason: RejectionReason,
    #[serde(default)]
    pub corrected: Option<ExtractedFields>,
}

/// Pending receipts, oldest first, with every signal
#[utoipa::path(
    get,
    path = "/admin/review-queue",
    tag = "review",
    security(("bearer_auth" = [])),
    params(LimitQuery),
    responses(
        (status = 200, description = "Receipts awaiting review", body = Vec<ReceiptReview>),
        (status = 403, description = "Administrator privileges required")
    )
)]
pub async fn review_queue(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Query(query): Query<LimitQuery>,
) -> AppResult<Json<Vec<ReceiptReview>>> {
    claims.require_admin()?;

    let receipts = state.services.store.review_queue(query.limit()).await?;
    Ok(Json(receipts.into_iter().map(ReceiptReview::from).collect()))
}

/// Full receipt view
#[utoipa::path(
    get,
    path = "/admin/receipts/{id}",
    tag = "review",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Receipt ID")
    ),
    responses(
        (status = 200, description = "Receipt with all signals", body = ReceiptReview),
        (status = 404, description = "Receipt not found")
    )
)]
pub async fn get_receipt(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ReceiptReview>> {
    claims.require_admin()?;

    let receipt = state.services.store.get_receipt(id).await?;
    Ok(Json(receipt.into()))
}

/// The stored receipt photo
#[utoipa::path(
    get,
    path = "/admin/receipts/{id}/image",
    tag = "review",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Receipt ID")
    ),
    responses(
        (status = 200, description = "Image bytes"),
        (status = 404, description = "Receipt or image not found")
    )
)]
pub async fn get_receipt_image(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    claims.require_admin()?;

    let receipt = state.services.store.get_receipt(id).await?;
    let bytes = state.services.blobs.get(&receipt.image_ref).await?;
    let content_type = match receipt.image_ref.rsplit('.').next() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    };

    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}

/// Approve a pending visit
#[utoipa::path(
    post,
    path = "/admin/visits/{id}/approve",
    tag = "review",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Visit ID")
    ),
    request_body = ApproveRequest,
    responses(
        (status = 200, description = "Visit approved", body = VisitOutcome),
        (status = 409, description = "Visit locked or image already approved"),
        (status = 422, description = "Visit not pending or required fields missing")
    )
)]
pub async fn approve_visit(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(request): Json<ApproveRequest>,
) -> AppResult<Json<VisitOutcome>> {
    claims.require_admin()?;

    let outcome = state
        .services
        .lifecycle
        .admin_approve(id, claims.user_id, request.corrected)
        .await?;
    Ok(Json(outcome))
}

/// Reject a pending visit
#[utoipa::path(
    post,
    path = "/admin/visits/{id}/reject",
    tag = "review",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Visit ID")
    ),
    request_body = RejectRequest,
    responses(
        (status = 200, description = "Visit rejected or sent back for a retake", body = VisitOutcome),
        (status = 409, description = "Visit locked"),
        (status = 422, description = "Visit not pending")
    )
)]
pub async fn reject_visit(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(request): Json<RejectRequest>,
) -> AppResult<Json<VisitOutcome>> {
    claims.require_admin()?;

    let outcome = state
        .services
        .lifecycle
        .admin_reject(id, claims.user_id, request.reason, request.corrected)
        .await?;
    Ok(Json(outcome))
}

/// Run one reconciler pass now
#[utoipa::path(
    post,
    path = "/admin/reconcile",
    tag = "review",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Pass report", body = ReconcileReport)
    )
)]
pub async fn reconcile(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
) -> AppResult<Json<ReconcileReport>> {
    claims.require_admin()?;

    let report = state.services.reconciler.run().await?;
    tracing::info!(admin_id = %claims.user_id, "Manual reconciler pass");
    Ok(Json(report))
}
