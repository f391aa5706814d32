//! Submitter endpoints: receipt upload and visit status

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use axum_extra::extract::Multipart;
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{SubmitVisit, SubmittedVisit, Visit, VisitSummary},
    AppState,
};

use super::{AuthenticatedUser, LimitQuery};

/// Experience link sent by the experience service
#[derive(Deserialize, ToSchema)]
pub struct LinkExperienceRequest {
    pub experience_id: Uuid,
}

/// Submit a receipt photo as proof of a visit
#[utoipa::path(
    post,
    path = "/visits",
    tag = "visits",
    security(("bearer_auth" = [])),
    request_body(
        content = SubmitVisit,
        content_type = "multipart/form-data",
        description = "`image` part (jpeg, png or webp) and `metadata` part (JSON)"
    ),
    responses(
        (status = 201, description = "Visit created and evaluated", body = SubmittedVisit),
        (status = 400, description = "Invalid image or metadata"),
        (status = 409, description = "Visit is being processed")
    )
)]
pub async fn submit_visit(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<SubmittedVisit>)> {
    let mut image = None;
    let mut metadata = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(format!("Failed to read part '{}': {}", name, e)))?;

        match name.as_str() {
            "image" => image = Some(data.to_vec()),
            "metadata" => {
                let parsed: SubmitVisit = serde_json::from_slice(&data)
                    .map_err(|e| AppError::Validation(format!("Invalid metadata: {}", e)))?;
                metadata = Some(parsed);
            }
            other => tracing::debug!(part = other, "Ignoring unknown multipart part"),
        }
    }

    let image = image.ok_or_else(|| AppError::Validation("Missing 'image' part".to_string()))?;
    let metadata =
        metadata.ok_or_else(|| AppError::Validation("Missing 'metadata' part".to_string()))?;
    if image.len() > state.config.server.max_upload_bytes {
        return Err(AppError::Validation(format!(
            "Image exceeds {} bytes",
            state.config.server.max_upload_bytes
        )));
    }

    let submitted = state
        .services
        .pipeline
        .submit(claims.user_id, metadata, image)
        .await?;

    Ok((StatusCode::CREATED, Json(submitted)))
}

/// Get one of the caller's visits
#[utoipa::path(
    get,
    path = "/visits/{id}",
    tag = "visits",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Visit ID")
    ),
    responses(
        (status = 200, description = "Visit status", body = VisitSummary),
        (status = 403, description = "Not the caller's visit"),
        (status = 404, description = "Visit not found")
    )
)]
pub async fn get_visit(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<VisitSummary>> {
    let visit = state.services.store.get_visit(id).await?;
    claims.require_owner_or_admin(visit.user_id)?;

    Ok(Json(summarize(&state, &visit).await?))
}

/// List the caller's visits, newest first
#[utoipa::path(
    get,
    path = "/visits",
    tag = "visits",
    security(("bearer_auth" = [])),
    params(LimitQuery),
    responses(
        (status = 200, description = "Caller's visits", body = Vec<VisitSummary>)
    )
)]
pub async fn list_visits(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Query(query): Query<LimitQuery>,
) -> AppResult<Json<Vec<VisitSummary>>> {
    let visits = state
        .services
        .store
        .list_user_visits(claims.user_id, query.limit())
        .await?;

    let mut summaries = Vec::with_capacity(visits.len());
    for visit in &visits {
        summaries.push(summarize(&state, visit).await?);
    }
    Ok(Json(summaries))
}

/// Link an experience to an approved visit
#[utoipa::path(
    post,
    path = "/visits/{id}/experience",
    tag = "visits",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Visit ID")
    ),
    request_body = LinkExperienceRequest,
    responses(
        (status = 200, description = "Experience linked", body = VisitSummary),
        (status = 404, description = "Visit not found"),
        (status = 422, description = "Visit is not approved or already linked elsewhere")
    )
)]
pub async fn link_experience(
    State(state): State<AppState>,
    AuthenticatedUser(claims): AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(request): Json<LinkExperienceRequest>,
) -> AppResult<Json<VisitSummary>> {
    let visit = state.services.store.get_visit(id).await?;
    claims.require_owner_or_admin(visit.user_id)?;

    let visit = state
        .services
        .lifecycle
        .link_experience(id, request.experience_id)
        .await?;
    Ok(Json(summarize(&state, &visit).await?))
}

async fn summarize(state: &AppState, visit: &Visit) -> AppResult<VisitSummary> {
    let points = match state.services.store.get_receipt_for_visit(visit.id).await {
        Ok(receipt) => receipt.points_awarded,
        Err(AppError::NotFound(_)) => None,
        Err(e) => return Err(e),
    };
    Ok(visit.summary(points))
}
