//! OpenAPI documentation

use axum::Router;
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use crate::api::{health, review, visits};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Visit Verifier API",
        version = "1.0.0",
        description = "Receipt proof-of-visit verification"
    ),
    servers(
        (url = "/api/v1", description = "API v1")
    ),
    paths(
        // Health
        health::health_check,
        health::readiness_check,
        // Visits
        visits::submit_visit,
        visits::get_visit,
        visits::list_visits,
        visits::link_experience,
        // Review
        review::review_queue,
        review::get_receipt,
        review::get_receipt_image,
        review::approve_visit,
        review::reject_visit,
        review::reconcile,
    ),
    components(
        schemas(
            // Visits
            crate::models::SubmitVisit,
            crate::models::SubmittedVisit,
            crate::models::VisitOutcome,
            crate::models::VisitSummary,
            crate::models::GpsPoint,
            visits::LinkExperienceRequest,
            // Review
            crate::models::ReceiptReview,
            crate::models::ExtractedFields,
            crate::models::Confidences,
            crate::models::FraudFlag,
            crate::models::OcrMethod,
            crate::models::ReceiptField,
            crate::models::ReceiptStatus,
            crate::models::RejectionReason,
            review::ApproveRequest,
            review::RejectRequest,
            crate::services::reconciler::ReconcileReport,
            // Health
            health::HealthResponse,
            // Errors
            crate::error::ErrorResponse,
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "visits", description = "Receipt submission and visit status"),
        (name = "review", description = "Administrator review and reconciliation")
    )
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// Create the OpenAPI documentation router
pub fn create_openapi_router() -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
}
