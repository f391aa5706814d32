//! Visit Verifier Server
//!
//! REST API server for receipt-based proof-of-visit verification.

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use visit_verifier::{
    api,
    config::{AppConfig, LoggingConfig},
    repository::Repository,
    services::{
        integrations::HttpIntegrations,
        locks::{LocalReceiptLocks, ReceiptLocks, RedisReceiptLocks},
        ocr::HttpOcrProvider,
        Services,
    },
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.logging);

    tracing::info!("Starting Visit Verifier v{}", env!("CARGO_PKG_VERSION"));

    // Create database connection pool
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .connect(&config.database.url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Connected to database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    tracing::info!("Database migrations completed");

    let locks: Arc<dyn ReceiptLocks> = match &config.redis.url {
        Some(url) => {
            let locks = RedisReceiptLocks::connect(url)
                .await
                .context("Failed to connect to Redis")?;
            tracing::info!("Receipt locks held in Redis");
            Arc::new(locks)
        }
        None => {
            tracing::warn!("No Redis configured, receipt locks are process-local");
            Arc::new(LocalReceiptLocks::new())
        }
    };

    let collaborators = HttpIntegrations::new(&config.integrations)
        .context("Failed to build integration clients")?
        .into_collaborators();
    let ocr_provider = Arc::new(HttpOcrProvider::new(&config.ocr));

    let server_host = config.server.host.clone();
    let server_port = config.server.port;

    let repository = Arc::new(Repository::new(pool));
    let services = Services::new(repository, &config, collaborators, locks, ocr_provider);

    if services.reconciler.clone().spawn().is_some() {
        tracing::info!(
            interval_secs = config.reconciler.interval_secs,
            "Reconciler worker started"
        );
    }

    let state = AppState {
        config: Arc::new(config),
        services: Arc::new(services),
    };

    let app = create_router(state);

    let addr = SocketAddr::new(
        server_host.parse().context("Invalid host address")?,
        server_port,
    );

    tracing::info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("visit_verifier={},tower_http=debug", logging.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Create the application router with all routes
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Multipart overhead on top of the largest accepted photo
    let body_limit = state.config.server.max_upload_bytes + 64 * 1024;

    // API v1 routes
    let api_v1 = Router::new()
        // Health check
        .route("/health", get(api::health::health_check))
        .route("/ready", get(api::health::readiness_check))
        // Visits
        .route("/visits", post(api::visits::submit_visit))
        .route("/visits", get(api::visits::list_visits))
        .route("/visits/:id", get(api::visits::get_visit))
        .route("/visits/:id/experience", post(api::visits::link_experience))
        // Review
        .route("/admin/review-queue", get(api::review::review_queue))
        .route("/admin/receipts/:id", get(api::review::get_receipt))
        .route("/admin/receipts/:id/image", get(api::review::get_receipt_image))
        .route("/admin/visits/:id/approve", post(api::review::approve_visit))
        .route("/admin/visits/:id/reject", post(api::review::reject_visit))
        .route("/admin/reconcile", post(api::review::reconcile))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state);

    // OpenAPI documentation
    let openapi = api::openapi::create_openapi_router();

    Router::new()
        .nest("/api/v1", api_v1)
        .merge(openapi)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
