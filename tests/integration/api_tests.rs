//! API integration tests against a running server
//!
//! Start the server with the default configuration, then run:
//! `cargo test --test api_tests -- --ignored`

use chrono::Utc;
use reqwest::{multipart, Client, StatusCode};
use serde_json::{json, Value};
use uuid::Uuid;
use visit_verifier::models::{enums::Role, UserClaims};

const BASE_URL: &str = "http://localhost:8080/api/v1";

fn secret() -> String {
    std::env::var("JWT_SECRET").unwrap_or_else(|_| "change-this-secret-in-production".to_string())
}

/// Mint a token the way the auth subsystem would
fn token_for(user_id: Uuid, role: Role) -> String {
    let now = Utc::now().timestamp();
    UserClaims {
        sub: format!("{}@example.com", user_id),
        user_id,
        role,
        exp: now + 3600,
        iat: now,
    }
    .create_token(&secret())
    .expect("Failed to sign token")
}

/// A small PNG the image sniffer accepts
fn receipt_photo() -> Vec<u8> {
    let mut bytes = Vec::new();
    let img = image::RgbImage::from_fn(64, 96, |x, y| {
        image::Rgb([(x * 4) as u8, (y * 2) as u8, ((x + y) % 255) as u8])
    });
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .expect("Failed to encode photo");
    bytes
}

#[tokio::test]
#[ignore] // Run with: cargo test -- --ignored
async fn test_health_check() {
    let client = Client::new();

    let response = client
        .get(format!("{}/health", BASE_URL))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());

    let body: Value = response.json().await.expect("Failed to parse response");
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
#[ignore]
async fn test_submit_requires_token() {
    let client = Client::new();

    let response = client
        .get(format!("{}/visits", BASE_URL))
        .send()
        .await
        .expect("Failed to send request");

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
#[ignore]
async fn test_submit_and_fetch_visit() {
    let client = Client::new();
    let user_id = Uuid::new_v4();
    let token = token_for(user_id, Role::User);

    let metadata = json!({
        "restaurant_id": Uuid::new_v4(),
        "declared_total": "18.40",
        "device_fingerprint": "integration-device-01"
    });
    let form = multipart::Form::new()
        .part(
            "image",
            multipart::Part::bytes(receipt_photo())
                .file_name("receipt.png")
                .mime_str("image/png")
                .expect("Invalid mime"),
        )
        .text("metadata", metadata.to_string());

    let response = client
        .post(format!("{}/visits", BASE_URL))
        .bearer_auth(&token)
        .multipart(form)
        .send()
        .await
        .expect("Failed to send request");

    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = response.json().await.expect("Failed to parse response");
    let visit_id = body["visit_id"].as_str().expect("No visit id").to_string();
    assert!(body["outcome"]["status"].is_string());
    // Submitters never see scores
    assert!(body["outcome"].get("auto_approve_score").is_none());

    let response = client
        .get(format!("{}/visits/{}", BASE_URL, visit_id))
        .bearer_auth(&token)
        .send()
        .await
        .expect("Failed to send request");
    assert!(response.status().is_success());

    // Someone else's visit is off limits
    let stranger = token_for(Uuid::new_v4(), Role::User);
    let response = client
        .get(format!("{}/visits/{}", BASE_URL, visit_id))
        .bearer_auth(&stranger)
        .send()
        .await
        .expect("Failed to send request");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
#[ignore]
async fn test_submit_rejects_unsupported_image() {
    let client = Client::new();
    let token = token_for(Uuid::new_v4(), Role::User);

    let form = multipart::Form::new()
        .part(
            "image",
            multipart::Part::bytes(b"GIF89a\x01\x00\x01\x00".to_vec()).file_name("receipt.gif"),
        )
        .text(
            "metadata",
            json!({ "restaurant_id": Uuid::new_v4() }).to_string(),
        );

    let response = client
        .post(format!("{}/visits", BASE_URL))
        .bearer_auth(&token)
        .multipart(form)
        .send()
        .await
        .expect("Failed to send request");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
#[ignore]
async fn test_review_queue_requires_admin() {
    let client = Client::new();

    let response = client
        .get(format!("{}/admin/review-queue", BASE_URL))
        .bearer_auth(token_for(Uuid::new_v4(), Role::User))
        .send()
        .await
        .expect("Failed to send request");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = client
        .get(format!("{}/admin/review-queue?limit=10", BASE_URL))
        .bearer_auth(token_for(Uuid::new_v4(), Role::Admin))
        .send()
        .await
        .expect("Failed to send request");
    assert!(response.status().is_success());

    let body: Value = response.json().await.expect("Failed to parse response");
    assert!(body.as_array().is_some_and(|queue| queue.len() <= 10));
}

#[tokio::test]
#[ignore]
async fn test_manual_reconcile() {
    let client = Client::new();

    let response = client
        .post(format!("{}/admin/reconcile", BASE_URL))
        .bearer_auth(token_for(Uuid::new_v4(), Role::Admin))
        .send()
        .await
        .expect("Failed to send request");
    assert!(response.status().is_success());

    let body: Value = response.json().await.expect("Failed to parse response");
    assert!(body["expired_retakes_deleted"].is_number());
    assert!(body["stale_pending"].is_number());
}
