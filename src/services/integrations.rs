//! Collaborators owned by other subsystems, reached over HTTP

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::IntegrationsConfig,
    error::{AppError, AppResult},
    models::{enums::NotificationEvent, GpsPoint},
};

/// External points ledger; deduplicates by `reference`
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PointsLedger: Send + Sync {
    async fn award(&self, user_id: Uuid, points: i32, reference: Uuid) -> AppResult<()>;
}

/// The user's "must-visit" favorites
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FavoritesService: Send + Sync {
    /// Remove the must-visit flag; true when it was set
    async fn take_must_visit(&self, user_id: Uuid, restaurant_id: Uuid) -> AppResult<bool>;

    async fn restore(&self, user_id: Uuid, restaurant_id: Uuid) -> AppResult<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify(
        &self,
        user_id: Uuid,
        event: NotificationEvent,
        payload: serde_json::Value,
    ) -> AppResult<()>;
}

/// Told when an approved visit opens its experience window
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExperienceService: Send + Sync {
    async fn open_window(
        &self,
        visit_id: Uuid,
        user_id: Uuid,
        restaurant_id: Uuid,
        deadline: DateTime<Utc>,
    ) -> AppResult<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RestaurantDirectory: Send + Sync {
    async fn resolve_oib(&self, oib: &str) -> AppResult<Option<Uuid>>;

    async fn location(&self, restaurant_id: Uuid) -> AppResult<Option<GpsPoint>>;
}

/// Handles on every external collaborator
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn PointsLedger>,
    pub favorites: Arc<dyn FavoritesService>,
    pub notifications: Arc<dyn NotificationDispatcher>,
    pub experiences: Arc<dyn ExperienceService>,
    pub restaurants: Arc<dyn RestaurantDirectory>,
}

impl Collaborators {
    /// Credit the visit owner and each tagged buddy. Buddy references are
    /// derived from the receipt id so a retry re-sends identical awards.
    pub async fn award_points(
        &self,
        receipt_id: Uuid,
        user_id: Uuid,
        points: i32,
        buddies: &[Uuid],
        buddy_points: i32,
    ) -> AppResult<()> {
        self.ledger.award(user_id, points, receipt_id).await?;
        if buddy_points > 0 {
            for buddy in buddies.iter().filter(|b| **b != user_id) {
                let reference = Uuid::new_v5(&receipt_id, buddy.as_bytes());
                self.ledger.award(*buddy, buddy_points, reference).await?;
            }
        }
        Ok(())
    }
}

/// Thin JSON client shared by the HTTP collaborators
#[derive(Clone)]
struct HttpEndpoint {
    client: Client,
    base_url: String,
    name: &'static str,
}

impl HttpEndpoint {
    fn new(client: Client, base_url: &str, name: &'static str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            name,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn failure(&self, detail: impl std::fmt::Display) -> AppError {
        AppError::Provider(format!("{}: {}", self.name, detail))
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> AppResult<reqwest::Response> {
        self.client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| self.failure(e))
    }

    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> AppResult<Option<T>> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| self.failure(e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status().map_err(|e| self.failure(e))?;
        response.json().await.map(Some).map_err(|e| self.failure(e))
    }
}

#[derive(Serialize)]
struct AwardRequest {
    user_id: Uuid,
    points: i32,
    reference: Uuid,
}

pub struct HttpPointsLedger {
    endpoint: HttpEndpoint,
}

#[async_trait]
impl PointsLedger for HttpPointsLedger {
    async fn award(&self, user_id: Uuid, points: i32, reference: Uuid) -> AppResult<()> {
        let response = self
            .endpoint
            .post("/awards", &AwardRequest { user_id, points, reference })
            .await?;

        // 409: this reference was already credited
        match response.status() {
            s if s.is_success() || s == StatusCode::CONFLICT => Ok(()),
            s => Err(self.endpoint.failure(format!("status {}", s))),
        }
    }
}

#[derive(Deserialize)]
struct TakeResponse {
    removed: bool,
}

pub struct HttpFavoritesService {
    endpoint: HttpEndpoint,
}

#[async_trait]
impl FavoritesService for HttpFavoritesService {
    async fn take_must_visit(&self, user_id: Uuid, restaurant_id: Uuid) -> AppResult<bool> {
        let path = format!("/users/{}/must-visit/{}/take", user_id, restaurant_id);
        let response = self
            .endpoint
            .post(&path, &serde_json::json!({}))
            .await?
            .error_for_status()
            .map_err(|e| self.endpoint.failure(e))?;

        let body: TakeResponse = response.json().await.map_err(|e| self.endpoint.failure(e))?;
        Ok(body.removed)
    }

    async fn restore(&self, user_id: Uuid, restaurant_id: Uuid) -> AppResult<()> {
        let path = format!("/users/{}/must-visit/{}/restore", user_id, restaurant_id);
        self.endpoint
            .post(&path, &serde_json::json!({}))
            .await?
            .error_for_status()
            .map_err(|e| self.endpoint.failure(e))?;
        Ok(())
    }
}

#[derive(Serialize)]
struct NotificationRequest {
    user_id: Uuid,
    event: NotificationEvent,
    payload: serde_json::Value,
}

/// Posts in a detached task; delivery failures are only logged
pub struct HttpNotificationDispatcher {
    endpoint: HttpEndpoint,
}

#[async_trait]
impl NotificationDispatcher for HttpNotificationDispatcher {
    async fn notify(
        &self,
        user_id: Uuid,
        event: NotificationEvent,
        payload: serde_json::Value,
    ) -> AppResult<()> {
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            let request = NotificationRequest { user_id, event, payload };
            let result = match endpoint.post("/notifications", &request).await {
                Ok(response) => response.error_for_status().map(|_| ()).map_err(|e| endpoint.failure(e)),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::warn!(%user_id, ?event, error = %e, "Notification delivery failed");
            }
        });
        Ok(())
    }
}

#[derive(Serialize)]
struct WindowRequest {
    visit_id: Uuid,
    user_id: Uuid,
    restaurant_id: Uuid,
    deadline: DateTime<Utc>,
}

pub struct HttpExperienceService {
    endpoint: HttpEndpoint,
}

#[async_trait]
impl ExperienceService for HttpExperienceService {
    async fn open_window(
        &self,
        visit_id: Uuid,
        user_id: Uuid,
        restaurant_id: Uuid,
        deadline: DateTime<Utc>,
    ) -> AppResult<()> {
        let request = WindowRequest {
            visit_id,
            user_id,
            restaurant_id,
            deadline,
        };
        self.endpoint
            .post("/experience-windows", &request)
            .await?
            .error_for_status()
            .map_err(|e| self.endpoint.failure(e))?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct RestaurantRef {
    id: Uuid,
}

pub struct HttpRestaurantDirectory {
    endpoint: HttpEndpoint,
}

#[async_trait]
impl RestaurantDirectory for HttpRestaurantDirectory {
    async fn resolve_oib(&self, oib: &str) -> AppResult<Option<Uuid>> {
        let found: Option<RestaurantRef> = self
            .endpoint
            .get_optional(&format!("/restaurants/by-oib/{}", oib))
            .await?;
        Ok(found.map(|r| r.id))
    }

    async fn location(&self, restaurant_id: Uuid) -> AppResult<Option<GpsPoint>> {
        self.endpoint
            .get_optional(&format!("/restaurants/{}/location", restaurant_id))
            .await
    }
}

/// All HTTP collaborators, sharing one connection pool
pub struct HttpIntegrations {
    pub ledger: HttpPointsLedger,
    pub favorites: HttpFavoritesService,
    pub notifications: HttpNotificationDispatcher,
    pub experiences: HttpExperienceService,
    pub restaurants: HttpRestaurantDirectory,
}

impl HttpIntegrations {
    pub fn into_collaborators(self) -> Collaborators {
        Collaborators {
            ledger: Arc::new(self.ledger),
            favorites: Arc::new(self.favorites),
            notifications: Arc::new(self.notifications),
            experiences: Arc::new(self.experiences),
            restaurants: Arc::new(self.restaurants),
        }
    }

    pub fn new(config: &IntegrationsConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            ledger: HttpPointsLedger {
                endpoint: HttpEndpoint::new(client.clone(), &config.points_ledger_url, "points ledger"),
            },
            favorites: HttpFavoritesService {
                endpoint: HttpEndpoint::new(client.clone(), &config.favorites_url, "favorites"),
            },
            notifications: HttpNotificationDispatcher {
                endpoint: HttpEndpoint::new(client.clone(), &config.notifications_url, "notifications"),
            },
            experiences: HttpExperienceService {
                endpoint: HttpEndpoint::new(client.clone(), &config.experiences_url, "experiences"),
            },
            restaurants: HttpRestaurantDirectory {
                endpoint: HttpEndpoint::new(client, &config.restaurants_url, "restaurant directory"),
            },
        })
    }
}
