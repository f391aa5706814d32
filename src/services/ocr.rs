//! OCR provider boundary: typed extraction with bounded retries

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    config::OcrConfig,
    models::{ExtractionResult, FieldReading, OcrMethod, ReceiptField},
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum OcrError {
    /// Transport failure, timeout, 5xx or throttling
    #[error("OCR provider unavailable: {0}")]
    ProviderUnavailable(String),
    /// The provider refused this image; retrying cannot help
    #[error("OCR provider rejected the image: {0}")]
    ProviderRejected(String),
}

impl OcrError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, OcrError::ProviderUnavailable(_))
    }
}

/// One raw call to a vision/LLM OCR backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OcrProvider: Send + Sync {
    async fn extract(&self, image: &[u8], content_type: &str) -> Result<ExtractionResult, OcrError>;
}

#[derive(Serialize)]
struct ExtractRequest<'a> {
    model: &'a str,
    content_type: &'a str,
    image: String,
    fields: Vec<ReceiptField>,
}

#[derive(Deserialize)]
struct ExtractResponse {
    #[serde(default)]
    raw_text: String,
    #[serde(default)]
    fields: BTreeMap<String, FieldReading>,
    method: OcrMethod,
    model_version: Option<String>,
}

/// JSON-over-HTTP provider
pub struct HttpOcrProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl HttpOcrProvider {
    pub fn new(config: &OcrConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        }
    }
}

#[async_trait]
impl OcrProvider for HttpOcrProvider {
    async fn extract(&self, image: &[u8], content_type: &str) -> Result<ExtractionResult, OcrError> {
        let body = ExtractRequest {
            model: &self.model,
            content_type,
            image: BASE64_STANDARD.encode(image),
            fields: vec![
                ReceiptField::MerchantName,
                ReceiptField::TotalAmount,
                ReceiptField::IssueDate,
                ReceiptField::IssueTime,
                ReceiptField::Jir,
                ReceiptField::Zki,
                ReceiptField::Oib,
            ],
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| OcrError::ProviderUnavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(OcrError::ProviderUnavailable(format!("status {}", status)));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(OcrError::ProviderRejected(format!("status {}: {}", status, detail)));
        }

        let payload: ExtractResponse = response
            .json()
            .await
            .map_err(|e| OcrError::ProviderUnavailable(format!("malformed response: {}", e)))?;

        let fields = payload
            .fields
            .into_iter()
            .filter_map(|(name, reading)| match name.parse::<ReceiptField>() {
                Ok(field) => Some((field, reading)),
                Err(_) => {
                    debug!(field = %name, "ignoring unknown OCR field");
                    None
                }
            })
            .collect();

        Ok(ExtractionResult {
            raw_text: payload.raw_text,
            fields,
            method: payload.method,
            model_version: payload.model_version.or_else(|| Some(self.model.clone())),
        })
    }
}

/// Wraps a provider with a per-attempt timeout and exponential backoff on
/// retryable failures. Callers must not retry again on top of this.
#[derive(Clone)]
pub struct OcrAdapter {
    provider: Arc<dyn OcrProvider>,
    backoff: ExponentialBuilder,
    attempt_timeout: Duration,
}

impl OcrAdapter {
    pub fn new(provider: Arc<dyn OcrProvider>, config: &OcrConfig) -> Self {
        // max_times counts retries, not attempts
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(config.min_backoff_ms))
            .with_max_delay(Duration::from_millis(config.max_backoff_ms))
            .with_max_times(config.max_attempts.saturating_sub(1))
            .with_jitter();

        Self {
            provider,
            backoff,
            attempt_timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub async fn extract(
        &self,
        image_ref: &str,
        image: &[u8],
        content_type: &str,
    ) -> Result<ExtractionResult, OcrError> {
        let attempt = || async move {
            match tokio::time::timeout(self.attempt_timeout, self.provider.extract(image, content_type))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(OcrError::ProviderUnavailable(format!(
                    "no answer within {}s",
                    self.attempt_timeout.as_secs()
                ))),
            }
        };

        attempt
            .retry(self.backoff)
            .sleep(tokio::time::sleep)
            .when(OcrError::is_retryable)
            .notify(|err: &OcrError, delay: Duration| {
                warn!(
                    image_ref,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "retrying OCR extraction"
                );
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> OcrConfig {
        OcrConfig {
            min_backoff_ms: 1,
            max_backoff_ms: 2,
            timeout_secs: 1,
            ..OcrConfig::default()
        }
    }

    fn extraction() -> ExtractionResult {
        ExtractionResult {
            raw_text: "UKUPNO 18,40".to_string(),
            fields: BTreeMap::new(),
            method: OcrMethod::Hybrid,
            model_version: Some("v3".to_string()),
        }
    }

    #[test]
    fn test_only_unavailability_is_retryable() {
        assert!(OcrError::ProviderUnavailable("503".into()).is_retryable());
        assert!(!OcrError::ProviderRejected("415".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_retries_unavailable_then_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut provider = MockOcrProvider::new();
        provider.expect_extract().times(2).returning(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(OcrError::ProviderUnavailable("503".into()))
            } else {
                Ok(extraction())
            }
        });

        let adapter = OcrAdapter::new(Arc::new(provider), &fast_config());
        let result = adapter.extract("ab/cd", b"img", "image/jpeg").await;
        assert_eq!(result, Ok(extraction()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_three_attempts() {
        let mut provider = MockOcrProvider::new();
        provider
            .expect_extract()
            .times(3)
            .returning(|_, _| Err(OcrError::ProviderUnavailable("connection reset".into())));

        let adapter = OcrAdapter::new(Arc::new(provider), &fast_config());
        let err = adapter.extract("ab/cd", b"img", "image/jpeg").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let mut provider = MockOcrProvider::new();
        provider
            .expect_extract()
            .times(1)
            .returning(|_, _| Err(OcrError::ProviderRejected("unsupported".into())));

        let adapter = OcrAdapter::new(Arc::new(provider), &fast_config());
        let err = adapter.extract("ab/cd", b"img", "image/jpeg").await.unwrap_err();
        assert_eq!(err, OcrError::ProviderRejected("unsupported".into()));
    }

    struct SlowProvider;

    #[async_trait]
    impl OcrProvider for SlowProvider {
        async fn extract(&self, _: &[u8], _: &str) -> Result<ExtractionResult, OcrError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(extraction())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_unavailable() {
        let adapter = OcrAdapter::new(Arc::new(SlowProvider), &fast_config());
        let err = adapter.extract("ab/cd", b"img", "image/jpeg").await.unwrap_err();
        assert!(matches!(err, OcrError::ProviderUnavailable(_)));
    }
}
