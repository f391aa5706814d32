//! Business logic services

pub mod blob;
pub mod clock;
pub mod decision;
pub mod fraud;
pub mod hashing;
pub mod integrations;
pub mod lifecycle;
pub mod locks;
pub mod ocr;
pub mod pipeline;
pub mod reconciler;
pub mod scoring;
pub mod training;

#[cfg(test)]
pub(crate) mod fixtures;

use std::sync::Arc;

use crate::{config::AppConfig, repository::VerificationStore};

/// Container for all services
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn VerificationStore>,
    pub blobs: Arc<dyn blob::BlobStore>,
    pub pipeline: pipeline::VerificationPipeline,
    pub lifecycle: lifecycle::VisitLifecycle,
    pub reconciler: reconciler::Reconciler,
}

impl Services {
    /// Wire every service around the given store and collaborators
    pub fn new(
        store: Arc<dyn VerificationStore>,
        config: &AppConfig,
        collaborators: integrations::Collaborators,
        locks: Arc<dyn locks::ReceiptLocks>,
        ocr_provider: Arc<dyn ocr::OcrProvider>,
    ) -> Self {
        let clock: Arc<dyn clock::Clock> = Arc::new(clock::SystemClock);
        let blobs: Arc<dyn blob::BlobStore> = Arc::new(blob::FsBlobStore::new(&config.blob.root_dir));

        let restaurants = collaborators.restaurants.clone();
        let lifecycle = lifecycle::VisitLifecycle::new(
            store.clone(),
            clock.clone(),
            collaborators,
            locks,
            config.lifecycle.clone(),
        );
        let pipeline = pipeline::VerificationPipeline::new(
            store.clone(),
            blobs.clone(),
            ocr::OcrAdapter::new(ocr_provider, &config.ocr),
            lifecycle.clone(),
            restaurants,
            clock.clone(),
        )
        .with_scoring(config.scoring.clone())
        .with_fraud(config.fraud.clone());
        let reconciler = reconciler::Reconciler::new(
            store.clone(),
            lifecycle.clone(),
            clock,
            config.reconciler.clone(),
        );

        Self {
            store,
            blobs,
            pipeline,
            lifecycle,
            reconciler,
        }
    }
}
