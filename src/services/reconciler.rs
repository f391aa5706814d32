//! Periodic sweep enforcing visit deadlines

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use super::{clock::Clock, lifecycle::VisitLifecycle};
use crate::{config::ReconcilerConfig, error::AppResult, repository::VerificationStore};

/// What one reconciler pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct ReconcileReport {
    pub expired_retakes_deleted: usize,
    pub favorites_restored: usize,
    pub experiences_lapsed: usize,
    pub awards_synced: usize,
    /// Pending receipts the OCR step never completed for; reported, not touched
    pub stale_pending: i64,
    /// Rows that changed state between the scan and the update
    pub skipped: usize,
}

impl ReconcileReport {
    pub fn mutations(&self) -> usize {
        self.expired_retakes_deleted + self.experiences_lapsed + self.awards_synced
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn VerificationStore>,
    lifecycle: VisitLifecycle,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn VerificationStore>,
        lifecycle: VisitLifecycle,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            lifecycle,
            clock,
            config,
        }
    }

    /// Run one pass at the clock's current time
    pub async fn run(&self) -> AppResult<ReconcileReport> {
        self.run_once(self.clock.now()).await
    }

    /// One bounded pass. Each row is updated on its own, conditional on the
    /// state it was scanned in, so a pass over unchanged data changes nothing.
    pub async fn run_once(&self, now: DateTime<Utc>) -> AppResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        self.expire_retakes(now, &mut report).await?;
        self.stamp_lapsed_experiences(now, &mut report).await?;
        self.retry_awards(now, &mut report).await?;

        report.stale_pending = self
            .store
            .count_stale_pending(now - Duration::hours(self.config.stale_pending_hours))
            .await?;
        if report.stale_pending > 0 {
            warn!(count = report.stale_pending, "Pending receipts without OCR result");
        }

        info!(
            deleted = report.expired_retakes_deleted,
            restored = report.favorites_restored,
            lapsed = report.experiences_lapsed,
            synced = report.awards_synced,
            skipped = report.skipped,
            "Reconciler pass finished"
        );
        Ok(report)
    }

    async fn expire_retakes(&self, now: DateTime<Utc>, report: &mut ReconcileReport) -> AppResult<()> {
        for visit in self.store.expired_retakes(now, self.config.batch_size).await? {
            // Deleted only once the favorite is back; restores are idempotent
            if visit.was_in_must_visit {
                if !self
                    .lifecycle
                    .restore_must_visit(visit.user_id, visit.restaurant_id)
                    .await
                {
                    report.skipped += 1;
                    continue;
                }
                report.favorites_restored += 1;
            }

            if !self.store.delete_expired_retake(visit.id, now).await? {
                report.skipped += 1;
                continue;
            }
            report.expired_retakes_deleted += 1;
            debug!(visit_id = %visit.id, deadline = ?visit.retake_deadline, "Expired retake deleted");
        }
        Ok(())
    }

    async fn stamp_lapsed_experiences(
        &self,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> AppResult<()> {
        for visit in self.store.lapsed_experiences(now, self.config.batch_size).await? {
            if self.store.mark_experience_lapsed(visit.id, now).await? {
                report.experiences_lapsed += 1;
                info!(visit_id = %visit.id, user_id = %visit.user_id, "Experience window lapsed");
            } else {
                report.skipped += 1;
            }
        }
        Ok(())
    }

    async fn retry_awards(&self, now: DateTime<Utc>, report: &mut ReconcileReport) -> AppResult<()> {
        let before = now - Duration::seconds(self.config.award_retry_grace_secs);
        for receipt in self.store.unsynced_awards(before, self.config.batch_size).await? {
            let Some(points) = receipt.points_awarded else {
                continue;
            };
            let visit = self.store.get_visit(receipt.visit_id).await?;
            if self.lifecycle.sync_points(&visit, receipt.id, points).await? {
                report.awards_synced += 1;
            } else {
                report.skipped += 1;
            }
        }
        Ok(())
    }

    /// Spawn the periodic worker; None when disabled
    pub fn spawn(self) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            info!("Reconciler disabled");
            return None;
        }

        let period = StdDuration::from_secs(self.config.interval_secs.max(1));
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run().await {
                    error!(error = %e, "Reconciler pass failed");
                }
            }
        }))
    }
}
