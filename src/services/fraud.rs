//! Duplicate and velocity checks against a window of recent receipts

use std::collections::BTreeSet;

use chrono::Duration;

use super::hashing::hamming_distance;
use crate::{
    config::FraudConfig,
    models::{FraudFlag, ReceiptFingerprint},
};

#[derive(Debug, Clone)]
pub struct FraudDetector {
    config: FraudConfig,
}

impl FraudDetector {
    pub fn new(config: FraudConfig) -> Self {
        Self { config }
    }

    /// Comparison window length the caller should load
    pub fn window(&self) -> Duration {
        Duration::days(self.config.window_days)
    }

    /// Union of the exact, near-duplicate and velocity checks. The candidate
    /// may appear in `window` itself; it is never compared with itself.
    pub fn detect(
        &self,
        candidate: &ReceiptFingerprint,
        window: &[ReceiptFingerprint],
    ) -> BTreeSet<FraudFlag> {
        let others: Vec<&ReceiptFingerprint> =
            window.iter().filter(|r| r.id != candidate.id).collect();
        let mut flags = BTreeSet::new();

        if others.iter().any(|r| r.image_hash == candidate.image_hash) {
            flags.insert(FraudFlag::DuplicateExact);
        }

        let near = others.iter().any(|r| {
            r.image_hash != candidate.image_hash
                && hamming_distance(r.perceptual_hash, candidate.perceptual_hash)
                    <= self.config.near_duplicate_max_distance
        });
        if near {
            flags.insert(FraudFlag::DuplicateSimilar);
        }

        if self.velocity_count(candidate, &others) > self.config.velocity_max_receipts {
            flags.insert(FraudFlag::VelocityAnomaly);
        }

        flags
    }

    /// Receipts, the candidate included, from the same device or the same
    /// GPS cluster inside the velocity window, whichever account sent them
    fn velocity_count(&self, candidate: &ReceiptFingerprint, others: &[&ReceiptFingerprint]) -> usize {
        let since = candidate.submitted_at - Duration::hours(self.config.velocity_window_hours);

        let related = others
            .iter()
            .filter(|r| r.submitted_at >= since && r.submitted_at <= candidate.submitted_at)
            .filter(|r| {
                let same_device = matches!(
                    (&candidate.device_fingerprint, &r.device_fingerprint),
                    (Some(a), Some(b)) if a == b
                );
                let same_spot = matches!(
                    (candidate.gps, r.gps),
                    (Some(a), Some(b)) if a.distance_m(&b) <= self.config.gps_cluster_radius_m
                );
                same_device || same_spot
            })
            .count();

        related + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GpsPoint, ReceiptStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn fingerprint(hash: &str, phash: u64) -> ReceiptFingerprint {
        ReceiptFingerprint {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            image_hash: hash.to_string(),
            perceptual_hash: phash,
            device_fingerprint: None,
            gps: None,
            status: ReceiptStatus::Pending,
            submitted_at: Utc::now(),
        }
    }

    fn detector() -> FraudDetector {
        FraudDetector::new(FraudConfig::default())
    }

    #[test]
    fn test_clean_receipt_has_no_flags() {
        let candidate = fingerprint("aa", 0);
        let window = vec![candidate.clone(), fingerprint("bb", u64::MAX)];
        assert!(detector().detect(&candidate, &window).is_empty());
    }

    #[test]
    fn test_exact_duplicate() {
        let candidate = fingerprint("aa", 0);
        let mut earlier = fingerprint("aa", 0);
        earlier.status = ReceiptStatus::Approved;

        let flags = detector().detect(&candidate, &[earlier]);
        assert!(flags.contains(&FraudFlag::DuplicateExact));
        assert!(!flags.contains(&FraudFlag::DuplicateSimilar));
    }

    #[test]
    fn test_near_duplicate_threshold() {
        let candidate = fingerprint("aa", 0);
        let eight_bits = fingerprint("bb", 0xff);
        let nine_bits = fingerprint("cc", 0x1ff);

        assert!(detector()
            .detect(&candidate, &[eight_bits])
            .contains(&FraudFlag::DuplicateSimilar));
        assert!(detector().detect(&candidate, &[nine_bits]).is_empty());
    }

    #[test]
    fn test_velocity_by_device() {
        let mut candidate = fingerprint("aa", 0);
        candidate.device_fingerprint = Some("device-1234".to_string());

        let burst: Vec<ReceiptFingerprint> = (0..5u64)
            .map(|i| {
                let mut r = fingerprint(&format!("h{i}"), u64::MAX - i);
                r.device_fingerprint = Some("device-1234".to_string());
                r.submitted_at = candidate.submitted_at - Duration::hours(1);
                r
            })
            .collect();

        // five earlier plus the candidate exceeds the limit of five
        assert!(detector()
            .detect(&candidate, &burst)
            .contains(&FraudFlag::VelocityAnomaly));
        assert!(!detector()
            .detect(&candidate, &burst[..4])
            .contains(&FraudFlag::VelocityAnomaly));
    }

    #[test]
    fn test_velocity_by_gps_cluster_spans_accounts() {
        let mut candidate = fingerprint("aa", 0);
        candidate.gps = Some(GpsPoint { lat: 45.0, lng: 15.0, accuracy_m: None });

        // five other accounts, each a few metres away
        let cluster: Vec<ReceiptFingerprint> = (0..5u64)
            .map(|i| {
                let mut r = fingerprint(&format!("h{i}"), u64::MAX - i);
                r.gps = Some(GpsPoint {
                    lat: 45.0 + 0.00005 * i as f64,
                    lng: 15.0,
                    accuracy_m: None,
                });
                r.submitted_at = candidate.submitted_at - Duration::hours(2);
                r
            })
            .collect();

        assert!(cluster.iter().all(|r| r.user_id != candidate.user_id));
        assert!(detector()
            .detect(&candidate, &cluster)
            .contains(&FraudFlag::VelocityAnomaly));

        // one kilometre away is another cluster
        let elsewhere: Vec<ReceiptFingerprint> = cluster
            .iter()
            .cloned()
            .map(|mut r| {
                r.gps = Some(GpsPoint { lat: 45.009, lng: 15.0, accuracy_m: None });
                r
            })
            .collect();
        assert!(!detector()
            .detect(&candidate, &elsewhere)
            .contains(&FraudFlag::VelocityAnomaly));
    }

    #[test]
    fn test_velocity_ignores_old_receipts() {
        let mut candidate = fingerprint("aa", 0);
        candidate.gps = Some(GpsPoint { lat: 45.0, lng: 15.0, accuracy_m: None });
        candidate.device_fingerprint = Some("device-1234".to_string());

        let window: Vec<ReceiptFingerprint> = (0..6u64)
            .map(|i| {
                let mut r = fingerprint(&format!("h{i}"), u64::MAX - i);
                r.gps = candidate.gps;
                r.device_fingerprint = candidate.device_fingerprint.clone();
                r.submitted_at = candidate.submitted_at - Duration::hours(30);
                r
            })
            .collect();

        assert!(detector().detect(&candidate, &window).is_empty());
    }
}
