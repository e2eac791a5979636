//! Expiry sweep: resolves matches whose confirmation deadline has passed.
//!
//! Silence counts as consent: an expired match below the report threshold is
//! approved and settled; at or above the threshold it is cancelled. Each
//! match resolves independently, failures are collected and retried on the
//! next cycle. The global sweep lock keeps redundant invokers (cron, manual
//! trigger, several app instances) from racing.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api_error::ApiError;
use crate::config::SettlementConfig;
use crate::models::{ConfirmationStatus, Match};
use crate::service::dispute_service::DisputeService;
use crate::service::settlement_service::SettlementService;
use crate::store::{LockManager, SettlementStore, SWEEP_LOCK};

#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub match_id: Uuid,
    pub error: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    pub processed: usize,
    pub approved: usize,
    pub cancelled: usize,
    /// True when another worker held the sweep lock and this cycle did
    /// nothing.
    pub skipped: bool,
    pub errors: Vec<SweepFailure>,
}

impl SweepReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

enum Resolution {
    Approved,
    Cancelled,
}

pub struct ExpiryService {
    store: Arc<dyn SettlementStore>,
    locks: Arc<dyn LockManager>,
    settlement: Arc<SettlementService>,
    dispute: Arc<DisputeService>,
    config: SettlementConfig,
}

impl ExpiryService {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        locks: Arc<dyn LockManager>,
        settlement: Arc<SettlementService>,
        dispute: Arc<DisputeService>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            store,
            locks,
            settlement,
            dispute,
            config,
        }
    }

    /// Resolve every expired pending match. Safe to invoke from any number
    /// of callers: at most one sweep runs at a time, the rest skip.
    pub async fn sweep(&self) -> SweepReport {
        match self.locks.acquire(SWEEP_LOCK).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Sweep already running elsewhere, skipping this cycle");
                return SweepReport::skipped();
            }
            Err(e) => {
                warn!(error = %e, "Lock service unreachable, skipping sweep cycle");
                return SweepReport::skipped();
            }
        }

        let report = self.run_sweep().await;

        if let Err(e) = self.locks.release(SWEEP_LOCK).await {
            warn!(error = %e, "Failed to release sweep lock");
        }
        report
    }

    async fn run_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = Utc::now();

        let expired = match self.store.expired_pending_matches(now).await {
            Ok(matches) => matches,
            Err(e) => {
                // Nothing was mutated; the next cycle retries the scan.
                error!(error = %e, "Expiry scan failed");
                return report;
            }
        };

        for m in expired {
            report.processed += 1;
            match self.resolve_expired(&m).await {
                Ok(Resolution::Approved) => report.approved += 1,
                Ok(Resolution::Cancelled) => report.cancelled += 1,
                Err(e) => {
                    warn!(
                        match_id = %m.id,
                        error = %e,
                        "Expired match left pending for the next sweep"
                    );
                    report.errors.push(SweepFailure {
                        match_id: m.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        if report.processed > 0 {
            info!(
                processed = report.processed,
                approved = report.approved,
                cancelled = report.cancelled,
                errors = report.errors.len(),
                "Expiry sweep finished"
            );
        }
        report
    }

    async fn resolve_expired(&self, m: &Match) -> Result<Resolution, ApiError> {
        if m.reported_count >= self.config.report_threshold {
            self.dispute.discard(m.id).await?;
            Ok(Resolution::Cancelled)
        } else {
            self.settlement.apply(m.id).await?;
            Ok(Resolution::Approved)
        }
    }

    /// Targeted re-evaluation of one match, driven by the change feed. The
    /// feed is advisory: this only resolves a match the sweep or a vote
    /// would resolve anyway.
    pub async fn resolve_match(&self, match_id: Uuid) -> Result<(), ApiError> {
        let m = self.store.fetch_match(match_id).await?;
        if m.confirmation_status != ConfirmationStatus::Pending {
            return Ok(());
        }
        if m.reported_count >= self.config.report_threshold {
            self.dispute.discard(match_id).await?;
        } else if m.approved_count >= 4 || m.deadline_passed(Utc::now()) {
            self.settlement.apply(match_id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChangeFeed;
    use crate::models::{MatchStatus, Profile, SetScore};
    use crate::service::rating_calculator::RatingCalculator;
    use crate::store::{LocalLockManager, MemoryStore};
    use chrono::Duration;

    fn test_config() -> SettlementConfig {
        SettlementConfig {
            retry_backoff_ms: 1,
            ..SettlementConfig::default()
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        locks: Arc<LocalLockManager>,
        settlement: Arc<SettlementService>,
        expiry: ExpiryService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let locks = Arc::new(LocalLockManager::new());
        let feed = ChangeFeed::default();
        let settlement = Arc::new(SettlementService::new(
            store.clone(),
            locks.clone(),
            RatingCalculator::default(),
            test_config(),
            feed.clone(),
        ));
        let dispute = Arc::new(DisputeService::new(
            store.clone(),
            locks.clone(),
            test_config(),
            feed,
        ));
        let expiry = ExpiryService::new(
            store.clone(),
            locks.clone(),
            settlement.clone(),
            dispute,
            test_config(),
        );
        Fixture {
            store,
            locks,
            settlement,
            expiry,
        }
    }

    async fn seed_expired_match(fx: &Fixture, reported: i32) -> Match {
        let m = Match {
            id: Uuid::new_v4(),
            players: [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()],
            sets: vec![SetScore { team_a: 6, team_b: 0 }],
            status: MatchStatus::Finished,
            confirmation_status: ConfirmationStatus::Pending,
            confirmation_deadline: None,
            approved_count: 0,
            reported_count: 0,
            rating_applied: false,
            created_at: Utc::now(),
        };
        fx.store.insert_match(&m).await.unwrap();
        for player_id in m.players {
            fx.store.upsert_profile(&Profile::new(player_id)).await.unwrap();
        }
        fx.settlement.calculate_and_store(m.id).await.unwrap();
        fx.store
            .set_confirmation_deadline(m.id, Utc::now() - Duration::minutes(1))
            .await
            .unwrap();
        if reported > 0 {
            fx.store.update_vote_counts(m.id, 0, reported).await.unwrap();
        }
        m
    }

    #[tokio::test]
    async fn unvoted_expired_match_resolves_as_approved() {
        let fx = fixture();
        let m = seed_expired_match(&fx, 0).await;

        let report = fx.expiry.sweep().await;
        assert_eq!(report.processed, 1);
        assert_eq!(report.approved, 1);
        assert_eq!(report.cancelled, 0);
        assert!(report.errors.is_empty());

        let stored = fx.store.fetch_match(m.id).await.unwrap();
        assert_eq!(stored.confirmation_status, ConfirmationStatus::Approved);
        assert!(stored.rating_applied);
    }

    #[tokio::test]
    async fn single_report_still_resolves_as_approved() {
        let fx = fixture();
        let m = seed_expired_match(&fx, 1).await;

        let report = fx.expiry.sweep().await;
        assert_eq!(report.approved, 1);

        let stored = fx.store.fetch_match(m.id).await.unwrap();
        assert!(stored.rating_applied);
    }

    #[tokio::test]
    async fn reported_expired_match_resolves_as_cancelled() {
        let fx = fixture();
        let m = seed_expired_match(&fx, 2).await;

        let report = fx.expiry.sweep().await;
        assert_eq!(report.processed, 1);
        assert_eq!(report.cancelled, 1);

        let stored = fx.store.fetch_match(m.id).await.unwrap();
        assert_eq!(stored.confirmation_status, ConfirmationStatus::Cancelled);
        assert!(!stored.rating_applied);
    }

    #[tokio::test]
    async fn sweep_skips_when_lock_is_held() {
        let fx = fixture();
        seed_expired_match(&fx, 0).await;
        fx.locks.acquire(SWEEP_LOCK).await.unwrap();

        let report = fx.expiry.sweep().await;
        assert!(report.skipped);
        assert_eq!(report.processed, 0);

        fx.locks.release(SWEEP_LOCK).await.unwrap();
        let report = fx.expiry.sweep().await;
        assert!(!report.skipped);
        assert_eq!(report.processed, 1);
    }

    #[tokio::test]
    async fn redundant_sweeps_are_noops() {
        let fx = fixture();
        let m = seed_expired_match(&fx, 0).await;

        fx.expiry.sweep().await;
        let report = fx.expiry.sweep().await;
        assert_eq!(report.processed, 0, "resolved matches leave the scan");

        let profile = fx.store.fetch_profile(m.players[0]).await.unwrap();
        assert_eq!(profile.matches_played, 1, "ratings applied exactly once");
    }

    #[tokio::test]
    async fn one_failing_match_does_not_block_the_rest() {
        let fx = fixture();
        let healthy = seed_expired_match(&fx, 0).await;

        // An expired pending match whose rating change records were never
        // stored fails application with an integrity error.
        let orphan = Match {
            id: Uuid::new_v4(),
            players: [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()],
            sets: vec![SetScore { team_a: 6, team_b: 0 }],
            status: MatchStatus::Finished,
            confirmation_status: ConfirmationStatus::Pending,
            confirmation_deadline: Some(Utc::now() - Duration::minutes(1)),
            approved_count: 0,
            reported_count: 0,
            rating_applied: false,
            created_at: Utc::now(),
        };
        fx.store.insert_match(&orphan).await.unwrap();

        let report = fx.expiry.sweep().await;
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].match_id, orphan.id);
        assert_eq!(report.approved, 1);

        let stored = fx.store.fetch_match(healthy.id).await.unwrap();
        assert!(stored.rating_applied);
    }

    #[tokio::test]
    async fn resolve_match_settles_expired_pending() {
        let fx = fixture();
        let m = seed_expired_match(&fx, 0).await;

        fx.expiry.resolve_match(m.id).await.unwrap();
        let stored = fx.store.fetch_match(m.id).await.unwrap();
        assert!(stored.rating_applied);

        // Terminal matches are left alone.
        fx.expiry.resolve_match(m.id).await.unwrap();
    }
}
