//! Dispute handling: terminal cancellation, with reversal of ratings that
//! were already committed.
//!
//! Player votes can never reach a match in a terminal state, so the reversal
//! branch is only reachable through the administrative dispute route
//! (moderation of falsified scores after a quorum approval).

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api_error::ApiError;
use crate::config::SettlementConfig;
use crate::events::{ChangeFeed, ChangeKind};
use crate::models::{ConfirmationStatus, RatingState};
use crate::service::retry::{acquire_with_backoff, with_retries};
use crate::store::{match_lock_name, LockManager, SettlementStore, StoreError};

/// How a `discard` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardOutcome {
    /// Match moved to cancelled; ratings had never been applied.
    Cancelled,
    /// Applied ratings were rolled back, then the match was cancelled.
    Reverted,
    /// Match was already cancelled; nothing to do.
    AlreadyCancelled,
}

pub struct DisputeService {
    store: Arc<dyn SettlementStore>,
    locks: Arc<dyn LockManager>,
    config: SettlementConfig,
    feed: ChangeFeed,
}

impl DisputeService {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        locks: Arc<dyn LockManager>,
        config: SettlementConfig,
        feed: ChangeFeed,
    ) -> Self {
        Self {
            store,
            locks,
            config,
            feed,
        }
    }

    fn backoff(&self) -> Duration {
        Duration::from_millis(self.config.retry_backoff_ms)
    }

    /// Cancel a match. If ratings were already applied, first restore every
    /// player's pre-match rating, all-or-nothing, and mark the change
    /// records reverted. Idempotent.
    pub async fn discard(&self, match_id: Uuid) -> Result<DiscardOutcome, ApiError> {
        let lock_name = match_lock_name(match_id);
        let acquired = acquire_with_backoff(
            self.locks.as_ref(),
            &lock_name,
            self.config.retry_attempts,
            self.backoff(),
        )
        .await?;
        if !acquired {
            return Err(ApiError::conflict(
                "Match is being settled by another worker",
            ));
        }
        let result = self.discard_locked(match_id).await;
        if let Err(e) = self.locks.release(&lock_name).await {
            warn!(match_id = %match_id, error = %e, "Failed to release match lock");
        }
        result
    }

    /// Discard under a lock the caller already holds (the vote path's
    /// per-match critical section).
    pub(crate) async fn discard_locked(&self, match_id: Uuid) -> Result<DiscardOutcome, ApiError> {
        let m = self.store.fetch_match(match_id).await?;
        if m.confirmation_status == ConfirmationStatus::Cancelled && !m.rating_applied {
            return Ok(DiscardOutcome::AlreadyCancelled);
        }

        let mut outcome = DiscardOutcome::Cancelled;
        if m.rating_applied {
            let records = self.store.fetch_rating_changes(match_id).await?;
            if records.len() != 4 {
                return Err(StoreError::Integrity(format!(
                    "expected 4 rating change records for match {}, found {}",
                    match_id,
                    records.len()
                ))
                .into());
            }
            let rollbacks: Vec<(Uuid, RatingState)> = records
                .iter()
                .filter(|r| !r.is_reverted)
                .map(|r| (r.player_id, r.before_state()))
                .collect();
            if !rollbacks.is_empty() {
                with_retries(
                    self.config.retry_attempts,
                    self.backoff(),
                    "revert_profile_ratings",
                    || self.store.apply_profile_ratings(&rollbacks),
                )
                .await?;
            }
            // mark_reverted uncounts matches_played alongside the revert
            // stamp, so a retried reversal never decrements twice.
            with_retries(
                self.config.retry_attempts,
                self.backoff(),
                "mark_reverted",
                || self.store.mark_reverted(match_id),
            )
            .await?;
            warn!(match_id = %match_id, "Applied ratings reverted by dispute");
            self.feed.publish(match_id, ChangeKind::RatingsReverted);
            outcome = DiscardOutcome::Reverted;
        }

        with_retries(
            self.config.retry_attempts,
            self.backoff(),
            "cancel_confirmation",
            || self.store.cancel_confirmation(match_id),
        )
        .await?;

        info!(match_id = %match_id, outcome = ?outcome, "Match cancelled");
        self.feed.publish(match_id, ChangeKind::MatchCancelled);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Match, MatchStatus, Profile, SetScore};
    use crate::service::rating_calculator::RatingCalculator;
    use crate::service::settlement_service::SettlementService;
    use crate::store::{LocalLockManager, MemoryStore};
    use chrono::Utc;

    fn test_config() -> SettlementConfig {
        SettlementConfig {
            retry_backoff_ms: 1,
            ..SettlementConfig::default()
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        settlement: SettlementService,
        dispute: DisputeService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let locks = Arc::new(LocalLockManager::new());
        let feed = ChangeFeed::default();
        let settlement = SettlementService::new(
            store.clone(),
            locks.clone(),
            RatingCalculator::default(),
            test_config(),
            feed.clone(),
        );
        let dispute = DisputeService::new(store.clone(), locks, test_config(), feed);
        Fixture {
            store,
            settlement,
            dispute,
        }
    }

    async fn seed_settled_match(fx: &Fixture) -> Match {
        let m = Match {
            id: Uuid::new_v4(),
            players: [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()],
            sets: vec![SetScore { team_a: 6, team_b: 4 }],
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
        m
    }

    #[tokio::test]
    async fn discard_pending_match_cancels_without_reversal() {
        let fx = fixture();
        let m = seed_settled_match(&fx).await;

        let outcome = fx.dispute.discard(m.id).await.unwrap();
        assert_eq!(outcome, DiscardOutcome::Cancelled);

        let stored = fx.store.fetch_match(m.id).await.unwrap();
        assert_eq!(stored.confirmation_status, ConfirmationStatus::Cancelled);
        assert!(!stored.rating_applied);

        let records = fx.store.fetch_rating_changes(m.id).await.unwrap();
        assert!(records.iter().all(|r| !r.is_reverted));
    }

    #[tokio::test]
    async fn discard_is_idempotent() {
        let fx = fixture();
        let m = seed_settled_match(&fx).await;

        fx.dispute.discard(m.id).await.unwrap();
        let outcome = fx.dispute.discard(m.id).await.unwrap();
        assert_eq!(outcome, DiscardOutcome::AlreadyCancelled);
    }

    #[tokio::test]
    async fn discard_after_application_restores_pre_match_ratings() {
        let fx = fixture();
        let m = seed_settled_match(&fx).await;

        // Resolve by quorum and apply.
        fx.store.update_vote_counts(m.id, 4, 0).await.unwrap();
        fx.settlement.apply(m.id).await.unwrap();

        let before_reversal = fx.store.fetch_profile(m.players[0]).await.unwrap();
        assert_ne!(before_reversal.rating.rating, 1500.0);

        let outcome = fx.dispute.discard(m.id).await.unwrap();
        assert_eq!(outcome, DiscardOutcome::Reverted);

        let stored = fx.store.fetch_match(m.id).await.unwrap();
        assert_eq!(stored.confirmation_status, ConfirmationStatus::Cancelled);
        assert!(!stored.rating_applied);

        for player_id in m.players {
            let profile = fx.store.fetch_profile(player_id).await.unwrap();
            assert_eq!(profile.rating.rating, 1500.0);
            assert_eq!(profile.rating.rating_deviation, 350.0);
            assert_eq!(profile.matches_played, 0);
        }
        let records = fx.store.fetch_rating_changes(m.id).await.unwrap();
        assert!(records.iter().all(|r| r.is_reverted));
    }
}
