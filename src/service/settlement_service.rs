//! Rating settlement engine.
//!
//! Deltas are computed once, at the moment scores become final, and held as
//! pending [`RatingChangeRecord`]s until a resolution event (quorum or
//! expiry) authorizes their application. Application is exactly-once: a
//! per-match advisory lock serializes concurrent callers, the
//! `rating_applied` flag short-circuits repeats, and the two-phase stamp
//! (profiles first, `applied_at` second) makes a crash mid-way recoverable
//! by retry.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api_error::ApiError;
use crate::config::SettlementConfig;
use crate::events::{ChangeFeed, ChangeKind};
use crate::models::{ConfirmationStatus, MatchStatus, PlayerConfirmation, RatingChangeRecord, RatingState};
use crate::service::rating_calculator::RatingCalculator;
use crate::service::retry::{acquire_with_backoff, with_retries};
use crate::store::{match_lock_name, LockManager, SettlementStore, StoreError};

/// How an `apply` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    AlreadyApplied,
}

pub struct SettlementService {
    store: Arc<dyn SettlementStore>,
    locks: Arc<dyn LockManager>,
    calculator: RatingCalculator,
    config: SettlementConfig,
    feed: ChangeFeed,
}

impl SettlementService {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        locks: Arc<dyn LockManager>,
        calculator: RatingCalculator,
        config: SettlementConfig,
        feed: ChangeFeed,
    ) -> Self {
        Self {
            store,
            locks,
            calculator,
            config,
            feed,
        }
    }

    fn backoff(&self) -> Duration {
        Duration::from_millis(self.config.retry_backoff_ms)
    }

    async fn with_match_lock<T>(
        &self,
        match_id: Uuid,
        op: impl std::future::Future<Output = Result<T, ApiError>>,
    ) -> Result<T, ApiError> {
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
        let result = op.await;
        if let Err(e) = self.locks.release(&lock_name).await {
            warn!(match_id = %match_id, error = %e, "Failed to release match lock");
        }
        result
    }

    /// Compute and persist the pending rating deltas for a finished match,
    /// open its confirmation window and seed the four voting rows.
    ///
    /// Idempotent: a match that already has rating change records is left
    /// untouched and reported as success.
    pub async fn calculate_and_store(&self, match_id: Uuid) -> Result<(), ApiError> {
        self.with_match_lock(match_id, self.calculate_and_store_locked(match_id))
            .await
    }

    async fn calculate_and_store_locked(&self, match_id: Uuid) -> Result<(), ApiError> {
        let m = self.store.fetch_match(match_id).await?;

        let existing = self.store.fetch_rating_changes(match_id).await?;
        if !existing.is_empty() {
            info!(match_id = %match_id, "Rating deltas already stored, skipping");
            return Ok(());
        }

        if m.status != MatchStatus::Finished {
            return Err(ApiError::bad_request("Match scores are not final yet"));
        }
        if m.rating_applied {
            return Err(StoreError::Integrity(
                "match has applied ratings but no rating change records".to_string(),
            )
            .into());
        }
        if m.sets.iter().any(|s| s.team_a == s.team_b) {
            return Err(ApiError::bad_request("Set scores must be decisive"));
        }
        let winner = m
            .winner()
            .ok_or_else(|| ApiError::bad_request("Match must have a decisive winner by sets"))?;

        let mut before = [RatingState::default(); 4];
        for (slot, player_id) in m.players.iter().enumerate() {
            before[slot] = self.store.fetch_profile(*player_id).await?.rating;
        }
        let after = self.calculator.rate_match(&before, winner);

        let confirmations: Vec<PlayerConfirmation> = m
            .players
            .iter()
            .map(|p| PlayerConfirmation::pending(match_id, *p))
            .collect();
        let records: Vec<RatingChangeRecord> = m
            .players
            .iter()
            .enumerate()
            .map(|(slot, p)| RatingChangeRecord::new(match_id, *p, before[slot], after[slot]))
            .collect();

        let deadline = Utc::now() + self.config.confirmation_window;
        with_retries(
            self.config.retry_attempts,
            self.backoff(),
            "insert_confirmations",
            || self.store.insert_confirmations(&confirmations),
        )
        .await?;
        with_retries(
            self.config.retry_attempts,
            self.backoff(),
            "insert_rating_changes",
            || self.store.insert_rating_changes(&records),
        )
        .await?;
        with_retries(
            self.config.retry_attempts,
            self.backoff(),
            "set_confirmation_deadline",
            || self.store.set_confirmation_deadline(match_id, deadline),
        )
        .await?;

        info!(
            match_id = %match_id,
            winner = ?winner,
            deadline = %deadline,
            "Stored pending rating deltas and opened confirmation window"
        );
        self.feed.publish(match_id, ChangeKind::DeltasStored);
        Ok(())
    }

    /// Apply the stored deltas to the four player profiles, all-or-nothing.
    ///
    /// Preconditions: ratings not yet applied, match not cancelled, report
    /// count below the cancellation threshold, and a resolution event
    /// happened (full quorum or deadline passed). A second call is a no-op.
    pub async fn apply(&self, match_id: Uuid) -> Result<ApplyOutcome, ApiError> {
        self.with_match_lock(match_id, self.apply_locked(match_id))
            .await
    }

    /// Apply under a lock the caller already holds. The vote path runs its
    /// claim and resolution inside one per-match critical section.
    pub(crate) async fn apply_locked(&self, match_id: Uuid) -> Result<ApplyOutcome, ApiError> {
        let m = self.store.fetch_match(match_id).await?;
        if m.rating_applied {
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        if m.confirmation_status == ConfirmationStatus::Cancelled {
            return Err(ApiError::conflict("Match is cancelled"));
        }
        if m.reported_count >= self.config.report_threshold {
            return Err(ApiError::conflict(
                "Match has reached the report threshold",
            ));
        }
        let now = Utc::now();
        let quorum = m.approved_count >= 4;
        let resolvable = quorum
            || m.deadline_passed(now)
            || m.confirmation_status == ConfirmationStatus::Approved;
        if !resolvable {
            return Err(ApiError::conflict(
                "Confirmation window is still open and quorum is not reached",
            ));
        }

        let records = self.store.fetch_rating_changes(match_id).await?;
        if records.len() != 4 {
            return Err(StoreError::Integrity(format!(
                "expected 4 rating change records for match {}, found {}",
                match_id,
                records.len()
            ))
            .into());
        }
        if records.iter().any(|r| r.is_reverted) {
            return Err(StoreError::Integrity(format!(
                "match {} has reverted rating change records",
                match_id
            ))
            .into());
        }

        let updates: Vec<(Uuid, RatingState)> = records
            .iter()
            .map(|r| (r.player_id, r.after_state()))
            .collect();
        with_retries(
            self.config.retry_attempts,
            self.backoff(),
            "apply_profile_ratings",
            || self.store.apply_profile_ratings(&updates),
        )
        .await?;
        // Stamps come second: an unstamped record after a crash here means
        // the application is incomplete and the next attempt re-runs it.
        // The matches_played bump rides on the stamp, not the rating write,
        // so the re-run converges instead of counting the match again.
        with_retries(
            self.config.retry_attempts,
            self.backoff(),
            "finalize_application",
            || self.store.finalize_application(match_id, now),
        )
        .await?;

        info!(match_id = %match_id, "Ratings applied to all four profiles");
        self.feed.publish(match_id, ChangeKind::RatingsApplied);
        Ok(ApplyOutcome::Applied)
    }
}
