//! Confirmation ledger: records participant votes and derives the
//! match-level confirmation status.
//!
//! Every precondition is checked before any mutation; a rejected vote leaves
//! no trace. The claim and its resolution run inside one per-match critical
//! section, so a vote can never land on a match a concurrent sweep is
//! resolving. Reports dominate approvals: the report threshold is evaluated
//! before the quorum check, so a write that could satisfy both resolves the
//! match as cancelled.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api_error::ApiError;
use crate::config::SettlementConfig;
use crate::events::{ChangeFeed, ChangeKind};
use crate::models::{
    ConfirmationStatus, ConfirmationSummary, MatchStatus, PlayerVote, VoteAction, VoteDecision,
    VoteOutcome,
};
use crate::service::dispute_service::DisputeService;
use crate::service::retry::{acquire_with_backoff, with_retries};
use crate::service::settlement_service::SettlementService;
use crate::store::{match_lock_name, LockManager, SettlementStore, StoreError};

pub struct ConfirmationService {
    store: Arc<dyn SettlementStore>,
    locks: Arc<dyn LockManager>,
    settlement: Arc<SettlementService>,
    dispute: Arc<DisputeService>,
    config: SettlementConfig,
    feed: ChangeFeed,
}

impl ConfirmationService {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        locks: Arc<dyn LockManager>,
        settlement: Arc<SettlementService>,
        dispute: Arc<DisputeService>,
        config: SettlementConfig,
        feed: ChangeFeed,
    ) -> Self {
        Self {
            store,
            locks,
            settlement,
            dispute,
            config,
            feed,
        }
    }

    fn backoff(&self) -> Duration {
        Duration::from_millis(self.config.retry_backoff_ms)
    }

    /// Record one participant's vote and, when the vote resolves the match
    /// (full quorum or report threshold), trigger settlement or dispute.
    pub async fn record_vote(
        &self,
        match_id: Uuid,
        player_id: Uuid,
        decision: VoteDecision,
        reason: Option<String>,
    ) -> Result<VoteOutcome, ApiError> {
        let m = self.store.fetch_match(match_id).await.map_err(|e| match e {
            StoreError::NotFound(_) => ApiError::not_found("Match not found"),
            other => other.into(),
        })?;

        if m.status != MatchStatus::Finished {
            return Err(ApiError::bad_request("Match scores are not final yet"));
        }
        if !m.is_participant(player_id) {
            return Err(ApiError::forbidden("Only match participants can vote"));
        }

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
        let result = self
            .record_vote_locked(match_id, player_id, decision, reason)
            .await;
        if let Err(e) = self.locks.release(&lock_name).await {
            warn!(match_id = %match_id, error = %e, "Failed to release match lock");
        }
        result
    }

    async fn record_vote_locked(
        &self,
        match_id: Uuid,
        player_id: Uuid,
        decision: VoteDecision,
        reason: Option<String>,
    ) -> Result<VoteOutcome, ApiError> {
        // Re-read under the lock: a sweep may have resolved the match while
        // this vote was waiting for it.
        let m = self.store.fetch_match(match_id).await?;
        if m.confirmation_status != ConfirmationStatus::Pending {
            return Err(ApiError::conflict("Voting is closed for this match"));
        }
        let deadline = m.confirmation_deadline.ok_or_else(|| {
            StoreError::Integrity(format!(
                "pending match {} has no confirmation deadline",
                match_id
            ))
        })?;
        let now = Utc::now();
        if now >= deadline {
            return Err(ApiError::bad_request("The confirmation window has expired"));
        }

        let claimed = with_retries(
            self.config.retry_attempts,
            self.backoff(),
            "claim_vote",
            || {
                self.store
                    .claim_vote(match_id, player_id, decision.as_action(), now, reason.clone())
            },
        )
        .await?;
        if !claimed {
            return Err(ApiError::conflict("You already voted on this match"));
        }

        info!(
            match_id = %match_id,
            player_id = %player_id,
            decision = ?decision,
            "Vote recorded"
        );
        self.feed.publish(match_id, ChangeKind::VoteRecorded);

        let rows = self.store.fetch_confirmations(match_id).await?;
        if rows.len() != 4 {
            return Err(StoreError::Integrity(format!(
                "expected 4 confirmation rows for match {}, found {}",
                match_id,
                rows.len()
            ))
            .into());
        }
        // The cache on the match is derived, never trusted; the store
        // recomputes it from the rows in one atomic statement.
        let (approved, reported) = self.store.refresh_vote_counts(match_id).await?;

        let (new_status, message) = if reported >= self.config.report_threshold {
            self.dispute.discard_locked(match_id).await?;
            (
                ConfirmationStatus::Cancelled,
                "Vote recorded; match cancelled after reaching the report threshold".to_string(),
            )
        } else if approved >= 4 {
            self.settlement.apply_locked(match_id).await?;
            (
                ConfirmationStatus::Approved,
                "Vote recorded; all players approved, ratings applied".to_string(),
            )
        } else {
            (ConfirmationStatus::Pending, "Vote recorded".to_string())
        };

        Ok(VoteOutcome {
            success: true,
            message,
            new_status,
        })
    }

    /// Current voting state of a match, per player, in match slot order.
    pub async fn confirmation_summary(
        &self,
        match_id: Uuid,
    ) -> Result<ConfirmationSummary, ApiError> {
        let m = self.store.fetch_match(match_id).await.map_err(|e| match e {
            StoreError::NotFound(_) => ApiError::not_found("Match not found"),
            other => other.into(),
        })?;
        let rows = self.store.fetch_confirmations(match_id).await?;

        let players = m
            .players
            .iter()
            .map(|player_id| {
                let row = rows.iter().find(|r| r.player_id == *player_id);
                match row {
                    Some(r) => PlayerVote {
                        player_id: *player_id,
                        action: r.action,
                        action_at: r.action_at,
                        reason: r.reason.clone(),
                    },
                    // No rows yet: confirmation has not been opened.
                    None => PlayerVote {
                        player_id: *player_id,
                        action: VoteAction::Pending,
                        action_at: None,
                        reason: None,
                    },
                }
            })
            .collect();

        Ok(ConfirmationSummary {
            match_id,
            status: m.confirmation_status,
            approved_count: m.approved_count,
            reported_count: m.reported_count,
            deadline: m.confirmation_deadline,
            players,
        })
    }
}
