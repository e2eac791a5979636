//! Persistence seam for the settlement core.
//!
//! The relational store is a capability: services talk to the
//! [`SettlementStore`] trait and never to a concrete database. `PgStore`
//! backs production, `MemoryStore` backs tests and demo mode.

pub mod lock;
pub mod memory;
pub mod postgres;

pub use lock::{match_lock_name, LocalLockManager, LockManager, RedisLockManager, SWEEP_LOCK};
pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    ConfirmationStatus, Match, PlayerConfirmation, Profile, RatingChangeRecord, RatingState,
    VoteAction,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Invariant broken in persisted data (wrong row counts, illegal state
    /// combinations). Fatal: surfaced, never coerced into a valid state.
    #[error("Data integrity error: {0}")]
    Integrity(String),
}

impl StoreError {
    /// Transient failures are worth a bounded retry; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound("row"),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Reads and writes the settlement core needs, including the
/// compare-and-swap primitives the concurrency model relies on.
#[async_trait]
pub trait SettlementStore: Send + Sync {
    // --- matches ---
    async fn insert_match(&self, m: &Match) -> Result<(), StoreError>;
    async fn fetch_match(&self, match_id: Uuid) -> Result<Match, StoreError>;
    async fn set_confirmation_deadline(
        &self,
        match_id: Uuid,
        deadline: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    /// Set `confirmation_status = cancelled`. Idempotent. Fails with an
    /// integrity error while `rating_applied` is still true: applied ratings
    /// must be reverted before a match may be cancelled.
    async fn cancel_confirmation(&self, match_id: Uuid) -> Result<(), StoreError>;
    /// Matches still pending whose confirmation deadline is at or before
    /// `now`.
    async fn expired_pending_matches(&self, now: DateTime<Utc>)
        -> Result<Vec<Match>, StoreError>;

    // --- player confirmations ---
    async fn insert_confirmations(&self, rows: &[PlayerConfirmation]) -> Result<(), StoreError>;
    async fn fetch_confirmations(&self, match_id: Uuid)
        -> Result<Vec<PlayerConfirmation>, StoreError>;
    /// Write a vote only if the player's row is still `pending`. Returns
    /// false when the row was already voted on (lost race or double vote);
    /// the caller must treat that as a rejection, not retry it.
    async fn claim_vote(
        &self,
        match_id: Uuid,
        player_id: Uuid,
        action: VoteAction,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<bool, StoreError>;
    async fn update_vote_counts(
        &self,
        match_id: Uuid,
        approved: i32,
        reported: i32,
    ) -> Result<(), StoreError>;
    /// Recompute the cached tallies on the match row from the confirmation
    /// rows, atomically, and return `(approved, reported)`. Concurrent
    /// refreshes can never regress the cache below what the rows say.
    async fn refresh_vote_counts(&self, match_id: Uuid) -> Result<(i32, i32), StoreError>;

    // --- rating change records ---
    async fn insert_rating_changes(&self, rows: &[RatingChangeRecord]) -> Result<(), StoreError>;
    async fn fetch_rating_changes(
        &self,
        match_id: Uuid,
    ) -> Result<Vec<RatingChangeRecord>, StoreError>;
    /// Second phase of application: stamp `applied_at` on the match's
    /// records, bump `matches_played` for the players whose records are
    /// newly stamped, set `rating_applied = true` and move a still-pending
    /// confirmation status to approved, all in one transaction. Runs only
    /// after all profile rating writes committed, so unstamped records
    /// signal an incomplete application; a retried application can never
    /// bump the counter twice.
    async fn finalize_application(&self, match_id: Uuid, at: DateTime<Utc>)
        -> Result<(), StoreError>;
    /// Mark the match's records reverted, decrement `matches_played` for
    /// the players whose applied records are newly reverted, and clear
    /// `rating_applied`, all in one transaction.
    async fn mark_reverted(&self, match_id: Uuid) -> Result<(), StoreError>;

    // --- profiles ---
    async fn upsert_profile(&self, profile: &Profile) -> Result<(), StoreError>;
    async fn fetch_profile(&self, player_id: Uuid) -> Result<Profile, StoreError>;
    /// All-or-nothing write of the rating fields for the given players. If
    /// any write fails, none commit. Absolute values only, so a retried
    /// application or reversal converges instead of compounding;
    /// `matches_played` moves with the finalize/revert stamp, never here.
    async fn apply_profile_ratings(
        &self,
        updates: &[(Uuid, RatingState)],
    ) -> Result<(), StoreError>;
}

/// Guard on illegal status writes, shared by store implementations.
pub(crate) fn check_status_write(
    current: ConfirmationStatus,
    to: ConfirmationStatus,
) -> Result<(), StoreError> {
    if current.can_transition_to(&to) {
        Ok(())
    } else {
        Err(StoreError::Integrity(format!(
            "illegal confirmation transition {:?} -> {:?}",
            current, to
        )))
    }
}
