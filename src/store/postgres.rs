//! Postgres-backed [`SettlementStore`].
//!
//! Multi-row writes that must be all-or-nothing (profile rating writes, the
//! finalize/revert stamps) run inside a transaction. Conditional `UPDATE`
//! statements carry the compare-and-swap semantics: a zero row count means
//! the guard failed and the caller decides what that means.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{
    ConfirmationStatus, Match, MatchStatus, PlayerConfirmation, Profile, RatingChangeRecord,
    RatingState, SetScore, VoteAction,
};
use crate::store::{SettlementStore, StoreError};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const MATCH_COLUMNS: &str = "id, player_a1, player_a2, player_b1, player_b2, set_scores, \
     status, confirmation_status, confirmation_deadline, approved_count, reported_count, \
     rating_applied, created_at";

fn match_from_row(row: &PgRow) -> Result<Match, StoreError> {
    let sets_json: String = row.try_get("set_scores")?;
    let sets: Vec<SetScore> = serde_json::from_str(&sets_json)
        .map_err(|e| StoreError::Integrity(format!("unreadable set scores: {}", e)))?;
    Ok(Match {
        id: row.try_get("id")?,
        players: [
            row.try_get("player_a1")?,
            row.try_get("player_a2")?,
            row.try_get("player_b1")?,
            row.try_get("player_b2")?,
        ],
        sets,
        status: row.try_get::<MatchStatus, _>("status")?,
        confirmation_status: row.try_get::<ConfirmationStatus, _>("confirmation_status")?,
        confirmation_deadline: row.try_get("confirmation_deadline")?,
        approved_count: row.try_get("approved_count")?,
        reported_count: row.try_get("reported_count")?,
        rating_applied: row.try_get("rating_applied")?,
        created_at: row.try_get("created_at")?,
    })
}

fn confirmation_from_row(row: &PgRow) -> Result<PlayerConfirmation, StoreError> {
    Ok(PlayerConfirmation {
        match_id: row.try_get("match_id")?,
        player_id: row.try_get("player_id")?,
        action: row.try_get::<VoteAction, _>("action")?,
        action_at: row.try_get("action_at")?,
        reason: row.try_get("reason")?,
    })
}

fn rating_change_from_row(row: &PgRow) -> Result<RatingChangeRecord, StoreError> {
    Ok(RatingChangeRecord {
        id: row.try_get("id")?,
        match_id: row.try_get("match_id")?,
        player_id: row.try_get("player_id")?,
        rating_before: row.try_get("rating_before")?,
        rd_before: row.try_get("rd_before")?,
        vol_before: row.try_get("vol_before")?,
        rating_after: row.try_get("rating_after")?,
        rd_after: row.try_get("rd_after")?,
        vol_after: row.try_get("vol_after")?,
        applied_at: row.try_get("applied_at")?,
        is_reverted: row.try_get("is_reverted")?,
        created_at: row.try_get("created_at")?,
    })
}

fn profile_from_row(row: &PgRow) -> Result<Profile, StoreError> {
    Ok(Profile {
        player_id: row.try_get("player_id")?,
        rating: RatingState {
            rating: row.try_get("rating")?,
            rating_deviation: row.try_get("rating_deviation")?,
            volatility: row.try_get("volatility")?,
        },
        matches_played: row.try_get("matches_played")?,
    })
}

#[async_trait]
impl SettlementStore for PgStore {
    async fn insert_match(&self, m: &Match) -> Result<(), StoreError> {
        let sets_json = serde_json::to_string(&m.sets)
            .map_err(|e| StoreError::Integrity(format!("unserializable set scores: {}", e)))?;
        sqlx::query(
            "INSERT INTO matches (id, player_a1, player_a2, player_b1, player_b2, set_scores, \
             status, confirmation_status, confirmation_deadline, approved_count, \
             reported_count, rating_applied, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(m.id)
        .bind(m.players[0])
        .bind(m.players[1])
        .bind(m.players[2])
        .bind(m.players[3])
        .bind(sets_json)
        .bind(m.status)
        .bind(m.confirmation_status)
        .bind(m.confirmation_deadline)
        .bind(m.approved_count)
        .bind(m.reported_count)
        .bind(m.rating_applied)
        .bind(m.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_match(&self, match_id: Uuid) -> Result<Match, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM matches WHERE id = $1",
            MATCH_COLUMNS
        ))
        .bind(match_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("match"))?;
        match_from_row(&row)
    }

    async fn set_confirmation_deadline(
        &self,
        match_id: Uuid,
        deadline: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE matches SET confirmation_deadline = $2 WHERE id = $1")
            .bind(match_id)
            .bind(deadline)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("match"));
        }
        Ok(())
    }

    async fn cancel_confirmation(&self, match_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE matches SET confirmation_status = 'cancelled' \
             WHERE id = $1 AND rating_applied = FALSE",
        )
        .bind(match_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            // Distinguish a missing match from the applied-ratings guard.
            self.fetch_match(match_id).await?;
            return Err(StoreError::Integrity(
                "cannot cancel a match with applied ratings".to_string(),
            ));
        }
        Ok(())
    }

    async fn expired_pending_matches(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Match>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM matches \
             WHERE confirmation_status = 'pending' \
             AND confirmation_deadline IS NOT NULL \
             AND confirmation_deadline <= $1",
            MATCH_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(match_from_row).collect()
    }

    async fn insert_confirmations(&self, rows: &[PlayerConfirmation]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO player_confirmations (match_id, player_id, action, action_at, reason) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(row.match_id)
            .bind(row.player_id)
            .bind(row.action)
            .bind(row.action_at)
            .bind(row.reason.as_deref())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_confirmations(
        &self,
        match_id: Uuid,
    ) -> Result<Vec<PlayerConfirmation>, StoreError> {
        let rows = sqlx::query(
            "SELECT match_id, player_id, action, action_at, reason \
             FROM player_confirmations WHERE match_id = $1",
        )
        .bind(match_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(confirmation_from_row).collect()
    }

    async fn claim_vote(
        &self,
        match_id: Uuid,
        player_id: Uuid,
        action: VoteAction,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE player_confirmations SET action = $3, action_at = $4, reason = $5 \
             WHERE match_id = $1 AND player_id = $2 AND action = 'pending'",
        )
        .bind(match_id)
        .bind(player_id)
        .bind(action)
        .bind(at)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        // Either the row never existed (integrity problem upstream) or the
        // player already voted; only the latter is a plain rejection.
        let exists = sqlx::query(
            "SELECT 1 AS one FROM player_confirmations WHERE match_id = $1 AND player_id = $2",
        )
        .bind(match_id)
        .bind(player_id)
        .fetch_optional(&self.pool)
        .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound("player confirmation")),
        }
    }

    async fn update_vote_counts(
        &self,
        match_id: Uuid,
        approved: i32,
        reported: i32,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE matches SET approved_count = $2, reported_count = $3 WHERE id = $1",
        )
        .bind(match_id)
        .bind(approved)
        .bind(reported)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("match"));
        }
        Ok(())
    }

    async fn refresh_vote_counts(&self, match_id: Uuid) -> Result<(i32, i32), StoreError> {
        // One statement, so interleaved refreshes cannot overwrite a fresh
        // tally with a staler one.
        let row = sqlx::query(
            "UPDATE matches SET approved_count = sub.approved, reported_count = sub.reported \
             FROM (SELECT \
                 COUNT(*) FILTER (WHERE action = 'approved')::INT AS approved, \
                 COUNT(*) FILTER (WHERE action = 'reported')::INT AS reported \
                 FROM player_confirmations WHERE match_id = $1) AS sub \
             WHERE matches.id = $1 \
             RETURNING sub.approved, sub.reported",
        )
        .bind(match_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("match"))?;
        Ok((row.try_get("approved")?, row.try_get("reported")?))
    }

    async fn insert_rating_changes(&self, rows: &[RatingChangeRecord]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO rating_change_records (id, match_id, player_id, rating_before, \
                 rd_before, vol_before, rating_after, rd_after, vol_after, applied_at, \
                 is_reverted, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            )
            .bind(row.id)
            .bind(row.match_id)
            .bind(row.player_id)
            .bind(row.rating_before)
            .bind(row.rd_before)
            .bind(row.vol_before)
            .bind(row.rating_after)
            .bind(row.rd_after)
            .bind(row.vol_after)
            .bind(row.applied_at)
            .bind(row.is_reverted)
            .bind(row.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_rating_changes(
        &self,
        match_id: Uuid,
    ) -> Result<Vec<RatingChangeRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, match_id, player_id, rating_before, rd_before, vol_before, \
             rating_after, rd_after, vol_after, applied_at, is_reverted, created_at \
             FROM rating_change_records WHERE match_id = $1",
        )
        .bind(match_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(rating_change_from_row).collect()
    }

    async fn finalize_application(
        &self,
        match_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE matches SET rating_applied = TRUE, confirmation_status = 'approved' \
             WHERE id = $1 AND confirmation_status <> 'cancelled'",
        )
        .bind(match_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            self.fetch_match(match_id).await?;
            return Err(StoreError::Integrity(
                "cannot apply ratings on a cancelled match".to_string(),
            ));
        }
        // The counter moves with the stamp, keyed off unstamped records, so
        // a retried application bumps each player exactly once.
        sqlx::query(
            "UPDATE profiles SET matches_played = matches_played + 1 \
             WHERE player_id IN (SELECT player_id FROM rating_change_records \
                 WHERE match_id = $1 AND applied_at IS NULL)",
        )
        .bind(match_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE rating_change_records SET applied_at = $2 \
             WHERE match_id = $1 AND applied_at IS NULL",
        )
        .bind(match_id)
        .bind(at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn mark_reverted(&self, match_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE matches SET rating_applied = FALSE WHERE id = $1")
            .bind(match_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE profiles SET matches_played = matches_played - 1 \
             WHERE player_id IN (SELECT player_id FROM rating_change_records \
                 WHERE match_id = $1 AND is_reverted = FALSE AND applied_at IS NOT NULL)",
        )
        .bind(match_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE rating_change_records SET is_reverted = TRUE WHERE match_id = $1")
            .bind(match_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_profile(&self, profile: &Profile) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO profiles (player_id, rating, rating_deviation, volatility, matches_played) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (player_id) DO UPDATE SET rating = EXCLUDED.rating, \
             rating_deviation = EXCLUDED.rating_deviation, volatility = EXCLUDED.volatility, \
             matches_played = EXCLUDED.matches_played",
        )
        .bind(profile.player_id)
        .bind(profile.rating.rating)
        .bind(profile.rating.rating_deviation)
        .bind(profile.rating.volatility)
        .bind(profile.matches_played)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_profile(&self, player_id: Uuid) -> Result<Profile, StoreError> {
        let row = sqlx::query(
            "SELECT player_id, rating, rating_deviation, volatility, matches_played \
             FROM profiles WHERE player_id = $1",
        )
        .bind(player_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("profile"))?;
        profile_from_row(&row)
    }

    async fn apply_profile_ratings(
        &self,
        updates: &[(Uuid, RatingState)],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for (player_id, state) in updates {
            let result = sqlx::query(
                "UPDATE profiles SET rating = $2, rating_deviation = $3, volatility = $4 \
                 WHERE player_id = $1",
            )
            .bind(player_id)
            .bind(state.rating)
            .bind(state.rating_deviation)
            .bind(state.volatility)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                // Dropping the transaction rolls back the earlier writes.
                return Err(StoreError::NotFound("profile"));
            }
        }
        tx.commit().await?;
        Ok(())
    }
}
