//! In-memory store used by tests and demo mode.
//!
//! Every mutation runs under one table-wide write lock, which gives the
//! multi-row writes the same all-or-nothing behavior the Postgres store gets
//! from transactions.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use async_trait::async_trait;

use crate::models::{
    ConfirmationStatus, Match, PlayerConfirmation, Profile, RatingChangeRecord, RatingState,
    VoteAction,
};
use crate::store::{check_status_write, SettlementStore, StoreError};

#[derive(Default)]
struct Tables {
    matches: HashMap<Uuid, Match>,
    confirmations: HashMap<(Uuid, Uuid), PlayerConfirmation>,
    rating_changes: HashMap<Uuid, Vec<RatingChangeRecord>>,
    profiles: HashMap<Uuid, Profile>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }
}

#[async_trait]
impl SettlementStore for MemoryStore {
    async fn insert_match(&self, m: &Match) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        if tables.matches.contains_key(&m.id) {
            return Err(StoreError::Conflict(format!("match {} already exists", m.id)));
        }
        tables.matches.insert(m.id, m.clone());
        Ok(())
    }

    async fn fetch_match(&self, match_id: Uuid) -> Result<Match, StoreError> {
        self.read()?
            .matches
            .get(&match_id)
            .cloned()
            .ok_or(StoreError::NotFound("match"))
    }

    async fn set_confirmation_deadline(
        &self,
        match_id: Uuid,
        deadline: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let m = tables
            .matches
            .get_mut(&match_id)
            .ok_or(StoreError::NotFound("match"))?;
        m.confirmation_deadline = Some(deadline);
        Ok(())
    }

    async fn cancel_confirmation(&self, match_id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let m = tables
            .matches
            .get_mut(&match_id)
            .ok_or(StoreError::NotFound("match"))?;
        if m.rating_applied {
            return Err(StoreError::Integrity(
                "cannot cancel a match with applied ratings".to_string(),
            ));
        }
        check_status_write(m.confirmation_status, ConfirmationStatus::Cancelled)?;
        m.confirmation_status = ConfirmationStatus::Cancelled;
        Ok(())
    }

    async fn expired_pending_matches(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Match>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .matches
            .values()
            .filter(|m| {
                m.confirmation_status == ConfirmationStatus::Pending && m.deadline_passed(now)
            })
            .cloned()
            .collect())
    }

    async fn insert_confirmations(&self, rows: &[PlayerConfirmation]) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        for row in rows {
            let key = (row.match_id, row.player_id);
            if tables.confirmations.contains_key(&key) {
                return Err(StoreError::Integrity(format!(
                    "duplicate confirmation row for player {} in match {}",
                    row.player_id, row.match_id
                )));
            }
            tables.confirmations.insert(key, row.clone());
        }
        Ok(())
    }

    async fn fetch_confirmations(
        &self,
        match_id: Uuid,
    ) -> Result<Vec<PlayerConfirmation>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .confirmations
            .values()
            .filter(|c| c.match_id == match_id)
            .cloned()
            .collect())
    }

    async fn claim_vote(
        &self,
        match_id: Uuid,
        player_id: Uuid,
        action: VoteAction,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.write()?;
        let row = tables
            .confirmations
            .get_mut(&(match_id, player_id))
            .ok_or(StoreError::NotFound("player confirmation"))?;
        if row.action != VoteAction::Pending {
            return Ok(false);
        }
        row.action = action;
        row.action_at = Some(at);
        row.reason = reason;
        Ok(true)
    }

    async fn update_vote_counts(
        &self,
        match_id: Uuid,
        approved: i32,
        reported: i32,
    ) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let m = tables
            .matches
            .get_mut(&match_id)
            .ok_or(StoreError::NotFound("match"))?;
        m.approved_count = approved;
        m.reported_count = reported;
        Ok(())
    }

    async fn refresh_vote_counts(&self, match_id: Uuid) -> Result<(i32, i32), StoreError> {
        let mut tables = self.write()?;
        let approved = tables
            .confirmations
            .values()
            .filter(|c| c.match_id == match_id && c.action == VoteAction::Approved)
            .count() as i32;
        let reported = tables
            .confirmations
            .values()
            .filter(|c| c.match_id == match_id && c.action == VoteAction::Reported)
            .count() as i32;
        let m = tables
            .matches
            .get_mut(&match_id)
            .ok_or(StoreError::NotFound("match"))?;
        m.approved_count = approved;
        m.reported_count = reported;
        Ok((approved, reported))
    }

    async fn insert_rating_changes(&self, rows: &[RatingChangeRecord]) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        for row in rows {
            let records = tables.rating_changes.entry(row.match_id).or_default();
            if records.iter().any(|r| r.player_id == row.player_id) {
                return Err(StoreError::Integrity(format!(
                    "duplicate rating change for player {} in match {}",
                    row.player_id, row.match_id
                )));
            }
            records.push(row.clone());
        }
        Ok(())
    }

    async fn fetch_rating_changes(
        &self,
        match_id: Uuid,
    ) -> Result<Vec<RatingChangeRecord>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .rating_changes
            .get(&match_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn finalize_application(
        &self,
        match_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let m = tables
            .matches
            .get_mut(&match_id)
            .ok_or(StoreError::NotFound("match"))?;
        if m.confirmation_status == ConfirmationStatus::Cancelled {
            return Err(StoreError::Integrity(
                "cannot apply ratings on a cancelled match".to_string(),
            ));
        }
        m.rating_applied = true;
        m.confirmation_status = ConfirmationStatus::Approved;
        // The counter moves with the stamp: only unstamped records count,
        // so a retried application bumps each player exactly once.
        let unstamped: Vec<Uuid> = tables
            .rating_changes
            .get(&match_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.applied_at.is_none())
                    .map(|r| r.player_id)
                    .collect()
            })
            .unwrap_or_default();
        for player_id in &unstamped {
            if !tables.profiles.contains_key(player_id) {
                return Err(StoreError::NotFound("profile"));
            }
        }
        for player_id in &unstamped {
            if let Some(profile) = tables.profiles.get_mut(player_id) {
                profile.matches_played += 1;
            }
        }
        for record in tables.rating_changes.entry(match_id).or_default() {
            if record.applied_at.is_none() {
                record.applied_at = Some(at);
            }
        }
        Ok(())
    }

    async fn mark_reverted(&self, match_id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let m = tables
            .matches
            .get_mut(&match_id)
            .ok_or(StoreError::NotFound("match"))?;
        m.rating_applied = false;
        let reverting: Vec<Uuid> = tables
            .rating_changes
            .get(&match_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| !r.is_reverted && r.applied_at.is_some())
                    .map(|r| r.player_id)
                    .collect()
            })
            .unwrap_or_default();
        for player_id in &reverting {
            if let Some(profile) = tables.profiles.get_mut(player_id) {
                profile.matches_played -= 1;
            }
        }
        for record in tables.rating_changes.entry(match_id).or_default() {
            record.is_reverted = true;
        }
        Ok(())
    }

    async fn upsert_profile(&self, profile: &Profile) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        tables.profiles.insert(profile.player_id, profile.clone());
        Ok(())
    }

    async fn fetch_profile(&self, player_id: Uuid) -> Result<Profile, StoreError> {
        self.read()?
            .profiles
            .get(&player_id)
            .cloned()
            .ok_or(StoreError::NotFound("profile"))
    }

    async fn apply_profile_ratings(
        &self,
        updates: &[(Uuid, RatingState)],
    ) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        // Validate every target first so the write below cannot fail halfway.
        for (player_id, _) in updates {
            if !tables.profiles.contains_key(player_id) {
                return Err(StoreError::NotFound("profile"));
            }
        }
        for (player_id, state) in updates {
            let profile = tables
                .profiles
                .get_mut(player_id)
                .ok_or(StoreError::NotFound("profile"))?;
            profile.rating = *state;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MatchStatus, SetScore};

    fn sample_match() -> Match {
        Match {
            id: Uuid::new_v4(),
            players: [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()],
            sets: vec![SetScore { team_a: 6, team_b: 2 }],
            status: MatchStatus::Finished,
            confirmation_status: ConfirmationStatus::Pending,
            confirmation_deadline: None,
            approved_count: 0,
            reported_count: 0,
            rating_applied: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn claim_vote_is_exclusive() {
        let store = MemoryStore::new();
        let m = sample_match();
        let player = m.players[0];
        store.insert_match(&m).await.unwrap();
        store
            .insert_confirmations(&[PlayerConfirmation::pending(m.id, player)])
            .await
            .unwrap();

        let first = store
            .claim_vote(m.id, player, VoteAction::Approved, Utc::now(), None)
            .await
            .unwrap();
        assert!(first);

        let second = store
            .claim_vote(m.id, player, VoteAction::Reported, Utc::now(), None)
            .await
            .unwrap();
        assert!(!second, "second vote must not overwrite the first");

        let rows = store.fetch_confirmations(m.id).await.unwrap();
        assert_eq!(rows[0].action, VoteAction::Approved);
    }

    #[tokio::test]
    async fn duplicate_confirmation_rows_are_integrity_errors() {
        let store = MemoryStore::new();
        let m = sample_match();
        let player = m.players[0];
        store.insert_match(&m).await.unwrap();
        store
            .insert_confirmations(&[PlayerConfirmation::pending(m.id, player)])
            .await
            .unwrap();

        let err = store
            .insert_confirmations(&[PlayerConfirmation::pending(m.id, player)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
    }

    #[tokio::test]
    async fn cancel_refuses_applied_ratings() {
        let store = MemoryStore::new();
        let mut m = sample_match();
        m.rating_applied = true;
        m.confirmation_status = ConfirmationStatus::Approved;
        store.insert_match(&m).await.unwrap();

        let err = store.cancel_confirmation(m.id).await.unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
    }

    #[tokio::test]
    async fn expired_scan_only_returns_pending_past_deadline() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut expired = sample_match();
        expired.confirmation_deadline = Some(now - chrono::Duration::minutes(5));
        store.insert_match(&expired).await.unwrap();

        let mut future = sample_match();
        future.confirmation_deadline = Some(now + chrono::Duration::hours(1));
        store.insert_match(&future).await.unwrap();

        let mut resolved = sample_match();
        resolved.confirmation_deadline = Some(now - chrono::Duration::minutes(5));
        resolved.confirmation_status = ConfirmationStatus::Approved;
        store.insert_match(&resolved).await.unwrap();

        let found = store.expired_pending_matches(now).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, expired.id);
    }

    #[tokio::test]
    async fn profile_writes_are_all_or_nothing() {
        let store = MemoryStore::new();
        let known = Uuid::new_v4();
        store.upsert_profile(&Profile::new(known)).await.unwrap();

        let missing = Uuid::new_v4();
        let updated = RatingState {
            rating: 1600.0,
            ..RatingState::default()
        };
        let err = store
            .apply_profile_ratings(&[(known, updated), (missing, updated)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        // The known profile must be untouched.
        let profile = store.fetch_profile(known).await.unwrap();
        assert_eq!(profile.rating.rating, 1500.0);
        assert_eq!(profile.matches_played, 0);
    }

    #[tokio::test]
    async fn finalize_stamps_and_counts_each_player_once() {
        let store = MemoryStore::new();
        let m = sample_match();
        store.insert_match(&m).await.unwrap();
        let records: Vec<RatingChangeRecord> = m
            .players
            .iter()
            .map(|p| {
                RatingChangeRecord::new(m.id, *p, RatingState::default(), RatingState::default())
            })
            .collect();
        store.insert_rating_changes(&records).await.unwrap();
        for player_id in m.players {
            store.upsert_profile(&Profile::new(player_id)).await.unwrap();
        }

        store.finalize_application(m.id, Utc::now()).await.unwrap();
        store.finalize_application(m.id, Utc::now()).await.unwrap();

        for player_id in m.players {
            let profile = store.fetch_profile(player_id).await.unwrap();
            assert_eq!(profile.matches_played, 1, "stamped records must not re-count");
        }
    }

    #[tokio::test]
    async fn revert_uncounts_each_player_once() {
        let store = MemoryStore::new();
        let m = sample_match();
        store.insert_match(&m).await.unwrap();
        let records: Vec<RatingChangeRecord> = m
            .players
            .iter()
            .map(|p| {
                RatingChangeRecord::new(m.id, *p, RatingState::default(), RatingState::default())
            })
            .collect();
        store.insert_rating_changes(&records).await.unwrap();
        for player_id in m.players {
            store.upsert_profile(&Profile::new(player_id)).await.unwrap();
        }
        store.finalize_application(m.id, Utc::now()).await.unwrap();

        store.mark_reverted(m.id).await.unwrap();
        store.mark_reverted(m.id).await.unwrap();

        for player_id in m.players {
            let profile = store.fetch_profile(player_id).await.unwrap();
            assert_eq!(profile.matches_played, 0, "reverted records must not re-uncount");
        }
    }

    #[tokio::test]
    async fn refresh_recomputes_tallies_from_rows() {
        let store = MemoryStore::new();
        let m = sample_match();
        store.insert_match(&m).await.unwrap();
        let rows: Vec<PlayerConfirmation> = m
            .players
            .iter()
            .map(|p| PlayerConfirmation::pending(m.id, *p))
            .collect();
        store.insert_confirmations(&rows).await.unwrap();

        store
            .claim_vote(m.id, m.players[0], VoteAction::Approved, Utc::now(), None)
            .await
            .unwrap();
        store
            .claim_vote(m.id, m.players[1], VoteAction::Reported, Utc::now(), None)
            .await
            .unwrap();
        // A stale direct write cannot survive a refresh.
        store.update_vote_counts(m.id, 0, 0).await.unwrap();

        let (approved, reported) = store.refresh_vote_counts(m.id).await.unwrap();
        assert_eq!((approved, reported), (1, 1));

        let stored = store.fetch_match(m.id).await.unwrap();
        assert_eq!(stored.approved_count, 1);
        assert_eq!(stored.reported_count, 1);
    }
}
