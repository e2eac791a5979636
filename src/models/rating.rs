use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A player's Glicko-2 state: rating, rating deviation, volatility.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RatingState {
    pub rating: f64,
    pub rating_deviation: f64,
    pub volatility: f64,
}

impl Default for RatingState {
    fn default() -> Self {
        Self {
            rating: 1500.0,
            rating_deviation: 350.0,
            volatility: 0.06,
        }
    }
}

/// The rating slice of a player profile. The rest of the profile (name,
/// avatar, clubs) lives outside the settlement core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub player_id: Uuid,
    pub rating: RatingState,
    pub matches_played: i32,
}

impl Profile {
    pub fn new(player_id: Uuid) -> Self {
        Self {
            player_id,
            rating: RatingState::default(),
            matches_played: 0,
        }
    }
}

/// Pending rating delta for one player in one match. Written exactly once
/// when scores become final; settlement replays the stored values and never
/// recomputes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingChangeRecord {
    pub id: Uuid,
    pub match_id: Uuid,
    pub player_id: Uuid,
    pub rating_before: f64,
    pub rd_before: f64,
    pub vol_before: f64,
    pub rating_after: f64,
    pub rd_after: f64,
    pub vol_after: f64,
    pub applied_at: Option<DateTime<Utc>>,
    pub is_reverted: bool,
    pub created_at: DateTime<Utc>,
}

impl RatingChangeRecord {
    pub fn new(match_id: Uuid, player_id: Uuid, before: RatingState, after: RatingState) -> Self {
        Self {
            id: Uuid::new_v4(),
            match_id,
            player_id,
            rating_before: before.rating,
            rd_before: before.rating_deviation,
            vol_before: before.volatility,
            rating_after: after.rating,
            rd_after: after.rating_deviation,
            vol_after: after.volatility,
            applied_at: None,
            is_reverted: false,
            created_at: Utc::now(),
        }
    }

    pub fn before_state(&self) -> RatingState {
        RatingState {
            rating: self.rating_before,
            rating_deviation: self.rd_before,
            volatility: self.vol_before,
        }
    }

    pub fn after_state(&self) -> RatingState {
        RatingState {
            rating: self.rating_after,
            rating_deviation: self.rd_after,
            volatility: self.vol_after,
        }
    }
}
