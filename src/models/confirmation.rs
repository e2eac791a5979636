use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::match_model::ConfirmationStatus;

/// State of a single participant's vote. Exactly one row per player per
/// match; transitions only `Pending -> Approved` or `Pending -> Reported`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "vote_action", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VoteAction {
    Pending,
    Approved,
    Reported,
}

/// A vote a participant can actually cast. `VoteAction::Pending` is the
/// initial row state, never a valid input.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VoteDecision {
    Approved,
    Reported,
}

impl VoteDecision {
    pub fn as_action(&self) -> VoteAction {
        match self {
            VoteDecision::Approved => VoteAction::Approved,
            VoteDecision::Reported => VoteAction::Reported,
        }
    }
}

/// One participant's voting record for one match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerConfirmation {
    pub match_id: Uuid,
    pub player_id: Uuid,
    pub action: VoteAction,
    pub action_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl PlayerConfirmation {
    pub fn pending(match_id: Uuid, player_id: Uuid) -> Self {
        Self {
            match_id,
            player_id,
            action: VoteAction::Pending,
            action_at: None,
            reason: None,
        }
    }
}

// ===== API DTOs =====

/// Vote Request DTO
#[derive(Debug, Deserialize, Serialize, Clone, Validate)]
pub struct VoteRequest {
    pub player_id: Uuid,
    pub action: VoteDecision,
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

/// Outcome of a vote attempt, surfaced directly to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteOutcome {
    pub success: bool,
    pub message: String,
    pub new_status: ConfirmationStatus,
}

/// Per-player view inside a confirmation summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerVote {
    pub player_id: Uuid,
    pub action: VoteAction,
    pub action_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

/// Confirmation Summary Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationSummary {
    pub match_id: Uuid,
    pub status: ConfirmationStatus,
    pub approved_count: i32,
    pub reported_count: i32,
    pub deadline: Option<DateTime<Utc>>,
    pub players: Vec<PlayerVote>,
}
