use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Side of a 2-vs-2 padel match. Player slots 0-1 belong to team A,
/// slots 2-3 to team B.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Team {
    A,
    B,
}

/// Match lifecycle state. Confirmation only starts once the match is
/// `Finished` (scores recorded and final).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "match_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Scheduled,
    InProgress,
    Finished,
}

/// Confirmation state machine for a finished match.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "confirmation_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    Pending,
    Approved,
    Cancelled,
}

impl ConfirmationStatus {
    /// Check if transition to another state is valid. `Pending` resolves to
    /// either terminal state; `Approved` may still be cancelled by an
    /// administrative dispute (ratings are reverted first). Same-state
    /// transitions are allowed for idempotency.
    pub fn can_transition_to(&self, to: &ConfirmationStatus) -> bool {
        match (self, to) {
            (ConfirmationStatus::Pending, ConfirmationStatus::Approved) => true,
            (ConfirmationStatus::Pending, ConfirmationStatus::Cancelled) => true,
            (ConfirmationStatus::Approved, ConfirmationStatus::Cancelled) => true,
            (a, b) if a == b => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConfirmationStatus::Approved | ConfirmationStatus::Cancelled
        )
    }
}

/// One set of a padel match.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetScore {
    pub team_a: u8,
    pub team_b: u8,
}

/// A 2-vs-2 match with its confirmation bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Match {
    pub id: Uuid,
    /// Fixed slot order: [team A player 1, team A player 2,
    /// team B player 1, team B player 2].
    pub players: [Uuid; 4],
    pub sets: Vec<SetScore>,
    pub status: MatchStatus,
    pub confirmation_status: ConfirmationStatus,
    pub confirmation_deadline: Option<DateTime<Utc>>,
    /// Cached vote tallies, recomputed from the confirmation rows on every
    /// vote. The rows are authoritative.
    pub approved_count: i32,
    pub reported_count: i32,
    pub rating_applied: bool,
    pub created_at: DateTime<Utc>,
}

impl Match {
    pub fn is_participant(&self, player_id: Uuid) -> bool {
        self.players.contains(&player_id)
    }

    /// Winner by sets won. `None` means the score sheet is tied or empty,
    /// which is not a settleable match.
    pub fn winner(&self) -> Option<Team> {
        let mut a = 0u8;
        let mut b = 0u8;
        for set in &self.sets {
            if set.team_a > set.team_b {
                a += 1;
            } else if set.team_b > set.team_a {
                b += 1;
            }
        }
        match a.cmp(&b) {
            std::cmp::Ordering::Greater => Some(Team::A),
            std::cmp::Ordering::Less => Some(Team::B),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        match self.confirmation_deadline {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished_match(sets: Vec<SetScore>) -> Match {
        Match {
            id: Uuid::new_v4(),
            players: [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()],
            sets,
            status: MatchStatus::Finished,
            confirmation_status: ConfirmationStatus::Pending,
            confirmation_deadline: None,
            approved_count: 0,
            reported_count: 0,
            rating_applied: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_valid_confirmation_transitions() {
        let pending = ConfirmationStatus::Pending;
        let approved = ConfirmationStatus::Approved;
        let cancelled = ConfirmationStatus::Cancelled;

        assert!(pending.can_transition_to(&approved));
        assert!(pending.can_transition_to(&cancelled));

        // Idempotent (same state)
        assert!(approved.can_transition_to(&approved));
        assert!(cancelled.can_transition_to(&cancelled));

        // Administrative dispute reversal
        assert!(approved.can_transition_to(&cancelled));

        // Never backwards, never out of cancelled
        assert!(!cancelled.can_transition_to(&approved));
        assert!(!approved.can_transition_to(&pending));
        assert!(!cancelled.can_transition_to(&pending));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ConfirmationStatus::Pending.is_terminal());
        assert!(ConfirmationStatus::Approved.is_terminal());
        assert!(ConfirmationStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_winner_by_sets() {
        let m = finished_match(vec![
            SetScore { team_a: 6, team_b: 3 },
            SetScore { team_a: 4, team_b: 6 },
            SetScore { team_a: 6, team_b: 2 },
        ]);
        assert_eq!(m.winner(), Some(Team::A));

        let m = finished_match(vec![
            SetScore { team_a: 2, team_b: 6 },
            SetScore { team_a: 3, team_b: 6 },
        ]);
        assert_eq!(m.winner(), Some(Team::B));
    }

    #[test]
    fn test_tied_sets_have_no_winner() {
        let m = finished_match(vec![
            SetScore { team_a: 6, team_b: 3 },
            SetScore { team_a: 3, team_b: 6 },
        ]);
        assert_eq!(m.winner(), None);

        let m = finished_match(vec![]);
        assert_eq!(m.winner(), None);
    }

    #[test]
    fn test_deadline_passed() {
        let mut m = finished_match(vec![SetScore { team_a: 6, team_b: 0 }]);
        let now = Utc::now();

        assert!(!m.deadline_passed(now));

        m.confirmation_deadline = Some(now + chrono::Duration::hours(1));
        assert!(!m.deadline_passed(now));

        m.confirmation_deadline = Some(now - chrono::Duration::seconds(1));
        assert!(m.deadline_passed(now));
    }

    #[test]
    fn test_status_serialization() {
        let status = ConfirmationStatus::Pending;
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, "\"pending\"");

        let deserialized: ConfirmationStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, status);
    }
}
