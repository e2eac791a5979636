//! Change notifications for confirmation and match mutations.
//!
//! The feed is advisory: subscribers use it to re-evaluate a match promptly,
//! but the periodic sweep remains the backstop, so dropped or lagged events
//! are harmless.

use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    DeltasStored,
    VoteRecorded,
    RatingsApplied,
    MatchCancelled,
    RatingsReverted,
}

#[derive(Debug, Clone, Copy)]
pub struct MatchChange {
    pub match_id: Uuid,
    pub kind: ChangeKind,
}

#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<MatchChange>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish a change. A send error only means no subscriber is listening.
    pub fn publish(&self, match_id: Uuid, kind: ChangeKind) {
        let _ = self.tx.send(MatchChange { match_id, kind });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MatchChange> {
        self.tx.subscribe()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_change() {
        let feed = ChangeFeed::new(8);
        let mut rx = feed.subscribe();

        let match_id = Uuid::new_v4();
        feed.publish(match_id, ChangeKind::VoteRecorded);

        let change = rx.recv().await.unwrap();
        assert_eq!(change.match_id, match_id);
        assert_eq!(change.kind, ChangeKind::VoteRecorded);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let feed = ChangeFeed::new(8);
        feed.publish(Uuid::new_v4(), ChangeKind::RatingsApplied);
    }
}
