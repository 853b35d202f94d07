//! The standardized event schema every ESP webhook is normalized into, and
//! the idempotent merge rule used by the event store's upsert.
//!
//! Grounded on `webhook_event_processor.go`'s `saveStandardizedEvent` SQL:
//! booleans OR-combine, counters sum, every `*_time` field (including the
//! `last_*_time` ones) is first-writer-wins via coalesce, and the provider
//! column is last-writer-wins.

use serde::{Deserialize, Serialize};

use crate::credentials::Provider;

/// The full delivery lifecycle of one message, merged across every webhook
/// callback received for it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StandardizedEvent {
    pub message_id: String,
    pub provider: Option<Provider>,

    pub processed: bool,
    pub processed_time: Option<i64>,

    pub delivered: bool,
    pub delivered_time: Option<i64>,

    pub bounce: bool,
    pub bounce_type: Option<String>,
    pub bounce_time: Option<i64>,

    pub deferred: bool,
    pub deferred_count: i32,
    pub last_deferral_time: Option<i64>,

    pub open: bool,
    pub open_count: i32,
    pub last_open_time: Option<i64>,

    pub unique_open: bool,
    pub unique_open_time: Option<i64>,

    pub dropped: bool,
    pub dropped_time: Option<i64>,
    pub dropped_reason: Option<String>,
}

impl StandardizedEvent {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            ..Default::default()
        }
    }

    /// Merge an incoming event into `self` (the existing row), applying the
    /// idempotent rules from §4.A: OR for booleans, sum for counters,
    /// coalesce (keep existing, else adopt incoming) for `*_time` fields,
    /// last-writer-wins for `provider`.
    pub fn merge(&mut self, incoming: &StandardizedEvent) {
        self.provider = incoming.provider.or(self.provider);

        self.processed |= incoming.processed;
        self.processed_time = self.processed_time.or(incoming.processed_time);

        self.delivered |= incoming.delivered;
        self.delivered_time = self.delivered_time.or(incoming.delivered_time);

        self.bounce |= incoming.bounce;
        self.bounce_type = self.bounce_type.clone().or_else(|| incoming.bounce_type.clone());
        self.bounce_time = self.bounce_time.or(incoming.bounce_time);

        self.deferred |= incoming.deferred;
        self.deferred_count += incoming.deferred_count;
        self.last_deferral_time = self.last_deferral_time.or(incoming.last_deferral_time);

        self.open |= incoming.open;
        self.open_count += incoming.open_count;
        self.last_open_time = self.last_open_time.or(incoming.last_open_time);

        self.unique_open |= incoming.unique_open;
        self.unique_open_time = self.unique_open_time.or(incoming.unique_open_time);

        self.dropped |= incoming.dropped;
        self.dropped_time = self.dropped_time.or(incoming.dropped_time);
        self.dropped_reason = self.dropped_reason.clone().or_else(|| incoming.dropped_reason.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivered_time_is_first_writer_wins() {
        let mut row = StandardizedEvent::new("m1");
        row.merge(&StandardizedEvent {
            delivered: true,
            delivered_time: Some(100),
            ..StandardizedEvent::new("m1")
        });
        row.merge(&StandardizedEvent {
            delivered: true,
            delivered_time: Some(200),
            ..StandardizedEvent::new("m1")
        });
        assert_eq!(row.delivered_time, Some(100));
        assert!(row.delivered);
    }

    #[test]
    fn open_counter_accumulates() {
        let mut row = StandardizedEvent::new("m1");
        for (i, t) in [(1, 10), (1, 20), (1, 30)] {
            row.merge(&StandardizedEvent {
                open: true,
                open_count: i,
                last_open_time: Some(t),
                unique_open: row.open_count == 0,
                unique_open_time: if row.open_count == 0 { Some(t) } else { None },
                ..StandardizedEvent::new("m1")
            });
        }
        assert_eq!(row.open_count, 3);
        assert!(row.open);
        assert!(row.unique_open);
        assert_eq!(row.unique_open_time, Some(10));
    }

    #[test]
    fn merge_is_commutative_for_disjoint_updates() {
        let a = StandardizedEvent {
            delivered: true,
            delivered_time: Some(100),
            ..StandardizedEvent::new("m1")
        };
        let b = StandardizedEvent {
            open: true,
            open_count: 1,
            last_open_time: Some(150),
            ..StandardizedEvent::new("m1")
        };

        let mut forward = StandardizedEvent::new("m1");
        forward.merge(&a);
        forward.merge(&b);

        let mut backward = StandardizedEvent::new("m1");
        backward.merge(&b);
        backward.merge(&a);

        assert_eq!(forward.delivered, backward.delivered);
        assert_eq!(forward.delivered_time, backward.delivered_time);
        assert_eq!(forward.open_count, backward.open_count);
    }

    #[test]
    fn hard_bounce_also_drops() {
        let mut row = StandardizedEvent::new("m1");
        row.merge(&StandardizedEvent {
            bounce: true,
            bounce_type: Some("hard".into()),
            bounce_time: Some(5),
            dropped: true,
            dropped_time: Some(5),
            dropped_reason: Some("bounced".into()),
            ..StandardizedEvent::new("m1")
        });
        assert!(row.bounce && row.dropped);
        assert_eq!(row.bounce_type.as_deref(), Some("hard"));
    }
}
