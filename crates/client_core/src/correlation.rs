use std::time::{Duration, Instant};

use shared::domain::MessageId;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct CorrelationEntry {
    provisional_id: Uuid,
    durable_id: MessageId,
    expires_at: Instant,
}

/// Short-lived provisional→durable id map used to recognize the
/// change-feed echo of a send that was already materialized through the
/// HTTP confirmation path.
///
/// Entries expire after a fixed grace window; expiry is applied lazily
/// on access rather than by timer, so no timer handle can outlive the
/// engine. Callers pass `now` explicitly, which also keeps the expiry
/// logic deterministic under test.
#[derive(Debug)]
pub struct CorrelationTracker {
    grace: Duration,
    entries: Vec<CorrelationEntry>,
}

impl CorrelationTracker {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            entries: Vec::new(),
        }
    }

    /// Records a confirmed send. The entry stays live for one grace
    /// window from `now`.
    pub fn record(&mut self, provisional_id: Uuid, durable_id: MessageId, now: Instant) {
        self.purge(now);
        self.entries.push(CorrelationEntry {
            provisional_id,
            durable_id,
            expires_at: now + self.grace,
        });
    }

    /// True if `durable_id` belongs to a live entry, meaning an inbound
    /// insert for that row is the echo of our own recent send.
    pub fn contains_durable(&mut self, durable_id: MessageId, now: Instant) -> bool {
        self.purge(now);
        match self
            .entries
            .iter()
            .find(|entry| entry.durable_id == durable_id)
        {
            Some(entry) => {
                tracing::debug!(
                    provisional_id = %entry.provisional_id,
                    durable_id = durable_id.0,
                    "durable id matches a live correlation entry"
                );
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn purge(&mut self, now: Instant) {
        self.entries.retain(|entry| entry.expires_at > now);
    }
}
