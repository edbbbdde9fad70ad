use std::{collections::HashMap, time::Duration};

use iris_protocol::{body::ResponseStatus, RequestId};
use tokio::time::Instant;

/// Upper bound on remembered request ids.
const MAX_SEEN_REQUESTS: usize = 100_000;

#[derive(Debug, Clone)]
pub struct SeenEntry {
    /// Local deadline of the request; retention counts from here.
    pub deadline:   Instant,
    /// Final status once the coordinator is done.
    pub finalized:  Option<ResponseStatus>,
}

/// Request ids this node has already handled, for cycle-safe deduplication.
///
/// Entries outlive their request by the retention window so that late
/// duplicates arriving over slow paths are still recognised.
pub struct SeenTable {
    entries:   HashMap<RequestId, SeenEntry>,
    retention: Duration,
}

impl SeenTable {
    pub fn new(retention: Duration) -> Self {
        Self { entries: HashMap::new(), retention }
    }

    /// Record a sighting. Returns true only for the first one.
    pub fn first_sighting(&mut self, id: RequestId, deadline: Instant, now: Instant) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        if self.entries.len() >= MAX_SEEN_REQUESTS {
            self.sweep(now);
        }
        if self.entries.len() >= MAX_SEEN_REQUESTS {
            // Still full: drop the entry closest to eviction anyway.
            let oldest = self.entries.iter()
                .min_by_key(|(_, e)| e.deadline)
                .map(|(k, _)| *k);
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(id, SeenEntry { deadline, finalized: None });
        true
    }

    pub fn finalize(&mut self, id: &RequestId, status: ResponseStatus) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.finalized = Some(status);
        }
    }

    pub fn get(&self, id: &RequestId) -> Option<&SeenEntry> {
        self.entries.get(id)
    }

    /// Evict entries whose retention window has passed. Returns the count.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let retention = self.retention;
        self.entries.retain(|_, e| e.deadline + retention > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
