use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use tether_core::EntrySource;

/// What the engine remembers about a run after it closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedRun {
    pub agent: String,
    /// Highest accepted chat-channel terminal seq.
    pub chat_seq: Option<u64>,
    /// Highest accepted lifecycle-channel terminal seq.
    pub lifecycle_seq: Option<u64>,
    /// Which source wrote the run's canonical entry.
    pub source: EntrySource,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    run: ClosedRun,
    closed_at: DateTime<Utc>,
}

/// TTL-bounded, capacity-bounded record of recently closed runs. Expired
/// entries are pruned lazily on access and insert.
#[derive(Debug, Clone)]
pub struct ClosedRunCache {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
}

impl ClosedRunCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, run_id: &str, run: ClosedRun, now: DateTime<Utc>) {
        self.prune(now);
        if self.entries.contains_key(run_id) {
            self.order.retain(|key| key != run_id);
        }
        self.entries.insert(
            run_id.to_string(),
            CacheEntry {
                run,
                closed_at: now,
            },
        );
        self.order.push_back(run_id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    pub fn contains(&mut self, run_id: &str, now: DateTime<Utc>) -> bool {
        self.get_mut(run_id, now).is_some()
    }

    pub fn get_mut(&mut self, run_id: &str, now: DateTime<Utc>) -> Option<&mut ClosedRun> {
        let expired = self
            .entries
            .get(run_id)
            .is_some_and(|entry| now - entry.closed_at > self.ttl);
        if expired {
            self.entries.remove(run_id);
            self.order.retain(|key| key != run_id);
            return None;
        }
        self.entries.get_mut(run_id).map(|entry| &mut entry.run)
    }

    pub fn prune(&mut self, now: DateTime<Utc>) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| now - entry.closed_at <= ttl);
        let entries = &self.entries;
        self.order.retain(|key| entries.contains_key(key));
    }
}
