use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Pending {
    last_change: Instant,
    created: bool,
}

/// Tracks paths and determines when they've "settled" (stopped changing).
///
/// A path that was created while being tracked stays a creation even if
/// later writes are reported as modifications.
#[derive(Debug)]
pub struct FileSettleTracker {
    pending: HashMap<String, Pending>,
    settle_duration: Duration,
}

impl FileSettleTracker {
    pub fn new(settle_duration: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            settle_duration,
        }
    }

    /// Record a write to `path` at `now`.
    pub fn touch(&mut self, path: String, created: bool, now: Instant) {
        let entry = self.pending.entry(path).or_insert(Pending {
            last_change: now,
            created,
        });
        entry.last_change = now;
        entry.created |= created;
    }

    /// Take every path that has been quiet for the settle duration.
    /// Returns `(path, created)` pairs.
    pub fn take_settled(&mut self, now: Instant) -> Vec<(String, bool)> {
        let settled: Vec<(String, bool)> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_change) >= self.settle_duration)
            .map(|(path, p)| (path.clone(), p.created))
            .collect();
        for (path, _) in &settled {
            self.pending.remove(path);
        }
        settled
    }

    /// Stop tracking a path (deleted or renamed away).
    pub fn remove(&mut self, path: &str) -> bool {
        self.pending.remove(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
