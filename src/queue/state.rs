//! In-memory scheduling state for the task queue.
//!
//! Holds at most one pending operation per path. A path that is in flight
//! is never handed out again until its worker finishes; a newer submission
//! for it waits in `pending` and marks the running one as superseded.
//! Heap entries are validated lazily against `pending` when popped.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use lm_core::{OperationId, SyncOperation};

#[derive(Debug)]
struct Pending {
    op: SyncOperation,
    seq: u64,
    ready_at: Option<Instant>,
}

#[derive(Debug)]
struct InFlight {
    id: OperationId,
    superseded: bool,
}

/// Highest priority first, then lowest sequence number.
#[derive(Debug, PartialEq, Eq)]
struct ReadyKey {
    priority: i32,
    seq: u64,
    path: String,
}

impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    pending: HashMap<String, Pending>,
    ready: BinaryHeap<ReadyKey>,
    delayed: BinaryHeap<Reverse<(Instant, u64, String)>>,
    in_flight: HashMap<String, InFlight>,
}

impl QueueState {
    /// Whether a submission for `path` fits under `max_depth`. Replacing an
    /// already-pending path always fits.
    pub fn has_room(&self, path: &str, max_depth: usize) -> bool {
        self.pending.contains_key(path) || self.pending.len() < max_depth
    }

    /// Queue `op`, replacing any pending operation for its path. Returns the
    /// replaced operation, if any.
    pub fn insert(&mut self, op: SyncOperation, seq: u64, ready_at: Option<Instant>) -> Option<SyncOperation> {
        let path = op.path.clone();
        if let Some(running) = self.in_flight.get_mut(&path) {
            running.superseded = true;
        }
        let priority = op.priority;
        let replaced = self
            .pending
            .insert(path.clone(), Pending { op, seq, ready_at })
            .map(|p| p.op);
        if !self.in_flight.contains_key(&path) {
            self.schedule(path, priority, seq, ready_at);
        }
        replaced
    }

    fn schedule(&mut self, path: String, priority: i32, seq: u64, ready_at: Option<Instant>) {
        match ready_at {
            Some(at) if at > Instant::now() => self.delayed.push(Reverse((at, seq, path))),
            _ => self.ready.push(ReadyKey { priority, seq, path }),
        }
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse((at, _, _))) = self.delayed.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((_, seq, path))) = self.delayed.pop() else {
                break;
            };
            if let Some(p) = self.pending.get(&path) {
                if p.seq == seq && !self.in_flight.contains_key(&path) {
                    self.ready.push(ReadyKey {
                        priority: p.op.priority,
                        seq,
                        path,
                    });
                }
            }
        }
    }

    /// Take the best ready operation and mark its path in flight.
    pub fn next_ready(&mut self, now: Instant) -> Option<(SyncOperation, u64)> {
        self.promote_due(now);
        while let Some(key) = self.ready.pop() {
            if self.in_flight.contains_key(&key.path) {
                continue;
            }
            let valid = matches!(
                self.pending.get(&key.path),
                Some(p) if p.seq == key.seq && p.ready_at.map_or(true, |at| at <= now)
            );
            if !valid {
                continue;
            }
            let Some(pending) = self.pending.remove(&key.path) else {
                continue;
            };
            self.in_flight.insert(
                key.path,
                InFlight {
                    id: pending.op.id,
                    superseded: false,
                },
            );
            return Some((pending.op, pending.seq));
        }
        None
    }

    /// Earliest time a delayed operation may become ready.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse((at, _, _))| *at)
    }

    /// Whether the in-flight operation for `path` has been replaced by a
    /// newer submission.
    pub fn is_superseded(&self, path: &str, id: OperationId) -> bool {
        self.in_flight
            .get(path)
            .map_or(true, |f| f.id != id || f.superseded)
    }

    /// Release `path` after its worker finishes and make any waiting
    /// operation for it schedulable.
    pub fn finish(&mut self, path: &str) {
        self.in_flight.remove(path);
        if let Some(p) = self.pending.get(path) {
            let (priority, seq, ready_at) = (p.op.priority, p.seq, p.ready_at);
            self.schedule(path.to_string(), priority, seq, ready_at);
        }
    }

    /// Put a failed operation back for another attempt, unless a newer
    /// submission replaced it meanwhile. Returns false when superseded.
    pub fn requeue(&mut self, op: SyncOperation, seq: u64, ready_at: Instant) -> bool {
        let path = op.path.clone();
        if self.is_superseded(&path, op.id) {
            self.finish(&path);
            return false;
        }
        self.in_flight.remove(&path);
        let priority = op.priority;
        self.pending.insert(
            path.clone(),
            Pending {
                op,
                seq,
                ready_at: Some(ready_at),
            },
        );
        self.schedule(path, priority, seq, Some(ready_at));
        true
    }

    pub fn contains(&self, path: &str) -> bool {
        self.pending.contains_key(path) || self.in_flight.contains_key(path)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lm_core::{EntryKind, OperationKind};
    use std::time::Duration;

    fn op(path: &str, kind: OperationKind, entry_kind: EntryKind) -> SyncOperation {
        SyncOperation::new(kind, path, entry_kind, 1)
    }

    fn link(path: &str) -> SyncOperation {
        op(path, OperationKind::CreateLink, EntryKind::File)
    }

    #[test]
    fn priority_then_fifo() {
        let mut state = QueueState::default();
        let now = Instant::now();
        state.insert(link("b.mkv"), 1, None);
        state.insert(link("a.mkv"), 2, None);
        state.insert(op("Movies", OperationKind::CreateLink, EntryKind::Directory), 3, None);
        state.insert(op("Old", OperationKind::RemoveLink, EntryKind::Directory), 4, None);

        let order: Vec<String> = std::iter::from_fn(|| state.next_ready(now).map(|(o, _)| o.path)).collect();
        assert_eq!(order, vec!["Movies", "b.mkv", "a.mkv", "Old"]);
    }

    #[test]
    fn resubmission_replaces_pending() {
        let mut state = QueueState::default();
        let first = link("a.mkv");
        let second = op("a.mkv", OperationKind::RemoveLink, EntryKind::File);
        state.insert(first.clone(), 1, None);
        let replaced = state.insert(second.clone(), 2, None);
        assert_eq!(replaced.map(|o| o.id), Some(first.id));
        assert_eq!(state.pending_len(), 1);

        let (next, seq) = state.next_ready(Instant::now()).unwrap();
        assert_eq!(next.id, second.id);
        assert_eq!(seq, 2);
        assert!(state.next_ready(Instant::now()).is_none());
    }

    #[test]
    fn in_flight_path_is_exclusive() {
        let mut state = QueueState::default();
        let first = link("a.mkv");
        state.insert(first.clone(), 1, None);
        let (running, _) = state.next_ready(Instant::now()).unwrap();

        let newer = op("a.mkv", OperationKind::UpdateLink, EntryKind::File);
        state.insert(newer.clone(), 2, None);
        assert!(state.is_superseded("a.mkv", running.id));
        assert!(state.next_ready(Instant::now()).is_none());

        state.finish("a.mkv");
        let (next, _) = state.next_ready(Instant::now()).unwrap();
        assert_eq!(next.id, newer.id);
    }

    #[test]
    fn superseded_retry_is_discarded() {
        let mut state = QueueState::default();
        state.insert(link("a.mkv"), 1, None);
        let (running, seq) = state.next_ready(Instant::now()).unwrap();
        let newer = op("a.mkv", OperationKind::RemoveLink, EntryKind::File);
        state.insert(newer.clone(), 2, None);

        assert!(!state.requeue(running, seq, Instant::now()));
        let (next, _) = state.next_ready(Instant::now()).unwrap();
        assert_eq!(next.id, newer.id);
    }

    #[test]
    fn delayed_retry_waits_for_deadline() {
        let mut state = QueueState::default();
        state.insert(link("a.mkv"), 1, None);
        let (running, seq) = state.next_ready(Instant::now()).unwrap();

        let at = Instant::now() + Duration::from_secs(60);
        assert!(state.requeue(running.clone(), seq, at));
        assert!(state.next_ready(Instant::now()).is_none());
        assert_eq!(state.next_deadline(), Some(at));
        assert!(!state.is_idle());

        let (again, _) = state.next_ready(at + Duration::from_millis(1)).unwrap();
        assert_eq!(again.id, running.id);
    }

    #[test]
    fn depth_counts_distinct_paths() {
        let mut state = QueueState::default();
        state.insert(link("a.mkv"), 1, None);
        assert!(!state.has_room("b.mkv", 1));
        assert!(state.has_room("a.mkv", 1));
    }
}
