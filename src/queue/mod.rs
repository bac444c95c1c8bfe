//! Durable task queue with per-path ordering, retries and dead letters.
//!
//! Every submission is written to the `operations` table before workers can
//! see it, so a restart resumes with [`TaskQueue::restore`]. At most one
//! operation per path runs at a time; a newer submission for a running path
//! waits behind it and cancels the running one's retry.

mod state;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use lm_core::events::{EventBus, EventPayload};
use lm_core::{Error, OperationId, Result, SyncOperation};
use lm_db::pool::{get_conn, DbPool};
use lm_db::queries::{dead_letters, inventory, operations};

use crate::context::ConfigStore;
use state::QueueState;

/// Executes one operation. Implemented by the link applier.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn apply(&self, op: &SyncOperation) -> Result<()>;
}

/// Counters exposed on the status surface.
#[derive(Debug, Default)]
struct Counters {
    applied: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    superseded: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub in_flight: usize,
    pub applied: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub superseded: u64,
}

struct Inner {
    state: Mutex<QueueState>,
    db: DbPool,
    config: Arc<ConfigStore>,
    event_bus: Arc<EventBus>,
    seq: AtomicU64,
    work_ready: Notify,
    space_free: Notify,
    idle: Notify,
    counters: Counters,
}

/// Cheaply cloneable handle to the shared queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    pub fn new(db: DbPool, config: Arc<ConfigStore>, event_bus: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                db,
                config,
                event_bus,
                seq: AtomicU64::new(0),
                work_ready: Notify::new(),
                space_free: Notify::new(),
                idle: Notify::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Reload persisted operations after a restart. Returns how many were
    /// restored.
    pub fn restore(&self) -> Result<usize> {
        let conn = get_conn(&self.inner.db)?;
        let persisted = operations::list_all(&conn)?;
        let max_seq = operations::max_seq(&conn)?;
        drop(conn);

        self.inner.seq.fetch_max(max_seq, Ordering::SeqCst);
        let now = Utc::now();
        let count = persisted.len();
        {
            let mut state = self.inner.state.lock();
            for p in persisted {
                let ready_at = p.op.next_retry_at.and_then(|at| {
                    (at - now).to_std().ok().map(|wait| Instant::now() + wait)
                });
                state.insert(p.op, p.seq, ready_at);
            }
        }
        if count > 0 {
            tracing::info!(count, "Restored queued operations");
            self.inner.work_ready.notify_waiters();
        }
        Ok(count)
    }

    /// Queue an operation, replacing any pending one for the same path.
    ///
    /// Waits while the queue already holds `queue.max_depth` distinct
    /// paths.
    pub async fn submit(&self, op: SyncOperation) -> Result<()> {
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let conn = get_conn(&self.inner.db)?;
            operations::upsert(&conn, &op, seq)?;
        }

        tracing::debug!(
            op = %op.id,
            path = %op.path,
            kind = %op.kind,
            revision = op.revision,
            "Submitting operation"
        );

        let mut waiting = false;
        loop {
            let space = self.inner.space_free.notified();
            tokio::pin!(space);
            space.as_mut().enable();
            {
                let max_depth = self.inner.config.current().queue.max_depth;
                let mut state = self.inner.state.lock();
                if state.has_room(&op.path, max_depth) {
                    state.insert(op, seq, None);
                    break;
                }
            }
            if !waiting {
                tracing::debug!(path = %op.path, "Queue full, waiting for capacity");
                waiting = true;
            }
            space.await;
        }

        self.inner.work_ready.notify_waiters();
        Ok(())
    }

    /// Whether an operation for `path` is queued or running.
    pub fn has_pending(&self, path: &str) -> bool {
        self.inner.state.lock().contains(path)
    }

    pub fn depth(&self) -> usize {
        self.inner.state.lock().pending_len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.state.lock().in_flight_len()
    }

    pub fn stats(&self) -> QueueStats {
        let (depth, in_flight) = {
            let state = self.inner.state.lock();
            (state.pending_len(), state.in_flight_len())
        };
        let c = &self.inner.counters;
        QueueStats {
            depth,
            in_flight,
            applied: c.applied.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            superseded: c.superseded.load(Ordering::Relaxed),
        }
    }

    /// Wait until nothing is queued, delayed or running.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.inner.state.lock().is_idle() {
                return;
            }
            idle.await;
        }
    }

    /// Resubmit a dead-lettered operation at the entry's current revision.
    pub async fn retry_dead_letter(&self, id: i64) -> Result<OperationId> {
        let (letter, revision) = {
            let conn = get_conn(&self.inner.db)?;
            let letter = dead_letters::get(&conn, id)?
                .ok_or_else(|| Error::not_found("dead letter", id))?;
            if letter.is_resolved() {
                return Err(Error::Validation(format!("dead letter {id} was already retried")));
            }
            let revision = inventory::get(&conn, &letter.path)?
                .map(|e| e.last_seen_revision)
                .unwrap_or(letter.revision);
            dead_letters::mark_resolved(&conn, id)?;
            (letter, revision)
        };

        let op = SyncOperation::new(letter.kind, &letter.path, letter.entry_kind, revision);
        let op_id = op.id;
        tracing::info!(dead_letter = id, op = %op_id, path = %letter.path, "Retrying dead letter");
        self.submit(op).await?;
        Ok(op_id)
    }

    /// Run `queue.max_workers` workers until `cancel` fires. Each worker
    /// finishes the operation in hand before it stops.
    pub async fn run(&self, handler: Arc<dyn OperationHandler>, cancel: CancellationToken) {
        let workers = self.inner.config.current().queue.max_workers.max(1);
        tracing::info!(workers, "Task queue started");

        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let queue = self.clone();
                let handler = handler.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { queue.worker(worker, handler, cancel).await })
            })
            .collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Queue worker panicked");
            }
        }

        tracing::info!("Task queue stopped");
    }

    async fn worker(&self, worker: usize, handler: Arc<dyn OperationHandler>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let wake = self.inner.work_ready.notified();
            tokio::pin!(wake);
            wake.as_mut().enable();

            let (next, deadline) = {
                let mut state = self.inner.state.lock();
                let next = state.next_ready(Instant::now());
                (next, state.next_deadline())
            };

            match next {
                Some((op, seq)) => {
                    self.inner.space_free.notify_waiters();
                    self.execute(worker, handler.as_ref(), op, seq).await;
                }
                None => {
                    let sleep_for = deadline
                        .map(|at| at.saturating_duration_since(Instant::now()))
                        .unwrap_or(Duration::from_secs(3600));
                    tokio::select! {
                        _ = &mut wake => {}
                        _ = tokio::time::sleep(sleep_for) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }
        tracing::debug!(worker, "Queue worker stopped");
    }

    async fn execute(&self, worker: usize, handler: &dyn OperationHandler, mut op: SyncOperation, seq: u64) {
        let path = op.path.clone();
        let result = handler.apply(&op).await;

        match result {
            Ok(()) => {
                self.inner.counters.applied.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(worker, op = %op.id, path = %path, kind = %op.kind, "Operation applied");
                self.inner.state.lock().finish(&path);
            }
            Err(e) if self.inner.state.lock().is_superseded(&path, op.id) => {
                self.inner.counters.superseded.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(op = %op.id, path = %path, error = %e, "Failed operation was superseded");
                self.inner.state.lock().finish(&path);
            }
            Err(e) => {
                op.attempt_count += 1;
                let policy = self.inner.config.current().queue.retry.clone();
                if e.is_retryable() && !policy.exhausted(op.attempt_count) {
                    self.schedule_retry(op, seq, &policy, e);
                } else {
                    self.dead_letter(op, e);
                }
            }
        }

        self.inner.work_ready.notify_waiters();
        if self.inner.state.lock().is_idle() {
            self.inner.idle.notify_waiters();
        }
    }

    fn schedule_retry(&self, mut op: SyncOperation, seq: u64, policy: &lm_core::RetryPolicy, error: Error) {
        let delay = policy.delay(op.attempt_count - 1);
        op.next_retry_at = chrono::Duration::from_std(delay).ok().map(|d| Utc::now() + d);

        tracing::warn!(
            op = %op.id,
            path = %op.path,
            attempt = op.attempt_count,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Operation failed, retrying"
        );

        if let Err(db_err) = get_conn(&self.inner.db).and_then(|conn| operations::reschedule(&conn, &op)) {
            tracing::error!(op = %op.id, error = %db_err, "Failed to persist retry schedule");
        }

        self.inner.counters.retried.fetch_add(1, Ordering::Relaxed);
        self.inner.event_bus.broadcast(EventPayload::OperationRetrying {
            op_id: op.id,
            path: op.path.clone(),
            attempt: op.attempt_count,
            delay_ms: delay.as_millis() as u64,
            error: error.to_string(),
        });

        let path = op.path.clone();
        if !self.inner.state.lock().requeue(op, seq, Instant::now() + delay) {
            self.inner.counters.superseded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(path = %path, "Retry dropped, newer operation queued");
        }
    }

    fn dead_letter(&self, op: SyncOperation, error: Error) {
        tracing::error!(
            op = %op.id,
            path = %op.path,
            kind = %op.kind,
            attempts = op.attempt_count,
            error_kind = error.kind(),
            error = %error,
            "Operation dead-lettered"
        );

        match get_conn(&self.inner.db).and_then(|conn| dead_letters::record(&conn, &op, &error)) {
            Ok(id) => tracing::debug!(dead_letter = id, path = %op.path, "Dead letter recorded"),
            Err(db_err) => tracing::error!(op = %op.id, error = %db_err, "Failed to record dead letter"),
        }

        self.inner.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.inner.event_bus.broadcast(EventPayload::OperationDeadLettered {
            op_id: op.id,
            path: op.path.clone(),
            error_kind: error.kind().to_string(),
            error: error.to_string(),
        });
        self.inner.state.lock().finish(&op.path);
    }
}
