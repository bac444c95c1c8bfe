//! Change source adapters and the shared intake.
//!
//! The remote poller, the local watcher and the full scanner each run as
//! their own task and push [`Intake`] items into one bounded channel. A
//! single intake task drains it into the reconciler.

pub mod mount;
pub mod remote;
pub mod scanner;
pub mod settle;
pub mod watcher;

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lm_core::{ChangeEvent, ChangeSource, Observation};

use crate::reconciler::Reconciler;

/// A complete listing of a subtree.
#[derive(Debug, Clone)]
pub struct Listing {
    pub source: ChangeSource,
    /// Relative prefix that was listed; empty for the whole tree.
    pub prefix: String,
    pub observations: Vec<Observation>,
    /// Also walk the target tree under `prefix` for orphans and gaps.
    pub verify_target: bool,
}

/// One unit of work for the reconciler.
#[derive(Debug, Clone)]
pub enum Intake {
    Event(ChangeEvent),
    Listing(Listing),
}

pub type IntakeSender = mpsc::Sender<Intake>;

/// Request for a (sub)tree scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub prefix: String,
    pub reason: String,
}

/// Lets any component ask the scanner for a subtree rescan.
#[derive(Clone)]
pub struct RescanHandle {
    tx: mpsc::UnboundedSender<ScanRequest>,
}

impl RescanHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ScanRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn request(&self, prefix: impl Into<String>, reason: impl Into<String>) {
        let request = ScanRequest {
            prefix: prefix.into(),
            reason: reason.into(),
        };
        tracing::debug!(prefix = %request.prefix, reason = %request.reason, "Rescan requested");
        if self.tx.send(request).is_err() {
            tracing::debug!("Scanner is not running, rescan request dropped");
        }
    }
}

/// Drain the intake into the reconciler until cancelled or every sender is
/// gone.
pub async fn run_intake(reconciler: Arc<Reconciler>, mut rx: mpsc::Receiver<Intake>, cancel: CancellationToken) {
    tracing::info!("Reconciler intake started");
    loop {
        let item = tokio::select! {
            item = rx.recv() => item,
            _ = cancel.cancelled() => break,
        };
        let Some(item) = item else { break };

        if let Err(e) = reconciler.handle(item).await {
            tracing::error!(error = %e, "Failed to reconcile change");
        }
    }
    tracing::info!("Reconciler intake stopped");
}
