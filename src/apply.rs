//! Queue handler that materializes operations and commits them.

use async_trait::async_trait;
use std::sync::Arc;

use lm_core::events::{EventBus, EventPayload};
use lm_core::{Error, OperationKind, Result, SyncOperation};
use lm_db::pool::{get_conn, DbPool};
use lm_db::queries::inventory;

use crate::context::{AppContext, ConfigStore};
use crate::materializer::Materializer;
use crate::notifications::NotificationHandle;
use crate::queue::OperationHandler;
use crate::sources::mount::MountProbe;

/// Applies one operation: readiness checks, filesystem mutation, inventory
/// commit and media-server notification.
pub struct LinkApplier {
    db: DbPool,
    config: Arc<ConfigStore>,
    probe: Arc<dyn MountProbe>,
    notifier: NotificationHandle,
    event_bus: Arc<EventBus>,
}

impl LinkApplier {
    pub fn new(ctx: &AppContext) -> Self {
        Self {
            db: ctx.db.clone(),
            config: ctx.config.clone(),
            probe: ctx.probe.clone(),
            notifier: ctx.notifier.clone(),
            event_bus: ctx.event_bus.clone(),
        }
    }

    async fn ensure_source(&self, materializer: &Materializer, op: &SyncOperation) -> Result<()> {
        let report = self.probe.check().await;
        if !report.ready {
            return Err(Error::transient(format!("source root not ready: {}", report.detail)));
        }
        let source = materializer.source_path(&op.path);
        match tokio::fs::symlink_metadata(&source).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::transient(format!(
                "{} is not visible on the mount yet",
                source.display()
            ))),
            Err(e) => Err(Error::transient(format!("cannot stat {}: {e}", source.display()))),
        }
    }
}

#[async_trait]
impl OperationHandler for LinkApplier {
    async fn apply(&self, op: &SyncOperation) -> Result<()> {
        let config = self.config.current();
        let materializer = Materializer::from_config(&config);

        if matches!(op.kind, OperationKind::CreateLink | OperationKind::UpdateLink) {
            self.ensure_source(&materializer, op).await?;
        }

        let outcome = {
            let materializer = materializer.clone();
            let op = op.clone();
            tokio::task::spawn_blocking(move || materializer.apply(&op))
                .await
                .map_err(|e| Error::Internal(format!("materializer task failed: {e}")))??
        };

        let committed = {
            let conn = get_conn(&self.db)?;
            inventory::commit_applied(&conn, op)?
        };
        if !committed {
            tracing::debug!(op = %op.id, path = %op.path, "Inventory moved on, commit was a no-op");
        }

        tracing::debug!(op = %op.id, path = %op.path, kind = %op.kind, ?outcome, "Operation committed");
        self.event_bus.broadcast(EventPayload::OperationApplied {
            op_id: op.id,
            path: op.path.clone(),
            kind: op.kind,
            changed: outcome.mutated(),
        });

        self.notifier
            .applied(materializer.target_path(&op.path), op.group, outcome.mutated());
        Ok(())
    }
}
