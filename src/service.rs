//! Service assembly: builds the shared context and runs every task.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use lm_core::events::EventBus;
use lm_core::ChangeSource;
use lm_db::pool::DbPool;

use crate::apply::LinkApplier;
use crate::config::Config;
use crate::context::{AppContext, ConfigStore, Controls};
use crate::notifications::emby::{EmbyClient, MediaServerClient};
use crate::notifications::{Dispatcher, FlushReport, NotificationHandle, NotifyMessage};
use crate::queue::{QueueStats, TaskQueue};
use crate::reconciler::Reconciler;
use crate::sources::mount::{DirectoryProbe, MountProbe};
use crate::sources::remote::{DriveClient, RemoteChangeClient, RemotePoller};
use crate::sources::scanner::{scan_tree, Scanner};
use crate::sources::watcher::LocalWatcher;
use crate::sources::{run_intake, Intake, Listing, RescanHandle, ScanRequest};
use crate::{health, maintenance, server};

const INTAKE_CAPACITY: usize = 1024;

/// External collaborators; replaced by fakes in tests.
pub struct Dependencies {
    pub probe: Arc<dyn MountProbe>,
    pub remote: Option<Arc<dyn RemoteChangeClient>>,
    pub media_server: Option<Arc<dyn MediaServerClient>>,
}

impl Dependencies {
    pub fn from_config(config: &Config) -> Self {
        Self {
            probe: Arc::new(DirectoryProbe::from_config(&config.source)),
            remote: DriveClient::from_config(&config.remote).map(|c| Arc::new(c) as Arc<dyn RemoteChangeClient>),
            media_server: EmbyClient::from_config(&config.notify).map(|c| Arc::new(c) as Arc<dyn MediaServerClient>),
        }
    }
}

/// Outcome of a one-shot synchronization.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub operations: usize,
    pub queue: QueueStats,
    pub notifications: FlushReport,
}

pub struct Service {
    ctx: AppContext,
    rescan_rx: mpsc::UnboundedReceiver<ScanRequest>,
    notify_rx: mpsc::UnboundedReceiver<NotifyMessage>,
}

/// Open (or create) the inventory database.
pub fn open_database(config: &Config) -> Result<DbPool> {
    let db_path = &config.database.path;
    let existed = db_path.exists();
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
            tracing::info!("Created database directory {}", parent.display());
        }
    }
    let db_str = db_path.to_string_lossy();
    let db = lm_db::pool::init_pool(&db_str).with_context(|| format!("Failed to open database {db_str}"))?;
    if existed {
        tracing::info!("Database opened (existing) at {db_str}");
    } else {
        tracing::info!("Database created (new) at {db_str}");
    }
    Ok(db)
}

impl Service {
    /// Build the service with real adapters.
    pub fn build(config: Config, config_path: Option<PathBuf>) -> Result<Self> {
        let db = open_database(&config)?;
        let deps = Dependencies::from_config(&config);
        Ok(Self::with_dependencies(config, config_path, db, deps))
    }

    pub fn with_dependencies(config: Config, config_path: Option<PathBuf>, db: DbPool, deps: Dependencies) -> Self {
        let config = Arc::new(ConfigStore::new(config, config_path));
        let event_bus = Arc::new(EventBus::default());
        let (notifier, notify_rx) = NotificationHandle::channel();
        let (rescan, rescan_rx) = RescanHandle::channel();
        let queue = TaskQueue::new(db.clone(), config.clone(), event_bus.clone());

        let ctx = AppContext {
            db,
            config,
            event_bus,
            controls: Arc::new(Controls::default()),
            queue,
            notifier,
            rescan,
            probe: deps.probe,
            remote: deps.remote,
            media_server: deps.media_server,
        };
        Self {
            ctx,
            rescan_rx,
            notify_rx,
        }
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    fn dispatcher(ctx: &AppContext, rx: mpsc::UnboundedReceiver<NotifyMessage>) -> Dispatcher {
        Dispatcher::new(
            ctx.config.clone(),
            ctx.media_server.clone(),
            &ctx.notifier,
            ctx.event_bus.clone(),
            rx,
        )
    }

    /// Run every task until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let Service {
            ctx,
            rescan_rx,
            notify_rx,
        } = self;
        let config = ctx.config.current();

        let restored = ctx.queue.restore().context("Failed to restore pending operations")?;
        if restored > 0 {
            tracing::info!(restored, "Resuming operations from previous run");
        }

        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_CAPACITY);
        let mut handles = Vec::new();

        let reconciler = Arc::new(Reconciler::new(&ctx));
        handles.push(tokio::spawn(run_intake(reconciler, intake_rx, cancel.clone())));

        let queue = ctx.queue.clone();
        let applier: Arc<dyn crate::queue::OperationHandler> = Arc::new(LinkApplier::new(&ctx));
        let worker_cancel = cancel.clone();
        handles.push(tokio::spawn(async move { queue.run(applier, worker_cancel).await }));

        let scanner = Scanner {
            config: ctx.config.clone(),
            controls: ctx.controls.clone(),
            probe: ctx.probe.clone(),
            intake: intake_tx.clone(),
        };
        handles.push(tokio::spawn(scanner.run(rescan_rx, cancel.clone())));

        let watcher = LocalWatcher {
            config: ctx.config.clone(),
            controls: ctx.controls.clone(),
            probe: ctx.probe.clone(),
            rescan: ctx.rescan.clone(),
            intake: intake_tx.clone(),
        };
        handles.push(tokio::spawn(watcher.run(cancel.clone())));

        match &ctx.remote {
            Some(client) => {
                let poller = RemotePoller {
                    config: ctx.config.clone(),
                    controls: ctx.controls.clone(),
                    db: ctx.db.clone(),
                    client: client.clone(),
                    event_bus: ctx.event_bus.clone(),
                    intake: intake_tx.clone(),
                };
                handles.push(tokio::spawn(poller.run(cancel.clone())));
            }
            None => tracing::info!("Remote polling is disabled"),
        }
        drop(intake_tx);

        handles.push(tokio::spawn(maintenance::run_maintenance(
            ctx.db.clone(),
            ctx.config.clone(),
            cancel.clone(),
        )));
        handles.push(tokio::spawn(health::run_health_loop(ctx.clone(), cancel.clone())));

        // The dispatcher outlives the workers so their last refreshes go out.
        let dispatch_cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(Self::dispatcher(&ctx, notify_rx).run(dispatch_cancel.clone()));

        let server_result = if config.server.enabled {
            server::start_server(ctx.clone(), cancel.clone()).await
        } else {
            cancel.cancelled().await;
            Ok(())
        };
        if server_result.is_err() {
            cancel.cancel();
        }

        tracing::info!("Shutting down...");
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Task ended abnormally");
            }
        }
        dispatch_cancel.cancel();
        if let Err(e) = dispatcher.await {
            tracing::error!(error = %e, "Notification dispatcher ended abnormally");
        }

        tracing::info!("Shutdown complete");
        server_result
    }

    /// Start only the queue workers and the notification dispatcher.
    pub fn start_workers(self) -> Result<Workers> {
        let Service { ctx, notify_rx, .. } = self;
        let restored = ctx.queue.restore().context("Failed to restore pending operations")?;
        if restored > 0 {
            tracing::info!(restored, "Resuming operations from previous run");
        }

        let cancel = CancellationToken::new();
        let queue = ctx.queue.clone();
        let applier: Arc<dyn crate::queue::OperationHandler> = Arc::new(LinkApplier::new(&ctx));
        let worker_cancel = cancel.clone();
        let workers = tokio::spawn(async move { queue.run(applier, worker_cancel).await });
        let dispatch_cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(Self::dispatcher(&ctx, notify_rx).run(dispatch_cancel.clone()));

        Ok(Workers {
            ctx,
            cancel,
            dispatch_cancel,
            workers,
            dispatcher,
        })
    }

    /// Scan once, drain the queue, flush notifications and stop.
    pub async fn run_once(self) -> Result<SyncReport> {
        let workers = self.start_workers()?;
        let ctx = workers.context().clone();
        let config = ctx.config.current();

        let result = Self::sync_pass(&ctx, &config, &workers.cancel).await;
        let notifications = workers.drain().await;
        workers.stop().await;

        let operations = result?;
        Ok(SyncReport {
            operations,
            queue: ctx.queue.stats(),
            notifications,
        })
    }

    async fn sync_pass(ctx: &AppContext, config: &Config, cancel: &CancellationToken) -> Result<usize> {
        let report = ctx.probe.check().await;
        if !report.ready {
            anyhow::bail!("Source is not ready: {}", report.detail);
        }

        let reconciler = Reconciler::new(ctx);
        let root = config.source.root.clone();
        let token = cancel.clone();
        let observations = tokio::task::spawn_blocking(move || scan_tree(&root, "", &token))
            .await
            .context("Scan task failed")??;
        ctx.controls.record_scan();

        let mut operations = reconciler
            .handle(Intake::Listing(Listing {
                source: ChangeSource::Local,
                prefix: String::new(),
                observations,
                verify_target: true,
            }))
            .await?;

        if let Some(client) = &ctx.remote {
            let (tx, mut rx) = mpsc::channel(INTAKE_CAPACITY);
            let poller = RemotePoller {
                config: ctx.config.clone(),
                controls: ctx.controls.clone(),
                db: ctx.db.clone(),
                client: client.clone(),
                event_bus: ctx.event_bus.clone(),
                intake: tx,
            };
            let polled = {
                let poll = poller.poll_once();
                tokio::pin!(poll);
                // Drain concurrently; the poller blocks once the channel is full.
                loop {
                    tokio::select! {
                        result = &mut poll => break result,
                        Some(item) = rx.recv() => operations += reconciler.handle(item).await?,
                    }
                }
            };
            while let Ok(item) = rx.try_recv() {
                operations += reconciler.handle(item).await?;
            }
            match polled {
                Ok(_) => ctx.controls.record_poll(),
                Err(e) => tracing::warn!(error = %e, "Remote poll failed during sync"),
            }
        }

        Ok(operations)
    }
}

/// Running queue workers plus dispatcher, see [`Service::start_workers`].
pub struct Workers {
    ctx: AppContext,
    cancel: CancellationToken,
    dispatch_cancel: CancellationToken,
    workers: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl Workers {
    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    /// Wait for the queue to empty, then flush notifications.
    pub async fn drain(&self) -> FlushReport {
        self.ctx.queue.wait_idle().await;
        match self.ctx.notifier.flush_and_wait().await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "Final notification flush failed");
                FlushReport::default()
            }
        }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.workers.await {
            tracing::error!(error = %e, "Queue workers ended abnormally");
        }
        self.dispatch_cancel.cancel();
        if let Err(e) = self.dispatcher.await {
            tracing::error!(error = %e, "Notification dispatcher ended abnormally");
        }
    }
}
