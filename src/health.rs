//! Dependency health checks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use lm_db::pool::get_conn;
use lm_db::queries::maintenance;

use crate::context::AppContext;

/// Free space below which the target filesystem is reported unhealthy.
const MIN_FREE_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct DependencyHealth {
    pub name: &'static str,
    pub healthy: bool,
    pub detail: String,
}

impl DependencyHealth {
    fn ok(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            healthy: true,
            detail: detail.into(),
        }
    }

    fn failed(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            healthy: false,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
    pub checks: Vec<DependencyHealth>,
}

impl HealthReport {
    pub fn failures(&self) -> impl Iterator<Item = &DependencyHealth> {
        self.checks.iter().filter(|c| !c.healthy)
    }
}

async fn check_mount(ctx: &AppContext) -> DependencyHealth {
    let report = ctx.probe.check().await;
    if report.ready {
        DependencyHealth::ok("mount", report.detail)
    } else {
        DependencyHealth::failed("mount", report.detail)
    }
}

async fn check_remote(ctx: &AppContext) -> DependencyHealth {
    match &ctx.remote {
        None => DependencyHealth::ok("remote_api", "disabled"),
        Some(client) => match client.ping().await {
            Ok(()) => DependencyHealth::ok("remote_api", "reachable"),
            Err(e) => DependencyHealth::failed("remote_api", e.to_string()),
        },
    }
}

async fn check_media_server(ctx: &AppContext) -> DependencyHealth {
    match &ctx.media_server {
        None => DependencyHealth::ok("media_server", "disabled"),
        Some(client) => match client.ping().await {
            Ok(()) => DependencyHealth::ok("media_server", "reachable"),
            Err(e) => DependencyHealth::failed("media_server", e.to_string()),
        },
    }
}

async fn check_store(ctx: &AppContext) -> DependencyHealth {
    let db = ctx.db.clone();
    let result = tokio::task::spawn_blocking(move || {
        let conn = get_conn(&db)?;
        maintenance::check_writable(&conn)
    })
    .await;
    match result {
        Ok(Ok(())) => DependencyHealth::ok("store", "writable"),
        Ok(Err(e)) => DependencyHealth::failed("store", e.to_string()),
        Err(e) => DependencyHealth::failed("store", format!("check panicked: {e}")),
    }
}

#[cfg(unix)]
fn free_bytes(path: &Path) -> Result<u64, String> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(|e| e.to_string())?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

#[cfg(not(unix))]
fn free_bytes(_path: &Path) -> Result<u64, String> {
    Err("free space is not reported on this platform".into())
}

fn check_disk(target: &Path) -> DependencyHealth {
    match free_bytes(target) {
        Ok(free) if free < MIN_FREE_BYTES => {
            DependencyHealth::failed("disk", format!("{free} bytes free on {}", target.display()))
        }
        Ok(free) => DependencyHealth::ok("disk", format!("{free} bytes free")),
        // Unknown free space is not a failure.
        Err(e) => DependencyHealth::ok("disk", e),
    }
}

/// Check every dependency concurrently.
pub async fn check_all(ctx: &AppContext) -> HealthReport {
    let target = ctx.config.current().target.base.clone();
    let (mount, remote, media, store) = tokio::join!(
        check_mount(ctx),
        check_remote(ctx),
        check_media_server(ctx),
        check_store(ctx),
    );
    let disk = check_disk(&target);

    let checks = vec![mount, remote, media, store, disk];
    HealthReport {
        healthy: checks.iter().all(|c| c.healthy),
        checked_at: Utc::now(),
        checks,
    }
}

/// Log unhealthy dependencies every `health.interval_secs`.
pub async fn run_health_loop(ctx: AppContext, cancel: CancellationToken) {
    let mut was_healthy = true;
    loop {
        let interval = Duration::from_secs(ctx.config.current().health.interval_secs.max(1));
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => break,
        }

        let report = check_all(&ctx).await;
        for check in report.failures() {
            tracing::warn!(dependency = check.name, detail = %check.detail, "Dependency unhealthy");
        }
        if report.healthy && !was_healthy {
            tracing::info!("All dependencies healthy again");
        }
        was_healthy = report.healthy;
    }
}
