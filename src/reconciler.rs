//! Turns change events and listings into link operations.
//!
//! The reconciler is the only writer of inventory metadata and runs on the
//! single intake task. It decides per path what the target tree should
//! look like and submits the operations that get it there; the queue and
//! the applier do the rest.

use parking_lot::Mutex;
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lm_core::config::Config;
use lm_core::events::{EventBus, EventPayload};
use lm_core::filter::{PathClass, PathFilter};
use lm_core::{
    ChangeEvent, ChangeKind, ChangeSource, EntryKind, Error, InventoryEntry, LinkState, Observation,
    OperationKind, RenameGroupId, Result, SyncOperation,
};
use lm_db::pool::{get_conn, DbPool};
use lm_db::queries::{dead_letters, inventory, operations};

use crate::context::{AppContext, ConfigStore};
use crate::materializer::is_temp_artifact;
use crate::notifications::NotificationHandle;
use crate::queue::TaskQueue;
use crate::sources::mount::MountProbe;
use crate::sources::{Intake, Listing, RescanHandle};

/// Operations and follow-ups collected while the connection is held.
#[derive(Default)]
struct Plan {
    ops: Vec<SyncOperation>,
    planned: HashSet<String>,
    rescans: Vec<(String, String)>,
}

impl Plan {
    fn push(&mut self, kind: OperationKind, entry: &InventoryEntry, group: Option<RenameGroupId>) {
        let mut op = SyncOperation::new(kind, &entry.path, entry.kind, entry.last_seen_revision);
        if let Some(group) = group {
            op = op.with_group(group);
        }
        self.push_op(op);
    }

    fn push_op(&mut self, op: SyncOperation) {
        self.planned.insert(op.path.clone());
        self.ops.push(op);
    }

    fn plans(&self, path: &str) -> bool {
        self.planned.contains(path)
    }
}

/// What the target tree holds at a path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TargetNode {
    Link(PathBuf),
    Directory,
    Other,
}

pub struct Reconciler {
    db: DbPool,
    config: Arc<ConfigStore>,
    queue: TaskQueue,
    notifier: NotificationHandle,
    probe: Arc<dyn MountProbe>,
    rescan: RescanHandle,
    event_bus: Arc<EventBus>,
    filter: Mutex<Option<(Arc<Config>, Arc<PathFilter>)>>,
}

impl Reconciler {
    pub fn new(ctx: &AppContext) -> Self {
        Self {
            db: ctx.db.clone(),
            config: ctx.config.clone(),
            queue: ctx.queue.clone(),
            notifier: ctx.notifier.clone(),
            probe: ctx.probe.clone(),
            rescan: ctx.rescan.clone(),
            event_bus: ctx.event_bus.clone(),
            filter: Mutex::new(None),
        }
    }

    /// The compiled filter for this config snapshot.
    fn filter_for(&self, config: &Arc<Config>) -> Result<Arc<PathFilter>> {
        let mut cached = self.filter.lock();
        if let Some((snapshot, filter)) = cached.as_ref() {
            if Arc::ptr_eq(snapshot, config) {
                return Ok(filter.clone());
            }
        }
        let filter = Arc::new(PathFilter::from_config(&config.filter)?);
        *cached = Some((config.clone(), filter.clone()));
        Ok(filter)
    }

    /// Reconcile one intake item. Returns the number of operations submitted.
    pub async fn handle(&self, intake: Intake) -> Result<usize> {
        match intake {
            Intake::Event(event) => self.handle_event(event).await,
            Intake::Listing(listing) => self.reconcile_listing(listing).await,
        }
    }

    pub async fn handle_event(&self, event: ChangeEvent) -> Result<usize> {
        let config = self.config.current();
        let filter = self.filter_for(&config)?;

        let needs_mount = event.source == ChangeSource::Local
            && matches!(event.kind, ChangeKind::Deleted | ChangeKind::Renamed { .. });
        if needs_mount && !self.probe.is_ready().await {
            tracing::warn!(path = %event.path, "Source not ready, treating delete as suspect");
            self.request_rescan("", "delete reported while source not ready");
            return Ok(0);
        }

        tracing::debug!(source = %event.source, path = %event.path, kind = ?event.kind, "Reconciling change");

        let mut plan = Plan::default();
        {
            let conn = get_conn(&self.db)?;
            match &event.kind {
                ChangeKind::Created | ChangeKind::Modified => {
                    let obs = event.observation.as_ref().ok_or_else(|| {
                        Error::Validation(format!("change for {} carries no observation", event.path))
                    })?;
                    observe(&conn, &filter, obs, None, &mut plan)?;
                }
                ChangeKind::Deleted => delete_subtree(&conn, &event.path, None, &mut plan)?,
                ChangeKind::Renamed { from } => {
                    let obs = event.observation.as_ref().ok_or_else(|| {
                        Error::Validation(format!("rename to {} carries no observation", event.path))
                    })?;
                    let group = RenameGroupId::new();
                    delete_subtree(&conn, from, Some(group), &mut plan)?;
                    observe(&conn, &filter, obs, Some(group), &mut plan)?;
                    if obs.kind == EntryKind::Directory {
                        plan.rescans.push((obs.path.clone(), format!("directory renamed from {from}")));
                    }
                }
            }
        }

        self.submit(plan).await
    }

    /// Diff the inventory under `listing.prefix` against a complete listing.
    pub async fn reconcile_listing(&self, listing: Listing) -> Result<usize> {
        if listing.source == ChangeSource::Local && !self.probe.is_ready().await {
            tracing::warn!(prefix = %listing.prefix, "Source not ready, discarding listing");
            return Ok(0);
        }

        let config = self.config.current();
        let filter = self.filter_for(&config)?;

        let targets = if listing.verify_target {
            let root = config.target.base.join(&listing.prefix);
            let prefix = listing.prefix.clone();
            tokio::task::spawn_blocking(move || walk_target(&root, &prefix))
                .await
                .map_err(|e| Error::Internal(format!("target walk failed: {e}")))?
        } else {
            HashMap::new()
        };

        let mut plan = Plan::default();
        {
            let conn = get_conn(&self.db)?;
            let mut observed = HashSet::with_capacity(listing.observations.len());
            for obs in &listing.observations {
                if obs.path.is_empty() {
                    continue;
                }
                observe(&conn, &filter, obs, None, &mut plan)?;
                observed.insert(obs.path.as_str());
            }

            for entry in inventory::list_under(&conn, &listing.prefix)? {
                if entry.path == listing.prefix || observed.contains(entry.path.as_str()) {
                    continue;
                }
                delete_entry(&conn, &entry, None, &mut plan)?;
            }

            if listing.verify_target {
                verify_target(&conn, &config, &filter, &listing.prefix, &targets, &mut plan)?;
            }
        }

        let observed = listing.observations.len() as u64;
        let submitted = self.submit(plan).await?;
        tracing::info!(
            source = %listing.source,
            prefix = %listing.prefix,
            observed,
            operations = submitted,
            "Listing reconciled"
        );
        self.event_bus.broadcast(EventPayload::scan_completed(
            listing.source,
            &listing.prefix,
            observed,
            submitted as u64,
        ));
        Ok(submitted)
    }

    fn request_rescan(&self, prefix: &str, reason: &str) {
        self.event_bus.broadcast(EventPayload::RescanRequested {
            prefix: prefix.to_string(),
            reason: reason.to_string(),
        });
        self.rescan.request(prefix, reason);
    }

    async fn submit(&self, plan: Plan) -> Result<usize> {
        let mut groups: HashMap<RenameGroupId, usize> = HashMap::new();
        for group in plan.ops.iter().filter_map(|op| op.group) {
            *groups.entry(group).or_default() += 1;
        }
        for (group, members) in groups {
            self.notifier.expect_group(group, members);
        }

        let count = plan.ops.len();
        for op in plan.ops {
            self.queue.submit(op).await?;
        }
        for (prefix, reason) in plan.rescans {
            self.request_rescan(&prefix, &reason);
        }
        Ok(count)
    }
}

/// Record an observation and plan the operation it implies.
fn observe(
    conn: &Connection,
    filter: &PathFilter,
    obs: &Observation,
    group: Option<RenameGroupId>,
    plan: &mut Plan,
) -> Result<()> {
    let class = filter.classify(&obs.path, obs.kind);
    let existing = inventory::get(conn, &obs.path)?;

    if class == PathClass::Excluded {
        if existing.is_some() {
            tracing::debug!(path = %obs.path, "Path is now excluded, dropping it");
            delete_subtree(conn, &obs.path, group, plan)?;
        }
        return Ok(());
    }

    let Some(mut entry) = existing else {
        let entry = InventoryEntry::from_observation(obs, 1);
        inventory::upsert(conn, &entry)?;
        if class.materializes() {
            plan.push(OperationKind::CreateLink, &entry, group);
        }
        return Ok(());
    };

    let before = entry.clone();
    let changed = entry.content_differs(obs);
    entry.absorb(obs);

    match entry.state {
        LinkState::Linked => {
            if changed || !class.materializes() {
                entry.last_seen_revision += 1;
                inventory::upsert(conn, &entry)?;
                let kind = if class.materializes() {
                    OperationKind::UpdateLink
                } else {
                    OperationKind::RemoveLink
                };
                plan.push(kind, &entry, group);
            } else if entry != before {
                inventory::upsert(conn, &entry)?;
            } else if group.is_some() && !operations::exists_for_path(conn, &entry.path)? {
                // Rename target already linked; still complete the group.
                plan.push(OperationKind::NoOp, &entry, group);
            }
        }
        LinkState::Unlinked => {
            if changed {
                entry.last_seen_revision += 1;
            }
            if entry != before {
                inventory::upsert(conn, &entry)?;
            }
            if class.materializes()
                && (changed
                    || (!operations::exists_for_path(conn, &entry.path)?
                        && !dead_letters::has_unresolved_for_path(conn, &entry.path)?))
            {
                plan.push(OperationKind::CreateLink, &entry, group);
            }
        }
        LinkState::PendingDelete => {
            entry.last_seen_revision += 1;
            entry.state = LinkState::Unlinked;
            inventory::upsert(conn, &entry)?;
            let kind = if class.materializes() {
                OperationKind::CreateLink
            } else {
                OperationKind::RemoveLink
            };
            plan.push(kind, &entry, group);
        }
    }
    Ok(())
}

/// Plan the removal of `path` and everything beneath it.
fn delete_subtree(conn: &Connection, path: &str, group: Option<RenameGroupId>, plan: &mut Plan) -> Result<()> {
    for entry in inventory::list_under(conn, path)? {
        delete_entry(conn, &entry, group, plan)?;
    }
    Ok(())
}

fn delete_entry(conn: &Connection, entry: &InventoryEntry, group: Option<RenameGroupId>, plan: &mut Plan) -> Result<()> {
    if plan.plans(&entry.path) {
        return Ok(());
    }
    let queued = operations::exists_for_path(conn, &entry.path)?;
    match entry.state {
        LinkState::Unlinked if !queued => {
            inventory::remove(conn, &entry.path)?;
        }
        LinkState::PendingDelete
            if queued || dead_letters::has_unresolved_for_path(conn, &entry.path)? => {}
        _ => {
            let revision = entry.last_seen_revision + 1;
            inventory::mark_pending_delete(conn, &entry.path, revision)?;
            let mut pending = entry.clone();
            pending.state = LinkState::PendingDelete;
            pending.last_seen_revision = revision;
            plan.push(OperationKind::RemoveLink, &pending, group);
        }
    }
    Ok(())
}

/// Compare the target tree with the inventory: orphaned links into the
/// source get removed, missing links of linked entries get recreated.
fn verify_target(
    conn: &Connection,
    config: &Config,
    filter: &PathFilter,
    prefix: &str,
    targets: &HashMap<String, TargetNode>,
    plan: &mut Plan,
) -> Result<()> {
    let source_root = &config.source.root;
    let entries: HashMap<String, InventoryEntry> = inventory::list_under(conn, prefix)?
        .into_iter()
        .map(|e| (e.path.clone(), e))
        .collect();

    for (path, node) in targets {
        let TargetNode::Link(dest) = node else { continue };
        // Links into the source that we did not write are left alone; only
        // our own layout and interrupted replacements count as orphans.
        let owned = *dest == source_root.join(path)
            || (is_temp_artifact(path) && dest.starts_with(source_root));
        if !owned || plan.plans(path) {
            continue;
        }
        let entry = entries.get(path);
        if entry.is_some_and(|e| e.state == LinkState::Linked) {
            continue;
        }
        if operations::exists_for_path(conn, path)? {
            continue;
        }
        tracing::info!(path = %path, "Removing orphaned link");
        let revision = entry.map(|e| e.last_seen_revision).unwrap_or(0);
        plan.push_op(SyncOperation::new(OperationKind::RemoveLink, path, EntryKind::File, revision));
    }

    for entry in entries.values() {
        if entry.state != LinkState::Linked
            || entry.path.is_empty()
            || !filter.classify(&entry.path, entry.kind).materializes()
            || plan.plans(&entry.path)
        {
            continue;
        }
        let intact = match (entry.kind, targets.get(&entry.path)) {
            (EntryKind::Directory, Some(TargetNode::Directory)) => true,
            (EntryKind::File, Some(TargetNode::Link(dest))) => *dest == source_root.join(&entry.path),
            _ => false,
        };
        if intact || operations::exists_for_path(conn, &entry.path)? {
            continue;
        }
        tracing::info!(path = %entry.path, "Linked entry is missing from target, recreating");
        plan.push(OperationKind::CreateLink, entry, None);
    }
    Ok(())
}

/// Everything under `root`, keyed by path relative to the target base.
fn walk_target(root: &Path, prefix: &str) -> HashMap<String, TargetNode> {
    let mut nodes = HashMap::new();
    if !root.exists() {
        return nodes;
    }
    for entry in walkdir::WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable target entry");
                continue;
            }
        };
        let Ok(rel) = entry.path().strip_prefix(root) else { continue };
        let rel = lm_core::normalize_path(&rel.to_string_lossy());
        let path = if prefix.is_empty() { rel } else { format!("{prefix}/{rel}") };

        let file_type = entry.file_type();
        let node = if file_type.is_symlink() {
            match std::fs::read_link(entry.path()) {
                Ok(dest) => TargetNode::Link(dest),
                Err(_) => TargetNode::Other,
            }
        } else if file_type.is_dir() {
            TargetNode::Directory
        } else {
            TargetNode::Other
        };
        nodes.insert(path, node);
    }
    nodes
}
