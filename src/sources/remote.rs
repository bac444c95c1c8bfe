//! Remote change poller.
//!
//! Asks the cloud drive for changes since the last resumption token and
//! turns them into change events. The token is persisted only after every
//! event of a page has been accepted by the intake, so a crash replays at
//! most one page.

use async_trait::async_trait;
use chrono::DateTime;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use lm_core::config::RemoteConfig;
use lm_core::events::{EventBus, EventPayload};
use lm_core::{ChangeEvent, ChangeSource, Observation, RetryPolicy};
use lm_db::pool::{get_conn, DbPool};
use lm_db::queries::{cursors, inventory};

use super::{Intake, IntakeSender, Listing};
use crate::context::{Adapter, ConfigStore, Controls};

/// Cursor row holding the changes page token.
pub const CURSOR_NAME: &str = "remote.changes";

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const MAX_PARENT_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("authorization expired (HTTP {status})")]
    AuthExpired { status: u16 },

    #[error("server error (HTTP {status})")]
    Server { status: u16 },

    #[error("request rejected (HTTP {status}): {message}")]
    Client { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<RemoteError> for lm_core::Error {
    fn from(e: RemoteError) -> Self {
        lm_core::Error::TransientSource(e.to_string())
    }
}

/// One changed file. `observation` is `None` when the file left the view
/// (removed, trashed, or moved out of the root folder).
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub file_id: String,
    pub observation: Option<Observation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangePage {
    pub changes: Vec<RemoteChange>,
    pub new_token: String,
    pub has_more: bool,
}

#[async_trait]
pub trait RemoteChangeClient: Send + Sync {
    async fn start_token(&self) -> Result<String, RemoteError>;

    async fn list_changes_since(&self, token: &str) -> Result<ChangePage, RemoteError>;

    /// Every file and folder beneath `root_id`.
    async fn list_all(&self, root_id: &str) -> Result<Vec<Observation>, RemoteError>;

    async fn ping(&self) -> Result<(), RemoteError>;
}

// ---------------------------------------------------------------------------
// Drive v3 client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    parents: Vec<String>,
    size: Option<String>,
    modified_time: Option<String>,
    md5_checksum: Option<String>,
    #[serde(default)]
    trashed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveChange {
    file_id: String,
    #[serde(default)]
    removed: bool,
    file: Option<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeList {
    next_page_token: Option<String>,
    new_start_page_token: Option<String>,
    #[serde(default)]
    changes: Vec<DriveChange>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    next_page_token: Option<String>,
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartToken {
    start_page_token: String,
}

#[derive(Debug, Clone)]
enum TokenSource {
    None,
    Static(String),
    /// Re-read on every request; an external helper refreshes it.
    File(PathBuf),
}

pub struct DriveClient {
    client: Client,
    api_base: String,
    root_id: String,
    token: TokenSource,
    page_size: u32,
    /// Folder id to (name, parent id).
    folders: Mutex<HashMap<String, (String, Option<String>)>>,
}

impl DriveClient {
    pub fn new(config: &RemoteConfig, root_id: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build HTTP client with timeout: {}", e);
                Client::new()
            });
        let token = match (&config.access_token, &config.token_path) {
            (Some(token), _) => TokenSource::Static(token.clone()),
            (None, Some(path)) => TokenSource::File(PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())),
            (None, None) => TokenSource::None,
        };

        Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            root_id: root_id.to_string(),
            token,
            page_size: config.page_size.max(1),
            folders: Mutex::new(HashMap::new()),
        }
    }

    /// `None` when remote polling is disabled or no folder is configured.
    pub fn from_config(config: &RemoteConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let root = config.folder_id.as_deref()?;
        Some(Self::new(config, root))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path)
    }

    fn bearer(&self) -> Result<Option<String>, RemoteError> {
        match &self.token {
            TokenSource::None => Ok(None),
            TokenSource::Static(token) => Ok(Some(token.clone())),
            TokenSource::File(path) => std::fs::read_to_string(path)
                .map(|t| Some(t.trim().to_string()))
                .map_err(|e| RemoteError::Transport(format!("cannot read token file {}: {e}", path.display()))),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, RemoteError> {
        let mut request = self.client.get(self.url(path)).query(query);
        if let Some(token) = self.bearer()? {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let response = check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn folder(&self, id: &str) -> Result<(String, Option<String>), RemoteError> {
        if let Some(hit) = self.folders.lock().get(id) {
            return Ok(hit.clone());
        }
        let file: DriveFile = self
            .get_json(&format!("files/{id}"), &[("fields", "id,name,parents".to_string())])
            .await?;
        let value = (file.name, file.parents.first().cloned());
        self.folders.lock().insert(id.to_string(), value.clone());
        Ok(value)
    }

    /// Path of `file` relative to the root folder, or `None` if it lives
    /// elsewhere.
    async fn resolve_path(&self, file: &DriveFile) -> Result<Option<String>, RemoteError> {
        if file.id == self.root_id {
            return Ok(None);
        }
        let mut components = vec![file.name.clone()];
        let mut parent = file.parents.first().cloned();
        for _ in 0..MAX_PARENT_DEPTH {
            let Some(id) = parent else { return Ok(None) };
            if id == self.root_id {
                components.reverse();
                return Ok(Some(components.join("/")));
            }
            let (name, next) = self.folder(&id).await?;
            components.push(name);
            parent = next;
        }
        Ok(None)
    }

    async fn to_change(&self, change: DriveChange) -> Result<RemoteChange, RemoteError> {
        let observation = match change.file {
            Some(file) if !change.removed && !file.trashed => {
                if file.mime_type == FOLDER_MIME {
                    // Renames invalidate cached folder names.
                    self.folders.lock().remove(&file.id);
                }
                match self.resolve_path(&file).await? {
                    Some(path) => to_observation(&file, &path),
                    None => None,
                }
            }
            _ => None,
        };
        Ok(RemoteChange {
            file_id: change.file_id,
            observation,
        })
    }
}

fn to_observation(file: &DriveFile, path: &str) -> Option<Observation> {
    if file.mime_type == FOLDER_MIME {
        return Some(Observation::directory(path).with_remote_id(&file.id));
    }
    // Native documents have no bytes on the mount.
    if file.mime_type.starts_with("application/vnd.google-apps.") {
        return None;
    }
    let size = file.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0);
    let mtime = file
        .modified_time
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.timestamp())
        .unwrap_or(0);
    let mut obs = Observation::file(path, size, mtime).with_remote_id(&file.id);
    if let Some(md5) = &file.md5_checksum {
        obs = obs.with_fingerprint(format!("md5:{md5}"));
    }
    Some(obs)
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            Err(RemoteError::RateLimited { retry_after })
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RemoteError::AuthExpired {
            status: status.as_u16(),
        }),
        s if s.is_server_error() => Err(RemoteError::Server { status: s.as_u16() }),
        s => {
            let message = response.text().await.unwrap_or_default();
            Err(RemoteError::Client {
                status: s.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl RemoteChangeClient for DriveClient {
    async fn start_token(&self) -> Result<String, RemoteError> {
        let token: StartToken = self.get_json("changes/startPageToken", &[]).await?;
        Ok(token.start_page_token)
    }

    async fn list_changes_since(&self, token: &str) -> Result<ChangePage, RemoteError> {
        let list: ChangeList = self
            .get_json(
                "changes",
                &[
                    ("pageToken", token.to_string()),
                    ("pageSize", self.page_size.to_string()),
                    ("includeRemoved", "true".to_string()),
                    (
                        "fields",
                        "nextPageToken,newStartPageToken,changes(fileId,removed,file(id,name,mimeType,parents,size,modifiedTime,md5Checksum,trashed))".to_string(),
                    ),
                ],
            )
            .await?;

        let mut changes = Vec::with_capacity(list.changes.len());
        for change in list.changes {
            changes.push(self.to_change(change).await?);
        }

        let (new_token, has_more) = match (list.next_page_token, list.new_start_page_token) {
            (Some(next), _) => (next, true),
            (None, Some(start)) => (start, false),
            (None, None) => return Err(RemoteError::Decode("change list carries no page token".into())),
        };
        Ok(ChangePage {
            changes,
            new_token,
            has_more,
        })
    }

    async fn list_all(&self, root_id: &str) -> Result<Vec<Observation>, RemoteError> {
        let mut observations = Vec::new();
        let mut folders: VecDeque<(String, String)> = VecDeque::from([(root_id.to_string(), String::new())]);

        while let Some((folder_id, prefix)) = folders.pop_front() {
            let mut page_token: Option<String> = None;
            loop {
                let mut query = vec![
                    ("q", format!("'{folder_id}' in parents and trashed = false")),
                    ("pageSize", self.page_size.to_string()),
                    (
                        "fields",
                        "nextPageToken,files(id,name,mimeType,parents,size,modifiedTime,md5Checksum)".to_string(),
                    ),
                ];
                if let Some(token) = &page_token {
                    query.push(("pageToken", token.clone()));
                }
                let list: FileList = self.get_json("files", &query).await?;

                for file in list.files {
                    let path = if prefix.is_empty() {
                        file.name.clone()
                    } else {
                        format!("{prefix}/{}", file.name)
                    };
                    if file.mime_type == FOLDER_MIME {
                        self.folders
                            .lock()
                            .insert(file.id.clone(), (file.name.clone(), Some(folder_id.clone())));
                        folders.push_back((file.id.clone(), path.clone()));
                    }
                    if let Some(obs) = to_observation(&file, &path) {
                        observations.push(obs);
                    }
                }

                match list.next_page_token {
                    Some(next) => page_token = Some(next),
                    None => break,
                }
            }
        }
        Ok(observations)
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let _: serde_json::Value = self
            .get_json("about", &[("fields", "user".to_string())])
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Store(#[from] lm_core::Error),

    #[error("intake closed")]
    IntakeClosed,
}

/// How long to wait after the `failures`-th consecutive failure.
pub fn backoff_for(error: &PollError, policy: &RetryPolicy, failures: u32) -> Duration {
    let attempt = failures.saturating_sub(1);
    match error {
        PollError::Remote(RemoteError::RateLimited { retry_after }) => {
            retry_after.unwrap_or_default().max(policy.delay(attempt))
        }
        PollError::Remote(RemoteError::AuthExpired { .. }) => policy.max_delay(),
        _ => policy.delay(attempt),
    }
}

pub struct RemotePoller {
    pub config: Arc<ConfigStore>,
    pub controls: Arc<Controls>,
    pub db: DbPool,
    pub client: Arc<dyn RemoteChangeClient>,
    pub event_bus: Arc<EventBus>,
    pub intake: IntakeSender,
}

impl RemotePoller {
    async fn send(&self, intake: Intake) -> Result<(), PollError> {
        self.intake.send(intake).await.map_err(|_| PollError::IntakeClosed)
    }

    /// Match a remote change against the inventory by file id.
    fn to_event(&self, change: RemoteChange) -> Result<Option<ChangeEvent>, PollError> {
        let conn = get_conn(&self.db)?;
        let known = inventory::get_by_remote_id(&conn, &change.file_id)?;
        let event = match (change.observation, known) {
            (None, Some(entry)) => Some(ChangeEvent::deleted(ChangeSource::Remote, &entry.path)),
            (None, None) => None,
            (Some(obs), Some(entry)) if entry.path != obs.path => {
                Some(ChangeEvent::renamed(ChangeSource::Remote, &entry.path, obs))
            }
            (Some(obs), Some(_)) => Some(ChangeEvent::modified(ChangeSource::Remote, obs)),
            (Some(obs), None) => Some(ChangeEvent::created(ChangeSource::Remote, obs)),
        };
        Ok(event)
    }

    /// Fetch and forward every change since the stored token. Returns the
    /// number of events forwarded.
    pub async fn poll_once(&self) -> Result<u64, PollError> {
        let config = self.config.current();
        let stored = {
            let conn = get_conn(&self.db)?;
            cursors::get_token(&conn, CURSOR_NAME)?
        };

        let mut token = match stored {
            Some(token) => token,
            None => {
                let start = self.client.start_token().await?;
                if config.remote.initial_listing {
                    if let Some(root) = &config.remote.folder_id {
                        let observations = self.client.list_all(root).await?;
                        tracing::info!(entries = observations.len(), "Initial remote listing fetched");
                        self.send(Intake::Listing(Listing {
                            source: ChangeSource::Remote,
                            prefix: String::new(),
                            observations,
                            verify_target: false,
                        }))
                        .await?;
                    }
                }
                let conn = get_conn(&self.db)?;
                cursors::set_token(&conn, CURSOR_NAME, &start)?;
                tracing::info!("Remote change tracking initialized");
                return Ok(0);
            }
        };

        let mut forwarded = 0u64;
        loop {
            let page = self.client.list_changes_since(&token).await?;
            let count = page.changes.len();
            for change in page.changes {
                if let Some(event) = self.to_event(change)? {
                    self.send(Intake::Event(event.with_revision(token.clone()))).await?;
                    forwarded += 1;
                }
            }

            {
                let conn = get_conn(&self.db)?;
                cursors::set_token(&conn, CURSOR_NAME, &page.new_token)?;
            }
            tracing::debug!(changes = count, has_more = page.has_more, "Remote change page processed");
            token = page.new_token;
            if !page.has_more {
                break;
            }
        }
        Ok(forwarded)
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!("Remote poller started");
        let mut failures = 0u32;

        loop {
            let config = self.config.current();
            let interval = Duration::from_secs(config.remote.poll_interval_secs);

            let wait = if self.controls.is_paused(Adapter::Remote) {
                tracing::debug!("Remote adapter paused, skipping poll");
                interval
            } else {
                let result = tokio::select! {
                    result = self.poll_once() => result,
                    _ = cancel.cancelled() => break,
                };
                match result {
                    Ok(changes) => {
                        failures = 0;
                        self.controls.record_poll();
                        self.event_bus.broadcast(EventPayload::PollCompleted { changes });
                        if changes > 0 {
                            tracing::info!(changes, "Remote poll forwarded changes");
                        }
                        interval
                    }
                    Err(PollError::IntakeClosed) => break,
                    Err(e) => {
                        failures += 1;
                        let wait = backoff_for(&e, &config.remote.retry, failures);
                        match &e {
                            PollError::Remote(RemoteError::AuthExpired { .. }) => {
                                tracing::error!(error = %e, "Remote credentials rejected, waiting for a new token")
                            }
                            _ => tracing::warn!(
                                error = %e,
                                failures,
                                retry_in_ms = wait.as_millis() as u64,
                                "Remote poll failed"
                            ),
                        }
                        wait
                    }
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => break,
            }
        }
        tracing::info!("Remote poller stopped");
    }
}
