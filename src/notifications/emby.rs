use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use lm_core::config::NotifyConfig;
use lm_core::{Error, Result};

/// A media-server library and the folders it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibrarySection {
    pub id: String,
    pub name: String,
    pub locations: Vec<PathBuf>,
}

#[async_trait]
pub trait MediaServerClient: Send + Sync {
    async fn list_sections(&self) -> Result<Vec<LibrarySection>>;

    async fn refresh_section(&self, id: &str) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VirtualFolder {
    name: String,
    item_id: Option<String>,
    #[serde(default)]
    locations: Vec<String>,
}

pub struct EmbyClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl EmbyClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Self {
        let client = Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
            tracing::warn!("Failed to build HTTP client: {}", e);
            Client::new()
        });

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// `None` when notifications are disabled or no server is configured.
    pub fn from_config(config: &NotifyConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let url = config.server_url.as_deref().filter(|u| !u.is_empty())?;
        Some(Self::new(
            url,
            config.api_key.as_deref().unwrap_or_default(),
            Duration::from_secs(config.timeout_secs),
        ))
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = request
            .header("X-Emby-Token", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::transient(format!("Emby {what} request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(Error::transient(format!("Emby {what} failed ({status}): {body}")))
        } else {
            Err(Error::Notification(format!("Emby {what} failed ({status}): {body}")))
        }
    }
}

#[async_trait]
impl MediaServerClient for EmbyClient {
    async fn list_sections(&self) -> Result<Vec<LibrarySection>> {
        let url = format!("{}/emby/Library/VirtualFolders", self.base_url);
        let response = self.send(self.client.get(&url), "library listing").await?;
        let folders: Vec<VirtualFolder> = response
            .json()
            .await
            .map_err(|e| Error::Notification(format!("Unexpected library listing: {e}")))?;

        Ok(folders
            .into_iter()
            .filter_map(|f| {
                let id = f.item_id?;
                Some(LibrarySection {
                    id,
                    name: f.name,
                    locations: f.locations.into_iter().map(PathBuf::from).collect(),
                })
            })
            .collect())
    }

    async fn refresh_section(&self, id: &str) -> Result<()> {
        let url = format!("{}/emby/Items/{}/Refresh", self.base_url, id);
        let request = self.client.post(&url).query(&[
            ("Recursive", "true"),
            ("MetadataRefreshMode", "Default"),
            ("ImageRefreshMode", "Default"),
            ("ReplaceAllMetadata", "false"),
            ("ReplaceAllImages", "false"),
        ]);
        self.send(request, "refresh").await?;
        tracing::debug!(section = id, "Emby section refresh requested");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let url = format!("{}/emby/System/Info/Public", self.base_url);
        self.send(self.client.get(&url), "ping").await?;
        Ok(())
    }
}
