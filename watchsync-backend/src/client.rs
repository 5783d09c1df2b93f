//! Backend client contract and the Jellyfin-family implementation.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{TimeZone, Utc};
use reqwest::{Method, StatusCode};
use tokio::time::Duration;
use watchsync_model::{MediaType, State};

use crate::error::BackendError;
use crate::queue::{QueuedRequest, UserData};
use crate::types::{normalize_guids, ItemsPage, RemoteItem};

/// Hard timeout for API requests (covers connect + headers + body read).
const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for establishing the TCP connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum number of attempts for transient server errors.
const MAX_RETRIES: u32 = 3;

/// Initial backoff duration before the first retry (doubles each attempt).
const INITIAL_BACKOFF: Duration = Duration::from_secs(2);

/// What the reconciliation core needs from a media-server backend.
///
/// One implementation per server family; the core never sees wire details
/// beyond [`RemoteItem`] and the composed [`QueuedRequest`].
#[allow(async_fn_in_trait)]
pub trait BackendClient {
    /// The configured name of this backend, used as the `via` tag and the
    /// `metadata` key on every observation it produces.
    fn backend_id(&self) -> &str;

    /// Ask the server for its stable unique id.
    async fn identify(&self) -> Result<String, BackendError>;

    /// List the backend's current view as canonical observations,
    /// optionally restricted to items changed after `since` (unix seconds).
    async fn list_items(&self, since: Option<i64>) -> Result<Vec<State>, BackendError>;

    /// Fetch the backend's current view of one item.
    async fn get_item(&self, item_id: &str) -> Result<RemoteItem, BackendError>;

    /// Mark an item played, optionally backdating the play.
    async fn mark_played(&self, item_id: &str, played_at: Option<i64>)
        -> Result<(), BackendError>;

    /// Mark an item unplayed.
    async fn mark_unplayed(&self, item_id: &str) -> Result<(), BackendError>;

    /// Compose the queued request that would converge `item_id` to the
    /// canonical state of `entity`.
    fn play_state_request(&self, item_id: &str, entity: &State) -> QueuedRequest;
}

/// Connection settings for a Jellyfin-family server.
#[derive(Debug, Clone)]
pub struct JellyfinConfig {
    /// Configured backend name (the `via` tag).
    pub name: String,
    /// Server base URL without trailing slash, e.g. `http://media.local:8096`.
    pub base_url: String,
    pub api_key: String,
    pub user_id: String,
}

/// HTTP client for Jellyfin and Emby servers.
///
/// Requests carry explicit timeouts and transient 5xx responses are
/// retried with doubling backoff; everything else surfaces as a typed
/// [`BackendError`] for the caller to count and skip.
pub struct JellyfinClient {
    http: reqwest::Client,
    config: JellyfinConfig,
}

impl JellyfinClient {
    pub fn new(config: JellyfinConfig) -> Result<Self, BackendError> {
        if config.base_url.is_empty() || config.api_key.is_empty() || config.user_id.is_empty() {
            return Err(BackendError::Config(
                "Backend needs base_url, api_key, and user_id".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(API_TIMEOUT)
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    /// Issue a request, retrying transient server errors with backoff.
    async fn send(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response, BackendError> {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            let result = self
                .http
                .request(method.clone(), url)
                .header("X-Emby-Token", &self.config.api_key)
                .query(query)
                .send()
                .await;

            let retryable = match &result {
                Ok(response) => response.status().is_server_error(),
                Err(e) => e.is_connect() || e.is_timeout(),
            };
            if retryable && attempt < MAX_RETRIES {
                log::debug!(
                    "Transient error from {} (attempt {attempt}/{MAX_RETRIES}), \
                     retrying in {}s",
                    self.config.name,
                    backoff.as_secs(),
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
                continue;
            }

            let response = result?;
            return match response.status() {
                StatusCode::NOT_FOUND => Err(BackendError::NotFound),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                    BackendError::Unauthorized(format!("HTTP {}", response.status())),
                ),
                status if !status.is_success() => Err(BackendError::ServerError {
                    status: status.as_u16(),
                    message: response.text().await.unwrap_or_default(),
                }),
                _ => Ok(response),
            };
        }
    }

    /// Resolve the parent show GUIDs for every distinct series referenced
    /// by the listed episodes.
    async fn resolve_series_guids(
        &self,
        items: &[RemoteItem],
    ) -> BTreeMap<String, BTreeMap<String, String>> {
        let series_ids: BTreeSet<String> = items
            .iter()
            .filter(|item| item.media_type() == Some(MediaType::Episode))
            .filter_map(|item| item.series_id.clone())
            .collect();

        let mut resolved = BTreeMap::new();
        for series_id in series_ids {
            match self.get_item(&series_id).await {
                Ok(series) => {
                    resolved.insert(series_id, normalize_guids(&series.provider_ids));
                }
                Err(e) => {
                    log::warn!(
                        "Could not resolve series {series_id} on {}: {e}",
                        self.config.name,
                    );
                }
            }
        }
        resolved
    }
}

impl BackendClient for JellyfinClient {
    fn backend_id(&self) -> &str {
        &self.config.name
    }

    async fn identify(&self) -> Result<String, BackendError> {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "PascalCase")]
        struct ServerInfo {
            id: String,
        }

        let response = self
            .send(Method::GET, &self.url("/System/Info/Public"), &[])
            .await?;
        let info: ServerInfo = response.json().await?;
        Ok(info.id)
    }

    async fn list_items(&self, since: Option<i64>) -> Result<Vec<State>, BackendError> {
        let mut query = vec![
            ("Recursive", "true".to_string()),
            ("IncludeItemTypes", "Movie,Episode".to_string()),
            (
                "Fields",
                "ProviderIds,DateCreated,ParentIndexNumber,IndexNumber".to_string(),
            ),
            ("EnableUserData", "true".to_string()),
        ];
        if let Some(since) = since {
            if let Some(stamp) = Utc.timestamp_opt(since, 0).single() {
                query.push(("MinDateLastSaved", stamp.to_rfc3339()));
            }
        }

        let url = self.url(&format!("/Users/{}/Items", self.config.user_id));
        let response = self.send(Method::GET, &url, &query).await?;
        let page: ItemsPage = response.json().await?;

        let series_guids = self.resolve_series_guids(&page.items).await;
        let empty = BTreeMap::new();

        Ok(page
            .items
            .into_iter()
            .filter_map(|item| {
                let parent = item
                    .series_id
                    .as_ref()
                    .and_then(|id| series_guids.get(id))
                    .unwrap_or(&empty);
                item.into_state(&self.config.name, parent)
            })
            .collect())
    }

    async fn get_item(&self, item_id: &str) -> Result<RemoteItem, BackendError> {
        let url = self.url(&format!(
            "/Users/{}/Items/{item_id}",
            self.config.user_id
        ));
        let query = [("Fields", "ProviderIds,DateCreated".to_string())];
        let response = self.send(Method::GET, &url, &query).await?;
        Ok(response.json().await?)
    }

    async fn mark_played(
        &self,
        item_id: &str,
        played_at: Option<i64>,
    ) -> Result<(), BackendError> {
        let url = self.url(&format!(
            "/Users/{}/PlayedItems/{item_id}",
            self.config.user_id
        ));
        let mut query = Vec::new();
        if let Some(stamp) = played_at.and_then(|ts| Utc.timestamp_opt(ts, 0).single()) {
            query.push(("DatePlayed", stamp.to_rfc3339()));
        }
        self.send(Method::POST, &url, &query).await?;
        Ok(())
    }

    async fn mark_unplayed(&self, item_id: &str) -> Result<(), BackendError> {
        let url = self.url(&format!(
            "/Users/{}/PlayedItems/{item_id}",
            self.config.user_id
        ));
        self.send(Method::DELETE, &url, &[]).await?;
        Ok(())
    }

    fn play_state_request(&self, item_id: &str, entity: &State) -> QueuedRequest {
        let mut url = self.url(&format!(
            "/Users/{}/PlayedItems/{item_id}",
            self.config.user_id
        ));
        let method = if entity.watched {
            if let Some(stamp) = Utc.timestamp_opt(entity.updated, 0).single() {
                url.push_str(&format!("?DatePlayed={}", stamp.to_rfc3339()));
            }
            Method::POST
        } else {
            Method::DELETE
        };

        QueuedRequest {
            method,
            url,
            headers: vec![("X-Emby-Token".to_string(), self.config.api_key.clone())],
            user_data: UserData {
                backend: self.config.name.clone(),
                title: entity.title.clone(),
                media_type: entity.media_type.as_str().to_string(),
                watched: entity.watched,
                updated: entity.updated,
            },
        }
    }
}
