//! Live-view credential resolution
//!
//! Ephemeral per-camera signaling data is fetched from the platform's
//! live-view endpoint with a bearer token supplied by an external
//! authentication collaborator. No retries happen here; callers decide.

use crate::camera::CameraDescriptor;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

/// Source of bearer tokens (OAuth acquisition/refresh lives elsewhere)
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// Fixed token, for the CLI and tests
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// ICE server entry handed to the peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Credentials for one establishment attempt. Single-use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveViewCredentials {
    /// Signed signaling channel URL, or the room URL for managed rooms
    pub endpoint: String,
    /// Client/session identifier assigned by the platform
    pub client_id: String,
    pub ice_servers: Vec<IceServer>,
    /// Room join token (managed rooms only)
    pub room_token: Option<String>,
}

/// Anything that can produce live-view credentials for a camera
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self, camera: &CameraDescriptor) -> Result<LiveViewCredentials>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct IceServerBody {
    urls: OneOrMany,
    username: Option<String>,
    credential: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveKitDetails {
    #[serde(rename = "liveKitURL")]
    live_kit_url: Option<String>,
    user_token: Option<String>,
}

/// Response body of the live-view endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveViewBody {
    signed_channel_endpoint: Option<String>,
    client_id: Option<String>,
    #[serde(default)]
    ice_servers: Vec<IceServerBody>,
    live_kit_details: Option<LiveKitDetails>,
}

impl LiveViewBody {
    fn into_credentials(self) -> Result<LiveViewCredentials> {
        let (room_url, room_token) = match self.live_kit_details {
            Some(details) => (details.live_kit_url, details.user_token),
            None => (None, None),
        };

        let endpoint = self
            .signed_channel_endpoint
            .filter(|s| !s.is_empty())
            .or(room_url.filter(|s| !s.is_empty()))
            .ok_or_else(|| {
                Error::CredentialFetch("response has no signaling endpoint".to_string())
            })?;

        let client_id = self
            .client_id
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::CredentialFetch("response has no clientId".to_string()))?;

        let ice_servers = self
            .ice_servers
            .into_iter()
            .map(|s| IceServer {
                urls: match s.urls {
                    OneOrMany::One(url) => vec![url],
                    OneOrMany::Many(urls) => urls,
                },
                username: s.username,
                credential: s.credential,
            })
            .filter(|s| !s.urls.is_empty())
            .collect();

        Ok(LiveViewCredentials {
            endpoint,
            client_id,
            ice_servers,
            room_token,
        })
    }
}

/// Parse a live-view response body
pub fn parse_live_view(body: &str) -> Result<LiveViewCredentials> {
    let parsed: LiveViewBody = serde_json::from_str(body)
        .map_err(|e| Error::CredentialFetch(format!("Malformed live-view body: {}", e)))?;
    parsed.into_credentials()
}

/// HTTP credential source backed by the platform REST API
pub struct CredentialResolver {
    /// Base URL (e.g., "https://api.example.com")
    base_url: String,

    tokens: std::sync::Arc<dyn TokenProvider>,

    client: reqwest::Client,
}

impl CredentialResolver {
    /// Create a resolver
    ///
    /// # Arguments
    ///
    /// * `base_url` - API base URL; the live-view path is appended
    /// * `tokens` - bearer token source
    /// * `timeout` - per-request timeout
    pub fn new(
        base_url: impl Into<String>,
        tokens: std::sync::Arc<dyn TokenProvider>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::InvalidConfig(format!(
                "API base URL must start with http:// or https://, got: {}",
                base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url,
            tokens,
            client,
        })
    }

    fn live_view_url(&self, camera: &CameraDescriptor) -> String {
        format!(
            "{}/v2/cameras/{}/{}/live-view",
            self.base_url, camera.serial, camera.location_id
        )
    }
}

#[async_trait]
impl CredentialSource for CredentialResolver {
    #[instrument(skip(self, camera), fields(camera = %camera.serial))]
    async fn fetch(&self, camera: &CameraDescriptor) -> Result<LiveViewCredentials> {
        let url = self.live_view_url(camera);
        let token = self.tokens.access_token().await?;

        debug!("Fetching live-view credentials: {}", url);

        let response = self
            .client
            .get(&url)
            .header("authorization", format!("Bearer {}", token))
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| Error::CredentialFetch(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::CredentialFetch(format!(
                "HTTP {} {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown"),
                error_text
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::CredentialFetch(format!("Failed to read response: {}", e)))?;

        let credentials = parse_live_view(&body)?;
        debug!(
            client_id = %credentials.client_id,
            ice_servers = credentials.ice_servers.len(),
            "Live-view credentials resolved"
        );
        Ok(credentials)
    }
}
