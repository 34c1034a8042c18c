//! Stream key lookup and destination URLs

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{HelixCredentials, PipelineConfig};
use crate::error::{CastError, Result};

/// Upper bound on each Helix request
const HELIX_TIMEOUT: Duration = Duration::from_secs(10);

/// Supplies the secret stream key appended to the ingest URL
#[async_trait]
pub trait StreamKeyProvider: Send + Sync {
    /// Fetch the stream key
    async fn stream_key(&self) -> Result<String>;
}

/// A stream key known up front
#[derive(Clone)]
pub struct StaticStreamKey(String);

impl StaticStreamKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl std::fmt::Debug for StaticStreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StaticStreamKey").field(&"****").finish()
    }
}

#[async_trait]
impl StreamKeyProvider for StaticStreamKey {
    async fn stream_key(&self) -> Result<String> {
        if self.0.trim().is_empty() {
            return Err(CastError::credentials("stream key is empty"));
        }
        Ok(self.0.clone())
    }
}

/// Reads the stream key from an environment variable at start time
#[derive(Debug, Clone)]
pub struct EnvStreamKey {
    var: String,
}

impl EnvStreamKey {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    /// Variable name
    pub fn var(&self) -> &str {
        &self.var
    }
}

#[async_trait]
impl StreamKeyProvider for EnvStreamKey {
    async fn stream_key(&self) -> Result<String> {
        match std::env::var(&self.var) {
            Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
            Ok(_) => Err(CastError::credentials(format!("{} is empty", self.var))),
            Err(_) => Err(CastError::credentials(format!("{} is not set", self.var))),
        }
    }
}

/// Looks the stream key up through the Twitch Helix API
///
/// Without a user access token an app token is requested with the client
/// secret first. Twitch only hands out stream keys to user tokens carrying
/// the `channel:read:stream_key` scope, so a rejected app token surfaces as a
/// credentials error naming the missing scope.
pub struct HelixStreamKey {
    http: reqwest::Client,
    credentials: HelixCredentials,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct StreamKeyResponse {
    data: Vec<StreamKeyEntry>,
}

#[derive(Deserialize)]
struct StreamKeyEntry {
    stream_key: String,
}

#[derive(Deserialize)]
struct HelixErrorBody {
    message: String,
}

impl HelixStreamKey {
    pub fn new(credentials: HelixCredentials) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HELIX_TIMEOUT)
            .user_agent(concat!("castwire/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http, credentials }
    }

    /// Credentials in use
    pub fn credentials(&self) -> &HelixCredentials {
        &self.credentials
    }

    async fn access_token(&self) -> Result<String> {
        if let Some(token) = self.credentials.access_token.as_deref() {
            return Ok(token.to_string());
        }

        let url = format!("{}/token", self.credentials.auth_url);
        debug!("Requesting app access token from {}", url);
        let response = self
            .http
            .post(&url)
            .form(&[
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|e| CastError::credentials(format!("Token request failed: {}", e)))?;

        let token: TokenResponse = read_json(response, "Token request").await?;
        Ok(token.access_token)
    }
}

impl std::fmt::Debug for HelixStreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("HelixStreamKey").field(&self.credentials).finish()
    }
}

#[async_trait]
impl StreamKeyProvider for HelixStreamKey {
    async fn stream_key(&self) -> Result<String> {
        let token = self.access_token().await?;

        let url = format!("{}/streams/key", self.credentials.api_url);
        debug!("Fetching stream key for user {} from {}", self.credentials.user_id, url);
        let response = self
            .http
            .get(&url)
            .query(&[("broadcaster_id", self.credentials.user_id.as_str())])
            .header("Client-Id", self.credentials.client_id.as_str())
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| CastError::credentials(format!("Stream key request failed: {}", e)))?;

        let body: StreamKeyResponse = read_json(response, "Stream key request").await?;
        let key = body
            .data
            .into_iter()
            .map(|entry| entry.stream_key)
            .find(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                CastError::credentials(format!(
                    "Twitch returned no stream key for user {}",
                    self.credentials.user_id
                ))
            })?;

        info!("Fetched stream key for user {}", self.credentials.user_id);
        Ok(key)
    }
}

/// Decode a JSON body, turning error statuses into credentials errors
async fn read_json<T: DeserializeOwned>(response: reqwest::Response, what: &str) -> Result<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| CastError::credentials(format!("{} failed: {}", what, e)))?;

    if !status.is_success() {
        let message = serde_json::from_str::<HelixErrorBody>(&body)
            .map(|err| err.message)
            .unwrap_or(body);
        return Err(CastError::credentials(format!(
            "{} returned {}: {}",
            what,
            status,
            message.trim()
        )));
    }

    serde_json::from_str(&body)
        .map_err(|e| CastError::credentials(format!("{} returned unexpected JSON: {}", what, e)))
}

/// Pick the provider a config asks for
///
/// An explicit key wins, then Twitch credentials, then the environment.
pub fn provider_for(config: &PipelineConfig) -> Box<dyn StreamKeyProvider> {
    match (&config.stream_key, &config.helix) {
        (Some(key), _) => Box::new(StaticStreamKey::new(key.clone())),
        (None, Some(helix)) => Box::new(HelixStreamKey::new(helix.clone())),
        (None, None) => Box::new(EnvStreamKey::new(config.stream_key_env.clone())),
    }
}

/// Full publish destination
#[derive(Clone, PartialEq, Eq)]
pub struct Destination {
    ingest_url: String,
    stream_key: String,
}

impl Destination {
    pub fn new(ingest_url: impl Into<String>, stream_key: impl Into<String>) -> Self {
        Self {
            ingest_url: ingest_url.into().trim_end_matches('/').to_string(),
            stream_key: stream_key.into(),
        }
    }

    /// Ingest URL without the key
    pub fn ingest_url(&self) -> &str {
        &self.ingest_url
    }

    /// The secret key
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// `<ingest_url>/<stream_key>`
    pub fn url(&self) -> String {
        if self.stream_key.is_empty() {
            self.ingest_url.clone()
        } else {
            format!("{}/{}", self.ingest_url, self.stream_key)
        }
    }

    /// URL safe for logs, with the key masked
    pub fn masked(&self) -> String {
        if self.stream_key.is_empty() {
            return self.ingest_url.clone();
        }
        let visible: String = self.stream_key.chars().take(4).collect();
        format!("{}/{}****", self.ingest_url, visible)
    }

    /// Whether this destination is a local FLV file rather than an RTMP server
    pub fn is_file(&self) -> bool {
        self.ingest_url.starts_with("file://") || self.ingest_url.ends_with(".flv")
    }
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Destination").field(&self.masked()).finish()
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.masked())
    }
}
