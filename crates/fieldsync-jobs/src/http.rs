//! HTTP transport to the remote attachment service.
//!
//! | Call | Request |
//! |------|---------|
//! | probe | `GET {base}/health` |
//! | upload | `PUT {base}/attachments/{filename}` (multipart) |
//! | delete | `DELETE {base}/attachments/{reference}` |
//!
//! Connection failures, timeouts, 5xx and 429 responses are transient and
//! abort the sync pass; other 4xx responses fail only the item at hand.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, info};

use fieldsync_core::defaults::REMOTE_TIMEOUT_SECS;
use fieldsync_core::{DeleteOperation, Error, RemoteStore, RemoteUpload, Result};

/// Configuration for [`HttpRemoteStore`].
#[derive(Debug, Clone)]
pub struct HttpRemoteConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl HttpRemoteConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout_secs: REMOTE_TIMEOUT_SECS,
        }
    }

    /// Create config from environment variables.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `FIELDSYNC_REMOTE_URL` | (none) | Base URL; `None` when unset |
    /// | `FIELDSYNC_REMOTE_TOKEN` | (none) | Bearer token |
    /// | `FIELDSYNC_REMOTE_TIMEOUT_SECS` | `30` | Per-request timeout |
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("FIELDSYNC_REMOTE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())?;

        let timeout_secs = std::env::var("FIELDSYNC_REMOTE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(REMOTE_TIMEOUT_SECS);

        Some(Self {
            base_url,
            token: std::env::var("FIELDSYNC_REMOTE_TOKEN")
                .ok()
                .filter(|v| !v.is_empty()),
            timeout_secs,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Body the service may return from an upload.
#[derive(Debug, Deserialize)]
struct UploadResponse {
    filename: Option<String>,
}

/// [`RemoteStore`] over HTTP.
pub struct HttpRemoteStore {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpRemoteStore {
    pub fn new(config: HttpRemoteConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("invalid remote URL {:?}: {}", config.base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "remote URL {:?} cannot be a base",
                config.base_url
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        info!(base_url = %base, "Initializing HTTP remote store");
        Ok(Self {
            client,
            base,
            token: config.token,
        })
    }

    /// `{base}/{segments...}` with each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config("remote URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Map a non-success response to an error of the right class.
async fn status_error(response: Response, what: &str) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    classify_status(status, what, body.trim())
}

fn classify_status(status: StatusCode, what: &str, body: &str) -> Error {
    let message = if body.is_empty() {
        format!("{what} returned {status}")
    } else {
        format!("{what} returned {status}: {body}")
    };
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Error::Request(message)
    } else {
        Error::InvalidInput(message)
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn probe(&self) -> Result<()> {
        let url = self.endpoint(&["health"])?;
        let response = self.authorize(self.client.get(url)).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::Sync(format!(
                "health check returned {}",
                response.status()
            )))
        }
    }

    async fn upload(&self, upload: RemoteUpload) -> Result<String> {
        let url = self.endpoint(&["attachments", &upload.filename])?;
        let size = upload.data.len();

        let file = Part::bytes(upload.data)
            .file_name(upload.filename.clone())
            .mime_str(&upload.content_type)
            .map_err(|e| Error::InvalidInput(format!("content type {:?}: {}", upload.content_type, e)))?;
        let form = Form::new()
            .text("attachment_id", upload.attachment_id.to_string())
            .text("owner_id", upload.owner_id)
            .text("photo_kind", upload.photo_kind.as_str())
            .text("content_hash", upload.content_hash)
            .part("file", file);

        let response = self
            .authorize(self.client.put(url))
            .multipart(form)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response, "upload").await);
        }

        // The service may rename the binary; an empty body keeps our key.
        let body = response.text().await?;
        let assigned = serde_json::from_str::<UploadResponse>(&body)
            .ok()
            .and_then(|r| r.filename)
            .filter(|f| !f.is_empty())
            .unwrap_or(upload.filename);

        debug!(attachment_id = %upload.attachment_id, remote_filename = %assigned, size, "Uploaded");
        Ok(assigned)
    }

    async fn delete(&self, tombstone: &DeleteOperation) -> Result<()> {
        let url = self.endpoint(&["attachments", &tombstone.remote_reference])?;
        let response = self.authorize(self.client.delete(url)).send().await?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                debug!(tombstone_id = %tombstone.id, "Remote copy already gone");
                Ok(())
            }
            _ => Err(status_error(response, "delete").await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_encodes_segments() {
        let store = HttpRemoteStore::new(HttpRemoteConfig::new("https://api.example/v1/")).unwrap();
        let url = store
            .endpoint(&["attachments", "https://cdn.example/a b.jpg"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example/v1/attachments/https:%2F%2Fcdn.example%2Fa%20b.jpg"
        );
    }

    #[test]
    fn test_endpoint_without_trailing_slash() {
        let store = HttpRemoteStore::new(HttpRemoteConfig::new("http://localhost:8080")).unwrap();
        assert_eq!(
            store.endpoint(&["health"]).unwrap().as_str(),
            "http://localhost:8080/health"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let err = HttpRemoteStore::new(HttpRemoteConfig::new("not a url")).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "upload", "").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "upload", "").is_transient());

        let err = classify_status(StatusCode::UNPROCESSABLE_ENTITY, "upload", "bad image");
        assert!(!err.is_transient());
        assert_eq!(
            err.to_string(),
            "Invalid input: upload returned 422 Unprocessable Entity: bad image"
        );
    }

    #[test]
    fn test_config_builder() {
        let config = HttpRemoteConfig::new("http://x")
            .with_token("secret")
            .with_timeout_secs(5);
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.timeout_secs, 5);
    }
}
