//! External collaborators the session talks to: token issuing and blob storage.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::BoxFuture;
use crate::error::{AuthError, InkboardError, NetworkError};
use crate::image::{ImageFormat, ImageId};

/// What the token service needs to know about who is joining.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub room: String,
    pub user_id: String,
    pub user_name: String,
    pub user_color: String,
    pub user_role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: String,
}

/// Issues short-lived channel tokens.
pub trait TokenProvider: Send + Sync {
    fn get_token(&self, request: &TokenRequest) -> BoxFuture<'_, Result<String, InkboardError>>;
}

/// Stores image bytes out of band.
pub trait BlobStore: Send + Sync {
    /// Store `bytes` at `path` and return a URL peers can download from.
    fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> BoxFuture<'_, Result<String, NetworkError>>;

    fn download(&self, url: &str) -> BoxFuture<'_, Result<Vec<u8>, NetworkError>>;
}

/// `rooms/{room}/users/{user}/images/{image_id}.{ext}`
pub fn blob_path(room: &str, user_id: &str, image_id: &ImageId, format: ImageFormat) -> String {
    format!(
        "rooms/{}/users/{}/images/{}.{}",
        room,
        user_id,
        image_id,
        format.extension()
    )
}

fn classify(error: reqwest::Error, timeout: Duration) -> NetworkError {
    if error.is_timeout() {
        NetworkError::Timeout(timeout.as_millis() as u64)
    } else if error.is_connect() {
        NetworkError::Connect(error.to_string())
    } else {
        NetworkError::Http(error.to_string())
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, NetworkError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| NetworkError::Http(e.to_string()))
}

// =============================================================================
// HTTP TOKEN PROVIDER
// =============================================================================

/// `POST {endpoint}` with a JSON [`TokenRequest`], expecting `{"token": ".."}`.
pub struct HttpTokenProvider {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpTokenProvider {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, NetworkError> {
        Ok(Self {
            http: build_client(timeout)?,
            endpoint: endpoint.into(),
            timeout,
        })
    }
}

impl TokenProvider for HttpTokenProvider {
    fn get_token(&self, request: &TokenRequest) -> BoxFuture<'_, Result<String, InkboardError>> {
        let request = request.clone();
        Box::pin(async move {
            let response = self
                .http
                .post(&self.endpoint)
                .json(&request)
                .send()
                .await
                .map_err(|e| classify(e, self.timeout))?;

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
                let body = response.text().await.unwrap_or_default();
                return Err(AuthError::Rejected(format!("{}: {}", status, body)).into());
            }
            if !status.is_success() {
                return Err(NetworkError::Http(format!("token service returned {}", status)).into());
            }

            let body: TokenResponse = response
                .json()
                .await
                .map_err(|e| AuthError::Malformed(e.to_string()))?;
            Ok(body.token)
        })
    }
}

// =============================================================================
// HTTP BLOB STORE
// =============================================================================

/// `PUT {base_url}/{path}` returning `{"url": ".."}`; downloads are plain GETs.
pub struct HttpBlobStore {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpBlobStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, NetworkError> {
        Ok(Self {
            http: build_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }
}

impl BlobStore for HttpBlobStore {
    fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> BoxFuture<'_, Result<String, NetworkError>> {
        let url = format!("{}/{}", self.base_url, path);
        let content_type = content_type.to_string();
        Box::pin(async move {
            let response = self
                .http
                .put(&url)
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(bytes)
                .send()
                .await
                .map_err(|e| classify(e, self.timeout))?;
            if !response.status().is_success() {
                return Err(NetworkError::Http(format!("upload returned {}", response.status())));
            }
            let body: UploadResponse = response
                .json()
                .await
                .map_err(|e| NetworkError::Http(e.to_string()))?;
            Ok(body.url)
        })
    }

    fn download(&self, url: &str) -> BoxFuture<'_, Result<Vec<u8>, NetworkError>> {
        let url = url.to_string();
        Box::pin(async move {
            let response = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| classify(e, self.timeout))?;
            if !response.status().is_success() {
                return Err(NetworkError::Http(format!("download returned {}", response.status())));
            }
            let bytes = response
                .bytes()
                .await
                .map_err(|e| classify(e, self.timeout))?;
            Ok(bytes.to_vec())
        })
    }
}

// =============================================================================
// MEMORY BLOB STORE
// =============================================================================

/// In-memory blob store for tests and offline use. URLs are `memory://{path}`.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> BoxFuture<'_, Result<String, NetworkError>> {
        let url = format!("memory://{}", path);
        Box::pin(async move {
            let mut blobs = self
                .blobs
                .write()
                .map_err(|e| NetworkError::Send(format!("Lock error: {}", e)))?;
            blobs.insert(url.clone(), bytes);
            Ok(url)
        })
    }

    fn download(&self, url: &str) -> BoxFuture<'_, Result<Vec<u8>, NetworkError>> {
        let url = url.to_string();
        Box::pin(async move {
            let blobs = self
                .blobs
                .read()
                .map_err(|e| NetworkError::Http(format!("Lock error: {}", e)))?;
            blobs
                .get(&url)
                .cloned()
                .ok_or_else(|| NetworkError::Http(format!("404 Not Found: {}", url)))
        })
    }
}
