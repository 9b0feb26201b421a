//! HTTP implementation of [`RemoteApi`].
//!
//! The HTTP client itself is abstracted by [`HttpClient`] so the engine can
//! run over reqwest in production and over scripted responses in tests.
//! Bodies are JSON; status codes are mapped onto [`RemoteError`].

use crate::environment::{AuthProvider, ConnectivityProbe};
use crate::error::{SyncError, SyncResult};
use crate::remote::{RemoteApi, RemoteError, RemoteResult};
use async_trait::async_trait;
use docsync_protocol::{
    from_json, to_json, BatchRequest, BatchResponse, DocumentWrite, NewFolder, NewWorkspace, Page,
    RemoteDocument, RemoteFolder, RemoteWorkspace, WriteAck,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Bearer token.
    pub bearer: Option<String>,
    /// JSON body.
    pub body: Option<Vec<u8>>,
}

/// A received response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Raw body.
    pub body: Vec<u8>,
}

/// HTTP client abstraction.
///
/// `Err` means no response arrived at all; any status code, including
/// errors, is returned as `Ok`.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String>;
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a client with a per-request timeout.
    pub fn new(timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Remote(RemoteError::Network(e.to_string())))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };
        let mut builder = self.client.request(method, request.url.as_str());
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }
        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// What a 409 means for a given endpoint.
#[derive(Debug, Clone, Copy)]
enum OnConflict {
    Version,
    Exists,
    Batch,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: Option<serde_json::Value>,
    #[serde(default)]
    current_version: Option<u64>,
}

#[derive(Serialize)]
struct DocumentUpdate<'a> {
    #[serde(flatten)]
    write: &'a DocumentWrite,
    expected_version: u64,
}

fn map_status(status: u16, body: &[u8], on_conflict: OnConflict) -> RemoteError {
    let parsed: ErrorBody = serde_json::from_slice(body).unwrap_or_default();
    let message = match parsed.detail {
        Some(serde_json::Value::String(text)) => text,
        Some(other) => other.to_string(),
        None => String::from_utf8_lossy(body).into_owned(),
    };
    match status {
        401 | 403 => RemoteError::Unauthorized(message),
        404 => RemoteError::NotFound(message),
        409 => match on_conflict {
            OnConflict::Version => RemoteError::Conflict {
                current_version: parsed.current_version,
            },
            OnConflict::Exists => RemoteError::AlreadyExists(message),
            OnConflict::Batch => RemoteError::Rejected(message),
        },
        408 | 429 => RemoteError::server(status, message),
        400..=499 => RemoteError::Rejected(message),
        _ => RemoteError::server(status, message),
    }
}

/// Remote store reached over HTTP.
pub struct HttpRemote<C: HttpClient> {
    base_url: String,
    client: C,
    auth: Arc<dyn AuthProvider>,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpRemote<C> {
    /// Creates a remote rooted at `base_url` (for example
    /// `https://docs.example.com`).
    pub fn new(base_url: impl Into<String>, client: C, auth: Arc<dyn AuthProvider>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            auth,
            last_error: RwLock::new(None),
        }
    }

    /// Base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Message of the last failed request.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    async fn exchange(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        on_conflict: OnConflict,
    ) -> RemoteResult<Vec<u8>> {
        let bearer = self
            .auth
            .access_token()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| RemoteError::Unauthorized("no access token".into()))?;
        let request = HttpRequest {
            method,
            url: format!("{}{}", self.base_url, path),
            bearer: Some(bearer),
            body,
        };

        let response = self.client.send(request).await.map_err(|e| {
            warn!(path, error = %e, "request failed");
            *self.last_error.write() = Some(e.clone());
            RemoteError::Network(e)
        })?;

        if (200..300).contains(&response.status) {
            *self.last_error.write() = None;
            return Ok(response.body);
        }
        let err = map_status(response.status, &response.body, on_conflict);
        debug!(path, status = response.status, error = %err, "request refused");
        *self.last_error.write() = Some(err.to_string());
        Err(err)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        on_conflict: OnConflict,
    ) -> RemoteResult<T> {
        let bytes = self.exchange(method, path, body, on_conflict).await?;
        from_json(&bytes).map_err(|e| RemoteError::server(200, format!("malformed response: {e}")))
    }

    fn encode<T: Serialize>(value: &T) -> RemoteResult<Vec<u8>> {
        to_json(value).map_err(|e| RemoteError::Rejected(format!("unencodable request: {e}")))
    }
}

#[async_trait]
impl<C: HttpClient> RemoteApi for HttpRemote<C> {
    async fn create_workspace(&self, body: &NewWorkspace) -> RemoteResult<WriteAck> {
        let body = Self::encode(body)?;
        self.call(Method::Post, "/api/v1/workspaces", Some(body), OnConflict::Exists)
            .await
    }

    async fn list_workspaces(&self) -> RemoteResult<Page<RemoteWorkspace>> {
        self.call(Method::Get, "/api/v1/workspaces", None, OnConflict::Version)
            .await
    }

    async fn delete_workspace(&self, id: &str) -> RemoteResult<()> {
        let path = format!("/api/v1/workspaces/{id}");
        self.exchange(Method::Delete, &path, None, OnConflict::Version)
            .await
            .map(|_| ())
    }

    async fn create_folder(&self, body: &NewFolder) -> RemoteResult<WriteAck> {
        let body = Self::encode(body)?;
        self.call(Method::Post, "/api/v1/folders", Some(body), OnConflict::Exists)
            .await
    }

    async fn list_folders(&self, workspace_id: &str) -> RemoteResult<Page<RemoteFolder>> {
        let path = format!("/api/v1/folders/workspace/{workspace_id}");
        self.call(Method::Get, &path, None, OnConflict::Version).await
    }

    async fn create_document(&self, body: &DocumentWrite) -> RemoteResult<WriteAck> {
        let body = Self::encode(body)?;
        self.call(Method::Post, "/api/v1/documents", Some(body), OnConflict::Exists)
            .await
    }

    async fn update_document(
        &self,
        id: &str,
        body: &DocumentWrite,
        expected_version: u64,
    ) -> RemoteResult<WriteAck> {
        let body = Self::encode(&DocumentUpdate {
            write: body,
            expected_version,
        })?;
        let path = format!("/api/v1/documents/{id}");
        self.call(Method::Patch, &path, Some(body), OnConflict::Version)
            .await
    }

    async fn get_document(&self, id: &str) -> RemoteResult<RemoteDocument> {
        let path = format!("/api/v1/documents/{id}");
        self.call(Method::Get, &path, None, OnConflict::Version).await
    }

    async fn list_documents(&self, workspace_id: &str) -> RemoteResult<Page<RemoteDocument>> {
        let path = format!("/api/v1/documents/workspace/{workspace_id}");
        self.call(Method::Get, &path, None, OnConflict::Version).await
    }

    async fn delete_document(&self, id: &str) -> RemoteResult<()> {
        let path = format!("/api/v1/documents/{id}");
        self.exchange(Method::Delete, &path, None, OnConflict::Version)
            .await
            .map(|_| ())
    }

    async fn batch(&self, request: &BatchRequest) -> RemoteResult<BatchResponse> {
        let body = Self::encode(request)?;
        self.call(
            Method::Post,
            "/api/v1/documents/batch",
            Some(body),
            OnConflict::Batch,
        )
        .await
    }
}

#[async_trait]
impl<C: HttpClient> ConnectivityProbe for HttpRemote<C> {
    /// Any response below 500 from `/health` counts as reachable.
    async fn check(&self) -> bool {
        let request = HttpRequest {
            method: Method::Get,
            url: format!("{}/health", self.base_url),
            bearer: None,
            body: None,
        };
        match self.client.send(request).await {
            Ok(response) => response.status < 500,
            Err(err) => {
                debug!(error = %err, "health check failed");
                false
            }
        }
    }
}

impl<C: HttpClient> std::fmt::Debug for HttpRemote<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemote")
            .field("base_url", &self.base_url)
            .field("last_error", &self.last_error())
            .finish()
    }
}
