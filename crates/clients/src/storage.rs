//! Object storage (extractor-side reads) and public blob storage (uploads).

use serde::Deserialize;

use vs_domain::config::{BlobStorageConfig, ObjectStorageConfig};
use vs_domain::{Error, Result};

use crate::{execute_with_retry, join_url};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Read-side storage the extractor writes manifests and frames into.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Download an object by URI (absolute, or relative to the store).
    async fn get(&self, uri: &str) -> Result<Vec<u8>>;
}

/// Public blob storage for processed slide images.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload bytes at a deterministic path; returns the public URL.
    /// Re-uploading the same path overwrites identically, keeping the
    /// operation idempotent.
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP object store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpObjectStore {
    pub fn new(cfg: &ObjectStorageConfig, token: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("object store client: {e}")))?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_owned(),
            token,
        })
    }

    fn resolve(&self, uri: &str) -> String {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            uri.to_owned()
        } else {
            join_url(&self.base_url, uri)
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get(&self, uri: &str) -> Result<Vec<u8>> {
        let url = self.resolve(uri);
        let response = execute_with_retry("object_storage", 2, || {
            self.client.get(&url).bearer_auth(&self.token)
        })
        .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Transient(format!("object_storage body: {e}")))?;
        Ok(bytes.to_vec())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP blob store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    url: Option<String>,
}

pub struct HttpBlobStore {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpBlobStore {
    pub fn new(cfg: &BlobStorageConfig, token: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("blob store client: {e}")))?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_owned(),
            token,
        })
    }
}

#[async_trait::async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let url = join_url(&self.base_url, path);
        let response = execute_with_retry("blob_storage", 2, || {
            self.client
                .put(&url)
                .bearer_auth(&self.token)
                .header("Content-Type", content_type)
                .body(bytes.clone())
        })
        .await?;

        // Services that answer with a canonical URL win; otherwise the
        // deterministic upload URL is the public one.
        let parsed: UploadResponse = response.json().await.unwrap_or(UploadResponse { url: None });
        Ok(parsed.url.unwrap_or(url))
    }
}
