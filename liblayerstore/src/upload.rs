//! Blob upload client for the fetch agent's ingest side.

use std::path::Path;

use async_trait::async_trait;
use reqwest::Client;
use tracing::info;

use crate::error::{Result, StoreError};

/// Receives the staged blobs of an export. The agent on the other end
/// moves them into the shared content-addressed store.
#[async_trait]
pub trait RemoteBlobStore: Send + Sync {
    /// Uploads every blob under `dir`. Files are named by their hash.
    async fn upload_tree(&self, dir: &Path) -> Result<()>;
}

/// Talks to the local fetch agent. The upload request names the
/// staging directory and the agent reads the blobs from disk itself,
/// the same arrangement the fetch side uses.
pub struct HttpBlobStore {
    base: String,
    client: Client,
}

impl HttpBlobStore {
    pub fn new(base: impl Into<String>) -> Self {
        HttpBlobStore {
            base: base.into(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl RemoteBlobStore for HttpBlobStore {
    async fn upload_tree(&self, dir: &Path) -> Result<()> {
        let url = format!("{}/upload", self.base);
        let response = self
            .client
            .post(&url)
            .form(&[("PATH", dir.display().to_string())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(StoreError::Upload(format!(
                "agent answered {} for {}",
                response.status(),
                dir.display()
            )));
        }
        info!(dir = %dir.display(), "staged blobs uploaded");
        Ok(())
    }
}
