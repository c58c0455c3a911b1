//! Clients for the out-of-process collaborators of the lazy filesystem:
//! the local fetch agent that places blobs into the private cache, and
//! the optional monitor told about every placeholder access.

use std::path::Path;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use crate::error::{LazyFsError, Result};

/// Default address of the local fetch agent.
pub const DEFAULT_AGENT: &str = "http://localhost:2020";

/// Agent that downloads the blob named by a content hash into a target
/// directory. Success is observed as file presence; the call has no
/// timeout of its own, a hung agent stalls the read that triggered it.
#[async_trait]
pub trait FetchAgent: Send + Sync {
    /// Place the blob `hash` inside directory `dir` under its hash name,
    /// created with permission bits `perm`.
    async fn fetch(&self, hash: &str, dir: &Path, perm: u32) -> Result<()>;
}

/// Sink for access events fired when a placeholder is resolved.
#[async_trait]
pub trait AccessMonitor: Send + Sync {
    async fn record(&self, origin: &Path, hash: &str);
}

/// Fetch agent reached over local HTTP: `POST {base}/get/{hash}` with the
/// destination directory and permission bits as form fields.
pub struct HttpFetchAgent {
    base: String,
    client: Client,
}

impl HttpFetchAgent {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        HttpFetchAgent {
            base: base.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl FetchAgent for HttpFetchAgent {
    async fn fetch(&self, hash: &str, dir: &Path, perm: u32) -> Result<()> {
        let url = format!("{}/get/{}", self.base, hash);
        let form = [
            ("PATH", dir.to_string_lossy().into_owned()),
            ("PERM", format!("{:04o}", perm & 0o7777)),
        ];
        debug!(%url, dir = %dir.display(), "requesting blob from fetch agent");
        let resp = self.client.post(&url).form(&form).send().await?;
        if !resp.status().is_success() {
            return Err(LazyFsError::FetchFailed {
                hash: hash.to_string(),
                reason: format!("agent returned {}", resp.status()),
            });
        }
        Ok(())
    }
}

/// Monitor reached over HTTP: `POST {base}/event`. Delivery is best
/// effort, failures are logged and swallowed so an unreachable monitor
/// never breaks a read.
pub struct HttpMonitor {
    base: String,
    client: Client,
}

impl HttpMonitor {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        HttpMonitor {
            base: base.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl AccessMonitor for HttpMonitor {
    async fn record(&self, origin: &Path, hash: &str) {
        let url = format!("{}/event", self.base);
        let form = [
            ("path", origin.to_string_lossy().into_owned()),
            ("hash", hash.to_string()),
        ];
        match self.client.post(&url).form(&form).send().await {
            Ok(resp) if !resp.status().is_success() => {
                warn!(status = %resp.status(), "monitor rejected access event");
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "failed to deliver access event"),
        }
    }
}
