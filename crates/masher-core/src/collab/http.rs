//! HTTP adapters for the master mirror and the message bus.

use std::time::Duration;

use async_trait::async_trait;
use masher_state::RepoKey;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{BusMessage, CollabError, CollabResult, MessageBus, MirrorStatus};

fn build_client(service: &'static str, timeout_ms: u64) -> CollabResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("masher/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_millis(timeout_ms.max(1)))
        .build()
        .map_err(|e| CollabError::Rejected {
            service,
            reason: format!("cannot build HTTP client: {e}"),
        })
}

fn request_error(service: &'static str, err: reqwest::Error, timeout_ms: u64) -> CollabError {
    if err.is_timeout() {
        CollabError::Timeout {
            service,
            timeout_ms,
        }
    } else {
        CollabError::Request {
            service,
            reason: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Mirror
// ---------------------------------------------------------------------------

const MIRROR: &str = "mirror";

/// Fetches `<base>/<release>/<request>/repodata/repomd.json` from the master
/// mirror and hashes it.
pub struct HttpMirrorStatus {
    base_url: String,
    timeout_ms: u64,
    http_client: reqwest::Client,
}

impl HttpMirrorStatus {
    pub fn new(base_url: &str, timeout_ms: u64) -> CollabResult<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_ms,
            http_client: build_client(MIRROR, timeout_ms)?,
        })
    }

    pub fn index_url(&self, repo: &RepoKey) -> String {
        format!(
            "{}/{}/{}/repodata/repomd.json",
            self.base_url,
            repo.release_prefix(),
            repo.request.as_str()
        )
    }
}

#[async_trait]
impl MirrorStatus for HttpMirrorStatus {
    async fn index_digest(&self, repo: &RepoKey) -> CollabResult<Option<String>> {
        let url = self.index_url(repo);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| request_error(MIRROR, e, self.timeout_ms))?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(url = %url, "mirror has no index yet");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CollabError::Request {
                service: MIRROR,
                reason: format!("GET {url}: HTTP {}", response.status()),
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| request_error(MIRROR, e, self.timeout_ms))?;
        Ok(Some(hex::encode(Sha256::digest(&bytes))))
    }
}

// ---------------------------------------------------------------------------
// Message bus
// ---------------------------------------------------------------------------

const BUS: &str = "bus";

/// Posts each message as JSON to a bus gateway endpoint.
pub struct HttpBus {
    url: String,
    timeout_ms: u64,
    http_client: reqwest::Client,
}

impl HttpBus {
    pub fn new(url: &str, timeout_ms: u64) -> CollabResult<Self> {
        Ok(Self {
            url: url.to_string(),
            timeout_ms,
            http_client: build_client(BUS, timeout_ms)?,
        })
    }
}

#[async_trait]
impl MessageBus for HttpBus {
    async fn publish(&self, message: &BusMessage) -> CollabResult<()> {
        let response = self
            .http_client
            .post(&self.url)
            .json(message)
            .send()
            .await
            .map_err(|e| request_error(BUS, e, self.timeout_ms))?;
        if !response.status().is_success() {
            return Err(CollabError::Request {
                service: BUS,
                reason: format!("{} publish: HTTP {}", message.topic, response.status()),
            });
        }
        Ok(())
    }
}
