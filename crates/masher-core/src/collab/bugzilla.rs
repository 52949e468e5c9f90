//! `BugTracker` adapters: Bugzilla REST and a log-only tracker.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, instrument};

use super::{BugTracker, CollabError, CollabResult};

const SERVICE: &str = "bugzilla";

/// Bugzilla 5 REST client (`/rest/bug/<id>`).
pub struct BugzillaClient {
    base_url: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl BugzillaClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout_ms: u64) -> CollabResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("masher/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .build()
            .map_err(|e| CollabError::Rejected {
                service: SERVICE,
                reason: format!("cannot build HTTP client: {e}"),
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            http_client,
        })
    }

    fn bug_url(&self, bug_id: u64) -> String {
        format!("{}/bug/{bug_id}", self.base_url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> CollabResult<()> {
        let request = match &self.api_key {
            Some(key) => request.header("X-BUGZILLA-API-KEY", key),
            None => request,
        };
        let response = request.send().await.map_err(|e| classify(&e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        let reason = format!("HTTP {status}: {body}");
        if status.is_server_error() || status.as_u16() == 429 {
            Err(CollabError::Request {
                service: SERVICE,
                reason,
            })
        } else {
            Err(CollabError::Rejected {
                service: SERVICE,
                reason,
            })
        }
    }
}

fn classify(err: &reqwest::Error) -> CollabError {
    if err.is_timeout() {
        CollabError::Timeout {
            service: SERVICE,
            timeout_ms: 0,
        }
    } else {
        CollabError::Request {
            service: SERVICE,
            reason: err.to_string(),
        }
    }
}

pub(crate) fn close_body(comment: &str) -> serde_json::Value {
    json!({
        "status": "CLOSED",
        "resolution": "ERRATA",
        "comment": { "body": comment },
    })
}

#[async_trait]
impl BugTracker for BugzillaClient {
    #[instrument(skip(self, comment))]
    async fn close(&self, bug_id: u64, comment: &str) -> CollabResult<()> {
        let request = self
            .http_client
            .put(self.bug_url(bug_id))
            .json(&close_body(comment));
        self.send(request).await
    }

    #[instrument(skip(self, text))]
    async fn comment(&self, bug_id: u64, text: &str) -> CollabResult<()> {
        let request = self
            .http_client
            .post(format!("{}/comment", self.bug_url(bug_id)))
            .json(&json!({ "comment": text }));
        self.send(request).await
    }

    #[instrument(skip(self))]
    async fn update_title(&self, bug_id: u64, title: &str) -> CollabResult<()> {
        let request = self
            .http_client
            .put(self.bug_url(bug_id))
            .json(&json!({ "summary": title }));
        self.send(request).await
    }
}

/// Tracker used when no Bugzilla endpoint is configured: logs and succeeds.
#[derive(Debug, Default, Clone)]
pub struct LogBugTracker;

#[async_trait]
impl BugTracker for LogBugTracker {
    async fn close(&self, bug_id: u64, comment: &str) -> CollabResult<()> {
        info!(bug_id, comment = %comment, "bug close (no tracker configured)");
        Ok(())
    }

    async fn comment(&self, bug_id: u64, text: &str) -> CollabResult<()> {
        info!(bug_id, text = %text, "bug comment (no tracker configured)");
        Ok(())
    }

    async fn update_title(&self, bug_id: u64, title: &str) -> CollabResult<()> {
        info!(bug_id, title = %title, "bug title update (no tracker configured)");
        Ok(())
    }
}
