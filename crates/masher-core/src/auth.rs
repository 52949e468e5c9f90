//! Trigger authorization.
//!
//! A trigger is checked before anything else happens; rejected triggers have
//! no side effects. The authorizer fails closed: with an empty allow-list
//! every sender is rejected.

use std::collections::BTreeSet;

use hmac::{Hmac, Mac};
use masher_state::RequestType;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

use crate::config::RelengConfig;
use crate::error::{MashError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Request to push every eligible update for `request`, optionally limited to
/// some releases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub sender: String,
    pub request: RequestType,
    /// Empty means every release with eligible updates.
    #[serde(default)]
    pub releases: Vec<String>,
    /// Hex HMAC-SHA256 of [`TriggerEvent::canonical_body`].
    #[serde(default)]
    pub signature: Option<String>,
}

impl TriggerEvent {
    pub fn new(sender: impl Into<String>, request: RequestType) -> Self {
        Self {
            sender: sender.into(),
            request,
            releases: Vec::new(),
            signature: None,
        }
    }

    pub fn with_releases<I, S>(mut self, releases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.releases = releases.into_iter().map(Into::into).collect();
        self
    }

    /// `sender\nrequest\nrel1,rel2` with releases upper-cased and sorted.
    pub fn canonical_body(&self) -> String {
        let mut releases: Vec<String> = self
            .releases
            .iter()
            .map(|r| r.trim().to_ascii_uppercase())
            .collect();
        releases.sort();
        releases.dedup();
        format!("{}\n{}\n{}", self.sender, self.request, releases.join(","))
    }

    /// Attach a signature computed with `secret`.
    pub fn signed(mut self, secret: &str) -> Result<Self> {
        let mut mac = new_mac(secret)?;
        mac.update(self.canonical_body().as_bytes());
        self.signature = Some(hex::encode(mac.finalize().into_bytes()));
        Ok(self)
    }
}

fn new_mac(secret: &str) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| MashError::Config(format!("invalid trigger secret: {e}")))
}

#[derive(Debug, Clone, Default)]
pub struct TriggerAuthorizer {
    allowed: BTreeSet<String>,
    secret: Option<String>,
    allow_unsigned: bool,
}

impl TriggerAuthorizer {
    pub fn new<I, S>(allowed: I, secret: Option<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
            secret: secret.filter(|s| !s.is_empty()),
            allow_unsigned: false,
        }
    }

    /// Trust the sender name alone when no secret is configured.
    pub fn allow_unsigned(mut self, allow: bool) -> Self {
        self.allow_unsigned = allow;
        self
    }

    pub fn from_config(config: &RelengConfig) -> Self {
        Self::new(
            config.allowed_senders.iter().cloned(),
            config.trigger_secret.clone(),
        )
        .allow_unsigned(config.allow_unsigned)
    }

    pub fn authorize(&self, event: &TriggerEvent) -> Result<()> {
        if !self.allowed.contains(&event.sender) {
            warn!(sender = %event.sender, "trigger from unauthorized sender");
            return Err(MashError::Authorization(format!(
                "sender '{}' is not an allowed release engineer",
                event.sender
            )));
        }

        let Some(secret) = &self.secret else {
            if self.allow_unsigned {
                return Ok(());
            }
            warn!(sender = %event.sender, "no trigger secret configured, rejecting");
            return Err(MashError::Authorization(
                "trigger signing is not configured (set releng.trigger_secret, \
                 or releng.allow_unsigned for trusted input)"
                    .to_string(),
            ));
        };

        let signature = event.signature.as_deref().ok_or_else(|| {
            MashError::Authorization("trigger is not signed".to_string())
        })?;
        let expected = hex::decode(signature.trim())
            .map_err(|_| MashError::Authorization("malformed signature".to_string()))?;
        let mut mac = new_mac(secret)?;
        mac.update(event.canonical_body().as_bytes());
        mac.verify_slice(&expected).map_err(|_| {
            warn!(sender = %event.sender, "trigger signature mismatch");
            MashError::Authorization("signature mismatch".to_string())
        })?;
        Ok(())
    }
}
