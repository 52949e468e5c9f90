//! NotificationEmitter: bus events and announcement mail for a push.
//!
//! Every delivery goes through the notify retry policy. Exhausting it yields
//! a [`DeliveryError`]; callers decide whether that is a caveat or a logged
//! warning, it never undoes a push.

use std::sync::Arc;

use masher_state::{PushOutcome, PushRecord, Update, UpdateType};
use serde_json::json;
use tracing::{debug, warn};

use crate::collab::{BusMessage, Mail, Mailer, MessageBus, Topic};
use crate::config::NotifyConfig;
use crate::retry::{retry_with_backoff, RetryFailure, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("delivery to {target} failed after {attempts} attempt(s): {reason}")]
pub struct DeliveryError {
    pub target: String,
    pub attempts: u32,
    pub reason: String,
}

impl DeliveryError {
    fn from_failure<E: std::fmt::Display>(target: String, failure: RetryFailure<E>) -> Self {
        let attempts = failure.attempts();
        let reason = match failure {
            RetryFailure::Fatal { error, .. } | RetryFailure::Exhausted { error, .. } => {
                error.to_string()
            }
            timed_out => timed_out.to_string(),
        };
        Self {
            target,
            attempts,
            reason,
        }
    }
}

/// `in_progress`, `completed` or `failed`.
pub fn outcome_label(push: &PushRecord) -> &'static str {
    match push.outcome {
        PushOutcome::InProgress => "in_progress",
        PushOutcome::Completed => "completed",
        PushOutcome::Failed { .. } => "failed",
    }
}

#[derive(Debug, Clone)]
pub struct MailSettings {
    pub from: String,
    pub announce_list: String,
    pub testing_list: String,
    pub bug_url_base: String,
}

impl From<&NotifyConfig> for MailSettings {
    fn from(config: &NotifyConfig) -> Self {
        Self {
            from: config.from_address.clone(),
            announce_list: config.announce_list.clone(),
            testing_list: config.testing_list.clone(),
            bug_url_base: config.bug_url_base.clone(),
        }
    }
}

pub struct NotificationEmitter {
    bus: Arc<dyn MessageBus>,
    mailer: Arc<dyn Mailer>,
    policy: RetryPolicy,
    mail: MailSettings,
}

impl NotificationEmitter {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        mailer: Arc<dyn Mailer>,
        policy: RetryPolicy,
        mail: MailSettings,
    ) -> Self {
        Self {
            bus,
            mailer,
            policy,
            mail,
        }
    }

    fn message(push: &PushRecord, topic: Topic, body: serde_json::Value) -> BusMessage {
        BusMessage {
            topic,
            push_id: push.push_id.to_string(),
            release: push.repo.release.clone(),
            request: push.repo.request,
            outcome: outcome_label(push).to_string(),
            body,
        }
    }

    pub async fn publish(&self, message: &BusMessage) -> Result<(), DeliveryError> {
        let bus = &self.bus;
        retry_with_backoff(&self.policy, message.topic.as_str(), |_| async move {
            bus.publish(message).await
        })
        .await
        .map(|done| debug!(topic = %message.topic, attempts = done.attempts, "bus message delivered"))
        .map_err(|failure| {
            let err = DeliveryError::from_failure(format!("bus:{}", message.topic), failure);
            warn!(error = %err, "bus delivery failed");
            err
        })
    }

    pub async fn mash_started(&self, push: &PushRecord) -> Result<(), DeliveryError> {
        let updates: Vec<&str> = push.updates.iter().map(|u| u.id.as_str()).collect();
        let body = json!({ "repo": push.repo.to_string(), "updates": updates });
        self.publish(&Self::message(push, Topic::MashStarted, body))
            .await
    }

    /// Terminal event; the outcome field tells success from failure.
    pub async fn mash_completed(&self, push: &PushRecord) -> Result<(), DeliveryError> {
        let body = match &push.outcome {
            PushOutcome::Failed { phase, reason } => json!({
                "repo": push.repo.to_string(),
                "failed_phase": phase.as_str(),
                "reason": reason,
            }),
            _ => json!({
                "repo": push.repo.to_string(),
                "phase": push.phase.as_str(),
                "caveats": push.caveats.len(),
            }),
        };
        self.publish(&Self::message(push, Topic::MashCompleted, body))
            .await
    }

    pub async fn override_event(
        &self,
        push: &PushRecord,
        topic: Topic,
        nvr: &str,
        tag: &str,
    ) -> Result<(), DeliveryError> {
        let body = json!({ "nvr": nvr, "tag": tag });
        self.publish(&Self::message(push, topic, body)).await
    }

    pub async fn errata_published(
        &self,
        push: &PushRecord,
        update: &Update,
    ) -> Result<(), DeliveryError> {
        let builds: Vec<String> = update.nvrs().map(ToString::to_string).collect();
        let body = json!({
            "update": update.id,
            "title": update.title,
            "type": update.update_type.as_str(),
            "builds": builds,
        });
        self.publish(&Self::message(push, Topic::ErrataPublished, body))
            .await
    }

    pub async fn send(&self, mail: &Mail) -> Result<(), DeliveryError> {
        let mailer = &self.mailer;
        retry_with_backoff(&self.policy, "mail", |_| async move { mailer.send(mail).await })
            .await
            .map(|_| debug!(to = %mail.to, subject = %mail.subject, "mail sent"))
            .map_err(|failure| {
                let err = DeliveryError::from_failure(format!("mail:{}", mail.to), failure);
                warn!(error = %err, "mail delivery failed");
                err
            })
    }

    /// Announcement for one update pushed to stable.
    pub fn stable_notice(&self, push: &PushRecord, update: &Update) -> Mail {
        let prefix = if update.update_type == UpdateType::Security {
            "[SECURITY] "
        } else {
            ""
        };
        Mail {
            from: self.mail.from.clone(),
            to: self.mail.announce_list.clone(),
            subject: format!("{prefix}{} Update: {}", push.repo.release, update.title),
            body: self.describe(update),
        }
    }

    /// One digest listing every update pushed to testing, security first.
    pub fn testing_digest(&self, push: &PushRecord, updates: &[Update]) -> Mail {
        let mut ordered: Vec<&Update> = updates.iter().collect();
        ordered.sort_by_key(|u| (u.update_type != UpdateType::Security, u.id.clone()));

        let mut body = format!(
            "The following updates have been pushed to {}:\n\n",
            push.repo
        );
        for update in &ordered {
            body.push_str(&format!("  {:<24} {}\n", update.id, update.title));
        }
        body.push('\n');
        for update in ordered {
            body.push_str(&self.describe(update));
            body.push('\n');
        }
        Mail {
            from: self.mail.from.clone(),
            to: self.mail.testing_list.clone(),
            subject: format!("{} updates-testing report", push.repo.release),
            body,
        }
    }

    fn describe(&self, update: &Update) -> String {
        let rule = "=".repeat(72);
        let mut text = format!(
            "{rule}\nUpdate ID: {}\nType     : {}\nSubmitter: {}\n{rule}\n",
            update.id,
            update.update_type.as_str(),
            update.submitter
        );
        if !update.description.is_empty() {
            text.push_str(&format!("\n{}\n", update.description.trim()));
        }
        text.push_str("\nBuilds:\n");
        for nvr in update.nvrs() {
            text.push_str(&format!("  {nvr}\n"));
        }
        if !update.bugs.is_empty() {
            text.push_str("\nReferences:\n");
            for bug in &update.bugs {
                text.push_str(&format!(
                    "  [ {} ] {}\n    {}{}\n",
                    bug.id, bug.title, self.mail.bug_url_base, bug.id
                ));
            }
        }
        text
    }
}
