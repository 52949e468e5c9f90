//! Log-only bus and mailer, plus a spool-directory mailer.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::{BusMessage, CollabResult, Mail, Mailer, MessageBus};

/// Bus used when no endpoint is configured: every message becomes a log line.
#[derive(Debug, Default, Clone)]
pub struct LogBus;

#[async_trait]
impl MessageBus for LogBus {
    async fn publish(&self, message: &BusMessage) -> CollabResult<()> {
        info!(
            topic = %message.topic,
            push_id = %message.push_id,
            release = %message.release,
            request = %message.request,
            outcome = %message.outcome,
            body = %message.body,
            "bus message"
        );
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: &Mail) -> CollabResult<()> {
        info!(to = %mail.to, subject = %mail.subject, "mail (not delivered)");
        Ok(())
    }
}

/// Writes each message as an RFC 822 text file into a spool directory for
/// the local MTA to pick up.
#[derive(Debug, Clone)]
pub struct SpoolMailer {
    spool_dir: PathBuf,
}

impl SpoolMailer {
    pub fn new(spool_dir: impl Into<PathBuf>) -> Self {
        Self {
            spool_dir: spool_dir.into(),
        }
    }

    pub fn render(mail: &Mail) -> String {
        format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nDate: {}\r\nContent-Type: text/plain; charset=UTF-8\r\n\r\n{}\r\n",
            mail.from,
            mail.to,
            mail.subject,
            Utc::now().to_rfc2822(),
            mail.body.replace('\n', "\r\n"),
        )
    }
}

#[async_trait]
impl Mailer for SpoolMailer {
    async fn send(&self, mail: &Mail) -> CollabResult<()> {
        tokio::fs::create_dir_all(&self.spool_dir).await?;
        let name = format!(
            "{}-{}.eml",
            Utc::now().format("%Y%m%d%H%M%S"),
            uuid::Uuid::new_v4().simple()
        );
        let tmp = self.spool_dir.join(format!(".{name}.tmp"));
        tokio::fs::write(&tmp, Self::render(mail)).await?;
        tokio::fs::rename(&tmp, self.spool_dir.join(&name)).await?;
        info!(to = %mail.to, file = %name, "mail spooled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mail() -> Mail {
        Mail {
            from: "updates@example.org".to_string(),
            to: "announce@example.org".to_string(),
            subject: "[SECURITY] Fedora 17 Update: a-1.0-1".to_string(),
            body: "line one\nline two".to_string(),
        }
    }

    #[test]
    fn test_render_has_headers_and_crlf_body() {
        let text = SpoolMailer::render(&mail());
        assert!(text.starts_with("From: updates@example.org\r\n"));
        assert!(text.contains("Subject: [SECURITY] Fedora 17 Update: a-1.0-1\r\n"));
        assert!(text.contains("\r\n\r\nline one\r\nline two"));
    }

    #[tokio::test]
    async fn test_spool_writes_one_file_per_mail() {
        let dir = tempfile::tempdir().unwrap();
        let mailer = SpoolMailer::new(dir.path().join("spool"));
        mailer.send(&mail()).await.unwrap();
        mailer.send(&mail()).await.unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path().join("spool"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.ends_with(".eml")));
    }
}
