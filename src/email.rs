//! Outbound email. Delivery belongs to another service; this crate only triggers it.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()>;
}

/// Logs the envelope instead of sending anything.
#[derive(Clone, Debug, Default)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        info!(to, subject, bytes = html.len(), "email queued");
        Ok(())
    }
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Welcome message carrying the email verification link.
#[must_use]
pub fn verification_email(name: &str, link: &str) -> (String, String) {
    let subject = "Verify email address".to_string();
    let html = format!(
        "<p>Hi {},</p><p>your account is ready. Confirm your email address to finish setting it up:</p>\
         <p><a href=\"{link}\">Verify email address</a></p>\
         <p>The link expires in 24 hours.</p>",
        escape(name),
        link = escape(link),
    );
    (subject, html)
}
