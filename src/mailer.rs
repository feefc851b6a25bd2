use async_trait::async_trait;
use lettre::{
    message::header::ContentType, transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::info;

use crate::config::SmtpSettings;
use crate::error::{BillingError, BillingResult};

/// Outbound mail seam for run summaries and operator alerts.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> BillingResult<()>;
}

/// SMTP mailer over lettre's async transport.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl SmtpMailer {
    pub fn new(settings: &SmtpSettings, from: impl Into<String>) -> BillingResult<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
            .map_err(|e| BillingError::mail(format!("smtp relay {}: {e}", settings.host)))?
            .credentials(Credentials::new(
                settings.username.clone(),
                settings.password.clone(),
            ))
            .build();
        Ok(Self {
            transport,
            from: from.into(),
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> BillingResult<()> {
        let message = Message::builder()
            .from(
                self.from
                    .parse()
                    .map_err(|e| BillingError::mail(format!("from address: {e}")))?,
            )
            .to(to
                .parse()
                .map_err(|e| BillingError::mail(format!("to address {to}: {e}")))?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| BillingError::mail(format!("message build: {e}")))?;
        self.transport
            .send(message)
            .await
            .map_err(|e| BillingError::mail(format!("smtp send: {e}")))?;
        Ok(())
    }
}

/// Logs mail to the subscriber instead of sending it. Used when no SMTP host
/// is configured.
pub struct ConsoleMailer;

#[async_trait]
impl Mailer for ConsoleMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> BillingResult<()> {
        info!(to, subject, body, "console mailer: message not sent");
        Ok(())
    }
}
