use anyhow::anyhow;
use lettre::{
    message::Mailbox, transport::smtp::authentication::Credentials, AsyncSmtpTransport,
    AsyncTransport, Message, Tokio1Executor,
};

use super::core::AppConfig;

pub(crate) struct Mailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

/// SMTP is optional: absent config disables email entirely (tests run without
/// it), partial config is a startup error.
pub(crate) fn build_mailer(config: &AppConfig) -> anyhow::Result<Option<Mailer>> {
    let (host, from) = match (&config.smtp_host, &config.smtp_from) {
        (None, None) => return Ok(None),
        (Some(_), None) | (None, Some(_)) => {
            return Err(anyhow!("smtp host and from address must be set together"))
        }
        (Some(host), Some(from)) => (host.trim(), from.trim()),
    };
    if host.is_empty() || from.is_empty() {
        return Err(anyhow!("smtp host and from address cannot be empty"));
    }

    let from = from
        .parse::<Mailbox>()
        .map_err(|e| anyhow!("smtp from address is invalid: {e}"))?;
    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
        .map_err(|e| anyhow!("smtp relay init failed: {e}"))?
        .port(config.smtp_port);
    match (&config.smtp_username, &config.smtp_password) {
        (Some(username), Some(password)) => {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }
        (None, None) => {}
        _ => return Err(anyhow!("smtp username and password must be set together")),
    }

    Ok(Some(Mailer {
        transport: builder.build(),
        from,
    }))
}

impl Mailer {
    pub(crate) async fn send_welcome(&self, to: &str, display_name: &str) -> anyhow::Result<()> {
        let body = format!(
            "Hi {display_name},\n\n\
             Your meetpoint account is ready. Sign in, find an event nearby and say hello.\n"
        );
        self.send(to, "Welcome to meetpoint", body).await
    }

    pub(crate) async fn send_password_reset(
        &self,
        to: &str,
        token: &str,
        public_base_url: &str,
    ) -> anyhow::Result<()> {
        let body = format!(
            "A password reset was requested for your meetpoint account.\n\n\
             Reset link: {public_base_url}/reset-password?token={token}\n\n\
             The link expires in one hour. If you did not request this, ignore this email.\n"
        );
        self.send(to, "Reset your meetpoint password", body).await
    }

    async fn send(&self, to: &str, subject: &str, body: String) -> anyhow::Result<()> {
        let to = to
            .parse::<Mailbox>()
            .map_err(|e| anyhow!("recipient address is invalid: {e}"))?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .body(body)
            .map_err(|e| anyhow!("message build failed: {e}"))?;
        self.transport
            .send(message)
            .await
            .map_err(|e| anyhow!("smtp send failed: {e}"))?;
        Ok(())
    }
}
