use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::env;

#[derive(Debug, Clone)]
struct SmtpSettings {
    host: String,
    username: String,
    password: String,
    from: String,
    to: String,
}

/// Plain-text alert mail over SMTP. Does nothing when the SMTP environment is not set.
#[derive(Debug, Clone, Default)]
pub struct EmailClient {
    settings: Option<SmtpSettings>,
}

impl EmailClient {
    pub fn new() -> Self {
        let var = |key: &str| env::var(key).ok().filter(|v| !v.trim().is_empty());
        let settings = match (
            var("SMTP_HOST"),
            var("SMTP_USERNAME"),
            var("SMTP_PASSWORD"),
            var("ALERT_EMAIL_FROM"),
            var("ALERT_EMAIL_TO"),
        ) {
            (Some(host), Some(username), Some(password), Some(from), Some(to)) => {
                Some(SmtpSettings {
                    host,
                    username,
                    password,
                    from,
                    to,
                })
            }
            _ => None,
        };
        Self { settings }
    }

    pub fn is_configured(&self) -> bool {
        self.settings.is_some()
    }

    pub fn send(&self, subject: &str, body: &str) {
        let Some(settings) = &self.settings else {
            log::debug!("email not configured, skip '{}'", subject);
            return;
        };
        if let Err(e) = Self::deliver(settings, subject, body) {
            log::error!("failed to send email '{}': {}", subject, e);
        }
    }

    fn deliver(settings: &SmtpSettings, subject: &str, body: &str) -> anyhow::Result<()> {
        let from: Mailbox = settings.from.parse()?;
        let to: Mailbox = settings.to.parse()?;
        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())?;
        let mailer = SmtpTransport::relay(&settings.host)?
            .credentials(Credentials::new(
                settings.username.clone(),
                settings.password.clone(),
            ))
            .build();
        mailer.send(&message)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_client_is_a_no_op() {
        let client = EmailClient::default();
        assert!(!client.is_configured());
        client.send("subject", "body");
    }
}
