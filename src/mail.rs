// src/mail.rs
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::collections::HashMap;

use crate::config::SmtpConfig;
use crate::errors::{ReportError, Result};
use crate::verification::{ERR_MISSING_EMAIL_CONFIGURATION, VerificationResult, VerificationResultCollection};

pub const SMTP_FROM_ACCOUNT: &str = "SmtpFromAccount";
pub const SMTP_DISPLAY_NAME: &str = "SmtpDisplayName";
pub const SMTP_CC_TO: &str = "SmtpCcTo";
pub const SMTP_REPLY_TO: &str = "SmtpReplyTo";
pub const SMTP_EMAIL_BODY: &str = "SmtpEmailBody";

pub const DEFAULT_EMAIL_BODY: &str = "OpenPetra report attached.";

pub(crate) const CONTEXT: &str = "Sending Email";
const PREFERENCES_HINT: &str = "Check the Email tab in User Settings >> Preferences.";

#[derive(Debug, Clone, PartialEq)]
pub struct MailAttachment {
    pub file_name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl MailAttachment {
    /// Attachment whose MIME type is guessed from the file name.
    pub fn new(file_name: &str, data: Vec<u8>) -> Self {
        Self {
            file_name: file_name.to_string(),
            content_type: mime_guess::from_path(file_name)
                .first_or_octet_stream()
                .to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMail {
    pub from: String,
    pub display_name: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<MailAttachment>,
}

/// Something that can deliver a message.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, mail: OutgoingMail) -> Result<()>;
}

/// Sender preferences of one user, read from the user defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct MailSettings {
    pub from: String,
    pub display_name: Option<String>,
    pub cc: Vec<String>,
    pub reply_to: Option<String>,
    pub body: String,
}

impl MailSettings {
    /// Collects every configuration problem into `verification`; returns
    /// settings only when mail can actually be sent.
    pub fn resolve(
        user_defaults: &HashMap<String, String>,
        smtp_configured: bool,
        verification: &mut VerificationResultCollection,
    ) -> Option<Self> {
        let lookup = |code: &str| {
            user_defaults
                .get(code)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if !smtp_configured {
            verification.add(VerificationResult::critical(
                CONTEXT,
                format!("No SMTP server is configured.\n{}", PREFERENCES_HINT),
                ERR_MISSING_EMAIL_CONFIGURATION,
            ));
        }
        let from = lookup(SMTP_FROM_ACCOUNT);
        if from.is_none() {
            verification.add(VerificationResult::critical(
                CONTEXT,
                format!("No sender email address is set.\n{}", PREFERENCES_HINT),
                ERR_MISSING_EMAIL_CONFIGURATION,
            ));
        }

        let from = from.filter(|_| smtp_configured)?;
        Some(Self {
            from,
            display_name: lookup(SMTP_DISPLAY_NAME),
            cc: lookup(SMTP_CC_TO).map(|cc| split_addresses(&cc)).unwrap_or_default(),
            reply_to: lookup(SMTP_REPLY_TO),
            body: lookup(SMTP_EMAIL_BODY).unwrap_or_else(|| DEFAULT_EMAIL_BODY.to_string()),
        })
    }
}

/// Splits a recipient list on commas and semicolons.
pub fn split_addresses(addresses: &str) -> Vec<String> {
    addresses
        .split([',', ';'])
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

/// Delivers mail through an SMTP relay.
pub struct SmtpMailer {
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let builder = if self.config.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.config.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.host)
        }
        .map_err(mail_error)?
        .port(self.config.port);

        let builder = match (&self.config.username, &self.config.password) {
            (Some(user), Some(password)) => {
                builder.credentials(Credentials::new(user.clone(), password.clone()))
            }
            _ => builder,
        };
        Ok(builder.build())
    }
}

#[async_trait]
impl MailSender for SmtpMailer {
    async fn send(&self, mail: OutgoingMail) -> Result<()> {
        let message = build_message(&mail)?;
        log::info!(
            "Sending '{}' to {} recipient(s) via {}:{}",
            mail.subject,
            mail.to.len(),
            self.config.host,
            self.config.port
        );
        self.transport()?.send(message).await.map_err(mail_error)?;
        Ok(())
    }
}

fn build_message(mail: &OutgoingMail) -> Result<Message> {
    let from: Address = mail.from.parse().map_err(mail_error)?;
    let mut builder = Message::builder()
        .from(Mailbox::new(mail.display_name.clone(), from))
        .subject(mail.subject.clone());
    for to in &mail.to {
        builder = builder.to(to.parse::<Mailbox>().map_err(mail_error)?);
    }
    for cc in &mail.cc {
        builder = builder.cc(cc.parse::<Mailbox>().map_err(mail_error)?);
    }
    if let Some(reply_to) = &mail.reply_to {
        builder = builder.reply_to(reply_to.parse::<Mailbox>().map_err(mail_error)?);
    }

    let mut body = MultiPart::mixed().singlepart(SinglePart::plain(mail.body.clone()));
    for attachment in &mail.attachments {
        let content_type = ContentType::parse(&attachment.content_type).map_err(mail_error)?;
        body = body.singlepart(
            Attachment::new(attachment.file_name.clone()).body(attachment.data.clone(), content_type),
        );
    }

    builder.multipart(body).map_err(mail_error)
}

fn mail_error<E: std::fmt::Display>(err: E) -> ReportError {
    ReportError::Mail(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn mail() -> OutgoingMail {
        OutgoingMail {
            from: "office@example.org".to_string(),
            display_name: Some("Office".to_string()),
            to: vec!["donor@example.org".to_string()],
            cc: vec![],
            reply_to: None,
            subject: "PartnerByCity".to_string(),
            body: DEFAULT_EMAIL_BODY.to_string(),
            attachments: vec![MailAttachment::new("PartnerByCity.pdf", b"%PDF-1.4".to_vec())],
        }
    }

    #[test]
    fn test_every_missing_setting_is_reported() {
        let mut verification = VerificationResultCollection::new();
        let settings = MailSettings::resolve(&HashMap::new(), false, &mut verification);

        assert!(settings.is_none());
        assert_eq!(verification.len(), 2);
        assert!(verification.iter().all(|v| v.code == ERR_MISSING_EMAIL_CONFIGURATION));
    }

    #[test]
    fn test_settings_from_user_defaults() {
        let mut verification = VerificationResultCollection::new();
        let settings = MailSettings::resolve(
            &defaults(&[
                (SMTP_FROM_ACCOUNT, "office@example.org"),
                (SMTP_CC_TO, "a@example.org; b@example.org"),
            ]),
            true,
            &mut verification,
        )
        .unwrap();

        assert!(verification.is_empty());
        assert_eq!(settings.from, "office@example.org");
        assert_eq!(settings.cc, vec!["a@example.org", "b@example.org"]);
        assert_eq!(settings.body, DEFAULT_EMAIL_BODY);
    }

    #[test]
    fn test_attachment_content_type_is_guessed() {
        assert_eq!(MailAttachment::new("report.pdf", vec![]).content_type, "application/pdf");
        assert_eq!(
            MailAttachment::new("report.xlsx", vec![]).content_type,
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        );
    }

    #[test]
    fn test_message_is_built() {
        assert!(build_message(&mail()).is_ok());

        let mut broken = mail();
        broken.to = vec!["not an address".to_string()];
        assert!(matches!(build_message(&broken), Err(ReportError::Mail(_))));
    }
}
