//! Outbound mail submission
//!
//! Every send builds a short-lived SMTP client from the session's IMAP
//! credentials. The submission host is derived from the IMAP host
//! (`imap.example.com` becomes `smtp.example.com`) unless the request
//! overrides it.

use crate::config::ImapConfig;
use crate::error::{Error, Result};
use crate::message::{Attachment, MessageRef, ParsedMessage};
use crate::model::join_addresses;
use crate::sanitize::{escape_html, html_to_text, sanitize_html};
use lettre::message::header::ContentType;
use lettre::message::{Attachment as AttachmentPart, Mailbox, Mailboxes, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use rand::RngCore;
use serde::Deserialize;
use std::fmt::Write as _;
use tracing::{debug, info, warn};

const FORWARD_SEPARATOR: &str = "---------- Forwarded message ----------";
const MISSING_ORIGINAL_SUBJECT: &str = "(Original message unavailable)";
const MISSING_ORIGINAL_BODY: &str = "The original message could not be retrieved.";

/// Transport security for the submission connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// TLS from the first byte (port 465).
    Tls,
    /// Plain connection upgraded with STARTTLS (port 587).
    StartTls,
    /// No encryption. For local relays only.
    None,
}

impl SmtpSecurity {
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Tls => 465,
            Self::StartTls => 587,
            Self::None => 25,
        }
    }
}

/// Per-request submission overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// `true` for implicit TLS, `false` for STARTTLS. `security` wins
    /// when both are given.
    pub secure: Option<bool>,
    pub security: Option<SmtpSecurity>,
}

/// Where and how to submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpTarget {
    pub host: String,
    pub port: u16,
    pub security: SmtpSecurity,
}

impl SmtpTarget {
    /// Resolve the submission target for an IMAP host, applying
    /// overrides. Defaults to the derived host on port 465 with TLS.
    #[must_use]
    pub fn resolve(imap_host: &str, overrides: Option<&SmtpConfig>) -> Self {
        let overrides = overrides.cloned().unwrap_or_default();
        let security = overrides
            .security
            .or_else(|| {
                overrides
                    .secure
                    .map(|secure| if secure { SmtpSecurity::Tls } else { SmtpSecurity::StartTls })
            })
            .unwrap_or(SmtpSecurity::Tls);
        Self {
            host: overrides
                .host
                .filter(|h| !h.trim().is_empty())
                .unwrap_or_else(|| derive_smtp_host(imap_host)),
            port: overrides.port.unwrap_or_else(|| security.default_port()),
            security,
        }
    }
}

/// Swap a leading `imap` in the first host label for `smtp`. Hosts
/// without that prefix are returned unchanged.
#[must_use]
pub fn derive_smtp_host(imap_host: &str) -> String {
    let (label, rest) = imap_host
        .split_once('.')
        .map_or((imap_host, None), |(label, rest)| (label, Some(rest)));

    let label = match label.get(..4) {
        Some(prefix) if prefix.eq_ignore_ascii_case("imap") => format!("smtp{}", &label[4..]),
        _ => label.to_string(),
    };

    match rest {
        Some(rest) => format!("{label}.{rest}"),
        None => label,
    }
}

/// A recipient field given either as one string or as a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Recipients {
    One(String),
    Many(Vec<String>),
}

impl Default for Recipients {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl Recipients {
    /// The comma-separated header form.
    #[must_use]
    pub fn joined(&self) -> String {
        match self {
            Self::One(s) => s.trim().to_string(),
            Self::Many(list) => list
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    /// Parse into mailboxes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Dispatch`] if any address is malformed.
    pub fn mailboxes(&self) -> Result<Mailboxes> {
        let joined = self.joined();
        if joined.is_empty() {
            return Ok(Mailboxes::new());
        }
        joined
            .parse()
            .map_err(|e| Error::Dispatch(format!("Invalid recipient list \"{joined}\": {e}")))
    }
}

/// A new message or reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutgoingEmail {
    pub to: Recipients,
    pub cc: Recipients,
    pub bcc: Recipients,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub smtp_config: Option<SmtpConfig>,
}

/// A request to forward a stored message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardEmail {
    pub original_email_id: MessageRef,
    /// Folder holding the original. Defaults to INBOX.
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub to: Recipients,
    #[serde(default)]
    pub cc: Recipients,
    #[serde(default)]
    pub bcc: Recipients,
    #[serde(default)]
    pub additional_text: String,
    #[serde(default)]
    pub smtp_config: Option<SmtpConfig>,
}

impl ForwardEmail {
    #[must_use]
    pub const fn recipients(&self) -> [&Recipients; 3] {
        [&self.to, &self.cc, &self.bcc]
    }
}

/// The body of a forward, before sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardDraft {
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
    pub attachments: Vec<Attachment>,
}

/// Prefix `Fwd: ` unless the subject already has it.
#[must_use]
pub fn forward_subject(subject: &str) -> String {
    let subject = subject.trim();
    let prefixed = subject
        .get(..4)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("fwd:"));
    if prefixed {
        subject.to_string()
    } else {
        format!("Fwd: {subject}")
    }
}

/// Compose a forward of `original` with the sender's note on top. A
/// missing original is replaced by a placeholder so the forward still
/// goes out.
#[must_use]
pub fn compose_forward(original: Option<&ParsedMessage>, additional_text: &str) -> ForwardDraft {
    let Some(original) = original else {
        let mut text = String::new();
        push_note(&mut text, additional_text);
        let _ = write!(text, "{FORWARD_SEPARATOR}\n\n{MISSING_ORIGINAL_BODY}\n");
        return ForwardDraft {
            subject: forward_subject(MISSING_ORIGINAL_SUBJECT),
            text,
            html: None,
            attachments: Vec::new(),
        };
    };

    let headers = &original.headers;
    let from = headers.from.to_string();
    let to = join_addresses(&headers.to);
    let date = if headers.date_known {
        headers.date.to_rfc2822()
    } else {
        String::new()
    };
    let body = original
        .text
        .clone()
        .or_else(|| original.html.as_deref().and_then(html_to_text))
        .unwrap_or_default();

    let mut text = String::new();
    push_note(&mut text, additional_text);
    let _ = write!(
        text,
        "{FORWARD_SEPARATOR}\nFrom: {from}\nDate: {date}\nSubject: {}\nTo: {to}\n\n{body}",
        headers.subject
    );

    let html = original.html.as_deref().map(|original_html| {
        let mut html = String::new();
        if !additional_text.trim().is_empty() {
            let _ = write!(
                html,
                "<div>{}</div><br>",
                escape_html(additional_text).replace('\n', "<br>")
            );
        }
        let _ = write!(
            html,
            "<div class=\"forwarded-message\">{FORWARD_SEPARATOR}<br>\
             From: {}<br>Date: {}<br>Subject: {}<br>To: {}<br><br>\
             <blockquote>{}</blockquote></div>",
            escape_html(&from),
            escape_html(&date),
            escape_html(&headers.subject),
            escape_html(&to),
            sanitize_html(original_html),
        );
        html
    });

    ForwardDraft {
        subject: forward_subject(&headers.subject),
        text,
        html,
        attachments: original.attachments.clone(),
    }
}

fn push_note(text: &mut String, note: &str) {
    let note = note.trim_end();
    if !note.is_empty() {
        text.push_str(note);
        text.push_str("\n\n");
    }
}

/// A generated `Message-ID` in the sender's domain.
#[must_use]
pub fn generate_message_id(sender: &str) -> String {
    let domain = sender
        .rsplit_once('@')
        .map_or("localhost", |(_, domain)| domain.trim_end_matches('>'));
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let token: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("<{token}@{domain}>")
}

/// A transient submission client bound to one session's credentials.
pub struct Dispatcher {
    sender: String,
    password: String,
    target: SmtpTarget,
    accept_invalid_certs: bool,
}

impl Dispatcher {
    #[must_use]
    pub fn new(imap: &ImapConfig, overrides: Option<&SmtpConfig>) -> Self {
        Self {
            sender: imap.username.clone(),
            password: imap.password.clone(),
            target: SmtpTarget::resolve(&imap.host, overrides),
            accept_invalid_certs: imap.accept_invalid_certs,
        }
    }

    #[must_use]
    pub const fn target(&self) -> &SmtpTarget {
        &self.target
    }

    /// Send a new message or reply. Returns its `Message-ID`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Dispatch`] if the message cannot be built or the
    /// server rejects it.
    pub async fn send(&self, email: &OutgoingEmail) -> Result<String> {
        let mut builder = Message::builder().subject(email.subject.clone());
        if let Some(id) = email.in_reply_to.as_deref().filter(|s| !s.is_empty()) {
            builder = builder.in_reply_to(id.to_string());
        }
        if let Some(refs) = email.references.as_deref().filter(|s| !s.is_empty()) {
            builder = builder.references(refs.to_string());
        }

        let body = Body {
            text: email.text.clone(),
            html: email.html.clone(),
            attachments: Vec::new(),
        };
        self.deliver(builder, [&email.to, &email.cc, &email.bcc], body)
            .await
    }

    /// Forward a composed draft to new recipients.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Dispatch`] if the message cannot be built or the
    /// server rejects it.
    pub async fn forward(
        &self,
        draft: ForwardDraft,
        recipients: [&Recipients; 3],
    ) -> Result<String> {
        let builder = Message::builder().subject(draft.subject);
        let body = Body {
            text: Some(draft.text),
            html: draft.html,
            attachments: draft.attachments,
        };
        self.deliver(builder, recipients, body).await
    }

    async fn deliver(
        &self,
        mut builder: lettre::message::MessageBuilder,
        [to, cc, bcc]: [&Recipients; 3],
        body: Body,
    ) -> Result<String> {
        let from: Mailbox = self
            .sender
            .parse()
            .map_err(|e| Error::Dispatch(format!("Invalid sender \"{}\": {e}", self.sender)))?;
        builder = builder.from(from);

        let mut count = 0;
        for mailbox in to.mailboxes()? {
            builder = builder.to(mailbox);
            count += 1;
        }
        for mailbox in cc.mailboxes()? {
            builder = builder.cc(mailbox);
            count += 1;
        }
        for mailbox in bcc.mailboxes()? {
            builder = builder.bcc(mailbox);
            count += 1;
        }
        if count == 0 {
            return Err(Error::Dispatch("No recipients".into()));
        }

        let message_id = generate_message_id(&self.sender);
        let message = body.build(builder.message_id(Some(message_id.clone())))?;

        debug!(
            host = %self.target.host,
            port = self.target.port,
            security = ?self.target.security,
            recipients = count,
            "Submitting message"
        );
        self.transport()?
            .send(message)
            .await
            .map_err(|e| Error::Dispatch(e.to_string()))?;

        info!(host = %self.target.host, %message_id, "Message sent");
        Ok(message_id)
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let host = self.target.host.as_str();
        let credentials = Credentials::new(self.sender.clone(), self.password.clone());

        let builder = match (self.target.security, self.accept_invalid_certs) {
            (SmtpSecurity::None, _) => {
                warn!(host, "Submitting without TLS");
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            }
            (security, true) => {
                let params = TlsParameters::builder(host.to_string())
                    .dangerous_accept_invalid_certs(true)
                    .build_rustls()
                    .map_err(|e| Error::Dispatch(e.to_string()))?;
                let tls = if security == SmtpSecurity::Tls {
                    Tls::Wrapper(params)
                } else {
                    Tls::Required(params)
                };
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host).tls(tls)
            }
            (SmtpSecurity::Tls, false) => AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|e| Error::Dispatch(e.to_string()))?,
            (SmtpSecurity::StartTls, false) => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                    .map_err(|e| Error::Dispatch(e.to_string()))?
            }
        };

        Ok(builder
            .port(self.target.port)
            .credentials(credentials)
            .build())
    }
}

struct Body {
    text: Option<String>,
    html: Option<String>,
    attachments: Vec<Attachment>,
}

impl Body {
    fn build(self, builder: lettre::message::MessageBuilder) -> Result<Message> {
        let content = match (self.text, self.html) {
            (Some(text), Some(html)) => MultiPart::alternative_plain_html(text, html),
            (None, Some(html)) => MultiPart::alternative().singlepart(SinglePart::html(html)),
            (text, None) => {
                MultiPart::alternative().singlepart(SinglePart::plain(text.unwrap_or_default()))
            }
        };

        let content = if self.attachments.is_empty() {
            content
        } else {
            let mut mixed = MultiPart::mixed().multipart(content);
            for attachment in self.attachments {
                let content_type = ContentType::parse(&attachment.content_type)
                    .or_else(|_| ContentType::parse("application/octet-stream"))
                    .map_err(|e| Error::Dispatch(e.to_string()))?;
                mixed = mixed.singlepart(
                    AttachmentPart::new(attachment.filename).body(attachment.data, content_type),
                );
            }
            mixed
        };

        builder
            .multipart(content)
            .map_err(|e| Error::Dispatch(format!("Failed to build message: {e}")))
    }
}
