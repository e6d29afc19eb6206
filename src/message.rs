//! Single-message retrieval
//!
//! A message is addressed by UID first and by sequence number if no UID
//! matches. The protocol exchange runs in a spawned task holding the
//! connection lock and reports back once over a oneshot channel; the
//! caller bounds the wait with a watchdog. Parsing adapts to the message
//! size, and a message that cannot be parsed is returned as a degraded
//! placeholder flagged `partial` rather than failing the request.

use crate::connection::{Connection, ConnectionState, SharedConnection};
use crate::error::{Error, Result};
use crate::flag::{Flag, is_seen};
use crate::headers::{HeaderFields, fields_from_headers};
use crate::mime::MimeNode;
use crate::model::{AttachmentInfo, FullMessage, MessageSummary};
use crate::sanitize::{escape_html, html_to_text, sanitize_html, text_to_html};
use async_imap::types::Fetch;
use futures::StreamExt;
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// FETCH items for a full message. `BODY.PEEK` leaves `\Seen` alone;
/// the flag is set explicitly once the message parsed.
pub const MESSAGE_QUERY: &str = "(UID FLAGS RFC822.SIZE BODYSTRUCTURE BODY.PEEK[])";

/// Above this size HTML is not converted to text.
pub const SKIP_CONVERSION_ABOVE: usize = 5 * 1024 * 1024;
/// Above this size URLs in plain text are not turned into links.
pub const SKIP_LINKIFY_ABOVE: usize = 1024 * 1024;
/// HTML bodies are cut to this many bytes before sanitizing.
pub const MAX_HTML_LEN: usize = 20 * 1024 * 1024;

pub const UNREADABLE_SUBJECT: &str = "(Unable to display message)";
const EMPTY_BODY: &str = "<p><em>(This message has no content)</em></p>";

/// Parser behavior for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    /// Derive a text body from HTML when the message has none.
    pub convert: bool,
    /// Turn URLs into links when rendering a text-only body.
    pub linkify: bool,
    pub max_html_len: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            convert: true,
            linkify: true,
            max_html_len: MAX_HTML_LEN,
        }
    }
}

impl ParseOptions {
    /// Pick parser behavior for a message of `size` bytes.
    #[must_use]
    pub const fn for_size(size: usize) -> Self {
        Self {
            convert: size <= SKIP_CONVERSION_ABOVE,
            linkify: size <= SKIP_LINKIFY_ABOVE,
            max_html_len: MAX_HTML_LEN,
        }
    }
}

/// An attachment with its decoded content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content_id: Option<String>,
    pub data: Vec<u8>,
}

impl Attachment {
    #[must_use]
    pub fn info(&self) -> AttachmentInfo {
        AttachmentInfo {
            filename: self.filename.clone(),
            content_type: self.content_type.clone(),
            size: self.data.len(),
            content_id: self.content_id.clone(),
        }
    }
}

/// A parsed message body. `html` is unsanitized but already capped.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    pub headers: HeaderFields,
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<Attachment>,
    linkify: bool,
}

impl ParsedMessage {
    /// Safe-to-render HTML for this message.
    ///
    /// Sanitized HTML when the message has an HTML part, otherwise the
    /// text part as an escaped `<pre>` block, otherwise a placeholder.
    #[must_use]
    pub fn render_body(&self) -> String {
        if let Some(html) = self.html.as_deref().filter(|h| !h.trim().is_empty()) {
            return sanitize_html(html);
        }
        if let Some(text) = self.text.as_deref().filter(|t| !t.trim().is_empty()) {
            return text_to_html(text, self.linkify);
        }
        EMPTY_BODY.to_string()
    }
}

/// Parse a raw RFC 5322 message.
///
/// # Errors
///
/// Returns [`Error::Parse`] if the buffer is empty or its MIME structure
/// or part encodings cannot be decoded.
pub fn parse_message(raw: &[u8], options: ParseOptions) -> Result<ParsedMessage> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::Parse("Message is empty".into()));
    }

    let mail = mailparse::parse_mail(raw).map_err(|e| Error::Parse(e.to_string()))?;
    let headers = fields_from_headers(&mail.headers);

    let mut text = None;
    let mut html = None;
    let mut attachments = Vec::new();
    walk_parts(&mail, &mut text, &mut html, &mut attachments)?;

    if let Some(body) = html.as_mut() {
        truncate_at_char_boundary(body, options.max_html_len);
    }

    if text.is_none() && options.convert {
        text = html.as_deref().and_then(html_to_text);
    }

    Ok(ParsedMessage {
        headers,
        text,
        html,
        attachments,
        linkify: options.linkify,
    })
}

fn walk_parts(
    part: &ParsedMail<'_>,
    text: &mut Option<String>,
    html: &mut Option<String>,
    attachments: &mut Vec<Attachment>,
) -> Result<()> {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            walk_parts(sub, text, html, attachments)?;
        }
        return Ok(());
    }

    let content_type = part.ctype.mimetype.to_lowercase();
    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned();

    let is_html = content_type == "text/html";
    let is_body_text = is_html || content_type == "text/plain";
    // A named text part arriving after the body of its kind is a file.
    let body_taken = if is_html { html.is_some() } else { text.is_some() };
    let is_attachment = disposition.disposition == DispositionType::Attachment
        || !is_body_text
        || (body_taken && filename.is_some());

    if is_attachment {
        let data = part
            .get_body_raw()
            .map_err(|e| Error::Parse(format!("{content_type} part: {e}")))?;
        attachments.push(Attachment {
            filename: filename.unwrap_or_else(|| "attachment".to_string()),
            content_type,
            content_id: part
                .headers
                .get_first_value("Content-ID")
                .map(|id| id.trim().trim_start_matches('<').trim_end_matches('>').to_string()),
            data,
        });
        return Ok(());
    }

    let slot = if is_html { html } else { text };
    if slot.is_none() {
        let body = part
            .get_body()
            .map_err(|e| Error::Parse(format!("{content_type} part: {e}")))?;
        *slot = Some(body);
    }
    Ok(())
}

fn truncate_at_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

/// A message as fetched from the server, before parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub seq: u32,
    pub uid: Option<u32>,
    /// `RFC822.SIZE` if the server sent it.
    pub size: Option<u32>,
    pub seen: bool,
    /// Attachment presence according to BODYSTRUCTURE.
    pub structure_attachments: bool,
    pub raw: Vec<u8>,
}

impl RawMessage {
    fn from_fetch(fetch: &Fetch) -> Option<Self> {
        let raw = fetch.body()?.to_vec();
        Some(Self {
            seq: fetch.message,
            uid: fetch.uid,
            size: fetch.size,
            seen: is_seen(fetch.flags()),
            structure_attachments: fetch
                .bodystructure()
                .is_some_and(|s| MimeNode::from_body_structure(s).has_attachments()),
            raw,
        })
    }

    /// Size used to pick parser behavior.
    #[must_use]
    pub fn effective_size(&self) -> usize {
        self.size
            .and_then(|s| usize::try_from(s).ok())
            .unwrap_or(self.raw.len())
    }

    fn summary(&self) -> MessageSummary {
        let mut summary = MessageSummary::new(self.seq);
        if let Some(uid) = self.uid {
            summary.set_uid(uid);
        }
        summary.is_read = self.seen;
        summary.has_attachments = self.structure_attachments;
        summary
    }

    /// Combine fetch metadata with a parsed body. The message counts as
    /// read since retrieving it sets `\Seen`.
    #[must_use]
    pub fn into_full_message(self, parsed: &ParsedMessage) -> FullMessage {
        let mut summary = self.summary();
        let headers = parsed.headers.clone();
        summary.subject = headers.subject;
        summary.from = headers.from;
        summary.to = headers.to;
        summary.date = headers.date;
        summary.date_known = headers.date_known;
        summary.is_read = true;
        summary.has_attachments |= !parsed.attachments.is_empty();

        FullMessage {
            summary,
            cc: headers.cc,
            text: parsed.text.clone(),
            body: parsed.render_body(),
            attachments: parsed.attachments.iter().map(Attachment::info).collect(),
        }
    }

    /// A well-formed placeholder for a message that failed to parse.
    #[must_use]
    pub fn degraded(&self, reason: &Error) -> FullMessage {
        let mut summary = self.summary();
        summary.subject = UNREADABLE_SUBJECT.to_string();
        FullMessage {
            summary,
            cc: Vec::new(),
            text: None,
            body: format!(
                "<p>This message could not be displayed.</p><p><em>{}</em></p>",
                escape_html(&reason.to_string())
            ),
            attachments: Vec::new(),
        }
    }
}

/// Response for one retrieved message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageView {
    pub email: FullMessage,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
}

/// Parse a client-supplied message id. Anything that is not a positive
/// integer cannot address a message.
///
/// # Errors
///
/// Returns [`Error::NotFound`] for non-numeric or zero ids.
pub fn parse_message_id(raw: &str) -> Result<u32> {
    raw.trim()
        .parse::<u32>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| Error::NotFound(raw.to_string()))
}

/// A message id as clients send it in JSON bodies: a number or a
/// numeric string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum MessageRef {
    Number(u64),
    Text(String),
}

impl MessageRef {
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the id cannot address a message.
    pub fn resolve(&self) -> Result<u32> {
        match self {
            Self::Number(n) => u32::try_from(*n)
                .ok()
                .filter(|id| *id > 0)
                .ok_or_else(|| Error::NotFound(n.to_string())),
            Self::Text(s) => parse_message_id(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Addressing {
    Uid,
    Sequence,
}

impl Addressing {
    const fn command(self) -> &'static str {
        match self {
            Self::Uid => "UID FETCH",
            Self::Sequence => "FETCH",
        }
    }
}

/// Retrieve, parse and render one message.
///
/// On success the message is marked `\Seen` in the background.
///
/// # Errors
///
/// - [`Error::Folder`] if the folder cannot be selected
/// - [`Error::NotFound`] if neither the UID nor the sequence number
///   matches a message
/// - [`Error::FetchTimeout`] if the watchdog fires first
pub async fn get_message(
    conn: SharedConnection,
    folder: &str,
    id: u32,
    watchdog: Duration,
) -> Result<MessageView> {
    let rx = spawn_fetch(conn.clone(), folder, id);

    let fetched = match tokio::time::timeout(watchdog, rx).await {
        Ok(Ok(outcome)) => outcome?,
        Ok(Err(_)) => return Err(Error::Imap("Fetch task ended unexpectedly".into())),
        Err(_) => {
            warn!(folder, id, "Message watchdog fired");
            return Err(Error::FetchTimeout(watchdog));
        }
    };

    let options = ParseOptions::for_size(fetched.effective_size());
    debug!(folder, id, size = fetched.effective_size(), ?options, "Parsing message");

    match parse_message(&fetched.raw, options) {
        Ok(parsed) => {
            spawn_mark_seen(conn, folder.to_string(), fetched.seq, fetched.uid);
            Ok(MessageView {
                email: fetched.into_full_message(&parsed),
                partial: false,
            })
        }
        Err(e) => {
            warn!(folder, id, "Returning degraded message: {e}");
            Ok(MessageView {
                email: fetched.degraded(&e),
                partial: true,
            })
        }
    }
}

/// Fetch a message and parse it without size adaptation. Used to load
/// the original of a forward.
///
/// # Errors
///
/// Same as [`get_message`], plus [`Error::Parse`] if the message cannot
/// be parsed.
pub async fn load_message(
    conn: SharedConnection,
    folder: &str,
    id: u32,
    watchdog: Duration,
) -> Result<ParsedMessage> {
    let rx = spawn_fetch(conn, folder, id);
    let fetched = match tokio::time::timeout(watchdog, rx).await {
        Ok(Ok(outcome)) => outcome?,
        Ok(Err(_)) => return Err(Error::Imap("Fetch task ended unexpectedly".into())),
        Err(_) => return Err(Error::FetchTimeout(watchdog)),
    };
    parse_message(&fetched.raw, ParseOptions::default())
}

/// Run the fetch in its own task so a watchdog never interrupts a
/// protocol exchange halfway.
fn spawn_fetch(conn: SharedConnection, folder: &str, id: u32) -> oneshot::Receiver<Result<RawMessage>> {
    let (tx, rx) = oneshot::channel();
    let folder = folder.to_string();
    tokio::spawn(async move {
        let mut conn = conn.lock_owned().await;
        let outcome = fetch_raw(&mut conn, &folder, id).await;
        drop(conn);
        if tx.send(outcome).is_err() {
            debug!(folder, id, "Fetch finished after the caller gave up");
        }
    });
    rx
}

/// Select `folder` and fetch message `id`, by UID first and then by
/// sequence number.
///
/// # Errors
///
/// Returns [`Error::NotFound`] if neither addressing finds the message.
pub async fn fetch_raw(conn: &mut Connection, folder: &str, id: u32) -> Result<RawMessage> {
    conn.select(folder).await?;

    match fetch_one(conn, id, Addressing::Uid).await {
        Ok(Some(message)) => return Ok(message),
        Ok(None) => debug!(folder, id, "No message with this UID, trying sequence number"),
        Err(e) if conn.state() == ConnectionState::Ready => {
            debug!(folder, id, "UID fetch failed ({e}), trying sequence number");
        }
        Err(e) => return Err(e),
    }

    match fetch_one(conn, id, Addressing::Sequence).await {
        Ok(Some(message)) => Ok(message),
        Ok(None) => Err(Error::NotFound(id.to_string())),
        Err(e) if conn.state() == ConnectionState::Ready => {
            debug!(folder, id, "Sequence fetch failed: {e}");
            Err(Error::NotFound(id.to_string()))
        }
        Err(e) => Err(e),
    }
}

async fn fetch_one(
    conn: &mut Connection,
    id: u32,
    addressing: Addressing,
) -> Result<Option<RawMessage>> {
    let set = id.to_string();
    let session = conn.session()?;
    let outcome = match addressing {
        Addressing::Uid => match session.uid_fetch(&set, MESSAGE_QUERY).await {
            Ok(stream) => Ok(stream.collect::<Vec<_>>().await),
            Err(e) => Err(e),
        },
        Addressing::Sequence => match session.fetch(&set, MESSAGE_QUERY).await {
            Ok(stream) => Ok(stream.collect::<Vec<_>>().await),
            Err(e) => Err(e),
        },
    };

    let items = match outcome {
        Ok(items) => items,
        Err(e) => return Err(conn.imap_error(addressing.command(), &e)),
    };

    let mut failure = None;
    for item in items {
        match item {
            Ok(fetch) => {
                let matches = match addressing {
                    Addressing::Uid => fetch.uid == Some(id),
                    Addressing::Sequence => fetch.message == id,
                };
                if matches && let Some(message) = RawMessage::from_fetch(&fetch) {
                    return Ok(Some(message));
                }
            }
            Err(e) => failure = Some(e),
        }
    }

    match failure {
        Some(e) => Err(conn.imap_error(addressing.command(), &e)),
        None => Ok(None),
    }
}

fn spawn_mark_seen(conn: SharedConnection, folder: String, seq: u32, uid: Option<u32>) {
    tokio::spawn(async move {
        let mut conn = conn.lock_owned().await;
        match mark_seen(&mut conn, &folder, seq, uid).await {
            Ok(()) => debug!(folder, seq, ?uid, "Marked message as seen"),
            Err(e) => warn!(folder, seq, ?uid, "Failed to mark message as seen: {e}"),
        }
    });
}

async fn mark_seen(conn: &mut Connection, folder: &str, seq: u32, uid: Option<u32>) -> Result<()> {
    if conn.selected() != Some(folder) {
        conn.select(folder).await?;
    }

    let query = Flag::add_query(&[Flag::Seen]);
    let session = conn.session()?;
    let outcome = match uid {
        Some(uid) => match session.uid_store(uid.to_string(), &query).await {
            Ok(stream) => Ok(stream.collect::<Vec<_>>().await),
            Err(e) => Err(e),
        },
        None => match session.store(seq.to_string(), &query).await {
            Ok(stream) => Ok(stream.collect::<Vec<_>>().await),
            Err(e) => Err(e),
        },
    };

    let failure = match outcome {
        Ok(items) => items.into_iter().find_map(std::result::Result::err),
        Err(e) => Some(e),
    };
    match failure {
        Some(e) => Err(conn.imap_error("STORE", &e)),
        None => {
            info!(folder, seq, "Message flagged \\Seen");
            Ok(())
        }
    }
}
