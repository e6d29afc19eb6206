//! Message shapes returned to clients

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A mailbox address with an optional display name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: String,
    pub address: String,
}

impl Address {
    #[must_use]
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            f.write_str(&self.address)
        } else if self.address.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{} <{}>", self.name, self.address)
        }
    }
}

/// Join addresses the way a header would show them.
#[must_use]
pub fn join_addresses(addresses: &[Address]) -> String {
    addresses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// One row of a folder listing.
///
/// `id` starts out as the sequence number and becomes the UID once the
/// server reports it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    pub id: u32,
    pub uid: Option<u32>,
    #[serde(skip)]
    pub seq: u32,
    pub subject: String,
    pub from: Address,
    pub to: Vec<Address>,
    pub date: DateTime<Utc>,
    /// False when the Date header was missing or unparseable and `date`
    /// holds the fallback.
    #[serde(skip)]
    pub date_known: bool,
    pub is_read: bool,
    pub has_attachments: bool,
}

impl MessageSummary {
    #[must_use]
    pub fn new(seq: u32) -> Self {
        Self {
            id: seq,
            uid: None,
            seq,
            subject: String::new(),
            from: Address::default(),
            to: Vec::new(),
            date: Utc::now(),
            date_known: false,
            is_read: false,
            has_attachments: false,
        }
    }

    pub const fn set_uid(&mut self, uid: u32) {
        self.uid = Some(uid);
        self.id = uid;
    }
}

/// Metadata for one attachment of a retrieved message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentInfo {
    pub filename: String,
    pub content_type: String,
    pub size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
}

/// A fully retrieved message. `body` is always safe-to-render HTML.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullMessage {
    #[serde(flatten)]
    pub summary: MessageSummary,
    pub cc: Vec<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub body: String,
    pub attachments: Vec<AttachmentInfo>,
}
