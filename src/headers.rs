//! Lenient header parsing for listings and retrieved messages

use crate::model::Address;
use chrono::{DateTime, Utc};
use mailparse::MailHeaderMap;
use regex::Regex;
use std::sync::LazyLock;

static NAMED_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*"?([^"<]*?)"?\s*<([^<>]+)>\s*$"#).expect("valid named address regex")
});

static BARE_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+").expect("valid bare address regex")
});

pub const NO_SUBJECT: &str = "(No subject)";

/// The header fields a listing needs.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderFields {
    pub subject: String,
    pub from: Address,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub date: DateTime<Utc>,
    pub date_known: bool,
}

impl Default for HeaderFields {
    fn default() -> Self {
        Self {
            subject: NO_SUBJECT.to_string(),
            from: Address::default(),
            to: Vec::new(),
            cc: Vec::new(),
            date: Utc::now(),
            date_known: false,
        }
    }
}

/// Parse a raw header block. Never fails: anything unreadable falls
/// back to defaults.
#[must_use]
pub fn parse_header_block(raw: &[u8]) -> HeaderFields {
    let Ok((headers, _)) = mailparse::parse_headers(raw) else {
        return HeaderFields::default();
    };
    fields_from_headers(&headers)
}

/// Extract [`HeaderFields`] from already parsed headers.
#[must_use]
pub fn fields_from_headers(headers: &[mailparse::MailHeader<'_>]) -> HeaderFields {
    let subject = headers
        .get_first_value("Subject")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| NO_SUBJECT.to_string());

    let from = headers
        .get_first_value("From")
        .map(|raw| parse_address(&raw))
        .unwrap_or_default();

    let to = headers
        .get_first_value("To")
        .map(|raw| parse_address_list(&raw))
        .unwrap_or_default();

    let cc = headers
        .get_first_value("Cc")
        .map(|raw| parse_address_list(&raw))
        .unwrap_or_default();

    let (date, date_known) = parse_date(headers.get_first_value("Date").as_deref());

    HeaderFields {
        subject,
        from,
        to,
        cc,
        date,
        date_known,
    }
}

/// Parse `Name <address>`, falling back to the first bare address found
/// and finally to the raw text.
#[must_use]
pub fn parse_address(raw: &str) -> Address {
    if let Some(caps) = NAMED_ADDRESS.captures(raw) {
        return Address::new(caps[1].trim(), caps[2].trim());
    }
    if let Some(found) = BARE_ADDRESS.find(raw) {
        return Address::new("", found.as_str());
    }
    Address::new("", raw.trim())
}

/// Split a header value on commas outside quotes and angle brackets.
#[must_use]
pub fn parse_address_list(raw: &str) -> Vec<Address> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angle = false;

    for c in raw.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angle = true,
            '>' if !in_quotes => in_angle = false,
            ',' if !in_quotes && !in_angle => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    parts.push(current);

    parts
        .iter()
        .filter(|p| !p.trim().is_empty())
        .map(|p| parse_address(p))
        .collect()
}

/// Parse an RFC 2822 date. Missing or invalid dates become "now" with
/// the second element set to `false`.
#[must_use]
pub fn parse_date(raw: Option<&str>) -> (DateTime<Utc>, bool) {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| {
            DateTime::parse_from_rfc2822(value)
                .map(|date| date.with_timezone(&Utc))
                .ok()
                .or_else(|| lenient_date(value))
        })
        .map_or_else(|| (Utc::now(), false), |date| (date, true))
}

/// `dateparse` accepts obsolete forms chrono rejects, but it also maps
/// garbage to the epoch, so a zero or negative result counts as unknown.
fn lenient_date(value: &str) -> Option<DateTime<Utc>> {
    mailparse::dateparse(value)
        .ok()
        .filter(|&ts| ts > 0)
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
}
