//! IMAP message flags
//!
//! Typed flags for deriving read state from FETCH responses and for
//! building STORE queries.

use async_imap::types::Flag as ImapFlag;
use std::fmt;

/// An IMAP message flag.
///
/// Only `\Seen` drives gateway behavior. Every other flag is kept as
/// [`Flag::Keyword`] in its wire form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Flag {
    /// Message has been read (`\Seen`).
    Seen,
    /// Any other flag, verbatim.
    Keyword(String),
}

impl Flag {
    /// The IMAP wire representation of this flag.
    #[must_use]
    pub fn as_imap_str(&self) -> &str {
        match self {
            Self::Seen => "\\Seen",
            Self::Keyword(kw) => kw,
        }
    }

    /// STORE query that adds the given flags without echoing them back.
    #[must_use]
    pub fn add_query(flags: &[Self]) -> String {
        let list = flags
            .iter()
            .map(Self::as_imap_str)
            .collect::<Vec<_>>()
            .join(" ");
        format!("+FLAGS.SILENT ({list})")
    }
}

impl From<&ImapFlag<'_>> for Flag {
    fn from(flag: &ImapFlag<'_>) -> Self {
        let wire = match flag {
            ImapFlag::Seen => return Self::Seen,
            ImapFlag::Answered => "\\Answered",
            ImapFlag::Flagged => "\\Flagged",
            ImapFlag::Deleted => "\\Deleted",
            ImapFlag::Draft => "\\Draft",
            ImapFlag::Recent => "\\Recent",
            ImapFlag::MayCreate => "\\*",
            ImapFlag::Custom(kw) => kw.as_ref(),
        };
        Self::Keyword(wire.to_string())
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_imap_str())
    }
}

/// Whether a FETCH response's flags mark the message as read.
pub fn is_seen<'a>(flags: impl IntoIterator<Item = ImapFlag<'a>>) -> bool {
    flags
        .into_iter()
        .any(|flag| Flag::from(&flag) == Flag::Seen)
}
