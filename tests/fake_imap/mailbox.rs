//! Test data model for the fake IMAP server
//!
//! Provides a builder-style API for constructing mailbox state:
//!
//! ```ignore
//! let mailbox = MailboxBuilder::new()
//!     .credentials("user@example.com", "secret")
//!     .folder("INBOX")
//!         .email(1, false, raw_rfc2822_bytes)
//!         .email(2, true, raw_rfc2822_bytes)
//!     .folder("Work")
//!     .folder("Work/Projects")
//!         .stall(5, Duration::from_secs(2))
//!     .build();
//! ```
//!
//! Folder names use `/` as the hierarchy delimiter. The `Mailbox` is
//! shared with the server behind a mutex so STORE can flip `\Seen`.

use std::time::Duration;

/// Hierarchy delimiter announced in LIST responses.
pub const DELIMITER: char = '/';

/// A complete mailbox: the accepted login plus a collection of named
/// folders, each holding zero or more test emails.
#[derive(Debug, Clone)]
pub struct Mailbox {
    /// `(username, password)` accepted by LOGIN. `None` accepts anything.
    pub credentials: Option<(String, String)>,
    pub folders: Vec<Folder>,
}

impl Mailbox {
    /// Look up a folder by name (case-sensitive, matching real IMAP).
    pub fn get_folder(&self, name: &str) -> Option<&Folder> {
        self.folders.iter().find(|f| f.name == name)
    }

    pub fn get_folder_mut(&mut self, name: &str) -> Option<&mut Folder> {
        self.folders.iter_mut().find(|f| f.name == name)
    }

    /// Whether `name` has sub-folders.
    pub fn has_children(&self, name: &str) -> bool {
        let prefix = format!("{name}{DELIMITER}");
        self.folders.iter().any(|f| f.name.starts_with(&prefix))
    }

    /// Whether LOGIN with these credentials succeeds.
    pub fn accepts(&self, username: &str, password: &str) -> bool {
        self.credentials
            .as_ref()
            .is_none_or(|(u, p)| u == username && p == password)
    }
}

/// A pause injected into FETCH responses to simulate a slow server.
#[derive(Debug, Clone, Copy)]
pub struct Stall {
    /// Number of FETCH responses sent before pausing.
    pub after: usize,
    pub pause: Duration,
}

/// A single IMAP folder (e.g. "INBOX", "Work/Projects").
#[derive(Debug, Clone)]
pub struct Folder {
    pub name: String,
    pub emails: Vec<TestEmail>,
    pub stall: Option<Stall>,
}

/// A test email stored in a folder.
///
/// - `uid`: IMAP UID, unique per folder. The sequence number is the
///   1-based position in `Folder::emails`.
/// - `seen`: whether the `\Seen` flag is set.
/// - `raw`: the complete RFC 2822 message, returned for `BODY[]`.
#[derive(Debug, Clone)]
pub struct TestEmail {
    pub uid: u32,
    pub seen: bool,
    pub raw: Vec<u8>,
}

/// Builder for constructing a `Mailbox` step by step.
///
/// Call `.folder(name)` to start a new folder, then chain
/// `.email(uid, seen, raw)` calls to add messages to it.
/// Finish with `.build()` to get the final `Mailbox`.
pub struct MailboxBuilder {
    credentials: Option<(String, String)>,
    folders: Vec<Folder>,
}

impl MailboxBuilder {
    pub const fn new() -> Self {
        Self {
            credentials: None,
            folders: Vec::new(),
        }
    }

    /// Only accept LOGIN with this username and password.
    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    /// Add a new folder. Subsequent `.email()` calls add to this folder.
    pub fn folder(mut self, name: &str) -> Self {
        self.folders.push(Folder {
            name: name.to_string(),
            emails: Vec::new(),
            stall: None,
        });
        self
    }

    /// Add an email to the most recently added folder.
    ///
    /// # Panics
    ///
    /// Panics if called before any `.folder()` call.
    pub fn email(mut self, uid: u32, seen: bool, raw: &[u8]) -> Self {
        self.current().emails.push(TestEmail {
            uid,
            seen,
            raw: raw.to_vec(),
        });
        self
    }

    /// Pause FETCH responses from the most recently added folder after
    /// `after` messages have been sent.
    ///
    /// # Panics
    ///
    /// Panics if called before any `.folder()` call.
    pub fn stall(mut self, after: usize, pause: Duration) -> Self {
        self.current().stall = Some(Stall { after, pause });
        self
    }

    /// Consume the builder and return the finished `Mailbox`.
    pub fn build(self) -> Mailbox {
        Mailbox {
            credentials: self.credentials,
            folders: self.folders,
        }
    }

    fn current(&mut self) -> &mut Folder {
        self.folders
            .last_mut()
            .expect("call .folder() before adding to it")
    }
}
