//! Session-oriented mail gateway
//!
//! Bridges JSON clients to a remote mailbox: one authenticated IMAP
//! connection per session for browsing (folders, listings, single
//! messages) and a transient SMTP client per request for sending and
//! forwarding.
//!
//! [`Gateway`] holds the session registry and exposes one method per
//! operation; [`router`] mounts those methods as HTTP endpoints.

mod api;
mod config;
mod connection;
mod dispatch;
mod error;
mod flag;
mod folder;
mod gateway;
mod headers;
mod lifecycle;
mod listing;
mod message;
mod mime;
mod model;
mod sanitize;
mod session;

pub use api::{ApiError, router, serve, status_for};
pub use config::{GatewayConfig, ImapConfig, ProviderDefaults, TlsMode};
pub use connection::{Connection, ConnectionState, SharedConnection, connect};
pub use dispatch::{
    Dispatcher, ForwardDraft, ForwardEmail, OutgoingEmail, Recipients, SmtpConfig, SmtpSecurity,
    SmtpTarget, compose_forward, derive_smtp_host, forward_subject,
};
pub use error::{Error, Result};
pub use flag::Flag;
pub use folder::{Folder, INBOX, list_folders};
pub use gateway::{ConnectRequest, Gateway, SessionHandle};
pub use headers::HeaderFields;
pub use lifecycle::{DRAIN_TIMEOUT, reaper_interval, serve_until, shutdown_signal, spawn_idle_reaper};
pub use listing::{Listing, ListingOptions, fetch_range, list_messages, sort_summaries};
pub use message::{
    Attachment, MessageRef, MessageView, ParseOptions, ParsedMessage, get_message, load_message,
    parse_message,
};
pub use model::{Address, AttachmentInfo, FullMessage, MessageSummary};
pub use sanitize::{escape_html, sanitize_html, text_to_html};
pub use session::SessionRegistry;
