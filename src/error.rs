//! Error types for mail-gateway

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid session")]
    InvalidSession,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Host unreachable: {0}")]
    HostUnreachable(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IMAP error: {0}")]
    Imap(String),

    #[error("Failed to open folder {folder}: {reason}")]
    Folder { folder: String, reason: String },

    #[error("Fetch timed out after {}s", .0.as_secs())]
    FetchTimeout(Duration),

    #[error("Message {0} not found")]
    NotFound(String),

    #[error("Email parsing error: {0}")]
    Parse(String),

    #[error("Failed to send message: {0}")]
    Dispatch(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session limit of {0} reached")]
    SessionLimit(usize),
}

impl Error {
    /// Stable machine-readable code sent alongside the message.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidSession => "INVALID_SESSION",
            Self::AuthenticationFailed(_) => "AUTHENTICATION_FAILED",
            Self::HostUnreachable(_) | Self::Protocol(_) | Self::Tls(_) => "CONNECTION_FAILURE",
            Self::Imap(_) => "IMAP_ERROR",
            Self::Folder { .. } => "FOLDER_UNAVAILABLE",
            Self::FetchTimeout(_) => "FETCH_TIMEOUT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Parse(_) => "PARSE_FAILURE",
            Self::Dispatch(_) => "DISPATCH_FAILURE",
            Self::Config(_) => "CONFIG_ERROR",
            Self::SessionLimit(_) => "SESSION_LIMIT",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
