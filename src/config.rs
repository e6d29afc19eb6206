//! Connection and gateway configuration

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How the IMAP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// TLS from the first byte (usually port 993).
    Implicit,
    /// Plain TCP upgraded with `STARTTLS` (usually port 143).
    StartTls,
}

impl TlsMode {
    /// Map the client's `secure` flag onto a TLS mode.
    #[must_use]
    pub const fn from_secure(secure: bool) -> Self {
        if secure { Self::Implicit } else { Self::StartTls }
    }
}

/// Parameters for opening one IMAP session.
#[derive(Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls: TlsMode,
    /// Skip certificate verification. Only for servers with self-signed
    /// certificates the operator trusts.
    pub accept_invalid_certs: bool,
    /// Upper bound for TCP connect, TLS setup and LOGIN together.
    pub connect_timeout: Duration,
}

impl fmt::Debug for ImapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("tls", &self.tls)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Default server parameters for a well-known mail provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDefaults {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl ProviderDefaults {
    fn new(host: &str, port: u16, secure: bool) -> Self {
        Self {
            host: host.to_string(),
            port,
            secure,
        }
    }

    /// Built-in provider table keyed by provider name.
    #[must_use]
    pub fn builtin() -> BTreeMap<String, Self> {
        BTreeMap::from([
            ("gmail".to_string(), Self::new("imap.gmail.com", 993, true)),
            (
                "outlook".to_string(),
                Self::new("outlook.office365.com", 993, true),
            ),
            (
                "yahoo".to_string(),
                Self::new("imap.mail.yahoo.com", 993, true),
            ),
            (
                "icloud".to_string(),
                Self::new("imap.mail.me.com", 993, true),
            ),
        ])
    }
}

/// Process-wide gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: String,
    pub accept_invalid_certs: bool,
    /// How many of the most recent messages a listing returns.
    pub list_limit: u32,
    pub connect_timeout: Duration,
    pub list_timeout: Duration,
    pub message_timeout: Duration,
    pub max_sessions: usize,
    /// Sessions unused for this long are closed.
    pub session_idle: Duration,
    pub providers: BTreeMap<String, ProviderDefaults>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3001".to_string(),
            accept_invalid_certs: false,
            list_limit: 30,
            connect_timeout: Duration::from_secs(30),
            list_timeout: Duration::from_secs(30),
            message_timeout: Duration::from_secs(180),
            max_sessions: 1000,
            session_idle: Duration::from_secs(30 * 60),
            providers: ProviderDefaults::builtin(),
        }
    }
}

impl GatewayConfig {
    /// Load gateway configuration from environment variables
    ///
    /// Reads from `.env` file if present. All variables are optional:
    /// - `GATEWAY_BIND` (default: `127.0.0.1:3001`)
    /// - `GATEWAY_ACCEPT_INVALID_CERTS` (default: `false`)
    /// - `GATEWAY_LIST_LIMIT` (default: `30`)
    /// - `GATEWAY_CONNECT_TIMEOUT_SECS` (default: `30`)
    /// - `GATEWAY_LIST_TIMEOUT_SECS` (default: `30`)
    /// - `GATEWAY_MESSAGE_TIMEOUT_SECS` (default: `180`)
    /// - `GATEWAY_MAX_SESSIONS` (default: `1000`)
    /// - `GATEWAY_SESSION_IDLE_SECS` (default: `1800`)
    /// - `GATEWAY_PROVIDERS_FILE` (JSON object replacing the built-in
    ///   provider table)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is present but invalid or
    /// the providers file cannot be read.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let providers = match env::var("GATEWAY_PROVIDERS_FILE") {
            Ok(path) => load_providers(&path)?,
            Err(_) => defaults.providers,
        };

        Ok(Self {
            bind: env::var("GATEWAY_BIND").unwrap_or(defaults.bind),
            accept_invalid_certs: env_or(
                "GATEWAY_ACCEPT_INVALID_CERTS",
                defaults.accept_invalid_certs,
            )?,
            list_limit: env_or("GATEWAY_LIST_LIMIT", defaults.list_limit)?,
            connect_timeout: Duration::from_secs(env_or(
                "GATEWAY_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout.as_secs(),
            )?),
            list_timeout: Duration::from_secs(env_or(
                "GATEWAY_LIST_TIMEOUT_SECS",
                defaults.list_timeout.as_secs(),
            )?),
            message_timeout: Duration::from_secs(env_or(
                "GATEWAY_MESSAGE_TIMEOUT_SECS",
                defaults.message_timeout.as_secs(),
            )?),
            max_sessions: env_or("GATEWAY_MAX_SESSIONS", defaults.max_sessions)?,
            session_idle: Duration::from_secs(env_or(
                "GATEWAY_SESSION_IDLE_SECS",
                defaults.session_idle.as_secs(),
            )?),
            providers,
        })
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    env::var(key).map_or(Ok(default), |raw| {
        raw.trim()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid {key}: {e}")))
    })
}

fn load_providers(path: &str) -> Result<BTreeMap<String, ProviderDefaults>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Cannot read providers file {path}: {e}")))?;
    parse_providers(&raw)
}

fn parse_providers(raw: &str) -> Result<BTreeMap<String, ProviderDefaults>> {
    serde_json::from_str(raw).map_err(|e| Error::Config(format!("Invalid providers file: {e}")))
}
