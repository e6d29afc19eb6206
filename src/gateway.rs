//! Session-scoped entry points
//!
//! [`Gateway`] owns the session registry and the process settings. Each
//! public method resolves the session first and then runs exactly one
//! pipeline against that session's connection.

use crate::config::{GatewayConfig, ImapConfig, TlsMode};
use crate::connection::{self, SharedConnection};
use crate::dispatch::{Dispatcher, ForwardEmail, OutgoingEmail, compose_forward};
use crate::error::{Error, Result};
use crate::folder::{Folder, list_folders, mailbox_name};
use crate::listing::{Listing, ListingOptions, list_messages};
use crate::message::{MessageView, get_message, load_message, parse_message_id};
use crate::session::SessionRegistry;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Upper bound for logging out one connection during shutdown or expiry.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Credentials and server parameters for opening a session.
#[derive(Clone, Deserialize)]
pub struct ConnectRequest {
    pub email: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_secure")]
    pub secure: bool,
}

const fn default_secure() -> bool {
    true
}

impl std::fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .finish()
    }
}

/// What the registry stores per session. The IMAP parameters are kept
/// outside the connection lock so submission never waits on a fetch.
#[derive(Clone)]
pub struct SessionHandle {
    pub connection: SharedConnection,
    pub imap: Arc<ImapConfig>,
}

pub struct Gateway {
    registry: SessionRegistry<SessionHandle>,
    config: GatewayConfig,
}

impl Gateway {
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            registry: SessionRegistry::new(config.max_sessions, config.session_idle),
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &GatewayConfig {
        &self.config
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Open an IMAP session and register it.
    ///
    /// # Errors
    ///
    /// Returns a connection failure if the server cannot be reached or
    /// rejects the credentials, or [`Error::SessionLimit`] if the
    /// registry is full.
    pub async fn connect(&self, request: ConnectRequest) -> Result<String> {
        // Free capacity now; the logouts themselves must not delay login.
        let expired = self.registry.take_expired();
        if !expired.is_empty() {
            info!(count = expired.len(), "Closing idle sessions");
            tokio::spawn(close_all(expired));
        }

        let imap = ImapConfig {
            host: request.host.trim().to_string(),
            port: request.port,
            username: request.email.trim().to_string(),
            password: request.password,
            tls: TlsMode::from_secure(request.secure),
            accept_invalid_certs: self.config.accept_invalid_certs,
            connect_timeout: self.config.connect_timeout,
        };

        let connection = connection::connect(imap.clone()).await?;
        let handle = SessionHandle {
            connection: Arc::new(Mutex::new(connection)),
            imap: Arc::new(imap),
        };

        match self.registry.create(handle.clone()) {
            Ok(id) => {
                info!(session = short_id(&id), user = %handle.imap.username, "Session created");
                Ok(id)
            }
            Err(e) => {
                handle.connection.lock().await.close().await;
                Err(e)
            }
        }
    }

    /// Resolve a session id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSession`] if the id is missing or unknown.
    pub fn session(&self, id: Option<&str>) -> Result<SessionHandle> {
        match id.map(str::trim) {
            None | Some("") => Err(Error::InvalidSession),
            Some(id) => self.registry.get(id),
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidSession`] or the folder listing failure.
    pub async fn folders(&self, session_id: Option<&str>) -> Result<Vec<Folder>> {
        let handle = self.session(session_id)?;
        let mut conn = handle.connection.lock().await;
        list_folders(&mut conn).await
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidSession`] or the listing failure.
    pub async fn emails(&self, session_id: Option<&str>, folder: Option<&str>) -> Result<Listing> {
        let handle = self.session(session_id)?;
        let options = ListingOptions {
            limit: self.config.list_limit,
            watchdog: self.config.list_timeout,
        };
        list_messages(handle.connection, &mailbox_name(folder), options).await
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidSession`], [`Error::NotFound`] or the
    /// retrieval failure.
    pub async fn email(
        &self,
        session_id: Option<&str>,
        id: &str,
        folder: Option<&str>,
    ) -> Result<MessageView> {
        let handle = self.session(session_id)?;
        let id = parse_message_id(id)?;
        get_message(
            handle.connection,
            &mailbox_name(folder),
            id,
            self.config.message_timeout,
        )
        .await
    }

    /// Send a new message or reply. Returns the `Message-ID`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSession`] or [`Error::Dispatch`].
    pub async fn send(&self, session_id: Option<&str>, email: &OutgoingEmail) -> Result<String> {
        let handle = self.session(session_id)?;
        let dispatcher = Dispatcher::new(&handle.imap, email.smtp_config.as_ref());
        dispatcher.send(email).await
    }

    /// Forward a stored message. A missing original does not fail the
    /// forward; a placeholder is quoted instead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSession`] or [`Error::Dispatch`].
    pub async fn forward(&self, session_id: Option<&str>, request: &ForwardEmail) -> Result<String> {
        let handle = self.session(session_id)?;
        let folder = mailbox_name(request.folder.as_deref());

        let original = match request.original_email_id.resolve() {
            Ok(id) => load_message(
                handle.connection.clone(),
                &folder,
                id,
                self.config.message_timeout,
            )
            .await
            .inspect_err(|e| warn!(folder, id, "Forwarding without original: {e}"))
            .ok(),
            Err(e) => {
                warn!(folder, "Forwarding without original: {e}");
                None
            }
        };

        let draft = compose_forward(original.as_ref(), &request.additional_text);
        let dispatcher = Dispatcher::new(&handle.imap, request.smtp_config.as_ref());
        dispatcher.forward(draft, request.recipients()).await
    }

    /// Remove a session and log its connection out in the background.
    /// Returns whether the session existed.
    pub fn logout(&self, session_id: Option<&str>) -> bool {
        let Some(id) = session_id.map(str::trim).filter(|id| !id.is_empty()) else {
            return false;
        };
        let Some(handle) = self.registry.remove(id) else {
            debug!(session = short_id(id), "Logout for unknown session");
            return false;
        };
        info!(session = short_id(id), "Session closed by client");
        tokio::spawn(close_handle(handle));
        true
    }

    /// Close sessions idle past the limit. Returns how many were closed.
    pub async fn prune_idle(&self) -> usize {
        let expired = self.registry.take_expired();
        let count = expired.len();
        if count > 0 {
            close_all(expired).await;
            info!(count, "Closed idle sessions");
        }
        count
    }

    /// Close every registered connection once. In-flight requests are
    /// not waited for beyond a bounded lock wait per connection.
    pub async fn shutdown(&self) {
        let handles = self.registry.drain();
        info!(count = handles.len(), "Closing all sessions");
        close_all(handles).await;
    }
}

/// Close connections concurrently, each bounded by `CLOSE_TIMEOUT`.
async fn close_all(handles: Vec<SessionHandle>) {
    futures::future::join_all(handles.into_iter().map(close_handle)).await;
}

async fn close_handle(handle: SessionHandle) {
    let close = async {
        handle.connection.lock().await.close().await;
    };
    if tokio::time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
        warn!(host = %handle.imap.host, user = %handle.imap.username, "Timed out closing connection");
    }
}

/// Enough of a session id to correlate log lines without exposing it.
fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
