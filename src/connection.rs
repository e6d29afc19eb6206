//! IMAP connection establishment and the per-session connection handle
//!
//! [`connect`] opens one authenticated session (implicit TLS or
//! STARTTLS) and wraps it in a [`Connection`]. Pipelines share a handle
//! through [`SharedConnection`], whose mutex serializes protocol
//! exchanges on that session.

use crate::config::{ImapConfig, TlsMode};
use crate::error::{Error, Result};
use async_imap::Session;
use async_imap::error::Error as ImapError;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info, warn};

/// A TLS-wrapped IMAP session.
pub type ImapSession = Session<Compat<tokio_rustls::client::TlsStream<TcpStream>>>;

/// A connection handle shared between the registry and the pipelines.
pub type SharedConnection = Arc<tokio::sync::Mutex<Connection>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Ready,
    /// The protocol stream broke; the session must be reopened.
    Failed,
    Closed,
}

/// One authenticated IMAP session plus the parameters used to open it.
pub struct Connection {
    session: ImapSession,
    config: ImapConfig,
    state: ConnectionState,
    selected: Option<String>,
}

impl Connection {
    /// The parameters this connection was opened with. The outbound
    /// dispatcher derives its submission client from them.
    #[must_use]
    pub const fn config(&self) -> &ImapConfig {
        &self.config
    }

    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// The currently selected folder, if any.
    #[must_use]
    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Borrow the live session.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection has failed or been closed.
    pub fn session(&mut self) -> Result<&mut ImapSession> {
        match self.state {
            ConnectionState::Ready => Ok(&mut self.session),
            ConnectionState::Failed => Err(Error::Protocol(
                "Connection to mail server was lost, please reconnect".into(),
            )),
            ConnectionState::Closed => Err(Error::InvalidSession),
        }
    }

    /// Convert a protocol error, marking the connection failed when the
    /// underlying stream is gone.
    pub fn imap_error(&mut self, context: &str, err: &ImapError) -> Error {
        if matches!(err, ImapError::Io(_)) {
            warn!(host = %self.config.host, "IMAP stream failed: {err}");
            self.state = ConnectionState::Failed;
        }
        Error::Imap(format!("{context}: {err}"))
    }

    /// SELECT a folder read-write. Returns the number of messages in it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Folder`] if the server rejects the selection.
    pub async fn select(&mut self, folder: &str) -> Result<u32> {
        let outcome = self.session()?.select(folder).await;
        match outcome {
            Ok(mailbox) => {
                debug!(folder, exists = mailbox.exists, "Folder selected");
                self.selected = Some(folder.to_string());
                Ok(mailbox.exists)
            }
            Err(e) => {
                self.selected = None;
                let reason = self.imap_error("SELECT", &e).to_string();
                Err(Error::Folder {
                    folder: folder.to_string(),
                    reason,
                })
            }
        }
    }

    /// Log out and mark the handle closed. Closing twice is a no-op.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        let was_ready = self.state == ConnectionState::Ready;
        self.state = ConnectionState::Closed;
        self.selected = None;
        if was_ready && let Err(e) = self.session.logout().await {
            debug!(host = %self.config.host, "LOGOUT failed: {e}");
        }
        info!(host = %self.config.host, user = %self.config.username, "Connection closed");
    }
}

/// Open and authenticate one IMAP session.
///
/// Connects to `config.host:config.port` via TCP, performs the TLS
/// handshake (after `STARTTLS` when [`TlsMode::StartTls`] is chosen),
/// and logs in. The whole sequence is bounded by
/// `config.connect_timeout`.
///
/// # Errors
///
/// - [`Error::HostUnreachable`] if the TCP connection fails or the
///   server does not complete login in time
/// - [`Error::Tls`] if STARTTLS or the TLS handshake fails
/// - [`Error::AuthenticationFailed`] if the server rejects the login
/// - [`Error::Protocol`] for any other failure during login
pub async fn connect(config: ImapConfig) -> Result<Connection> {
    let addr = format!("{}:{}", config.host, config.port);
    debug!(%addr, tls = ?config.tls, "Connecting to IMAP server");

    let Ok(outcome) = tokio::time::timeout(config.connect_timeout, establish(&addr, &config)).await
    else {
        warn!(%addr, timeout = ?config.connect_timeout, "IMAP server did not answer in time");
        return Err(Error::HostUnreachable(format!(
            "{addr}: no response within {}s",
            config.connect_timeout.as_secs()
        )));
    };
    let session = outcome?;

    info!(host = %config.host, user = %config.username, "Connected to IMAP server");
    Ok(Connection {
        session,
        config,
        state: ConnectionState::Ready,
        selected: None,
    })
}

async fn establish(addr: &str, config: &ImapConfig) -> Result<ImapSession> {
    let tcp_stream = TcpStream::connect(addr)
        .await
        .map_err(|e| Error::HostUnreachable(format!("{addr}: {e}")))?;

    let tcp_stream = match config.tls {
        TlsMode::Implicit => tcp_stream,
        TlsMode::StartTls => starttls(tcp_stream).await?,
    };

    let connector = tls_connector(config.accept_invalid_certs)?;
    let server_name = ServerName::try_from(config.host.clone())
        .map_err(|e| Error::Tls(format!("Invalid server name: {e}")))?;

    let tls_stream = connector
        .connect(server_name, tcp_stream)
        .await
        .map_err(|e| Error::Tls(e.to_string()))?;

    let tls_client = async_imap::Client::new(tls_stream.compat());

    tls_client
        .login(&config.username, &config.password)
        .await
        .map_err(|(e, _)| match e {
            ImapError::No(_) => Error::AuthenticationFailed(e.to_string()),
            other => Error::Protocol(format!("Login failed: {other}")),
        })
}

/// Issue STARTTLS on a plain connection and hand back the raw stream.
async fn starttls(tcp_stream: TcpStream) -> Result<TcpStream> {
    let mut client = async_imap::Client::new(tcp_stream.compat());
    client
        .run_command_and_check_ok("STARTTLS", None)
        .await
        .map_err(|e| Error::Tls(format!("STARTTLS failed: {e}")))?;
    Ok(client.into_inner().into_inner())
}

/// Build a TLS connector, optionally accepting any certificate.
fn tls_connector(accept_invalid_certs: bool) -> Result<TlsConnector> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?;

    let config = if accept_invalid_certs {
        warn!("TLS certificate verification is disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth()
    } else {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Certificate verifier that accepts all certificates. Used only when
/// the operator sets `accept_invalid_certs`.
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
