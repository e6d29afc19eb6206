//! In-process fake IMAP server for integration testing
//!
//! # Connection lifecycle
//!
//! ```text
//!   Client connects via TCP
//!       |
//!   [STARTTLS mode]  greeting, STARTTLS, TLS handshake
//!   [implicit mode]  TLS handshake, greeting
//!       |
//!   LOGIN with username and password (checked against the mailbox)
//!       |
//!   LIST, SELECT, FETCH, UID FETCH, STORE, UID STORE ...
//!       |
//!   LOGOUT
//! ```
//!
//! ## Command format
//!
//! Every client command starts with a **tag** chosen by the client
//! (async-imap uses `A0001`, `A0002`, ...). The server echoes it in the
//! tagged completion so responses can be matched to commands. Lines
//! prefixed with `*` are untagged data sent before that completion:
//!
//! ```text
//!   Client:  A0002 LIST "" "*"
//!   Server:  * LIST (\HasNoChildren) "/" "INBOX"
//!   Server:  A0002 OK LIST completed
//! ```

use super::handlers::{
    Items, StoreArgs, handle_fetch, handle_list, handle_login, handle_logout, handle_select,
    handle_store,
};
use super::io::write_line;
use super::mailbox::Mailbox;
use imap_codec::CommandCodec;
use imap_codec::decode::Decoder;
use imap_codec::imap_types::command::CommandBody;
use imap_codec::imap_types::mailbox::Mailbox as ImapMailbox;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::PrivatePkcs8KeyDer;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

const GREETING: &str = "* OK IMAP4rev1 Fake server ready\r\n";

/// How the server secures new connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    /// TLS from the first byte, as on port 993.
    Implicit,
    /// Plain greeting, then `STARTTLS`, as on port 143.
    StartTls,
}

/// A fake IMAP server that runs on localhost with an OS-assigned port.
///
/// The server generates a self-signed TLS certificate at startup using
/// `rcgen`, so no cert files are needed. Clients must accept invalid
/// certificates to talk to it.
pub struct FakeImapServer {
    port: u16,
    mailbox: Arc<Mutex<Mailbox>>,
    /// Handle to the background task so it lives as long as the server.
    _handle: tokio::task::JoinHandle<()>,
}

impl FakeImapServer {
    /// Start a server that upgrades connections with STARTTLS.
    pub async fn start(mailbox: Mailbox) -> Self {
        Self::start_with(mailbox, Security::StartTls).await
    }

    /// Start a server that expects TLS immediately.
    pub async fn start_implicit(mailbox: Mailbox) -> Self {
        Self::start_with(mailbox, Security::Implicit).await
    }

    /// Start a new fake IMAP server with the given mailbox state.
    ///
    /// The accept loop runs until the `FakeImapServer` is dropped.
    pub async fn start_with(mailbox: Mailbox, security: Security) -> Self {
        // Several tests may race to install the provider.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();

        let cert = generate_simple_self_signed(vec!["127.0.0.1".to_string()])
            .expect("generate self-signed cert");
        let cert_der = cert.cert.der().clone();
        let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der.into())
            .expect("build server TLS config");

        let acceptor = TlsAcceptor::from(Arc::new(tls_config));
        let mailbox = Arc::new(Mutex::new(mailbox));
        let shared = Arc::clone(&mailbox);

        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _addr)) = listener.accept().await else {
                    break;
                };
                let acceptor = acceptor.clone();
                let mailbox = Arc::clone(&shared);
                tokio::spawn(async move {
                    match security {
                        Security::Implicit => handle_implicit(stream, acceptor, &mailbox).await,
                        Security::StartTls => handle_starttls(stream, acceptor, &mailbox).await,
                    }
                });
            }
        });

        Self {
            port,
            mailbox,
            _handle: handle,
        }
    }

    /// The port the server is listening on.
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// A copy of the current mailbox state, including flag changes.
    pub fn snapshot(&self) -> Mailbox {
        self.mailbox.lock().unwrap().clone()
    }
}

async fn handle_implicit(stream: TcpStream, acceptor: TlsAcceptor, mailbox: &Mutex<Mailbox>) {
    let Ok(tls_stream) = acceptor.accept(stream).await else {
        return;
    };
    let mut reader = BufReader::new(tls_stream);
    if write_line(&mut reader, GREETING).await.is_err() {
        return;
    }
    handle_imap_session(reader, mailbox).await;
}

/// Greeting and STARTTLS on the raw TCP stream, then the session over
/// TLS.
async fn handle_starttls(stream: TcpStream, acceptor: TlsAcceptor, mailbox: &Mutex<Mailbox>) {
    let mut reader = BufReader::new(stream);
    if write_line(&mut reader, GREETING).await.is_err() {
        return;
    }

    let mut line = String::new();
    if reader.read_line(&mut line).await.is_err() {
        return;
    }
    let Some((tag, command)) = line.trim().split_once(' ') else {
        return;
    };

    if !command.eq_ignore_ascii_case("STARTTLS") {
        let resp = format!("{tag} BAD Expected STARTTLS\r\n");
        let _ = write_line(&mut reader, &resp).await;
        return;
    }

    let resp = format!("{tag} OK Begin TLS negotiation now\r\n");
    if write_line(&mut reader, &resp).await.is_err() {
        return;
    }

    let Ok(tls_stream) = acceptor.accept(reader.into_inner()).await else {
        return;
    };
    handle_imap_session(BufReader::new(tls_stream), mailbox).await;
}

/// Extract the folder name from a parsed `imap_types::Mailbox`.
fn mailbox_name(mb: &ImapMailbox<'_>) -> String {
    match mb {
        ImapMailbox::Inbox => "INBOX".to_string(),
        ImapMailbox::Other(other) => {
            let bytes: &[u8] = other.as_ref();
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

/// Run the IMAP command loop over an established stream.
///
/// Uses `imap-codec`'s `CommandCodec` to parse each command line, then
/// dispatches on the `CommandBody` variant. Read handlers get a
/// snapshot of the mailbox; STORE locks it briefly to mutate flags.
async fn handle_imap_session<S: AsyncRead + AsyncWrite + Unpin>(
    mut reader: BufReader<S>,
    mailbox: &Mutex<Mailbox>,
) {
    let mut selected_folder: Option<String> = None;
    let codec = CommandCodec::default();

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let Ok((_, command)) = codec.decode(line.as_bytes()) else {
            let tag = trimmed.split_whitespace().next().unwrap_or("*");
            let resp = format!("{tag} BAD Parse error\r\n");
            if write_line(&mut reader, &resp).await.is_err() {
                break;
            }
            continue;
        };

        let tag = command.tag.inner();
        let snap = mailbox.lock().unwrap().clone();

        match command.body {
            CommandBody::Login { .. } => {
                if !handle_login(tag, &line, &snap, &mut reader).await {
                    break;
                }
            }
            CommandBody::List { .. } => {
                handle_list(tag, &snap, &mut reader).await;
            }
            CommandBody::Select { mailbox: ref mb, .. } => {
                let name = mailbox_name(mb);
                selected_folder = handle_select(tag, &name, &snap, &mut reader).await;
            }
            CommandBody::Fetch {
                ref sequence_set,
                uid,
                ..
            } => {
                let items = Items::from_line(&line);
                handle_fetch(
                    tag,
                    sequence_set,
                    uid,
                    &items,
                    &snap,
                    selected_folder.as_deref(),
                    &mut reader,
                )
                .await;
            }
            CommandBody::Store {
                ref sequence_set,
                uid,
                ref kind,
                ref response,
                ref flags,
                ..
            } => {
                let args = StoreArgs {
                    sequence_set,
                    uid,
                    kind,
                    response,
                    flags,
                };
                handle_store(tag, &args, mailbox, selected_folder.as_deref(), &mut reader).await;
            }
            CommandBody::Logout => {
                handle_logout(tag, &mut reader).await;
                break;
            }
            _ => {
                let resp = format!("{tag} BAD Unknown command\r\n");
                if write_line(&mut reader, &resp).await.is_err() {
                    break;
                }
            }
        }
    }
}
