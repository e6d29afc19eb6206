//! LOGIN command handler.
//!
//! Credentials arrive as two IMAP strings after the command name.
//! async-imap always sends them quoted:
//!
//! ```text
//! A0001 LOGIN "user@example.com" "secret"
//! ```
//!
//! The handler compares them against the mailbox's configured login and
//! answers `NO` on mismatch, like a real server rejecting a password.

use crate::fake_imap::io::write_line;
use crate::fake_imap::mailbox::Mailbox;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// Split the arguments of a command line into IMAP strings. Handles
/// quoted strings with `\"` and `\\` escapes as well as bare atoms.
fn string_args(args: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = args.trim().chars().peekable();
    while let Some(&c) = chars.peek() {
        if c == ' ' {
            chars.next();
            continue;
        }
        let mut value = String::new();
        if c == '"' {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    other => value.push(other),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ' ' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }
        out.push(value);
    }
    out
}

/// Extract `(username, password)` from a raw `LOGIN` command line.
fn credentials(line: &str) -> Option<(String, String)> {
    let mut parts = line.trim().splitn(3, ' ');
    let _tag = parts.next()?;
    if !parts.next()?.eq_ignore_ascii_case("LOGIN") {
        return None;
    }
    let mut args = string_args(parts.next()?).into_iter();
    Some((args.next()?, args.next()?))
}

/// Handle the LOGIN command. Returns `false` if the client went away.
pub async fn handle_login<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    line: &str,
    mailbox: &Mailbox,
    stream: &mut BufReader<S>,
) -> bool {
    let accepted =
        credentials(line).is_some_and(|(user, pass)| mailbox.accepts(&user, &pass));
    let resp = if accepted {
        format!("{tag} OK LOGIN completed\r\n")
    } else {
        format!("{tag} NO [AUTHENTICATIONFAILED] Invalid credentials\r\n")
    };
    write_line(stream, &resp).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_imap::mailbox::MailboxBuilder;
    use tokio::io::BufReader;

    /// Create a `BufReader` over an in-memory duplex stream, run the
    /// handler, and return what was written to the client.
    async fn run(tag: &str, line: &str, mailbox: &Mailbox) -> (String, bool) {
        let (client, server) = tokio::io::duplex(1024);
        let mut stream = BufReader::new(server);

        let ok = handle_login(tag, line, mailbox, &mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(client), &mut buf)
            .await
            .unwrap();
        (String::from_utf8(buf).unwrap(), ok)
    }

    #[test]
    fn parses_quoted_credentials() {
        assert_eq!(
            credentials("A1 LOGIN \"me@example.com\" \"p\\\"w\"\r\n"),
            Some(("me@example.com".to_string(), "p\"w".to_string()))
        );
        assert_eq!(
            credentials("A1 login user pass"),
            Some(("user".to_string(), "pass".to_string()))
        );
        assert_eq!(credentials("A1 LOGIN onlyuser"), None);
    }

    #[tokio::test]
    async fn accepts_matching_credentials() {
        let mailbox = MailboxBuilder::new().credentials("me", "pw").build();
        let (output, ok) = run("A0001", "A0001 LOGIN \"me\" \"pw\"\r\n", &mailbox).await;
        assert!(ok);
        assert_eq!(output, "A0001 OK LOGIN completed\r\n");
    }

    #[tokio::test]
    async fn rejects_wrong_password() {
        let mailbox = MailboxBuilder::new().credentials("me", "pw").build();
        let (output, _) = run("A0001", "A0001 LOGIN \"me\" \"nope\"\r\n", &mailbox).await;
        assert!(output.starts_with("A0001 NO "));
    }

    #[tokio::test]
    async fn open_mailbox_accepts_anything() {
        let mailbox = MailboxBuilder::new().build();
        let (output, _) = run("TAG42", "TAG42 LOGIN \"x\" \"y\"\r\n", &mailbox).await;
        assert!(output.starts_with("TAG42 OK"));
    }
}
