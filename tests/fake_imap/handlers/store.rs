//! STORE and UID STORE command handler.
//!
//! Only `\Seen` is modelled. Supports:
//!
//! - `+FLAGS (...)` -- add flags
//! - `-FLAGS (...)` -- remove flags
//! - `FLAGS (...)` -- replace flags
//!
//! The `.SILENT` variants suppress the `* N FETCH (FLAGS (...))` echo.

use crate::fake_imap::io::write_line;
use crate::fake_imap::mailbox::Mailbox;
use crate::fake_imap::sequence::resolve;
use imap_codec::imap_types::flag::{Flag, StoreResponse, StoreType};
use imap_codec::imap_types::sequence::SequenceSet;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// Parsed STORE command arguments.
pub struct StoreArgs<'a> {
    pub sequence_set: &'a SequenceSet,
    pub uid: bool,
    pub kind: &'a StoreType,
    pub response: &'a StoreResponse,
    pub flags: &'a [Flag<'a>],
}

/// Apply a STORE to the shared mailbox. Returns `(seq, uid, seen)` for
/// every message touched, or `None` if the command cannot apply.
fn apply(args: &StoreArgs<'_>, mailbox: &Mutex<Mailbox>, folder_name: &str) -> Option<Vec<(usize, u32, bool)>> {
    let wants_seen = args.flags.iter().any(|f| matches!(f, Flag::Seen));
    let mut mb = mailbox.lock().unwrap();
    let folder = mb.get_folder_mut(folder_name)?;
    let indices = resolve(args.sequence_set, args.uid, folder)?;

    let mut touched = Vec::new();
    for idx in indices {
        let email = &mut folder.emails[idx];
        match args.kind {
            StoreType::Add if wants_seen => email.seen = true,
            StoreType::Remove if wants_seen => email.seen = false,
            StoreType::Replace => email.seen = wants_seen,
            StoreType::Add | StoreType::Remove => {}
        }
        touched.push((idx + 1, email.uid, email.seen));
    }
    Some(touched)
}

/// Handle STORE (`uid == false`) and UID STORE (`uid == true`).
pub async fn handle_store<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    args: &StoreArgs<'_>,
    mailbox: &Mutex<Mailbox>,
    selected_folder: Option<&str>,
    stream: &mut BufReader<S>,
) {
    let Some(folder_name) = selected_folder else {
        let resp = format!("{tag} BAD No folder selected\r\n");
        let _ = write_line(stream, &resp).await;
        return;
    };

    // Mutate under the lock, write afterwards.
    let Some(touched) = apply(args, mailbox, folder_name) else {
        let resp = format!("{tag} BAD Invalid message set\r\n");
        let _ = write_line(stream, &resp).await;
        return;
    };

    if matches!(args.response, StoreResponse::Answer) {
        for (seq, uid, seen) in touched {
            let flags = if seen { "\\Seen" } else { "" };
            let line = format!("* {seq} FETCH (FLAGS ({flags}) UID {uid})\r\n");
            if write_line(stream, &line).await.is_err() {
                return;
            }
        }
    }

    let resp = format!("{tag} OK STORE completed\r\n");
    let _ = write_line(stream, &resp).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_imap::mailbox::MailboxBuilder;
    use imap_codec::imap_types::sequence::{SeqOrUid, Sequence};
    use std::num::NonZeroU32;
    use tokio::io::BufReader;

    fn single(n: u32) -> SequenceSet {
        SequenceSet(
            vec![Sequence::Single(SeqOrUid::Value(NonZeroU32::new(n).unwrap()))]
                .try_into()
                .unwrap(),
        )
    }

    async fn run(args: &StoreArgs<'_>, mailbox: &Mutex<Mailbox>) -> String {
        let (client, server) = tokio::io::duplex(4096);
        let mut stream = BufReader::new(server);

        handle_store("A1", args, mailbox, Some("INBOX"), &mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(client), &mut buf)
            .await
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    fn mailbox() -> Mutex<Mailbox> {
        Mutex::new(
            MailboxBuilder::new()
                .folder("INBOX")
                .email(7, false, b"Subject: a\r\n\r\n.")
                .email(9, false, b"Subject: b\r\n\r\n.")
                .build(),
        )
    }

    #[tokio::test]
    async fn silent_uid_store_sets_seen() {
        let mailbox = mailbox();
        let set = single(9);
        let flags = [Flag::Seen];
        let args = StoreArgs {
            sequence_set: &set,
            uid: true,
            kind: &StoreType::Add,
            response: &StoreResponse::Silent,
            flags: &flags,
        };

        let output = run(&args, &mailbox).await;

        assert_eq!(output, "A1 OK STORE completed\r\n");
        let mb = mailbox.lock().unwrap();
        let seen: Vec<bool> = mb.folders[0].emails.iter().map(|e| e.seen).collect();
        assert_eq!(seen, vec![false, true]);
    }

    #[tokio::test]
    async fn sequence_store_echoes_flags() {
        let mailbox = mailbox();
        let set = single(1);
        let flags = [Flag::Seen];
        let args = StoreArgs {
            sequence_set: &set,
            uid: false,
            kind: &StoreType::Add,
            response: &StoreResponse::Answer,
            flags: &flags,
        };

        let output = run(&args, &mailbox).await;

        assert!(output.starts_with("* 1 FETCH (FLAGS (\\Seen) UID 7)\r\n"));
        assert!(mailbox.lock().unwrap().folders[0].emails[0].seen);
    }
}
