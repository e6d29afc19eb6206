//! Folder listing pipeline
//!
//! Fetches headers, flags and structure for the most recent messages of
//! a folder. The fetch runs in its own task holding the connection
//! lock and streams summaries back over a channel; the caller collects
//! them until the fetch completes or the watchdog fires. On a watchdog
//! the caller answers with what it has while the task keeps draining
//! the server's response, so the connection stays usable.

use crate::connection::{Connection, SharedConnection};
use crate::error::{Error, Result};
use crate::flag::is_seen;
use crate::headers::{HeaderFields, parse_header_block};
use crate::mime::MimeNode;
use crate::model::MessageSummary;
use async_imap::types::Fetch;
use futures::StreamExt;
use serde::Serialize;
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// FETCH items for one listing row.
pub const SUMMARY_QUERY: &str =
    "(UID FLAGS BODYSTRUCTURE BODY.PEEK[HEADER.FIELDS (FROM TO SUBJECT DATE)])";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingOptions {
    /// Number of most recent messages to fetch.
    pub limit: u32,
    pub watchdog: Duration,
}

impl Default for ListingOptions {
    fn default() -> Self {
        Self {
            limit: 30,
            watchdog: Duration::from_secs(30),
        }
    }
}

/// Result of a listing. `partial` is set when the watchdog cut the
/// fetch short.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Listing {
    pub messages: Vec<MessageSummary>,
    pub partial: bool,
}

enum ListEvent {
    Summary(MessageSummary),
    Done(Result<()>),
}

/// Sequence numbers of the `limit` most recent messages out of `total`,
/// or `None` when there is nothing to fetch.
#[must_use]
pub fn fetch_range(total: u32, limit: u32) -> Option<RangeInclusive<u32>> {
    let count = total.min(limit);
    if count == 0 {
        return None;
    }
    Some(total - count + 1..=total)
}

/// Order summaries newest first.
///
/// Messages are first ordered by descending id. Messages whose date is
/// known are then rearranged among their own positions by descending
/// date, so two dated messages always compare by date while undated
/// ones keep their id order. This keeps the comparison total.
pub fn sort_summaries(summaries: &mut [MessageSummary]) {
    summaries.sort_by(|a, b| b.id.cmp(&a.id));

    let slots: Vec<usize> = summaries
        .iter()
        .enumerate()
        .filter(|(_, s)| s.date_known)
        .map(|(i, _)| i)
        .collect();

    let mut dated: Vec<MessageSummary> = slots.iter().map(|&i| summaries[i].clone()).collect();
    dated.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| b.id.cmp(&a.id)));

    for (slot, summary) in slots.into_iter().zip(dated) {
        summaries[slot] = summary;
    }
}

/// Build a summary from the pieces of one FETCH response.
#[must_use]
pub fn summary_from_parts(
    seq: u32,
    uid: Option<u32>,
    header: Option<&[u8]>,
    seen: bool,
    structure: Option<&MimeNode>,
) -> MessageSummary {
    let fields = header.map(parse_header_block).unwrap_or_default();
    let HeaderFields {
        subject,
        from,
        to,
        date,
        date_known,
        ..
    } = fields;

    let mut summary = MessageSummary::new(seq);
    summary.subject = subject;
    summary.from = from;
    summary.to = to;
    summary.date = date;
    summary.date_known = date_known;
    summary.is_read = seen;
    summary.has_attachments = structure.is_some_and(MimeNode::has_attachments);
    if let Some(uid) = uid {
        summary.set_uid(uid);
    }
    summary
}

fn summary_from_fetch(fetch: &Fetch) -> MessageSummary {
    let structure = fetch.bodystructure().map(MimeNode::from_body_structure);
    summary_from_parts(
        fetch.message,
        fetch.uid,
        fetch.header(),
        is_seen(fetch.flags()),
        structure.as_ref(),
    )
}

/// List the most recent messages of `folder`.
///
/// # Errors
///
/// - [`Error::Folder`] if the folder cannot be selected
/// - [`Error::FetchTimeout`] if the watchdog fires before any message
///   arrived
/// - [`Error::Imap`] if the FETCH fails
pub async fn list_messages(
    conn: SharedConnection,
    folder: &str,
    options: ListingOptions,
) -> Result<Listing> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task_folder = folder.to_string();

    tokio::spawn(async move {
        let mut conn = conn.lock_owned().await;
        let outcome = stream_summaries(&mut conn, &task_folder, options.limit, &tx).await;
        let _ = tx.send(ListEvent::Done(outcome));
    });

    let deadline = Instant::now() + options.watchdog;
    let mut messages = Vec::new();

    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(ListEvent::Summary(summary))) => messages.push(summary),
            Ok(Some(ListEvent::Done(Ok(())))) => break,
            Ok(Some(ListEvent::Done(Err(e)))) => return Err(e),
            Ok(None) => return Err(Error::Imap("Fetch task ended unexpectedly".into())),
            Err(_) if messages.is_empty() => {
                warn!(folder, "Listing watchdog fired with no messages");
                return Err(Error::FetchTimeout(options.watchdog));
            }
            Err(_) => {
                warn!(
                    folder,
                    count = messages.len(),
                    "Listing watchdog fired, returning partial results"
                );
                sort_summaries(&mut messages);
                return Ok(Listing {
                    messages,
                    partial: true,
                });
            }
        }
    }

    sort_summaries(&mut messages);
    info!(folder, count = messages.len(), "Listed messages");
    Ok(Listing {
        messages,
        partial: false,
    })
}

async fn stream_summaries(
    conn: &mut Connection,
    folder: &str,
    limit: u32,
    tx: &mpsc::UnboundedSender<ListEvent>,
) -> Result<()> {
    let total = conn.select(folder).await?;
    let Some(range) = fetch_range(total, limit) else {
        debug!(folder, "Folder is empty");
        return Ok(());
    };

    let sequence_set = format!("{}:{}", range.start(), range.end());
    debug!(folder, %sequence_set, "Fetching summaries");

    // Split the result in its own scope so the session borrow held by the
    // stream type ends before `imap_error` needs `conn` again.
    let (fetched, failure) = {
        let fetched = conn.session()?.fetch(&sequence_set, SUMMARY_QUERY).await;
        match fetched {
            Ok(stream) => (Some(stream), None),
            Err(e) => (None, Some(e)),
        }
    };
    if let Some(e) = failure {
        drop(fetched);
        return Err(conn.imap_error("FETCH", &e));
    }
    let mut stream = fetched.expect("FETCH result holds either a stream or an error");

    let mut failure = None;
    while let Some(item) = stream.next().await {
        match item {
            // The receiver may be gone after a watchdog; keep draining.
            Ok(fetch) => {
                let _ = tx.send(ListEvent::Summary(summary_from_fetch(&fetch)));
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    drop(stream);

    match failure {
        Some(e) => Err(conn.imap_error("FETCH", &e)),
        None => Ok(()),
    }
}
