//! Folder listing
//!
//! The server reports folders as flat names joined by a hierarchy
//! delimiter (`Work/Projects/2024`). They are assembled into a tree and
//! then walked back into a flat list where every entry carries its full
//! path, so clients can address any folder regardless of depth.

use crate::connection::Connection;
use crate::error::Result;
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, warn};

/// The folder every server must provide (RFC 3501, case-insensitive).
pub const INBOX: &str = "INBOX";

/// A folder as returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Folder {
    pub id: String,
    pub name: String,
    pub path: String,
    /// Always 0 here; a STATUS query would be needed to fill it.
    #[serde(rename = "unread")]
    pub unread_count: u32,
}

/// A node of the server's folder hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderNode {
    pub name: String,
    /// Delimiter used to join this node's children onto its path.
    pub delimiter: String,
    pub children: Vec<FolderNode>,
}

/// Resolve the requested folder, defaulting to INBOX.
#[must_use]
pub fn mailbox_name(requested: Option<&str>) -> String {
    match requested.map(str::trim) {
        None | Some("") => INBOX.to_string(),
        Some(name) if name.eq_ignore_ascii_case(INBOX) => INBOX.to_string(),
        Some(name) => name.to_string(),
    }
}

/// Build the hierarchy from `(full name, delimiter)` pairs. Ancestors
/// missing from the listing are created so every path stays reachable.
#[must_use]
pub fn build_tree(entries: &[(String, Option<String>)]) -> Vec<FolderNode> {
    let mut roots: Vec<FolderNode> = Vec::new();

    for (full_name, delimiter) in entries {
        // NIL delimiter: flat namespace, the name is a single segment.
        let delimiter = delimiter.as_deref().unwrap_or_default();
        let segments: Vec<&str> = if delimiter.is_empty() {
            vec![full_name.as_str()]
        } else {
            full_name.split(delimiter).collect()
        };

        let mut level = &mut roots;
        for segment in segments {
            let idx = if let Some(idx) = level.iter().position(|n| n.name == segment) {
                idx
            } else {
                level.push(FolderNode {
                    name: segment.to_string(),
                    delimiter: delimiter.to_string(),
                    children: Vec::new(),
                });
                level.len() - 1
            };
            level = &mut level[idx].children;
        }
    }

    roots
}

/// Flatten a hierarchy depth-first into addressable folders.
#[must_use]
pub fn flatten(nodes: &[FolderNode]) -> Vec<Folder> {
    let mut out = Vec::new();
    flatten_into(nodes, None, &mut out);
    out
}

fn flatten_into(nodes: &[FolderNode], parent: Option<(&str, &str)>, out: &mut Vec<Folder>) {
    for node in nodes {
        let path = match parent {
            Some((parent_path, delimiter)) => format!("{parent_path}{delimiter}{}", node.name),
            None => node.name.clone(),
        };
        out.push(Folder {
            id: path.clone(),
            name: node.name.clone(),
            path: path.clone(),
            unread_count: 0,
        });
        flatten_into(&node.children, Some((&path, &node.delimiter)), out);
    }
}

/// List every folder on the server as a flat list.
///
/// # Errors
///
/// Returns an error if the connection is unusable or LIST fails.
pub async fn list_folders(conn: &mut Connection) -> Result<Vec<Folder>> {
    // Split the result in its own scope so the session borrow held by the
    // stream type ends before `imap_error` needs `conn` again.
    let (listed, failure) = {
        let listed = conn.session()?.list(Some(""), Some("*")).await;
        match listed {
            Ok(stream) => (Some(stream), None),
            Err(e) => (None, Some(e)),
        }
    };
    if let Some(e) = failure {
        drop(listed);
        return Err(conn.imap_error("LIST", &e));
    }
    let mut stream = listed.expect("LIST result holds either a stream or an error");

    let mut entries = Vec::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(name) => entries.push((
                name.name().to_string(),
                name.delimiter().map(str::to_string),
            )),
            Err(e) => warn!("Skipping unreadable LIST entry: {e}"),
        }
    }
    drop(stream);

    let folders = flatten(&build_tree(&entries));
    debug!(count = folders.len(), "Listed folders");
    Ok(folders)
}
