//! MIME structure tree
//!
//! A small owned mirror of the server's BODYSTRUCTURE, used to decide
//! whether a message carries attachments without downloading it.

use async_imap::imap_proto::{BodyContentCommon, BodyStructure};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// `Content-Disposition` of one part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Disposition {
    /// Lowercased disposition type, e.g. `attachment`.
    pub kind: String,
    pub params: BTreeMap<String, String>,
}

/// One node of a message's MIME tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MimeNode {
    /// Lowercased `type/subtype`.
    pub content_type: String,
    pub disposition: Option<Disposition>,
    /// Content-Type parameters with lowercased keys.
    pub params: BTreeMap<String, String>,
    pub parts: Vec<MimeNode>,
}

impl MimeNode {
    #[must_use]
    pub fn from_body_structure(structure: &BodyStructure<'_>) -> Self {
        match structure {
            BodyStructure::Basic { common, .. } | BodyStructure::Text { common, .. } => {
                Self::leaf(common)
            }
            BodyStructure::Message { common, body, .. } => {
                let mut node = Self::leaf(common);
                node.parts.push(Self::from_body_structure(body));
                node
            }
            BodyStructure::Multipart { common, bodies, .. } => {
                let mut node = Self::leaf(common);
                node.parts = bodies.iter().map(Self::from_body_structure).collect();
                node
            }
        }
    }

    fn leaf(common: &BodyContentCommon<'_>) -> Self {
        Self {
            content_type: format!("{}/{}", common.ty.ty, common.ty.subtype).to_lowercase(),
            disposition: common.disposition.as_ref().map(|d| Disposition {
                kind: d.ty.to_lowercase(),
                params: params_map(d.params.as_deref()),
            }),
            params: params_map(common.ty.params.as_deref()),
            parts: Vec::new(),
        }
    }

    /// Whether this node itself looks like an attachment: an
    /// `attachment` or `inline` disposition, or a `name` parameter.
    #[must_use]
    pub fn is_attachment(&self) -> bool {
        self.disposition
            .as_ref()
            .is_some_and(|d| d.kind == "attachment" || d.kind == "inline")
            || self.params.contains_key("name")
    }

    /// Whether any node in the tree is an attachment.
    #[must_use]
    pub fn has_attachments(&self) -> bool {
        self.is_attachment() || self.parts.iter().any(Self::has_attachments)
    }
}

fn params_map(params: Option<&[(Cow<'_, str>, Cow<'_, str>)]>) -> BTreeMap<String, String> {
    params
        .unwrap_or_default()
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.to_string()))
        .collect()
}
