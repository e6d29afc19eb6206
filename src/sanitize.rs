//! HTML sanitization and plain text rendering

use regex::{Captures, Regex};
use std::sync::LazyLock;

static SCRIPT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("valid script block regex")
});

/// Stray opening or closing script tags left after block removal.
static SCRIPT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</?script\b[^>]*>").expect("valid script tag regex"));

/// An opening tag, up to its closing `>` or the end of input. Quoted
/// attribute values may contain `>`.
static OPEN_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<[A-Za-z][^\s/>"']*(?:"[^"]*"|'[^']*'|[^"'>])*(?:>|\z)"#)
        .expect("valid open tag regex")
});

/// An `on*=` attribute inside a tag. The separator before it may be
/// whitespace, `/`, or the quote closing the previous value.
static EVENT_HANDLER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)([\s/"'])on[a-z]+\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#)
        .expect("valid event handler regex")
});

static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"']+"#).expect("valid url regex"));

/// Remove `<script>` blocks and inline event handler attributes.
///
/// Removal repeats until nothing changes, so fragments that only form a
/// script tag once an inner one is removed are caught too.
#[must_use]
pub fn sanitize_html(html: &str) -> String {
    let mut current = html.to_string();
    loop {
        let without_blocks = SCRIPT_BLOCK.replace_all(&current, "");
        let without_tags = SCRIPT_TAG.replace_all(&without_blocks, "");
        let cleaned = OPEN_TAG
            .replace_all(&without_tags, |tag: &Captures<'_>| strip_handlers(&tag[0]))
            .into_owned();
        if cleaned == current {
            return cleaned;
        }
        current = cleaned;
    }
}

fn strip_handlers(tag: &str) -> String {
    EVENT_HANDLER
        .replace_all(tag, |attr: &Captures<'_>| {
            let separator = &attr[1];
            if !separator.trim().is_empty() {
                return separator.to_string();
            }
            // Keep one space if another attribute follows directly.
            let end = attr.get(0).map_or(tag.len(), |m| m.end());
            match tag[end..].chars().next() {
                Some(c) if !c.is_whitespace() && c != '>' && c != '/' => " ".to_string(),
                _ => String::new(),
            }
        })
        .into_owned()
}

/// Escape `&`, `<` and `>`.
#[must_use]
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render plain text as an escaped `<pre>` block, optionally turning
/// `http(s)://` URLs into links.
#[must_use]
pub fn text_to_html(text: &str, linkify: bool) -> String {
    let mut out = String::from("<pre class=\"plain-text\">");
    if linkify {
        let mut last = 0;
        for found in URL.find_iter(text) {
            out.push_str(&escape_html(&text[last..found.start()]));
            let url = escape_html(found.as_str());
            out.push_str("<a href=\"");
            out.push_str(&url);
            out.push_str("\">");
            out.push_str(&url);
            out.push_str("</a>");
            last = found.end();
        }
        out.push_str(&escape_html(&text[last..]));
    } else {
        out.push_str(&escape_html(text));
    }
    out.push_str("</pre>");
    out
}

/// Convert HTML to readable plain text.
#[must_use]
pub fn html_to_text(html: &str) -> Option<String> {
    html2text::from_read(html.as_bytes(), 80)
        .ok()
        .map(|text| text.trim_end().to_string())
        .filter(|text| !text.is_empty())
}
