//! Stylesheet reference scanning.

use std::borrow::Cow;

use super::markup::{Span, Splicer};
use super::{rewrite_references, RewriteContext};

/// A reference found in a stylesheet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CssUrl<'a> {
    /// Reference text without quotes or surrounding whitespace
    pub value: &'a str,
    pub span: Span,
}

/// Every `url(...)` and `@import "..."` reference, in source order.
/// Comments are skipped.
pub fn urls(css: &str) -> Vec<CssUrl<'_>> {
    let b = css.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;

    while i < b.len() {
        if b[i..].starts_with(b"/*") {
            i = css[i + 2..].find("*/").map_or(b.len(), |p| i + 2 + p + 2);
            continue;
        }

        if b.len() - i >= 4 && b[i..i + 4].eq_ignore_ascii_case(b"url(") && !ident_before(b, i) {
            let (url, next) = url_function(css, i + 4);
            if let Some(url) = url {
                found.push(url);
            }
            i = next;
            continue;
        }

        if b.len() - i >= 7 && b[i..i + 7].eq_ignore_ascii_case(b"@import") {
            let mut j = i + 7;
            while j < b.len() && b[j].is_ascii_whitespace() {
                j += 1;
            }
            if j < b.len() && (b[j] == b'"' || b[j] == b'\'') {
                let (url, next) = quoted(css, j);
                found.push(url);
                i = next;
                continue;
            }
            // `@import url(...)` is picked up on the next pass
            i = j;
            continue;
        }

        i += 1;
    }

    found
}

fn ident_before(b: &[u8], i: usize) -> bool {
    i > 0 && (b[i - 1].is_ascii_alphanumeric() || b[i - 1] == b'-' || b[i - 1] == b'_')
}

/// Parse the inside of `url(`, starting just past the parenthesis
fn url_function(css: &str, start: usize) -> (Option<CssUrl<'_>>, usize) {
    let b = css.as_bytes();
    let mut i = start;
    while i < b.len() && b[i].is_ascii_whitespace() {
        i += 1;
    }
    if i < b.len() && (b[i] == b'"' || b[i] == b'\'') {
        let (url, next) = quoted(css, i);
        let close = css[next..].find(')').map_or(b.len(), |p| next + p + 1);
        return (Some(url), close);
    }

    let end = css[i..].find(')').map_or(b.len(), |p| i + p);
    let raw = &css[i..end];
    let value = raw.trim_end();
    let next = (end + 1).min(b.len());
    if value.is_empty() {
        return (None, next);
    }
    (
        Some(CssUrl {
            value,
            span: i..i + value.len(),
        }),
        next,
    )
}

/// A quoted string starting at the quote character
fn quoted(css: &str, at: usize) -> (CssUrl<'_>, usize) {
    let b = css.as_bytes();
    let quote = b[at];
    let start = at + 1;
    let mut i = start;
    while i < b.len() && b[i] != quote && b[i] != b'\n' {
        if b[i] == b'\\' {
            i += 1;
        }
        i += 1;
    }
    let end = i.min(b.len());
    (
        CssUrl {
            value: &css[start..end],
            span: start..end,
        },
        (end + 1).min(b.len()),
    )
}

/// Rewrite target references inside stylesheet URLs
pub fn rewrite<'a>(css: &'a str, ctx: &RewriteContext) -> Cow<'a, str> {
    let mut splicer = None;
    for url in urls(css) {
        if let Cow::Owned(new) = rewrite_references(url.value, ctx) {
            splicer.get_or_insert_with(|| Splicer::new(css)).replace(url.span, &new);
        }
    }
    match splicer {
        Some(s) => Cow::Owned(s.finish()),
        None => Cow::Borrowed(css),
    }
}
