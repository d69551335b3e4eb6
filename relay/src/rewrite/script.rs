//! Script string-literal scanning.
//!
//! Scripts are not parsed. Only the contents of string and template
//! literals are candidates for rewriting; comments are skipped so that
//! commented-out URLs and `//` line comments never look like references.

use std::borrow::Cow;

use super::markup::{Span, Splicer};
use super::{rewrite_references, RewriteContext};

/// Spans of every string literal body (quotes excluded), in source order
pub fn literals(src: &str) -> Vec<Span> {
    let b = src.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;

    while i < b.len() {
        match b[i] {
            b'/' if b.get(i + 1) == Some(&b'/') => {
                i = src[i..].find('\n').map_or(b.len(), |p| i + p + 1);
            }
            b'/' if b.get(i + 1) == Some(&b'*') => {
                i = src[i + 2..].find("*/").map_or(b.len(), |p| i + 2 + p + 2);
            }
            quote @ (b'\'' | b'"' | b'`') => {
                let start = i + 1;
                let mut j = start;
                while j < b.len() && b[j] != quote {
                    if b[j] == b'\\' {
                        j += 1;
                    } else if b[j] == b'\n' && quote != b'`' {
                        break;
                    }
                    j += 1;
                }
                let end = j.min(b.len());
                spans.push(start..end);
                i = end + 1;
            }
            _ => i += 1,
        }
    }

    spans
}

/// Rewrite target references inside string literals only
pub fn rewrite<'a>(src: &'a str, ctx: &RewriteContext) -> Cow<'a, str> {
    let mut splicer = None;
    for span in literals(src) {
        if let Cow::Owned(new) = rewrite_references(&src[span.clone()], ctx) {
            splicer.get_or_insert_with(|| Splicer::new(src)).replace(span, &new);
        }
    }
    match splicer {
        Some(s) => Cow::Owned(s.finish()),
        None => Cow::Borrowed(src),
    }
}
