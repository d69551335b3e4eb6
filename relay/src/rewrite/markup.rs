//! Span-preserving HTML tokenizer and markup rewriting.
//!
//! The tokenizer never builds a tree and never normalises anything: every
//! token records byte spans into the source, so rewriting splices new text
//! into exactly the attribute values or element contents it changes and
//! copies everything else through verbatim.

use std::borrow::Cow;
use std::ops::Range;

use super::{css, rewrite_references, script, shim, RewriteContext};

pub type Span = Range<usize>;

/// Elements whose contents are raw text up to the matching end tag
const RAW_TEXT_ELEMENTS: &[&str] = &[
    "script", "style", "textarea", "title", "xmp", "iframe", "noembed", "noframes",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr<'a> {
    /// Name as written in the source
    pub name: &'a str,
    /// Value without quotes, if the attribute has one
    pub value: Option<&'a str>,
    pub value_span: Option<Span>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartTag<'a> {
    /// Lowercased tag name
    pub name: String,
    pub attrs: Vec<Attr<'a>>,
    pub span: Span,
    pub self_closing: bool,
}

impl<'a> StartTag<'a> {
    pub fn attr(&self, name: &str) -> Option<&Attr<'a>> {
        self.attrs.iter().find(|a| a.name.eq_ignore_ascii_case(name))
    }

    pub fn attr_value(&self, name: &str) -> Option<&'a str> {
        self.attr(name).and_then(|a| a.value)
    }

    /// Whitespace-separated token list check, as for `rel`
    pub fn has_token(&self, attr: &str, token: &str) -> bool {
        self.attr_value(attr)
            .map(|v| v.split_ascii_whitespace().any(|t| t.eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token<'a> {
    Text(Span),
    /// Contents of a raw-text element such as `<script>` or `<style>`
    RawText { element: String, span: Span },
    StartTag(StartTag<'a>),
    EndTag { name: String, span: Span },
    Comment(Span),
    Doctype(Span),
}

pub struct Tokenizer<'a> {
    src: &'a str,
    pos: usize,
    raw: Option<String>,
}

impl<'a> Tokenizer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self { src, pos: 0, raw: None }
    }

    fn bytes(&self) -> &'a [u8] {
        self.src.as_bytes()
    }

    fn start_tag(&mut self) -> Token<'a> {
        let b = self.bytes();
        let len = b.len();
        let start = self.pos;
        let mut i = start + 1;
        while i < len && !b[i].is_ascii_whitespace() && b[i] != b'/' && b[i] != b'>' {
            i += 1;
        }
        let name = self.src[start + 1..i].to_ascii_lowercase();
        let mut attrs = Vec::new();
        let mut self_closing = false;

        loop {
            while i < len && b[i].is_ascii_whitespace() {
                i += 1;
            }
            if i >= len {
                break;
            }
            if b[i] == b'>' {
                i += 1;
                break;
            }
            if b[i] == b'/' {
                if b.get(i + 1) == Some(&b'>') {
                    self_closing = true;
                    i += 2;
                    break;
                }
                i += 1;
                continue;
            }

            let name_start = i;
            i += 1;
            while i < len && !b[i].is_ascii_whitespace() && !matches!(b[i], b'=' | b'>' | b'/') {
                i += 1;
            }
            let attr_name = &self.src[name_start..i];

            let mut j = i;
            while j < len && b[j].is_ascii_whitespace() {
                j += 1;
            }
            let mut value_span = None;
            if j < len && b[j] == b'=' {
                j += 1;
                while j < len && b[j].is_ascii_whitespace() {
                    j += 1;
                }
                if j < len && (b[j] == b'"' || b[j] == b'\'') {
                    let quote = b[j];
                    let vs = j + 1;
                    let ve = b[vs..].iter().position(|&c| c == quote).map_or(len, |p| vs + p);
                    value_span = Some(vs..ve);
                    i = (ve + 1).min(len);
                } else {
                    let vs = j;
                    while j < len && !b[j].is_ascii_whitespace() && b[j] != b'>' {
                        j += 1;
                    }
                    value_span = Some(vs..j);
                    i = j;
                }
            }

            attrs.push(Attr {
                name: attr_name,
                value: value_span.clone().map(|s| &self.src[s]),
                value_span,
            });
        }

        self.pos = i;
        if !self_closing && RAW_TEXT_ELEMENTS.contains(&name.as_str()) {
            self.raw = Some(name.clone());
        }
        Token::StartTag(StartTag {
            name,
            attrs,
            span: start..i,
            self_closing,
        })
    }

    fn end_tag(&mut self) -> Token<'a> {
        let b = self.bytes();
        let start = self.pos;
        let mut i = start + 2;
        while i < b.len() && !b[i].is_ascii_whitespace() && b[i] != b'/' && b[i] != b'>' {
            i += 1;
        }
        let name = self.src[start + 2..i].to_ascii_lowercase();
        let end = find_byte(b, i, b'>').map_or(b.len(), |p| p + 1);
        self.pos = end;
        Token::EndTag { name, span: start..end }
    }

    fn until(&mut self, from: usize, terminator: &str) -> Span {
        let start = self.pos;
        let end = self.src[from..]
            .find(terminator)
            .map_or(self.src.len(), |p| from + p + terminator.len());
        self.pos = end;
        start..end
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        let b = self.bytes();
        if self.pos >= b.len() {
            return None;
        }

        if let Some(element) = self.raw.take() {
            let end = find_end_tag(self.src, self.pos, &element).unwrap_or(b.len());
            if end > self.pos {
                let span = self.pos..end;
                self.pos = end;
                return Some(Token::RawText { element, span });
            }
        }

        let rest = &b[self.pos..];
        if rest[0] == b'<' {
            if rest.starts_with(b"<!--") {
                let span = self.until(self.pos + 4, "-->");
                return Some(Token::Comment(span));
            }
            if rest.len() > 2 && rest[..2].eq_ignore_ascii_case(b"<!") {
                let is_doctype = rest.len() >= 9 && rest[2..9].eq_ignore_ascii_case(b"doctype");
                let span = self.until(self.pos + 2, ">");
                return Some(if is_doctype { Token::Doctype(span) } else { Token::Comment(span) });
            }
            if rest.starts_with(b"<?") {
                let span = self.until(self.pos + 2, ">");
                return Some(Token::Comment(span));
            }
            if rest.len() > 2 && rest[1] == b'/' && rest[2].is_ascii_alphabetic() {
                return Some(self.end_tag());
            }
            if rest.len() > 1 && rest[1].is_ascii_alphabetic() {
                return Some(self.start_tag());
            }
        }

        let start = self.pos;
        let end = find_byte(b, start + 1, b'<').unwrap_or(b.len());
        self.pos = end;
        Some(Token::Text(start..end))
    }
}

fn find_byte(b: &[u8], from: usize, needle: u8) -> Option<usize> {
    b.get(from..)?.iter().position(|&c| c == needle).map(|p| from + p)
}

/// Offset of `</element` (case-insensitive, followed by a delimiter)
fn find_end_tag(src: &str, from: usize, element: &str) -> Option<usize> {
    let b = src.as_bytes();
    let name = element.as_bytes();
    let mut i = from;
    while let Some(p) = find_byte(b, i, b'<') {
        let after = p + 2 + name.len();
        if b.get(p + 1) == Some(&b'/')
            && b.len() >= after
            && b[p + 2..after].eq_ignore_ascii_case(name)
            && b.get(after).map_or(true, |c| c.is_ascii_whitespace() || *c == b'/' || *c == b'>')
        {
            return Some(p);
        }
        i = p + 1;
    }
    None
}

/// Builds output by copying the source and splicing replacements in order
pub struct Splicer<'a> {
    src: &'a str,
    out: String,
    last: usize,
}

impl<'a> Splicer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            out: String::with_capacity(src.len() + 1024),
            last: 0,
        }
    }

    /// Replace `span` with `text`. Spans must arrive in source order; one
    /// that overlaps an earlier replacement is dropped and `false` returned.
    pub fn replace(&mut self, span: Span, text: &str) -> bool {
        if span.start < self.last || span.end < span.start || span.end > self.src.len() {
            return false;
        }
        self.out.push_str(&self.src[self.last..span.start]);
        self.out.push_str(text);
        self.last = span.end;
        true
    }

    pub fn insert(&mut self, at: usize, text: &str) -> bool {
        self.replace(at..at, text)
    }

    pub fn finish(mut self) -> String {
        self.out.push_str(&self.src[self.last..]);
        self.out
    }
}

/// Rewrite one attribute value according to what the attribute holds
fn rewrite_attr<'a>(name: &str, value: &'a str, ctx: &RewriteContext) -> Cow<'a, str> {
    if name.eq_ignore_ascii_case("style") {
        css::rewrite(value, ctx)
    } else if name.len() > 2 && name[..2].eq_ignore_ascii_case("on") {
        script::rewrite(value, ctx)
    } else {
        rewrite_references(value, ctx)
    }
}

/// Rewrite a markup document and inject the client shim once
pub fn rewrite(html: &str, ctx: &RewriteContext) -> String {
    let shim = shim::client_shim(ctx);
    let mut splicer = Splicer::new(html);
    let mut shim_seen = false;

    for token in Tokenizer::new(html) {
        match token {
            Token::StartTag(tag) => {
                if tag.name == "script" && tag.attr(shim::SHIM_MARKER).is_some() {
                    shim_seen = true;
                }
                for attr in &tag.attrs {
                    if let (Some(value), Some(span)) = (attr.value, attr.value_span.clone()) {
                        if let Cow::Owned(new) = rewrite_attr(attr.name, value, ctx) {
                            splicer.replace(span, &new);
                        }
                    }
                }
            }
            Token::RawText { element, span } => {
                let text = &html[span.clone()];
                let rewritten = match element.as_str() {
                    "script" => script::rewrite(text, ctx),
                    "style" => css::rewrite(text, ctx),
                    _ => Cow::Borrowed(text),
                };
                if let Cow::Owned(new) = rewritten {
                    splicer.replace(span, &new);
                }
            }
            Token::EndTag { name, span } if name == "head" && !shim_seen => {
                splicer.insert(span.start, &shim);
                shim_seen = true;
            }
            _ => {}
        }
    }

    let out = splicer.finish();
    if shim_seen {
        out
    } else {
        format!("{}{}", shim, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::tests::ctx;

    fn tokens(src: &str) -> Vec<Token<'_>> {
        Tokenizer::new(src).collect()
    }

    #[test]
    fn test_tokenize_attributes() {
        let src = r#"<img src="a.png" alt='x y' data-x=1 hidden>"#;
        let toks = tokens(src);
        assert_eq!(toks.len(), 1);
        let Token::StartTag(tag) = &toks[0] else {
            panic!("expected start tag");
        };
        assert_eq!(tag.name, "img");
        assert_eq!(tag.attr_value("src"), Some("a.png"));
        assert_eq!(tag.attr_value("ALT"), Some("x y"));
        assert_eq!(tag.attr_value("data-x"), Some("1"));
        assert!(tag.attr("hidden").is_some());
        assert_eq!(tag.attr_value("hidden"), None);
        assert_eq!(&src[tag.attr("src").unwrap().value_span.clone().unwrap()], "a.png");
    }

    #[test]
    fn test_raw_text_is_not_tokenized() {
        let src = "<script>if (a < b) { x = '</head>'; }</script><p>t</p>";
        let toks = tokens(src);
        assert!(matches!(&toks[1], Token::RawText { element, .. } if element == "script"));
        assert!(matches!(&toks[2], Token::EndTag { name, .. } if name == "script"));
        assert!(!toks.iter().any(|t| matches!(t, Token::EndTag { name, .. } if name == "head")));
    }

    #[test]
    fn test_comments_and_doctype() {
        let toks = tokens("<!DOCTYPE html><!-- <a href=x> --><a>");
        assert!(matches!(toks[0], Token::Doctype(_)));
        assert!(matches!(toks[1], Token::Comment(_)));
        assert!(matches!(&toks[2], Token::StartTag(t) if t.name == "a"));
    }

    #[test]
    fn test_splicer_drops_overlapping_spans() {
        let src = "<link href=\"/s.css\">";
        let mut splicer = Splicer::new(src);
        assert!(splicer.replace(0..src.len(), "<style></style>"));
        assert!(!splicer.replace(12..18, "data:"));
        assert!(!splicer.replace(20..40, "x"));
        assert_eq!(splicer.finish(), "<style></style>");
    }

    #[test]
    fn test_stray_angle_bracket_is_text() {
        let src = "a < b <3";
        let joined: String = tokens(src)
            .into_iter()
            .map(|t| match t {
                Token::Text(s) => src[s].to_string(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(joined, src);
    }

    #[test]
    fn test_rewrites_attributes_styles_and_scripts() {
        let c = ctx();
        let html = concat!(
            "<html><head><style>body{background:url(https://target.test/bg.png)}</style></head>",
            "<body><a href=\"https://target.test/page?q=1\">https://target.test/text</a>",
            "<div style=\"background:url('//target.test/d.png')\"></div>",
            "<script>var u = \"https://target.test/api\";</script>",
            "<img src=https://other.test/x.png></body></html>"
        );
        let out = rewrite(html, &c);
        assert!(out.contains("url(http://localhost:5000/site/bg.png)"));
        assert!(out.contains("href=\"http://localhost:5000/site/page?q=1\""));
        assert!(out.contains(">https://target.test/text</a>"), "text nodes are left alone");
        assert!(out.contains("url('//localhost:5000/site/d.png')"));
        assert!(out.contains("\"http://localhost:5000/site/api\""));
        assert!(out.contains("src=https://other.test/x.png"));
    }

    #[test]
    fn test_shim_injected_once_before_head_close() {
        let c = ctx();
        let out = rewrite("<html><head><title>t</title></head><body></body></html>", &c);
        assert_eq!(out.matches(shim::SHIM_MARKER).count(), 1);
        let shim_at = out.find(shim::SHIM_MARKER).unwrap();
        assert!(shim_at < out.find("</head>").unwrap());
    }

    #[test]
    fn test_shim_prepended_without_head() {
        let c = ctx();
        let out = rewrite("<p>fragment</p>", &c);
        assert!(out.starts_with("<script"));
        assert!(out.ends_with("<p>fragment</p>"));
    }

    #[test]
    fn test_markup_rewrite_idempotent() {
        let c = ctx();
        let inputs = [
            "<html><head></head><body><a href='https://target.test/a'>x</a></body></html>",
            "<img srcset=\"//target.test/a.png 1x, https://www.target.test/b.png 2x\">",
            "<HEAD><script>fetch('https://target.test/x.m3u8')</script></HEAD>",
            "",
        ];
        for input in inputs {
            let once = rewrite(input, &c);
            assert_eq!(rewrite(&once, &c), once, "input {:?}", input);
        }
    }

    #[test]
    fn test_proxy_origin_references_untouched() {
        let c = ctx();
        let html = "<head></head><a href=\"http://localhost:5000/site/x\">";
        let out = rewrite(html, &c);
        assert!(out.contains("<a href=\"http://localhost:5000/site/x\">"));
    }

    #[test]
    fn test_event_handler_attribute() {
        let c = ctx();
        let out = rewrite("<head></head><button onclick=\"location='https://target.test/go'\">", &c);
        assert!(out.contains("location='http://localhost:5000/site/go'"));
    }
}
