//! Page assembly: embedding referenced resources in place.
//!
//! Images, icons and fonts become base64 data URIs; external scripts and
//! stylesheets are replaced by inline elements carrying their source. All
//! fetches of one pass run through a bounded pool and the pass waits for
//! every one of them before producing output. A failed fetch leaves its
//! reference untouched.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, warn};
use url::Url;

use crate::classify::{self, ContentCategory};
use crate::fetcher::{Fetch, UpstreamRequest};
use crate::rewrite::{self, css, markup::{Span, Splicer, StartTag, Token, Tokenizer}};

pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_MAX_RESOURCES: usize = 50;
pub const DEFAULT_RESOURCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Schemes that never point at a fetchable resource
const IGNORED_SCHEMES: &[&str] = &["data:", "blob:", "javascript:", "about:"];

/// Encoded form of a fetched resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    DataUri(String),
    Text { mime: String, body: String },
}

impl Payload {
    fn encode(mime: &str, bytes: &[u8]) -> Self {
        Payload::DataUri(data_uri(mime, bytes))
    }

    /// The payload as a data URI, encoding text on demand
    pub fn data_uri(&self) -> Cow<'_, str> {
        match self {
            Payload::DataUri(uri) => Cow::Borrowed(uri),
            Payload::Text { mime, body } => Cow::Owned(data_uri(mime, body.as_bytes())),
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Payload::Text { body, .. } => Some(body),
            Payload::DataUri(_) => None,
        }
    }
}

fn data_uri(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, BASE64_STANDARD.encode(bytes))
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Where the payload was finally served from, after redirects
    pub url: Url,
    pub payload: Payload,
    pub fetched_at: DateTime<Utc>,
}

/// Memoized fetches for one assembly pass.
///
/// Created by the caller of [`Inliner::assemble`] and dropped with it; never
/// shared between passes.
#[derive(Debug, Default)]
pub struct PassCache {
    entries: HashMap<String, CacheEntry>,
    failed: HashSet<String>,
}

impl PassCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url: &str) -> Option<&CacheEntry> {
        self.entries.get(url)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn seen(&self, url: &str) -> bool {
        self.entries.contains_key(url) || self.failed.contains(url)
    }
}

/// Per-pass diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InlineReport {
    /// Unique resources scheduled for fetching
    pub requested: usize,
    /// Of those, how many were embedded
    pub embedded: usize,
    pub failed: usize,
    /// Unique resources left alone because of the resource cap
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteKind {
    /// An attribute value (or srcset candidate) replaced by a data URI
    Binary,
    /// A `<script src>` element replaced by an inline script
    Script,
    /// A `<link rel=stylesheet>` element replaced by a `<style>` block
    Stylesheet,
}

/// One place in the document that refers to an external resource
#[derive(Debug, Clone)]
pub struct Reference {
    pub kind: SiteKind,
    /// Canonical absolute URL, fragment removed
    pub url: Url,
    /// Replaced region: the attribute value for binary sites, the whole
    /// element for scripts and stylesheets
    pub span: Span,
    /// Attributes carried over to the replacement element
    pub keep_attrs: Vec<(String, Option<String>)>,
}

/// Resolve a raw reference against `base`, or `None` if it is not fetchable
pub fn resolve(base: &Url, raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with('#') {
        return None;
    }
    let lower = raw.to_ascii_lowercase();
    if IGNORED_SCHEMES.iter().any(|s| lower.starts_with(s)) {
        return None;
    }
    let mut url = base.join(&raw.replace("&amp;", "&")).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url)
}

/// Spans of the URL part of each `srcset` candidate
pub fn srcset_candidates(value: &str) -> Vec<Span> {
    let b = value.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    loop {
        while i < b.len() && (b[i].is_ascii_whitespace() || b[i] == b',') {
            i += 1;
        }
        if i >= b.len() {
            break;
        }
        let start = i;
        while i < b.len() && !b[i].is_ascii_whitespace() {
            i += 1;
        }
        let mut end = i;
        let mut separated = false;
        while end > start && b[end - 1] == b',' {
            end -= 1;
            separated = true;
        }
        if end > start {
            out.push(start..end);
        }
        if !separated {
            while i < b.len() && b[i] != b',' {
                i += 1;
            }
        }
    }
    out
}

fn binary_attrs(tag: &StartTag<'_>) -> &'static [&'static str] {
    match tag.name.as_str() {
        "img" | "source" => &["src", "srcset"],
        "video" => &["poster"],
        "input" if tag.attr_value("type").map_or(false, |t| t.eq_ignore_ascii_case("image")) => &["src"],
        "link" if tag.has_token("rel", "icon") || tag.has_token("rel", "apple-touch-icon") => &["href"],
        _ => &[],
    }
}

fn kept_attrs(tag: &StartTag<'_>, drop: &[&str]) -> Vec<(String, Option<String>)> {
    tag.attrs
        .iter()
        .filter(|a| !drop.iter().any(|d| a.name.eq_ignore_ascii_case(d)))
        .map(|a| (a.name.to_ascii_lowercase(), a.value.map(String::from)))
        .collect()
}

/// Every embeddable reference in the document, in source order
pub fn references(html: &str, page: &Url) -> Vec<Reference> {
    let mut base = page.clone();
    let mut found = Vec::new();
    let mut open_script: Option<Reference> = None;

    for token in Tokenizer::new(html) {
        match token {
            Token::StartTag(tag) => {
                if tag.name == "base" {
                    if let Some(href) = tag.attr_value("href").and_then(|h| resolve(page, h)) {
                        base = href;
                    }
                    continue;
                }

                if tag.name == "script" {
                    if let Some(url) = tag.attr_value("src").and_then(|s| resolve(&base, s)) {
                        let reference = Reference {
                            kind: SiteKind::Script,
                            url,
                            span: tag.span.clone(),
                            keep_attrs: kept_attrs(&tag, &["src", "integrity", "crossorigin"]),
                        };
                        if tag.self_closing {
                            found.push(reference);
                        } else {
                            open_script = Some(reference);
                        }
                        continue;
                    }
                } else if tag.name == "link" && tag.has_token("rel", "stylesheet") {
                    if let Some(url) = tag.attr_value("href").and_then(|h| resolve(&base, h)) {
                        found.push(Reference {
                            kind: SiteKind::Stylesheet,
                            url,
                            span: tag.span.clone(),
                            keep_attrs: kept_attrs(&tag, &["rel", "href", "integrity", "crossorigin", "as", "type"]),
                        });
                        continue;
                    }
                }

                // a tag replaced whole above has no attribute sites of its own
                for name in binary_attrs(&tag) {
                    let Some(attr) = tag.attr(name) else { continue };
                    let (Some(value), Some(span)) = (attr.value, attr.value_span.clone()) else {
                        continue;
                    };
                    if name.eq_ignore_ascii_case("srcset") {
                        for c in srcset_candidates(value) {
                            if let Some(url) = resolve(&base, &value[c.clone()]) {
                                let span = span.start + c.start..span.start + c.end;
                                found.push(Reference { kind: SiteKind::Binary, url, span, keep_attrs: Vec::new() });
                            }
                        }
                    } else if let Some(url) = resolve(&base, value) {
                        found.push(Reference { kind: SiteKind::Binary, url, span, keep_attrs: Vec::new() });
                    }
                }
            }
            Token::EndTag { name, span } if name == "script" => {
                if let Some(mut reference) = open_script.take() {
                    reference.span.end = span.end;
                    found.push(reference);
                }
            }
            _ => {}
        }
    }

    // unterminated script: replace the start tag only
    found.extend(open_script);
    found.sort_by_key(|r| r.span.start);
    found
}

pub struct Inliner {
    fetcher: Arc<dyn Fetch>,
    concurrency: usize,
    max_resources: usize,
    timeout: Duration,
}

impl Inliner {
    pub fn new(fetcher: Arc<dyn Fetch>) -> Self {
        Self {
            fetcher,
            concurrency: DEFAULT_CONCURRENCY,
            max_resources: DEFAULT_MAX_RESOURCES,
            timeout: DEFAULT_RESOURCE_TIMEOUT,
        }
    }

    pub fn with_limits(mut self, concurrency: usize, max_resources: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self.max_resources = max_resources;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Embed every reachable resource referenced by `html`.
    ///
    /// Never fails: unreachable resources keep their original reference and
    /// show up in the report as failed.
    pub async fn assemble(&self, html: &str, page: &Url, cache: &mut PassCache) -> (String, InlineReport) {
        let started = Instant::now();
        let refs = references(html, page);
        let mut report = InlineReport::default();

        let mut unique = Vec::new();
        let mut scheduled = HashSet::new();
        for r in &refs {
            let key = r.url.as_str();
            if scheduled.contains(key) {
                continue;
            }
            if scheduled.len() >= self.max_resources {
                report.skipped += 1;
                scheduled.insert(key.to_string());
                continue;
            }
            scheduled.insert(key.to_string());
            unique.push(r.url.clone());
        }
        let allowed: HashSet<String> = unique.iter().map(|u| u.to_string()).collect();
        self.fetch_all(unique, cache, &mut report).await;

        // Second level: fonts referenced by the stylesheets just fetched
        let mut fonts = Vec::new();
        for r in refs.iter().filter(|r| r.kind == SiteKind::Stylesheet) {
            let Some(entry) = cache.get(r.url.as_str()) else { continue };
            let Some(body) = entry.payload.text() else { continue };
            for u in css::urls(body) {
                let Some(url) = resolve(&entry.url, u.value) else { continue };
                if ContentCategory::from_extension(url.path()) != ContentCategory::Font {
                    continue;
                }
                let key = url.to_string();
                if scheduled.contains(&key) {
                    continue;
                }
                scheduled.insert(key);
                if report.requested + fonts.len() >= self.max_resources {
                    report.skipped += 1;
                } else {
                    fonts.push(url);
                }
            }
        }
        if !fonts.is_empty() {
            debug!("Fetching {} fonts referenced from stylesheets", fonts.len());
            self.fetch_all(fonts, cache, &mut report).await;
        }

        let mut splicer = Splicer::new(html);
        for r in &refs {
            let key = r.url.as_str();
            if !allowed.contains(key) {
                continue;
            }
            let Some(entry) = cache.get(key) else { continue };
            let spliced = match (r.kind, entry.payload.text()) {
                (SiteKind::Binary, _) => splicer.replace(r.span.clone(), &entry.payload.data_uri()),
                (SiteKind::Script, Some(body)) => splicer.replace(r.span.clone(), &script_element(r, body)),
                (SiteKind::Stylesheet, Some(body)) => {
                    let css = expand_stylesheet(body, &entry.url, cache);
                    splicer.replace(r.span.clone(), &style_element(r, &css))
                }
                _ => true,
            };
            if !spliced {
                debug!("Reference to {} overlaps an earlier one, left as is", r.url);
            }
        }

        info!(
            "Assembled {}: {}/{} resources embedded, {} failed, {} skipped in {:?}",
            page, report.embedded, report.requested, report.failed, report.skipped, started.elapsed()
        );
        (splicer.finish(), report)
    }

    /// Fetch every URL not already in the cache, at most `concurrency` at
    /// once, and wait for all of them.
    async fn fetch_all(&self, urls: Vec<Url>, cache: &mut PassCache, report: &mut InlineReport) {
        let pending: Vec<Url> = urls.into_iter().filter(|u| !cache.seen(u.as_str())).collect();
        report.requested += pending.len();

        let results: Vec<(String, Option<CacheEntry>)> = stream::iter(pending)
            .map(|url| async move {
                let key = url.to_string();
                (key, self.fetch_one(url).await)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (key, entry) in results {
            match entry {
                Some(entry) => {
                    report.embedded += 1;
                    cache.entries.insert(key, entry);
                }
                None => {
                    report.failed += 1;
                    cache.failed.insert(key);
                }
            }
        }
    }

    async fn fetch_one(&self, url: Url) -> Option<CacheEntry> {
        let request = UpstreamRequest::get(url.clone()).timeout(self.timeout);
        let response = match self.fetcher.fetch(request).await {
            Ok(r) => r,
            Err(e) => {
                warn!("Inline fetch of {} failed: {}", url, e);
                return None;
            }
        };
        if !response.is_success() {
            warn!("Inline fetch of {} returned {}", url, response.status);
            return None;
        }

        let content_type = response.content_type.clone();
        let final_url = response.url.clone();
        let body: Bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                warn!("Inline fetch of {} failed mid-body: {}", url, e);
                return None;
            }
        };

        let mime = content_type
            .as_deref()
            .map(classify::essence)
            .filter(|m| !m.is_empty() && m != "application/octet-stream")
            .unwrap_or_else(|| classify::guess_mime(&final_url).to_string());
        let category = classify::sniff(content_type.as_deref(), &final_url);

        let payload = if category.is_textual() {
            match rewrite::decode_text(&body, content_type.as_deref()) {
                Ok(text) => Payload::Text { mime, body: text.to_string() },
                Err(_) => Payload::encode(&mime, &body),
            }
        } else {
            Payload::encode(&mime, &body)
        };

        debug!("Inlined {} ({} bytes, {})", url, body.len(), category_name(category));
        Some(CacheEntry {
            url: final_url,
            payload,
            fetched_at: Utc::now(),
        })
    }
}

fn category_name(category: ContentCategory) -> &'static str {
    match category {
        ContentCategory::Markup => "markup",
        ContentCategory::Stylesheet => "stylesheet",
        ContentCategory::Script => "script",
        ContentCategory::Image => "image",
        ContentCategory::Font => "font",
        ContentCategory::Media => "media",
        ContentCategory::Opaque => "opaque",
    }
}

/// Embed cached fonts and make every other relative `url()` absolute, so the
/// stylesheet still resolves once moved into the page.
fn expand_stylesheet(css_text: &str, base: &Url, cache: &PassCache) -> String {
    let mut splicer = Splicer::new(css_text);
    for u in css::urls(css_text) {
        let Some(url) = resolve(base, u.value) else { continue };
        let replacement = match cache.get(url.as_str()) {
            Some(entry) if ContentCategory::from_extension(url.path()) == ContentCategory::Font => {
                entry.payload.data_uri().into_owned()
            }
            _ => url.to_string(),
        };
        splicer.replace(u.span, &replacement);
    }
    splicer.finish()
}

fn script_element(r: &Reference, body: &str) -> String {
    format!(
        "<script{} data-original=\"{}\">{}</script>",
        render_attrs(&r.keep_attrs),
        escape_attr(r.url.as_str()),
        escape_close_tag(body, "script")
    )
}

fn style_element(r: &Reference, body: &str) -> String {
    format!(
        "<style{} data-original=\"{}\">{}</style>",
        render_attrs(&r.keep_attrs),
        escape_attr(r.url.as_str()),
        escape_close_tag(body, "style")
    )
}

fn render_attrs(attrs: &[(String, Option<String>)]) -> String {
    attrs
        .iter()
        .map(|(name, value)| match value {
            Some(v) => format!(" {}=\"{}\"", name, v.replace('"', "&quot;")),
            None => format!(" {}", name),
        })
        .collect()
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;").replace('"', "&quot;")
}

/// Break up `</tag` (any case) so embedded content cannot close its element
fn escape_close_tag(body: &str, tag: &str) -> String {
    let needle = format!("</{}", tag);
    let lower = body.to_ascii_lowercase();
    let mut out = String::with_capacity(body.len());
    let mut last = 0;
    for (at, _) in lower.match_indices(&needle) {
        out.push_str(&body[last..at]);
        out.push_str("<\\/");
        last = at + 2;
    }
    out.push_str(&body[last..]);
    out
}
