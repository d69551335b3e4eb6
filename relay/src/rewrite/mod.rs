//! Reference rewriting.
//!
//! Every absolute (`https://target/...`) or scheme-relative (`//target/...`)
//! reference to the target origin is redirected through the proxy's own
//! origin, keeping path and query. References already pointing at the proxy
//! are never touched, so rewriting is idempotent.

use std::borrow::Cow;

use bytes::Bytes;
use tracing::warn;
use url::Url;

use crate::classify::{self, ContentCategory};
use crate::error::{ProxyError, Result};

pub mod css;
pub mod markup;
pub mod script;
pub mod shim;

pub const IFRAME_RELAY_PATH: &str = "/iframe-relay";
pub const MEDIA_RELAY_PATH: &str = "/media-relay";

/// Where references come from and where they should go
#[derive(Debug, Clone)]
pub struct RewriteContext {
    /// `scheme://authority` of the proxy, no trailing slash
    proxy_origin: String,
    proxy_authority: String,
    /// Path prefix under which the target is served, no trailing slash
    mount: String,
    /// Lowercased authorities that count as the target
    target_authorities: Vec<String>,
}

impl RewriteContext {
    pub fn new(proxy_origin: &Url, target: &Url, mount: &str) -> Result<Self> {
        let proxy_authority = authority(proxy_origin)
            .ok_or_else(|| ProxyError::InvalidInput(format!("Proxy origin has no host: {}", proxy_origin)))?;
        let target_authority = authority(target)
            .ok_or_else(|| ProxyError::InvalidInput(format!("Target has no host: {}", target)))?;
        let mut target_authorities = vec![target_authority.clone()];
        match target_authority.strip_prefix("www.") {
            Some(bare) => target_authorities.push(bare.to_string()),
            None => target_authorities.push(format!("www.{}", target_authority)),
        }
        if target.port().is_none() {
            let with_ports: Vec<String> = target_authorities
                .iter()
                .flat_map(|a| [format!("{}:80", a), format!("{}:443", a)])
                .collect();
            target_authorities.extend(with_ports);
        }
        // otherwise proxied references would match the target again
        if target_authorities.contains(&proxy_authority) {
            return Err(ProxyError::InvalidInput(format!(
                "Proxy origin {} overlaps the target origin",
                proxy_authority
            )));
        }

        Ok(Self {
            proxy_origin: format!("{}://{}", proxy_origin.scheme(), proxy_authority),
            proxy_authority,
            mount: mount.trim_end_matches('/').to_string(),
            target_authorities,
        })
    }

    pub fn proxy_origin(&self) -> &str {
        &self.proxy_origin
    }

    pub fn mount(&self) -> &str {
        &self.mount
    }

    /// True when `reference` already points at the proxy (prefix equality)
    pub fn is_proxied(&self, reference: &str) -> bool {
        let lower = reference.trim_start().to_ascii_lowercase();
        let origin = self.proxy_origin.to_ascii_lowercase();
        let relative = format!("//{}", self.proxy_authority);
        [origin.as_str(), relative.as_str()].iter().any(|prefix| {
            lower.starts_with(prefix)
                && lower[prefix.len()..]
                    .chars()
                    .next()
                    .map_or(true, |c| matches!(c, '/' | '?' | '#'))
        })
    }

    fn is_target(&self, authority: &str) -> bool {
        let authority = authority.to_ascii_lowercase();
        self.target_authorities.iter().any(|a| *a == authority)
    }

    fn replacement(&self, absolute: bool, escaped: bool) -> String {
        let base = if absolute {
            format!("{}{}", self.proxy_origin, self.mount)
        } else {
            format!("//{}{}", self.proxy_authority, self.mount)
        };
        if escaped {
            base.replace('/', "\\/")
        } else {
            base
        }
    }
}

/// Lowercased `host[:port]`, with the port only when it is not the default
fn authority(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

/// Rewrite target-origin references anywhere in `text`.
///
/// Recognises plain `//` and JSON-escaped `\/\/` forms; the escaped form is
/// written back escaped.
pub fn rewrite_references<'a>(text: &'a str, ctx: &RewriteContext) -> Cow<'a, str> {
    let bytes = text.as_bytes();
    let mut out: Option<String> = None;
    let mut last = 0;
    let mut i = 0;

    while i + 1 < bytes.len() {
        let (slashes, escaped) = if bytes[i..].starts_with(b"//") {
            (2, false)
        } else if bytes[i..].starts_with(b"\\/\\/") {
            (4, true)
        } else {
            i += 1;
            continue;
        };

        let auth_start = i + slashes;
        let auth_end = scan_authority(bytes, auth_start);
        let scheme = scheme_before(bytes, i);

        let matched = auth_end > auth_start
            && at_boundary(bytes, auth_end)
            && ctx.is_target(&text[auth_start..auth_end])
            && !matches!(scheme, Scheme::Other);

        if !matched {
            i = auth_start.max(i + 1);
            continue;
        }

        let (ref_start, absolute) = match scheme {
            Scheme::Http(len) => (i - len, true),
            _ => (i, false),
        };
        let buf = out.get_or_insert_with(|| String::with_capacity(text.len() + 64));
        buf.push_str(&text[last..ref_start]);
        buf.push_str(&ctx.replacement(absolute, escaped));
        last = auth_end;
        i = auth_end;
    }

    match out {
        Some(mut buf) => {
            buf.push_str(&text[last..]);
            Cow::Owned(buf)
        }
        None => Cow::Borrowed(text),
    }
}

enum Scheme {
    /// `http:` or `https:`, with its byte length
    Http(usize),
    /// Some other scheme (`wss:`, `ftp:`, ...), never rewritten
    Other,
    /// Scheme-relative
    None,
}

fn scheme_before(bytes: &[u8], slashes_at: usize) -> Scheme {
    let head = &bytes[..slashes_at];
    if !head.ends_with(b":") {
        return Scheme::None;
    }
    for candidate in [&b"https:"[..], &b"http:"[..]] {
        if head.len() >= candidate.len() {
            let start = head.len() - candidate.len();
            let preceded_by_word = start > 0 && bytes[start - 1].is_ascii_alphanumeric();
            if head[start..].eq_ignore_ascii_case(candidate) && !preceded_by_word {
                return Scheme::Http(candidate.len());
            }
        }
    }
    Scheme::Other
}

fn scan_authority(bytes: &[u8], start: usize) -> usize {
    let mut i = start;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'-' || bytes[i] == b'.') {
        i += 1;
    }
    if i < bytes.len() && bytes[i] == b':' {
        let mut j = i + 1;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if j > i + 1 {
            i = j;
        }
    }
    i
}

fn at_boundary(bytes: &[u8], at: usize) -> bool {
    match bytes.get(at) {
        None => true,
        Some(b) => matches!(
            b,
            b'/' | b'?' | b'#' | b'"' | b'\'' | b'`' | b')' | b'<' | b'>' | b',' | b';' | b'\\' | b'&'
        ) || b.is_ascii_whitespace(),
    }
}

/// Rewrite a text body of the given category
pub fn rewrite(text: &str, category: ContentCategory, ctx: &RewriteContext) -> String {
    match category {
        ContentCategory::Markup => markup::rewrite(text, ctx),
        ContentCategory::Stylesheet => css::rewrite(text, ctx).into_owned(),
        ContentCategory::Script => script::rewrite(text, ctx).into_owned(),
        _ => text.to_string(),
    }
}

/// Rewrite a raw body, passing the original bytes through when it cannot be
/// decoded as declared.
pub fn rewrite_body(
    body: Bytes,
    content_type: Option<&str>,
    category: ContentCategory,
    ctx: &RewriteContext,
) -> Bytes {
    if !category.is_textual() {
        return body;
    }
    match decode_text(&body, content_type) {
        Ok(text) => Bytes::from(rewrite(text, category, ctx)),
        Err(e) => {
            warn!("{}; passing body through unmodified", e);
            body
        }
    }
}

/// Decode a body as UTF-8, honouring the declared charset.
///
/// Only UTF-8 (and its ASCII subset) is supported; anything else is a
/// [`ProxyError::DecodeFailure`].
pub fn decode_text<'a>(body: &'a [u8], content_type: Option<&str>) -> Result<&'a str> {
    let charset = content_type.and_then(classify::charset);
    match charset.as_deref() {
        None | Some("utf-8" | "utf8" | "us-ascii" | "ascii") => {}
        Some(other) => {
            return Err(ProxyError::DecodeFailure(format!("unsupported charset '{}'", other)));
        }
    }
    let body = body.strip_prefix(b"\xEF\xBB\xBF".as_slice()).unwrap_or(body);
    std::str::from_utf8(body)
        .map_err(|e| ProxyError::DecodeFailure(format!("body is not valid UTF-8: {}", e)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn ctx() -> RewriteContext {
        RewriteContext::new(
            &Url::parse("http://localhost:5000").unwrap(),
            &Url::parse("https://target.test/").unwrap(),
            "/site",
        )
        .unwrap()
    }

    #[test]
    fn test_absolute_and_scheme_relative() {
        let c = ctx();
        assert_eq!(
            rewrite_references("a https://target.test/x?y=1 b", &c),
            "a http://localhost:5000/site/x?y=1 b"
        );
        assert_eq!(
            rewrite_references("src=\"//www.target.test/img.png\"", &c),
            "src=\"//localhost:5000/site/img.png\""
        );
        assert_eq!(
            rewrite_references("HTTPS://TARGET.TEST", &c),
            "http://localhost:5000/site"
        );
    }

    #[test]
    fn test_proxy_origin_overlapping_target_rejected() {
        let target = Url::parse("https://target.test/").unwrap();
        for proxy in [
            "https://target.test",
            "http://www.target.test",
            "http://target.test:443",
            "http://WWW.target.test:80",
        ] {
            let proxy = Url::parse(proxy).unwrap();
            assert!(RewriteContext::new(&proxy, &target, "/site").is_err(), "{}", proxy);
        }

        let proxy = Url::parse("http://mirror.target.test").unwrap();
        let c = RewriteContext::new(&proxy, &target, "/site").unwrap();
        let once = rewrite_references("https://www.target.test/a", &c);
        assert_eq!(once, "http://mirror.target.test/site/a");
        assert_eq!(rewrite_references(&once, &c), once);
    }

    #[test]
    fn test_lookalike_hosts_untouched() {
        let c = ctx();
        for input in [
            "https://target.test.evil.com/x",
            "https://nottarget.test/x",
            "https://evil.com/target.test/x",
            "wss://target.test/socket",
            "xhttps://target.test/",
            "https://user@target.test/",
        ] {
            assert_eq!(rewrite_references(input, &c), input, "input {}", input);
        }
    }

    #[test]
    fn test_default_port_matches() {
        let c = ctx();
        assert_eq!(
            rewrite_references("https://target.test:443/a", &c),
            "http://localhost:5000/site/a"
        );
        assert_eq!(
            rewrite_references("https://target.test:8443/a", &c),
            "https://target.test:8443/a"
        );
    }

    #[test]
    fn test_escaped_slashes() {
        let c = ctx();
        assert_eq!(
            rewrite_references(r#"{"u":"https:\/\/target.test\/a"}"#, &c),
            r#"{"u":"http:\/\/localhost:5000\/site\/a"}"#
        );
    }

    #[test]
    fn test_idempotent() {
        let c = ctx();
        let once = rewrite_references("https://target.test/a //target.test/b", &c).into_owned();
        assert_eq!(rewrite_references(&once, &c), once);
    }

    #[test]
    fn test_is_proxied_prefix_equality() {
        let c = ctx();
        assert!(c.is_proxied("http://localhost:5000/site/x"));
        assert!(c.is_proxied("//localhost:5000"));
        assert!(!c.is_proxied("http://localhost:50001/x"));
        assert!(!c.is_proxied("https://target.test/?next=http://localhost:5000/"));
    }

    #[test]
    fn test_same_origin_rejected() {
        let u = Url::parse("http://target.test").unwrap();
        assert!(RewriteContext::new(&u, &u, "/site").is_err());
    }

    #[test]
    fn test_decode_failure_passes_through() {
        let c = ctx();
        let body = Bytes::from_static(b"<a href=\"https://target.test/\">\xff</a>");
        let out = rewrite_body(body.clone(), Some("text/html"), ContentCategory::Markup, &c);
        assert_eq!(out, body);

        let latin = Bytes::from_static(b"<a href=\"https://target.test/\">x</a>");
        let out = rewrite_body(latin.clone(), Some("text/html; charset=iso-8859-1"), ContentCategory::Markup, &c);
        assert_eq!(out, latin);
    }

    #[test]
    fn test_opaque_body_untouched() {
        let c = ctx();
        let body = Bytes::from_static(b"https://target.test/");
        assert_eq!(rewrite_body(body.clone(), None, ContentCategory::Image, &c), body);
    }
}
