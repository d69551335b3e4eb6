//! Request/Response Header Policy
//!
//! Outbound requests get a fixed browser-like identity with client-identifying
//! headers stripped; relayed responses lose the headers that re-chunking or
//! re-encoding invalidates.

use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Never forwarded upstream: the HTTP client recomputes them or they leak
/// the caller's network identity.
const ALWAYS_STRIPPED: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
    "accept-encoding",
    "forwarded",
    "via",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-real-ip",
];

/// Forwarded only when a mode explicitly carries session state
const SESSION_HEADERS: &[&str] = &["origin", "referer", "cookie", "authorization"];

/// Invalid once the body has been re-chunked or decompressed
pub const HOP_BY_HOP: &[&str] = &[
    "content-length",
    "content-encoding",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "proxy-connection",
    "trailer",
    "upgrade",
];

/// Header rewrite rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderRule {
    /// Add header (won't overwrite existing)
    Add(String, String),
    /// Set header (overwrites existing)
    Set(String, String),
    /// Remove header by name
    Remove(String),
}

/// Identity applied to every upstream request
#[derive(Debug, Clone)]
pub struct OutboundPolicy {
    pub user_agent: String,
    /// Referer presented when the caller's own is stripped
    pub referer: Option<String>,
    /// Custom rules applied last, in order
    pub rules: Vec<HeaderRule>,
}

impl Default for OutboundPolicy {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            referer: None,
            rules: Vec::new(),
        }
    }
}

impl OutboundPolicy {
    /// Rewrite request headers before they go upstream
    pub fn apply(&self, headers: &mut Vec<(String, String)>, forward_session: bool) {
        headers.retain(|(name, _)| {
            let name = name.to_ascii_lowercase();
            !ALWAYS_STRIPPED.contains(&name.as_str())
                && (forward_session || !SESSION_HEADERS.contains(&name.as_str()))
        });

        upsert(headers, "User-Agent", &self.user_agent);
        add(headers, "Accept", DEFAULT_ACCEPT);
        add(headers, "Accept-Language", DEFAULT_ACCEPT_LANGUAGE);
        if let Some(referer) = &self.referer {
            add(headers, "Referer", referer);
        }

        apply_rules(&self.rules, headers);
    }
}

/// Drop headers that no longer describe the body we send
pub fn strip_hop_by_hop(headers: &mut Vec<(String, String)>) {
    headers.retain(|(name, _)| !HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)));
}

/// Let proxy-served pages embed the content in frames
pub fn relax_framing(headers: &mut Vec<(String, String)>) {
    headers.retain(|(name, _)| {
        !name.eq_ignore_ascii_case("x-frame-options")
            && !name.eq_ignore_ascii_case("content-security-policy")
            && !name.eq_ignore_ascii_case("content-security-policy-report-only")
    });
    upsert(headers, "X-Frame-Options", "ALLOWALL");
}

/// Permissive cross-origin access
pub fn allow_any_origin(headers: &mut Vec<(String, String)>) {
    upsert(headers, "Access-Control-Allow-Origin", "*");
}

pub fn get<'a>(headers: &'a [(String, String)], key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

fn apply_rules(rules: &[HeaderRule], headers: &mut Vec<(String, String)>) {
    for rule in rules {
        match rule {
            HeaderRule::Add(k, v) => add(headers, k, v),
            HeaderRule::Set(k, v) => upsert(headers, k, v),
            HeaderRule::Remove(k) => {
                headers.retain(|(name, _)| !name.eq_ignore_ascii_case(k));
            }
        }
    }
}

/// Insert unless present
fn add(headers: &mut Vec<(String, String)>, key: &str, value: &str) {
    if !headers.iter().any(|(name, _)| name.eq_ignore_ascii_case(key)) {
        headers.push((key.to_string(), value.to_string()));
    }
}

/// Insert or update a header
pub fn upsert(headers: &mut Vec<(String, String)>, key: &str, value: &str) {
    if let Some(h) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
        h.1 = value.to_string();
    } else {
        headers.push((key.to_string(), value.to_string()));
    }
}
