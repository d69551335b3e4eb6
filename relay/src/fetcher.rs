//! Outbound fetches.
//!
//! One attempt per call, no retries. Callers pick buffered or streaming
//! bodies per request; streaming bodies are forward-only and finite.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::redirect::Policy;
use tracing::debug;
use url::Url;

use crate::error::{ProxyError, Result};
use crate::headers::OutboundPolicy;

/// Interactive page fetches
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "PATCH" => Ok(Method::Patch),
            "HEAD" => Ok(Method::Head),
            "OPTIONS" => Ok(Method::Options),
            other => Err(ProxyError::InvalidInput(format!("Unsupported method '{}'", other))),
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(m: Method) -> Self {
        match m {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
            Method::Patch => reqwest::Method::PATCH,
            Method::Head => reqwest::Method::HEAD,
            Method::Options => reqwest::Method::OPTIONS,
        }
    }
}

/// A single outbound request
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    /// Hand back a lazy byte stream instead of a buffered body
    pub streaming: bool,
    /// Keep cookie/authorization/origin/referer from `headers`
    pub forward_session: bool,
    pub timeout: Duration,
}

impl UpstreamRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::Get,
            url,
            headers: Vec::new(),
            body: None,
            streaming: false,
            forward_session: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: Option<Bytes>) -> Self {
        self.body = body.filter(|b| !b.is_empty());
        self
    }

    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    pub fn forward_session(mut self, forward: bool) -> Self {
        self.forward_session = forward;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

pub enum ResponseBody {
    Buffered(Bytes),
    Streaming(ByteStream),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Buffered(b) => write!(f, "Buffered({} bytes)", b.len()),
            ResponseBody::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub content_type: Option<String>,
    /// Final URL after redirects
    pub url: Url,
    pub body: ResponseBody,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Materialize the body, draining the stream if there is one
    pub async fn bytes(self) -> Result<Bytes> {
        match self.body {
            ResponseBody::Buffered(b) => Ok(b),
            ResponseBody::Streaming(mut s) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = s.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }

    /// Split into the header part and a byte stream over the body
    pub fn into_stream(self) -> (UpstreamResponse, ByteStream) {
        let stream = match self.body {
            ResponseBody::Streaming(s) => s,
            ResponseBody::Buffered(b) => stream::once(async move { Ok(b) }).boxed(),
        };
        let head = UpstreamResponse {
            status: self.status,
            headers: self.headers,
            content_type: self.content_type,
            url: self.url,
            body: ResponseBody::Buffered(Bytes::new()),
        };
        (head, stream)
    }
}

/// Anything that can perform an upstream fetch.
///
/// The relay holds it as `Arc<dyn Fetch>` so tests can substitute a
/// scripted upstream.
pub trait Fetch: Send + Sync {
    fn fetch(&self, request: UpstreamRequest) -> BoxFuture<'_, Result<UpstreamResponse>>;
}

/// reqwest-backed fetcher
pub struct HttpFetcher {
    client: reqwest::Client,
    policy: OutboundPolicy,
}

impl HttpFetcher {
    pub fn new(policy: OutboundPolicy, max_redirects: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(Policy::limited(max_redirects))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProxyError::InvalidInput(format!("HTTP client setup failed: {}", e)))?;
        Ok(Self { client, policy })
    }

    async fn execute(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        if !matches!(request.url.scheme(), "http" | "https") {
            return Err(ProxyError::InvalidInput(format!(
                "Unsupported scheme '{}'",
                request.url.scheme()
            )));
        }

        let mut headers = request.headers;
        self.policy.apply(&mut headers, request.forward_session);

        debug!("{} {} (streaming: {})", request.method, request.url, request.streaming);

        let mut builder = self
            .client
            .request(request.method.into(), request.url.clone())
            .headers(to_header_map(&headers))
            .timeout(request.timeout);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder.send().await?;

        let status = resp.status().as_u16();
        let url = resp.url().clone();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let headers = from_header_map(resp.headers());

        let body = if request.streaming {
            ResponseBody::Streaming(resp.bytes_stream().map_err(ProxyError::from).boxed())
        } else {
            ResponseBody::Buffered(resp.bytes().await?)
        };

        Ok(UpstreamResponse {
            status,
            headers,
            content_type,
            url,
            body,
        })
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, request: UpstreamRequest) -> BoxFuture<'_, Result<UpstreamResponse>> {
        Box::pin(self.execute(request))
    }
}

fn to_header_map(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (k, v) in headers {
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
            map.append(name, value);
        }
    }
    map
}

fn from_header_map(map: &HeaderMap) -> Vec<(String, String)> {
    map.iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.as_str().to_string(), val.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse() {
        assert_eq!("get".parse::<Method>().unwrap(), Method::Get);
        assert_eq!(" Patch ".parse::<Method>().unwrap(), Method::Patch);
        assert!(matches!("TRACE".parse::<Method>(), Err(ProxyError::InvalidInput(_))));
        assert!("CONNECT".parse::<Method>().is_err());
    }

    #[test]
    fn test_empty_body_is_dropped() {
        let url = Url::parse("http://example.test/").unwrap();
        let req = UpstreamRequest::get(url).body(Some(Bytes::new()));
        assert!(req.body.is_none());
    }

    #[tokio::test]
    async fn test_non_http_scheme_rejected() {
        let fetcher = HttpFetcher::new(OutboundPolicy::default(), 5).unwrap();
        let url = Url::parse("ftp://example.test/file").unwrap();
        let err = fetcher.fetch(UpstreamRequest::get(url)).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_buffered_body_as_stream() {
        let resp = UpstreamResponse {
            status: 200,
            headers: vec![],
            content_type: None,
            url: Url::parse("http://example.test/").unwrap(),
            body: ResponseBody::Buffered(Bytes::from_static(b"abc")),
        };
        let (head, mut s) = resp.into_stream();
        assert_eq!(head.status, 200);
        assert_eq!(s.next().await.unwrap().unwrap(), Bytes::from_static(b"abc"));
        assert!(s.next().await.is_none());
    }
}
