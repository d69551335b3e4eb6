//! Streaming relay.
//!
//! Bytes are forwarded as they arrive, re-chunked to at most
//! [`MAX_CHUNK`] bytes; the body is never held in memory as a whole.

use std::time::Duration;

use futures_util::StreamExt;
use tracing::{debug, warn};
use url::Url;

use crate::error::Result;
use crate::fetcher::{ByteStream, Fetch, UpstreamRequest};
use crate::headers;

pub const MAX_CHUNK: usize = 64 * 1024;
pub const DEFAULT_MEDIA_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Upstream headers a relayed response keeps, besides the content type.
/// Length and encoding headers never survive re-chunking.
const PASSED_THROUGH: &[&str] = &[
    "content-range",
    "accept-ranges",
    "last-modified",
    "etag",
    "content-disposition",
];

/// A response ready to be streamed back
pub struct Relayed {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ByteStream,
}

/// Build the outbound request for a media fetch.
///
/// Only the headers given here go upstream: the client's own headers are
/// never forwarded, apart from `Range`.
pub fn media_request(url: Url, range: Option<&str>, spoof_origin: Option<&Url>, timeout: Duration) -> UpstreamRequest {
    let mut outbound = Vec::new();
    if let Some(range) = range {
        outbound.push(("Range".to_string(), range.to_string()));
    }
    if let Some(origin) = spoof_origin {
        outbound.push(("Referer".to_string(), origin.to_string()));
        outbound.push((
            "Origin".to_string(),
            origin.origin().ascii_serialization(),
        ));
    }
    outbound.push(("Accept".to_string(), "*/*".to_string()));
    UpstreamRequest::get(url)
        .headers(outbound)
        .forward_session(true)
        .streaming()
        .timeout(timeout)
}

/// Start relaying `request`. Returns as soon as upstream headers arrive.
pub async fn relay(fetcher: &dyn Fetch, request: UpstreamRequest) -> Result<Relayed> {
    let url = request.url.clone();
    let response = fetcher.fetch(request.streaming()).await?;
    let status = response.status;
    let content_type = response
        .content_type
        .clone()
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

    let (head, upstream) = response.into_stream();
    let mut out: Vec<(String, String)> = head
        .headers
        .into_iter()
        .filter(|(name, _)| PASSED_THROUGH.iter().any(|p| name.eq_ignore_ascii_case(p)))
        .collect();
    headers::upsert(&mut out, "Content-Type", &content_type);
    headers::upsert(&mut out, "Cache-Control", "no-cache");
    headers::allow_any_origin(&mut out);

    debug!("Relaying {} ({}, status {})", url, content_type, status);
    Ok(Relayed {
        status,
        headers: out,
        body: rechunk(upstream, url),
    })
}

/// Split upstream chunks to at most [`MAX_CHUNK`] bytes. An upstream error
/// ends the stream as its last item.
pub fn rechunk(mut upstream: ByteStream, url: Url) -> ByteStream {
    async_stream::stream! {
        while let Some(item) = upstream.next().await {
            match item {
                Ok(mut chunk) => {
                    while chunk.len() > MAX_CHUNK {
                        yield Ok(chunk.split_to(MAX_CHUNK));
                    }
                    if !chunk.is_empty() {
                        yield Ok(chunk);
                    }
                }
                Err(e) => {
                    warn!("Relay of {} truncated: {}", url, e);
                    yield Err(e);
                    break;
                }
            }
        }
    }
    .boxed()
}
