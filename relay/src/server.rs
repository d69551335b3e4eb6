//! HTTP surface.
//!
//! Thin adapters from axum requests to the fetch, rewrite, inline, relay and
//! tunnel paths. Every response leaves with a permissive CORS header.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{header, HeaderMap, Method as HttpMethod, StatusCode, Uri},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use bytes::Bytes;
use futures_util::StreamExt;
use hyper::header::{HeaderName, HeaderValue};
use mirrorgate_shared::protocol::MAX_FRAME_SIZE;
use mirrorgate_shared::{FrameCodec, Obfuscator};
use serde::Deserialize;
use tracing::info;
use url::Url;

use crate::classify::{self, ContentCategory};
use crate::config::RelayConfig;
use crate::error::{ProxyError, Result};
use crate::fetcher::{ByteStream, Fetch, HttpFetcher, Method, UpstreamRequest};
use crate::headers;
use crate::inline::{Inliner, PassCache};
use crate::metrics::{Metrics, Mode};
use crate::rewrite::{self, rewrite_references, RewriteContext, IFRAME_RELAY_PATH, MEDIA_RELAY_PATH};
use crate::stream::{self, rechunk};
use crate::tunnel::{self, TunnelSession};

pub const ASSEMBLE_PATH: &str = "/assemble";

#[derive(Clone)]
pub struct AppState {
    fetcher: Arc<dyn Fetch>,
    config: Arc<RelayConfig>,
    target: Url,
    public_origin: Option<Url>,
    metrics: Metrics,
}

impl AppState {
    /// State backed by the real HTTP client
    pub fn from_config(config: RelayConfig) -> anyhow::Result<Self> {
        let fetcher = HttpFetcher::new(config.outbound_policy(), config.max_redirects)?;
        Self::new(config, Arc::new(fetcher))
    }

    pub fn new(config: RelayConfig, fetcher: Arc<dyn Fetch>) -> anyhow::Result<Self> {
        config.validate()?;
        let target = config.target_url()?;
        let public_origin = config.public_origin_url()?;
        Ok(Self {
            fetcher,
            config: Arc::new(config),
            target,
            public_origin,
            metrics: Metrics::new(),
        })
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn mount(&self) -> &str {
        self.config.mount_path()
    }

    /// The origin clients reach this relay on
    fn proxy_origin(&self, headers: &HeaderMap) -> Result<Url> {
        if let Some(origin) = &self.public_origin {
            return Ok(origin.clone());
        }
        let host = headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| ProxyError::InvalidInput("Missing Host header".to_string()))?;
        let proto = headers
            .get("x-forwarded-proto")
            .and_then(|p| p.to_str().ok())
            .and_then(|p| p.split(',').next())
            .map(str::trim)
            .filter(|p| *p == "http" || *p == "https")
            .unwrap_or("http");
        Ok(Url::parse(&format!("{}://{}", proto, host))?)
    }

    fn rewrite_context(&self, headers: &HeaderMap) -> Result<RewriteContext> {
        RewriteContext::new(&self.proxy_origin(headers)?, &self.target, self.mount())
    }

    /// Target URL for a path under a mount point, keeping the raw query.
    ///
    /// The path replaces the target's path as-is, so `//host/...` stays on
    /// the target host instead of being read as a scheme-relative URL.
    fn target_url(&self, rest: &str, query: Option<&str>) -> Result<Url> {
        let path = if rest.is_empty() { "/" } else { rest };
        let mut url = self.target.clone();
        url.set_path(path);
        url.set_query(query);
        url.set_fragment(None);
        Ok(url)
    }

    async fn record(&self, mode: Mode, status: u16, started: Instant) {
        let elapsed = started.elapsed();
        self.metrics
            .record_request(mode, status, elapsed.as_micros() as u64)
            .await;
        info!("{} request -> {} in {:?}", mode.as_str(), status, elapsed);
    }

    /// Count bytes as they leave
    fn metered(&self, body: ByteStream) -> Body {
        let metrics = self.metrics.clone();
        Body::from_stream(body.inspect(move |chunk| {
            if let Ok(bytes) = chunk {
                metrics.add_bytes_out(bytes.len() as u64);
            }
        }))
    }
}

pub fn router(state: AppState) -> Router {
    let mount = state.mount().to_string();
    Router::new()
        .route(&mount, any(page))
        .route(&format!("{}/", mount), any(page))
        .route(&format!("{}/*path", mount), any(page))
        .route(MEDIA_RELAY_PATH, get(media_relay))
        .route(IFRAME_RELAY_PATH, get(iframe_relay))
        .route(ASSEMBLE_PATH, get(assemble))
        .route(&format!("{}/*path", ASSEMBLE_PATH), get(assemble))
        .route("/tunnel", get(tunnel_upgrade))
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::map_response(cors_header))
        .with_state(state)
}

async fn cors_header(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

#[derive(Debug, Deserialize)]
pub struct UrlParam {
    url: Option<String>,
}

/// The mandatory `url` parameter, checked before anything is fetched
fn url_param(param: &UrlParam) -> Result<&str> {
    param
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ProxyError::missing_param("url"))
}

fn relay_target(raw: &str, ctx: &RewriteContext) -> Result<Url> {
    let url = Url::parse(raw)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ProxyError::InvalidInput(format!("Unsupported scheme '{}'", url.scheme())));
    }
    if ctx.is_proxied(url.as_str()) {
        return Err(ProxyError::InvalidInput(
            "Refusing to relay the proxy's own origin".to_string(),
        ));
    }
    Ok(url)
}

fn build_response(status: u16, headers: &[(String, String)], body: Body) -> Response {
    let mut builder = hyper::Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    if let Some(headers_mut) = builder.headers_mut() {
        for (k, v) in headers {
            if let (Ok(hn), Ok(hv)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
                headers_mut.append(hn, hv);
            }
        }
    }
    match builder.body(body) {
        Ok(r) => r,
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Response build error").into_response(),
    }
}

fn client_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.as_str().to_string(), val.to_string())))
        .collect()
}

/// Upstream response headers as sent back to the client
fn response_headers(
    upstream: Vec<(String, String)>,
    category: ContentCategory,
    forward_session: bool,
    ctx: &RewriteContext,
) -> Vec<(String, String)> {
    let mut out = upstream;
    headers::strip_hop_by_hop(&mut out);
    if !forward_session {
        out.retain(|(k, _)| !k.eq_ignore_ascii_case("set-cookie"));
    }
    if let Some(location) = headers::get(&out, "location").map(String::from) {
        headers::upsert(&mut out, "Location", &rewrite_references(&location, ctx));
    }
    if category == ContentCategory::Markup {
        headers::relax_framing(&mut out);
    }
    headers::allow_any_origin(&mut out);
    out
}

// Page mode

async fn page(
    State(state): State<AppState>,
    method: HttpMethod,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let response = serve_page(&state, &method, &uri, &headers, body)
        .await
        .unwrap_or_else(ProxyError::into_page_response);
    state.record(Mode::Page, response.status().as_u16(), started).await;
    response
}

async fn serve_page(
    state: &AppState,
    method: &HttpMethod,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let ctx = state.rewrite_context(headers)?;
    let rest = uri.path().strip_prefix(state.mount()).unwrap_or("");
    let url = state.target_url(rest, uri.query())?;
    let method: Method = method.as_str().parse()?;

    let request = UpstreamRequest::get(url.clone())
        .method(method)
        .headers(client_headers(headers))
        .body(Some(body))
        .forward_session(state.config.forward_session)
        .streaming()
        .timeout(state.config.page_timeout());
    let response = state.fetcher.fetch(request).await?;

    let category = classify::sniff(response.content_type.as_deref(), &response.url);
    info!("page {} {} -> {} ({:?})", method, url, response.status, category);

    if category.is_textual() {
        let status = response.status;
        let content_type = response.content_type.clone();
        let out_headers = response_headers(response.headers.clone(), category, state.config.forward_session, &ctx);
        let body = response.bytes().await?;
        let body = rewrite::rewrite_body(body, content_type.as_deref(), category, &ctx);
        state.metrics.add_bytes_out(body.len() as u64);
        Ok(build_response(status, &out_headers, Body::from(body)))
    } else {
        let (head, upstream) = response.into_stream();
        let out_headers = response_headers(head.headers, category, state.config.forward_session, &ctx);
        let body = state.metered(rechunk(upstream, head.url));
        Ok(build_response(head.status, &out_headers, body))
    }
}

// Media relay

async fn media_relay(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(param): Query<UrlParam>,
) -> Response {
    let started = Instant::now();
    let response = serve_media(&state, &headers, &param)
        .await
        .unwrap_or_else(ProxyError::into_text_response);
    state.record(Mode::Media, response.status().as_u16(), started).await;
    response
}

async fn serve_media(state: &AppState, headers: &HeaderMap, param: &UrlParam) -> Result<Response> {
    let raw = url_param(param)?;
    let ctx = state.rewrite_context(headers)?;
    let url = relay_target(raw, &ctx)?;

    let range = headers.get(header::RANGE).and_then(|r| r.to_str().ok());
    let spoof = state.config.spoof_referer.then_some(&state.target);
    let request = stream::media_request(url, range, spoof, state.config.media_timeout());

    let relayed = stream::relay(state.fetcher.as_ref(), request).await?;
    Ok(build_response(relayed.status, &relayed.headers, state.metered(relayed.body)))
}

// Iframe relay

async fn iframe_relay(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(param): Query<UrlParam>,
) -> Response {
    let started = Instant::now();
    let response = serve_iframe(&state, &headers, &param)
        .await
        .unwrap_or_else(ProxyError::into_text_response);
    state.record(Mode::Iframe, response.status().as_u16(), started).await;
    response
}

async fn serve_iframe(state: &AppState, headers: &HeaderMap, param: &UrlParam) -> Result<Response> {
    let raw = url_param(param)?;
    let ctx = state.rewrite_context(headers)?;
    let url = relay_target(raw, &ctx)?;

    let request = UpstreamRequest::get(url).timeout(state.config.page_timeout());
    let response = state.fetcher.fetch(request).await?;
    let status = response.status;
    let category = classify::sniff(response.content_type.as_deref(), &response.url);
    let content_type = response.content_type.clone();

    let mut out_headers: Vec<(String, String)> = Vec::new();
    if let Some(ct) = &content_type {
        headers::upsert(&mut out_headers, "Content-Type", ct);
    }
    headers::relax_framing(&mut out_headers);
    headers::allow_any_origin(&mut out_headers);

    let body = rewrite::rewrite_body(response.bytes().await?, content_type.as_deref(), category, &ctx);
    state.metrics.add_bytes_out(body.len() as u64);
    Ok(build_response(status, &out_headers, Body::from(body)))
}

// Page assembly

async fn assemble(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Query(param): Query<UrlParam>,
) -> Response {
    let started = Instant::now();
    let response = serve_assembled(&state, &uri, &headers, &param)
        .await
        .unwrap_or_else(ProxyError::into_page_response);
    state.record(Mode::Assemble, response.status().as_u16(), started).await;
    response
}

async fn serve_assembled(state: &AppState, uri: &Uri, headers: &HeaderMap, param: &UrlParam) -> Result<Response> {
    let ctx = state.rewrite_context(headers)?;
    let rest = uri.path().strip_prefix(ASSEMBLE_PATH).unwrap_or("");
    let url = if rest.is_empty() || rest == "/" {
        relay_target(url_param(param)?, &ctx)?
    } else {
        state.target_url(rest, None)?
    };

    let request = UpstreamRequest::get(url).timeout(state.config.page_timeout());
    let response = state.fetcher.fetch(request).await?;
    let status = response.status;
    let page_url = response.url.clone();
    let content_type = response.content_type.clone();
    let category = classify::sniff(content_type.as_deref(), &page_url);
    let mut out_headers = response_headers(response.headers.clone(), category, false, &ctx);
    let body = response.bytes().await?;

    let decoded = match category {
        ContentCategory::Markup => rewrite::decode_text(&body, content_type.as_deref()).ok(),
        _ => None,
    };
    let Some(html) = decoded else {
        let body = rewrite::rewrite_body(body, content_type.as_deref(), category, &ctx);
        return Ok(build_response(status, &out_headers, Body::from(body)));
    };

    let inliner = Inliner::new(state.fetcher.clone())
        .with_limits(state.config.inline.concurrency, state.config.inline.max_resources)
        .with_timeout(state.config.resource_timeout());
    let mut cache = PassCache::new();
    let (assembled, report) = inliner.assemble(html, &page_url, &mut cache).await;
    state.metrics.record_inline(&report);

    let rewritten = rewrite::rewrite(&assembled, ContentCategory::Markup, &ctx);
    headers::upsert(&mut out_headers, "X-Inline-Requested", &report.requested.to_string());
    headers::upsert(&mut out_headers, "X-Inline-Embedded", &report.embedded.to_string());
    state.metrics.add_bytes_out(rewritten.len() as u64);
    Ok(build_response(status, &out_headers, Body::from(rewritten)))
}

// Tunnel

async fn tunnel_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let codec = FrameCodec::new(Obfuscator::new(state.config.obfuscation_key));
    let session = TunnelSession::new(
        state.fetcher.clone(),
        codec,
        state.config.page_timeout(),
        state.metrics.clone(),
    );
    ws.max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| tunnel::serve(socket, session))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus().await,
    )
}
