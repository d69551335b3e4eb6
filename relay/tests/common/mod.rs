//! Mock upstream and relay harness shared by the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;

use axum::{
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use mirrorgate_relay::{router, AppState, RelayConfig};
use tokio::net::TcpListener;

pub const VIDEO_LEN: usize = 200_000;

pub async fn spawn(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn host(headers: &HeaderMap) -> String {
    headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost")
        .to_string()
}

async fn index(headers: HeaderMap) -> Html<String> {
    let host = host(&headers);
    Html(format!(
        r#"<!DOCTYPE html><html><head><title>Upstream</title>
<link rel="stylesheet" href="/style.css">
</head><body>
<a href="http://{host}/next">next</a>
<img src="/logo.png"><img src="/logo.png"><img src="/missing.png">
<script>var api = "http://{host}/api";</script>
</body></html>"#
    ))
}

async fn style() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/css")],
        "@font-face{font-family:x;src:url(/font.woff2)}",
    )
}

async fn font() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "font/woff2")], b"WOFF2".to_vec())
}

async fn logo() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "image/png")], b"\x89PNG".to_vec())
}

async fn echo_headers(headers: HeaderMap) -> String {
    let mut lines: Vec<String> = headers
        .iter()
        .map(|(k, v)| format!("{}: {}", k, v.to_str().unwrap_or("")))
        .collect();
    lines.sort();
    lines.join("\n")
}

pub fn video_bytes() -> Vec<u8> {
    (0..=255u8).cycle().take(VIDEO_LEN).collect()
}

async fn video(headers: HeaderMap) -> Response {
    let data = video_bytes();
    let range = headers
        .get(header::RANGE)
        .and_then(|r| r.to_str().ok())
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.split_once('-'))
        .and_then(|(s, e)| Some((s.parse::<usize>().ok()?, e.parse::<usize>().ok()?)));

    match range {
        Some((start, end)) if start <= end && end < data.len() => (
            StatusCode::PARTIAL_CONTENT,
            [
                (header::CONTENT_TYPE, "video/mp4".to_string()),
                (header::ACCEPT_RANGES, "bytes".to_string()),
                (header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, data.len())),
            ],
            data[start..=end].to_vec(),
        )
            .into_response(),
        _ => (
            [
                (header::CONTENT_TYPE, "video/mp4".to_string()),
                (header::ACCEPT_RANGES, "bytes".to_string()),
            ],
            data,
        )
            .into_response(),
    }
}

pub fn upstream() -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ok", get(|| async { "hi" }))
        .route("/next", get(|| async { Html("<p>next page</p>") }))
        .route("/style.css", get(style))
        .route("/font.woff2", get(font))
        .route("/logo.png", get(logo))
        .route("/video.mp4", get(video))
        .route("/headers", get(echo_headers))
        .route("/missing.png", get(|| async { (StatusCode::NOT_FOUND, "gone") }))
}

pub struct Harness {
    pub upstream: SocketAddr,
    pub relay: SocketAddr,
}

impl Harness {
    pub async fn start() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut RelayConfig)) -> Self {
        let upstream = spawn(upstream()).await;
        let mut config = RelayConfig {
            target: format!("http://{}/", upstream),
            ..Default::default()
        };
        adjust(&mut config);
        let state = AppState::from_config(config).unwrap();
        let relay = spawn(router(state)).await;
        Self { upstream, relay }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.relay, path)
    }

    pub fn upstream_url(&self, path: &str) -> String {
        format!("http://{}{}", self.upstream, path)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/tunnel", self.relay)
    }
}
