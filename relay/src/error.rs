//! Error taxonomy for the relay.
//!
//! Non-2xx upstream statuses are not errors: they are relayed as-is. Every
//! variant here is a proxy-side failure and maps to one HTTP status.

use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Missing or malformed required parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Connect or DNS failure, or the connection dropped
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("Upstream timed out: {0}")]
    UpstreamTimeout(String),

    #[error("Too many redirects: {0}")]
    TooManyRedirects(String),

    /// Body encoding does not match what was declared
    #[error("Decode failure: {0}")]
    DecodeFailure(String),

    /// Malformed tunnel frame
    #[error("Channel protocol error: {0}")]
    ChannelProtocol(String),
}

impl ProxyError {
    pub fn missing_param(name: &str) -> Self {
        ProxyError::InvalidInput(format!("Missing {} parameter", name))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidInput(_) | ProxyError::ChannelProtocol(_) => StatusCode::BAD_REQUEST,
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamUnreachable(_)
            | ProxyError::TooManyRedirects(_)
            | ProxyError::DecodeFailure(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Minimal HTML error document used by the page modes
    pub fn into_page_response(self) -> Response {
        let body = format!(
            "<!DOCTYPE html>\n<html><head><title>Error</title></head>\
             <body><h1>Error</h1><p>{}</p></body></html>",
            escape_html(&self.to_string())
        );
        (self.status(), Html(body)).into_response()
    }

    /// Short plain-text error used by the relay modes
    pub fn into_text_response(self) -> Response {
        (
            self.status(),
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response()
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        let target = err
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "upstream".to_string());
        if err.is_timeout() {
            ProxyError::UpstreamTimeout(target)
        } else if err.is_redirect() {
            ProxyError::TooManyRedirects(target)
        } else if err.is_builder() {
            ProxyError::InvalidInput(err.to_string())
        } else {
            ProxyError::UpstreamUnreachable(err.to_string())
        }
    }
}

impl From<url::ParseError> for ProxyError {
    fn from(err: url::ParseError) -> Self {
        ProxyError::InvalidInput(format!("Invalid URL: {}", err))
    }
}

impl From<mirrorgate_shared::Error> for ProxyError {
    fn from(err: mirrorgate_shared::Error) -> Self {
        ProxyError::ChannelProtocol(err.to_string())
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        self.into_text_response()
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
