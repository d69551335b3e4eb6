//! Tunnel sessions.
//!
//! One WebSocket connection is one session. Frames are handled strictly one
//! at a time: each carries an obfuscated [`TunnelMessage`], the fetch runs to
//! completion and the [`TunnelResult`] goes back before the next frame is
//! read. Sessions share nothing with each other.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use mirrorgate_shared::{Frame, FrameCodec, TunnelMessage, TunnelResult};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ProxyError, Result};
use crate::fetcher::{Fetch, Method, UpstreamRequest};
use crate::headers::HOP_BY_HOP;
use crate::metrics::{Metrics, Mode};

pub struct TunnelSession {
    fetcher: Arc<dyn Fetch>,
    codec: FrameCodec,
    timeout: Duration,
    metrics: Metrics,
    last_id: Option<u64>,
}

impl TunnelSession {
    pub fn new(fetcher: Arc<dyn Fetch>, codec: FrameCodec, timeout: Duration, metrics: Metrics) -> Self {
        Self {
            fetcher,
            codec,
            timeout,
            metrics,
            last_id: None,
        }
    }

    /// Answer one inbound frame with exactly one result frame of the same
    /// kind.
    ///
    /// Errors only when the frame cannot be unwrapped at all, in which case
    /// the connection must be closed.
    pub async fn handle_frame(&mut self, frame: &Frame) -> Result<Frame> {
        let started = Instant::now();
        let plain = self.codec.open(frame)?;

        let result = match serde_json::from_slice::<TunnelMessage>(&plain) {
            Ok(message) => self.dispatch(message).await,
            Err(e) => {
                let id = recover_id(&plain);
                warn!("Invalid tunnel descriptor (id {}): {}", id, e);
                TunnelResult::failure(id, 400, "", format!("Invalid request descriptor: {}", e))
            }
        };

        self.metrics
            .record_request(Mode::Tunnel, result.status, started.elapsed().as_micros() as u64)
            .await;
        self.metrics.add_bytes_out(result.body.len() as u64);

        Ok(self.codec.seal(&result, frame.kind())?)
    }

    async fn dispatch(&mut self, message: TunnelMessage) -> TunnelResult {
        if let Some(last) = self.last_id {
            if message.id <= last {
                warn!("Tunnel id {} does not increase on {}", message.id, last);
            }
        }
        self.last_id = Some(message.id);

        match self.execute(&message).await {
            Ok(result) => {
                debug!("Tunnel #{} {} {} -> {}", message.id, message.method, message.url, result.status);
                result
            }
            Err(e) => {
                warn!("Tunnel #{} {} failed: {}", message.id, message.url, e);
                TunnelResult::failure(message.id, e.status().as_u16(), message.url.as_str(), e.to_string())
            }
        }
    }

    async fn execute(&self, message: &TunnelMessage) -> Result<TunnelResult> {
        let url = Url::parse(&message.url)?;
        let method: Method = message.method.parse()?;
        let headers = message
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let request = UpstreamRequest::get(url)
            .method(method)
            .headers(headers)
            .body(message.body.clone().map(Bytes::from))
            .forward_session(true)
            .timeout(self.timeout);

        let response = self.fetcher.fetch(request).await?;
        let status = response.status;
        let final_url = response.url.to_string();
        let content_type = response.content_type.clone();
        let headers: BTreeMap<String, String> = response
            .headers
            .iter()
            .filter(|(k, _)| !HOP_BY_HOP.iter().any(|h| k.eq_ignore_ascii_case(h)))
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect();
        let body = response.bytes().await?;

        Ok(TunnelResult {
            id: message.id,
            status,
            headers,
            body: body.to_vec(),
            url: final_url,
            content_type,
            error: None,
        })
    }
}

/// Best-effort id from a descriptor that failed to parse
fn recover_id(plain: &[u8]) -> u64 {
    serde_json::from_slice::<serde_json::Value>(plain)
        .ok()
        .and_then(|v| v.get("id")?.as_u64())
        .unwrap_or(0)
}

/// Drive one WebSocket connection until it closes
pub async fn serve(socket: WebSocket, mut session: TunnelSession) {
    let metrics = session.metrics.clone();
    metrics.tunnel_opened();
    info!("Tunnel opened ({} active)", metrics.active_tunnels());

    let (mut sender, mut receiver) = socket.split();
    let mut handled = 0u64;

    while let Some(msg) = receiver.next().await {
        let frame = match msg {
            Ok(Message::Text(text)) => Frame::Text(text),
            Ok(Message::Binary(data)) => Frame::Binary(data),
            Ok(Message::Ping(d)) => {
                if sender.send(Message::Pong(d)).await.is_err() {
                    break;
                }
                continue;
            }
            Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!("Tunnel read error: {}", e);
                break;
            }
        };

        match session.handle_frame(&frame).await {
            Ok(Frame::Text(text)) => {
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Ok(Frame::Binary(data)) => {
                if sender.send(Message::Binary(data)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Closing tunnel: {}", e);
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::PROTOCOL,
                        reason: Cow::Owned(close_reason(&e)),
                    })))
                    .await;
                break;
            }
        }
        handled += 1;
    }

    metrics.tunnel_closed();
    info!("Tunnel closed after {} messages", handled);
}

/// Close reasons are limited to 123 bytes on the wire
fn close_reason(e: &ProxyError) -> String {
    let mut reason = e.to_string();
    if reason.len() > 120 {
        let mut cut = 120;
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        reason.truncate(cut);
    }
    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockFetcher;
    use mirrorgate_shared::{FrameKind, Obfuscator};

    fn session(mock: MockFetcher) -> (TunnelSession, Arc<MockFetcher>) {
        let mock = Arc::new(mock);
        let s = TunnelSession::new(mock.clone(), FrameCodec::default(), Duration::from_secs(5), Metrics::new());
        (s, mock)
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (mut s, _) = session(MockFetcher::new().respond("http://example.test/ok", 200, "text/plain", &b"hi"[..]));
        let codec = FrameCodec::default();
        let frame = codec
            .seal(&TunnelMessage::get(7, "http://example.test/ok"), FrameKind::Text)
            .unwrap();

        let reply = s.handle_frame(&frame).await.unwrap();
        assert_eq!(reply.kind(), FrameKind::Text);
        let result: TunnelResult = codec.decode(&reply).unwrap();
        assert_eq!(result.id, 7);
        assert_eq!(result.status, 200);
        assert_eq!(result.body, b"hi");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_binary_frames_answered_in_kind() {
        let (mut s, _) = session(MockFetcher::new().respond("http://example.test/ok", 200, "text/plain", &b"hi"[..]));
        let codec = FrameCodec::default();
        let frame = codec
            .seal(&TunnelMessage::get(1, "http://example.test/ok"), FrameKind::Binary)
            .unwrap();
        let reply = s.handle_frame(&frame).await.unwrap();
        assert_eq!(reply.kind(), FrameKind::Binary);
    }

    #[tokio::test]
    async fn test_invalid_descriptor_gets_400_with_id() {
        let (mut s, mock) = session(MockFetcher::new());
        let codec = FrameCodec::default();
        let frame = codec
            .seal(&serde_json::json!({"id": 12, "method": "GET"}), FrameKind::Text)
            .unwrap();
        let result: TunnelResult = codec.decode(&s.handle_frame(&frame).await.unwrap()).unwrap();
        assert_eq!(result.id, 12);
        assert_eq!(result.status, 400);
        assert!(result.error.is_some());
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_bad_method_and_url() {
        let (mut s, mock) = session(MockFetcher::new());
        let codec = FrameCodec::default();
        let mut msg = TunnelMessage::get(2, "http://example.test/");
        msg.method = "TRACE".into();
        let result: TunnelResult = codec
            .decode(&s.handle_frame(&codec.seal(&msg, FrameKind::Text).unwrap()).await.unwrap())
            .unwrap();
        assert_eq!(result.status, 400);

        let msg = TunnelMessage::get(3, "not a url");
        let result: TunnelResult = codec
            .decode(&s.handle_frame(&codec.seal(&msg, FrameKind::Text).unwrap()).await.unwrap())
            .unwrap();
        assert_eq!(result.id, 3);
        assert_eq!(result.status, 400);
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failures_are_reported_in_band() {
        let (mut s, _) = session(
            MockFetcher::new()
                .unreachable("http://down.test/")
                .timeout("http://slow.test/"),
        );
        let codec = FrameCodec::default();

        let frame = codec.seal(&TunnelMessage::get(1, "http://down.test/"), FrameKind::Binary).unwrap();
        let result: TunnelResult = codec.decode(&s.handle_frame(&frame).await.unwrap()).unwrap();
        assert_eq!(result.status, 502);
        assert!(result.error.unwrap().contains("down.test"));

        let frame = codec.seal(&TunnelMessage::get(2, "http://slow.test/"), FrameKind::Binary).unwrap();
        let result: TunnelResult = codec.decode(&s.handle_frame(&frame).await.unwrap()).unwrap();
        assert_eq!(result.status, 504);
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_fatal() {
        let (mut s, _) = session(MockFetcher::new());
        let err = s.handle_frame(&Frame::Text("***not base64***".into())).await.unwrap_err();
        assert!(matches!(err, ProxyError::ChannelProtocol(_)));
    }

    #[tokio::test]
    async fn test_session_forwards_descriptor_headers() {
        let (mut s, mock) = session(MockFetcher::new().respond("http://example.test/me", 200, "application/json", &b"{}"[..]));
        let codec = FrameCodec::new(Obfuscator::new(0x33));
        s.codec = codec;
        let mut msg = TunnelMessage::get(9, "http://example.test/me");
        msg.method = "post".into();
        msg.headers.insert("Cookie".into(), "sid=1".into());
        msg.body = Some("payload".into());
        let frame = codec.seal(&msg, FrameKind::Text).unwrap();
        let result: TunnelResult = codec.decode(&s.handle_frame(&frame).await.unwrap()).unwrap();
        assert_eq!(result.status, 200);

        let sent = mock.requests().pop().unwrap();
        assert_eq!(sent.method, Method::Post);
        assert!(sent.forward_session);
        assert_eq!(sent.body.as_deref(), Some(&b"payload"[..]));
        assert!(sent.headers.iter().any(|(k, v)| k == "Cookie" && v == "sid=1"));
    }

    #[test]
    fn test_close_reason_is_bounded() {
        let long = ProxyError::ChannelProtocol("é".repeat(200));
        assert!(close_reason(&long).len() <= 120);
    }
}
