//! Tunnel wire protocol.
//!
//! A frame carries the JSON encoding of one [`TunnelMessage`] (client to
//! relay) or one [`TunnelResult`] (relay to client), passed through the
//! [`Obfuscator`]. Binary frames carry the obfuscated bytes as-is; text frames
//! wrap them in standard base64, which is what browser clients send.

use std::collections::BTreeMap;

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::obfuscate::Obfuscator;
use crate::{Error, Result};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Which WebSocket frame type carries the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
}

/// A sealed frame ready to be put on (or just taken off) the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Text(_) => FrameKind::Text,
            Frame::Binary(_) => FrameKind::Binary,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Frame::Text(t) => t.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Request descriptor sent by a tunnel client.
///
/// `id` is assigned by the client, increases monotonically per connection,
/// and is echoed on the matching [`TunnelResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelMessage {
    pub id: u64,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request body, base64 on the wire
    #[serde(default, with = "base64_opt_body")]
    pub body: Option<Vec<u8>>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl TunnelMessage {
    pub fn get(id: u64, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            body: None,
        }
    }
}

/// Outcome of one [`TunnelMessage`].
///
/// Upstream failures are reported in-band: `status` then carries a gateway
/// error code and `error` the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelResult {
    pub id: u64,
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TunnelResult {
    /// Synthetic result for a message that never reached (or never came
    /// back from) the upstream.
    pub fn failure(id: u64, status: u16, url: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            id,
            status,
            headers: BTreeMap::new(),
            body: message.clone().into_bytes(),
            url: url.into(),
            content_type: Some("text/plain; charset=utf-8".to_string()),
            error: Some(message),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status)
    }
}

mod base64_body {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64_STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(d)?.unwrap_or_default();
        BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod base64_opt_body {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Option<Vec<u8>>, s: S) -> std::result::Result<S::Ok, S::Error> {
        match body {
            Some(bytes) => s.serialize_some(&BASE64_STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|encoded| BASE64_STANDARD.decode(encoded.as_bytes()))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

/// Seals values into frames and opens them again.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    obfuscator: Obfuscator,
}

impl FrameCodec {
    pub fn new(obfuscator: Obfuscator) -> Self {
        Self { obfuscator }
    }

    pub fn obfuscator(&self) -> Obfuscator {
        self.obfuscator
    }

    /// Serialize and obfuscate a value into a frame of the given kind
    pub fn seal<T: Serialize>(&self, value: &T, kind: FrameKind) -> Result<Frame> {
        let mut bytes = serde_json::to_vec(value)?;
        self.obfuscator.apply_in_place(&mut bytes);
        Ok(match kind {
            FrameKind::Text => Frame::Text(BASE64_STANDARD.encode(&bytes)),
            FrameKind::Binary => Frame::Binary(bytes),
        })
    }

    /// Undo the framing and the obfuscation, returning the plain JSON bytes.
    ///
    /// Fails with an error for which [`Error::is_undecodable`] holds when the
    /// frame cannot be unwrapped at all.
    pub fn open(&self, frame: &Frame) -> Result<Vec<u8>> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge(frame.len()));
        }
        if frame.is_empty() {
            return Err(Error::Protocol("empty frame".to_string()));
        }
        let mut bytes = match frame {
            Frame::Text(text) => BASE64_STANDARD.decode(text.trim().as_bytes())?,
            Frame::Binary(data) => data.clone(),
        };
        self.obfuscator.apply_in_place(&mut bytes);
        Ok(bytes)
    }

    /// Open a frame and parse it as `T`
    pub fn decode<T: DeserializeOwned>(&self, frame: &Frame) -> Result<T> {
        let plain = self.open(frame)?;
        Ok(serde_json::from_slice(&plain)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_defaults() {
        let msg: TunnelMessage =
            serde_json::from_str(r#"{"id":3,"url":"http://example.test/"}"#).unwrap();
        assert_eq!(msg.method, "GET");
        assert!(msg.headers.is_empty());
        assert!(msg.body.is_none());
    }

    #[test]
    fn test_message_body_is_base64_on_the_wire() {
        let mut msg = TunnelMessage::get(2, "http://example.test/upload");
        msg.method = "POST".into();
        msg.body = Some(vec![0x00, 0xFF, b'h', b'i']);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["body"], "AP9oaQ==");
        assert_eq!(serde_json::from_value::<TunnelMessage>(json).unwrap(), msg);

        let no_body = serde_json::to_value(TunnelMessage::get(3, "http://example.test/")).unwrap();
        assert!(no_body["body"].is_null());
        let bad = r#"{"id":4,"url":"http://example.test/","body":"not base64!"}"#;
        assert!(serde_json::from_str::<TunnelMessage>(bad).is_err());
    }

    #[test]
    fn test_result_body_is_base64_on_the_wire() {
        let result = TunnelResult {
            id: 7,
            status: 200,
            headers: BTreeMap::new(),
            body: b"hi".to_vec(),
            url: "http://example.test/ok".into(),
            content_type: None,
            error: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["body"], "aGk=");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_text_frame_matches_browser_encoding() {
        // btoa(String.fromCharCode(...bytes.map(b => b ^ 0x5A)))
        let codec = FrameCodec::default();
        let msg = TunnelMessage::get(1, "http://a.test/");
        let frame = codec.seal(&msg, FrameKind::Text).unwrap();
        let Frame::Text(text) = &frame else {
            panic!("expected text frame");
        };
        let raw = BASE64_STANDARD.decode(text).unwrap();
        let plain: Vec<u8> = raw.iter().map(|b| b ^ 0x5A).collect();
        assert_eq!(plain, serde_json::to_vec(&msg).unwrap());
        assert_eq!(codec.decode::<TunnelMessage>(&frame).unwrap(), msg);
    }

    #[test]
    fn test_binary_frame_roundtrip() {
        let codec = FrameCodec::new(Obfuscator::new(0x21));
        let result = TunnelResult::failure(9, 504, "http://slow.test/", "timed out");
        let frame = codec.seal(&result, FrameKind::Binary).unwrap();
        assert_eq!(frame.kind(), FrameKind::Binary);
        assert_eq!(codec.decode::<TunnelResult>(&frame).unwrap(), result);
    }

    #[test]
    fn test_bad_base64_is_undecodable() {
        let codec = FrameCodec::default();
        let err = codec.open(&Frame::Text("not base64!!".into())).unwrap_err();
        assert!(err.is_undecodable());
    }

    #[test]
    fn test_empty_frame_is_undecodable() {
        let codec = FrameCodec::default();
        assert!(codec.open(&Frame::Binary(Vec::new())).unwrap_err().is_undecodable());
    }

    #[test]
    fn test_bad_json_is_not_undecodable() {
        let codec = FrameCodec::default();
        let frame = Frame::Binary(Obfuscator::default().encode(b"{\"id\":"));
        let err = codec.decode::<TunnelMessage>(&frame).unwrap_err();
        assert!(!err.is_undecodable());
    }
}
