//! Error types for the tunnel protocol.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame decode error: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Invalid message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame too large ({0} bytes)")]
    FrameTooLarge(usize),
}

impl Error {
    /// True when the frame itself could not be unwrapped, as opposed to
    /// unwrapping fine but carrying a malformed descriptor.
    pub fn is_undecodable(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Decode(_) | Error::FrameTooLarge(_))
    }
}
