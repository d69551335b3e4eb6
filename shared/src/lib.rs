//! Mirrorgate Shared Library
//!
//! Tunnel wire protocol shared by the relay and the command-line client.

pub mod error;
pub mod obfuscate;
pub mod protocol;

pub use error::{Error, Result};
pub use obfuscate::Obfuscator;
pub use protocol::{Frame, FrameCodec, FrameKind, TunnelMessage, TunnelResult};
