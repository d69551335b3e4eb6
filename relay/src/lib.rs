//! Mirrorgate Relay
//!
//! Serves a target site through this host: pages are fetched and their
//! references rewritten to point back here, media is streamed through,
//! pages can be assembled with their resources embedded, and a WebSocket
//! tunnel multiplexes arbitrary fetches for remote clients.

pub mod classify;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod headers;
pub mod inline;
pub mod metrics;
pub mod rewrite;
pub mod server;
pub mod stream;
pub mod tunnel;

#[cfg(test)]
mod test_utils;

pub use config::RelayConfig;
pub use error::{ProxyError, Result};
pub use fetcher::{Fetch, HttpFetcher, UpstreamRequest, UpstreamResponse};
pub use server::{router, AppState};
