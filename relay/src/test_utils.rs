//! Scripted upstream for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::error::{ProxyError, Result};
use crate::fetcher::{Fetch, ResponseBody, UpstreamRequest, UpstreamResponse};

enum Route {
    Static {
        status: u16,
        content_type: String,
        body: Bytes,
    },
    /// Body chunks arrive through a channel, one `recv` per chunk
    Stream {
        content_type: String,
        rx: Option<mpsc::Receiver<Result<Bytes>>>,
    },
    Unreachable,
    Timeout,
}

/// A [`Fetch`] that answers from a table keyed by absolute URL.
///
/// Unknown URLs get a 404. Every call is counted and recorded.
#[derive(Default)]
pub struct MockFetcher {
    routes: Mutex<HashMap<String, Route>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<UpstreamRequest>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn route(self, url: &str, route: Route) -> Self {
        if let Ok(mut routes) = self.routes.lock() {
            routes.insert(url.to_string(), route);
        }
        self
    }

    pub fn respond(self, url: &str, status: u16, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.route(
            url,
            Route::Static {
                status,
                content_type: content_type.to_string(),
                body: body.into(),
            },
        )
    }

    pub fn unreachable(self, url: &str) -> Self {
        self.route(url, Route::Unreachable)
    }

    pub fn timeout(self, url: &str) -> Self {
        self.route(url, Route::Timeout)
    }

    /// Serve `url` as a stream fed through the returned sender
    pub fn stream(self, url: &str, content_type: &str) -> (Self, mpsc::Sender<Result<Bytes>>) {
        let (tx, rx) = mpsc::channel(1);
        let this = self.route(
            url,
            Route::Stream {
                content_type: content_type.to_string(),
                rx: Some(rx),
            },
        );
        (this, tx)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<UpstreamRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn answer(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let url = request.url.clone();
        if let Ok(mut log) = self.requests.lock() {
            log.push(request);
        }

        let mut routes = self
            .routes
            .lock()
            .map_err(|_| ProxyError::UpstreamUnreachable("mock poisoned".into()))?;
        let (status, content_type, body) = match routes.get_mut(url.as_str()) {
            None => (404, "text/plain".to_string(), ResponseBody::Buffered(Bytes::from_static(b"not found"))),
            Some(Route::Static { status, content_type, body }) => {
                (*status, content_type.clone(), ResponseBody::Buffered(body.clone()))
            }
            Some(Route::Stream { content_type, rx }) => {
                let mut rx = rx
                    .take()
                    .ok_or_else(|| ProxyError::UpstreamUnreachable("stream already consumed".into()))?;
                let body = async_stream::stream! {
                    while let Some(item) = rx.recv().await {
                        yield item;
                    }
                };
                (200, content_type.clone(), ResponseBody::Streaming(body.boxed()))
            }
            Some(Route::Unreachable) => {
                return Err(ProxyError::UpstreamUnreachable(format!("connection refused: {}", url)))
            }
            Some(Route::Timeout) => return Err(ProxyError::UpstreamTimeout(url.to_string())),
        };

        Ok(UpstreamResponse {
            status,
            headers: vec![("content-type".to_string(), content_type.clone())],
            content_type: Some(content_type),
            url,
            body,
        })
    }
}

impl Fetch for MockFetcher {
    fn fetch(&self, request: UpstreamRequest) -> BoxFuture<'_, Result<UpstreamResponse>> {
        let result = self.answer(request);
        Box::pin(async move { result })
    }
}
