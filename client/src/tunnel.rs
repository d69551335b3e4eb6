//! Tunnel connection to the relay.
//!
//! Requests may be issued concurrently from any number of tasks. Each gets a
//! fresh id from a per-connection counter and waits on its own slot in the
//! pending table until the reader task sees the result with that id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use mirrorgate_shared::{Frame, FrameCodec, FrameKind, TunnelMessage, TunnelResult};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

type Pending = Arc<DashMap<u64, oneshot::Sender<TunnelResult>>>;

pub struct TunnelClient {
    codec: FrameCodec,
    kind: FrameKind,
    timeout: Duration,
    next_id: AtomicU64,
    pending: Pending,
    outbound: mpsc::Sender<Message>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl TunnelClient {
    pub async fn connect(relay_url: &str, codec: FrameCodec, kind: FrameKind, timeout: Duration) -> Result<Self> {
        info!("Connecting to relay: {}", relay_url);
        let (ws_stream, _) = connect_async(relay_url)
            .await
            .context("Failed to connect to relay server")?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound, mut rx) = mpsc::channel::<Message>(64);
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    warn!("Tunnel write failed: {}", e);
                    break;
                }
            }
        });

        let pending: Pending = Arc::new(DashMap::new());
        let table = pending.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let frame = match msg {
                    Ok(Message::Text(text)) => Frame::Text(text),
                    Ok(Message::Binary(data)) => Frame::Binary(data),
                    Ok(Message::Close(reason)) => {
                        match reason {
                            Some(close) => warn!("Relay closed the tunnel: {} {}", close.code, close.reason),
                            None => info!("Relay closed the tunnel"),
                        }
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Tunnel read error: {}", e);
                        break;
                    }
                };
                deliver(&codec, &table, &frame);
            }
            // Dropping the senders wakes every waiter with an error
            table.clear();
        });

        Ok(Self {
            codec,
            kind,
            timeout,
            next_id: AtomicU64::new(1),
            pending,
            outbound,
            writer,
            reader,
        })
    }

    /// Send one request and wait for its result.
    ///
    /// The id on `message` is replaced with the next id of this connection.
    pub async fn send(&self, mut message: TunnelMessage) -> Result<TunnelResult> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        message.id = id;

        let frame = self.codec.seal(&message, self.kind)?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        debug!("Tunnel #{} {} {}", id, message.method, message.url);
        if self.outbound.send(to_message(frame)).await.is_err() {
            self.pending.remove(&id);
            anyhow::bail!("Tunnel connection is closed");
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => anyhow::bail!("Tunnel closed before result #{} arrived", id),
            Err(_) => {
                self.pending.remove(&id);
                anyhow::bail!("Timed out after {:?} waiting for result #{}", self.timeout, id)
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Close the connection after flushing queued frames
    pub async fn close(self) {
        if self.in_flight() > 0 {
            warn!("Closing tunnel with {} request(s) still pending", self.in_flight());
        }
        let _ = self.outbound.send(Message::Close(None)).await;
        drop(self.outbound);
        let _ = self.writer.await;
        self.reader.abort();
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(data) => Message::Binary(data),
    }
}

fn deliver(codec: &FrameCodec, pending: &Pending, frame: &Frame) {
    let result: TunnelResult = match codec.decode(frame) {
        Ok(result) => result,
        Err(e) => {
            warn!("Dropping undecodable result frame: {}", e);
            return;
        }
    };
    match pending.remove(&result.id) {
        Some((_, waiter)) => {
            let _ = waiter.send(result);
        }
        None => warn!("Result #{} has no pending request", result.id),
    }
}
