//! The upstream request queue `Q`.
//!
//! The dispatcher core treats the upstream queue purely as an interface: hand
//! it a request, get exactly one completion back, at an unspecified point in
//! time and in unspecified order relative to other outstanding requests. This
//! module defines that interface plus two reference implementations used by
//! the binaries and the test suite: an in-process [`EchoQueue`] for smoke
//! testing and a [`TcpUpstreamQueue`] that forwards to a real upstream server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::time::Duration;
use tracing::warn;

use crate::error::QueueError;
use crate::packet::{self, Payload};

/// The upstream request queue consumed by the dispatcher.
///
/// Implementations must deliver exactly one resolution per [`Queue::submit`]
/// call. The dispatcher does not retry, reorder, or deduplicate requests; it
/// assumes the queue does whatever batching or pipelining it wants
/// internally and simply waits for each future to resolve.
#[async_trait]
pub trait Queue: Send + Sync + 'static {
    async fn submit(&self, request: Payload) -> Result<Payload, QueueError>;
}

/// An upstream stand-in that resolves every request with itself.
///
/// Useful for smoke-testing the dispatcher without standing up a real
/// backend. An optional fixed delay can be configured to make pipelining
/// and out-of-order completion easier to observe with a packet sniffer or in
/// a demo, but `EchoQueue` never reorders completions on its own: each
/// `submit` call resolves independently of the others as soon as its own
/// delay elapses.
#[derive(Debug, Default)]
pub struct EchoQueue {
    delay: Option<Duration>,
}

impl EchoQueue {
    pub fn new() -> Self {
        Self { delay: None }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }
}

#[async_trait]
impl Queue for EchoQueue {
    async fn submit(&self, request: Payload) -> Result<Payload, QueueError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(request)
    }
}

/// Forwards requests to a real upstream server over a second TCP connection,
/// using the same length-delimited framing as client connections plus an
/// 8-byte big-endian request id prefix invented for this reference
/// implementation (the dispatcher's spec leaves the upstream wire protocol
/// unspecified; this is the minimal scheme needed to match out-of-order
/// responses back to their requests).
///
/// A single background task owns the read half and demultiplexes responses
/// to the caller awaiting each one via a one-shot channel; writers serialize
/// through an async mutex since multiple requests can be in flight (and
/// therefore multiple `submit` calls can race to write) at once.
pub struct TcpUpstreamQueue {
    next_id: AtomicU64,
    pending: Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<Result<Payload, QueueError>>>>>,
    writer: AsyncMutex<packet::PacketWriter>,
}

impl TcpUpstreamQueue {
    pub async fn connect(addr: impl ToSocketAddrs) -> std::io::Result<Arc<Self>> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = packet::split(stream);
        let pending = Arc::new(std::sync::Mutex::new(HashMap::new()));

        let this = Arc::new(Self {
            next_id: AtomicU64::new(0),
            pending: Arc::clone(&pending),
            writer: AsyncMutex::new(writer),
        });

        tokio::spawn(Self::drive_responses(reader, pending));
        Ok(this)
    }

    async fn drive_responses(
        mut reader: packet::PacketReader,
        pending: Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<Result<Payload, QueueError>>>>>,
    ) {
        while let Some(frame) = reader.next().await {
            match frame {
                Ok(mut bytes) if bytes.len() >= 8 => {
                    let id = bytes.get_u64();
                    let payload = bytes.freeze();
                    if let Some(tx) = pending.lock().unwrap().remove(&id) {
                        let _ = tx.send(Ok(payload));
                    }
                }
                Ok(_) => warn!("upstream sent a response shorter than the id prefix"),
                Err(err) => {
                    warn!(error = %err, "upstream connection read failed");
                    break;
                }
            }
        }

        // The upstream connection is gone. Every request still waiting on a
        // response from it has to be failed, or it would hang forever.
        for (_, tx) in pending.lock().unwrap().drain() {
            let _ = tx.send(Err(QueueError::Closed));
        }
    }
}

#[async_trait]
impl Queue for TcpUpstreamQueue {
    async fn submit(&self, request: Payload) -> Result<Payload, QueueError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let mut framed = BytesMut::with_capacity(8 + request.len());
        framed.put_u64(id);
        framed.extend_from_slice(&request);

        let sent = self.writer.lock().await.send(framed.freeze()).await;
        if let Err(err) = sent {
            self.pending.lock().unwrap().remove(&id);
            return Err(QueueError::Failed(err.to_string()));
        }

        rx.await.unwrap_or(Err(QueueError::Closed))
    }
}
