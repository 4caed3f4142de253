//! Client side of the connection to the foreign-hosted endpoint.
//!
//! Requests are written through one shared writer; a reader task routes
//! replies to waiting callers by id and events to open streams. When the
//! connection drops every pending call fails with `TransportClosed`.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine as _;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{CallResult, Outcome, XCall, XFileSystemCall, XFrame, XRequest};
use crate::bridge::transport;
use crate::error::BridgeError;
use crate::model::EventSink;
use crate::nodeutil;

pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

type Pending = DashMap<u64, oneshot::Sender<Outcome>>;
type Streams = DashMap<u64, EventSink>;

pub struct ReverseChannel {
    writer: Mutex<FramedWrite<OwnedWriteHalf, JsonCodec<XRequest>>>,
    pending: Arc<Pending>,
    streams: Arc<Streams>,
    next_id: AtomicU64,
    next_stream: AtomicU64,
    timeout: Duration,
    closed: CancellationToken,
    reader: JoinHandle<()>,
}

impl ReverseChannel {
    /// Dial the foreign endpoint. Failure here is a startup failure.
    pub async fn connect(path: &Path, timeout: Duration) -> std::io::Result<Self> {
        let stream = transport::connect(path).await?;
        let (reader, writer) = transport::framed::<XFrame, XRequest>(stream);
        tracing::info!(path = %path.display(), ?timeout, "Reverse channel connected");
        Ok(Self::from_parts(reader, writer, timeout))
    }

    fn from_parts(
        reader: FramedRead<OwnedReadHalf, JsonCodec<XFrame>>,
        writer: FramedWrite<OwnedWriteHalf, JsonCodec<XRequest>>,
        timeout: Duration,
    ) -> Self {
        let pending = Arc::new(Pending::new());
        let streams = Arc::new(Streams::new());
        let closed = CancellationToken::new();
        let reader = tokio::spawn(read_loop(
            reader,
            pending.clone(),
            streams.clone(),
            closed.clone(),
        ));
        Self {
            writer: Mutex::new(writer),
            pending,
            streams,
            next_id: AtomicU64::new(1),
            next_stream: AtomicU64::new(1),
            timeout,
            closed,
            reader,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Forward one call and wait for its reply. Queueing for the writer,
    /// writing and waiting are all bounded by the forward timeout.
    pub async fn call(&self, call: XCall) -> Result<CallResult, BridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _pending = PendingEntry {
            pending: &self.pending,
            id,
        };

        // The reader cancels before draining `pending`; checking after the
        // insert means either it drains us or we see the cancel.
        if self.closed.is_cancelled() {
            return Err(BridgeError::TransportClosed("reverse channel is closed".into()));
        }

        tracing::trace!(id, ?call, "Forwarding call");
        let exchange = async {
            self.writer
                .lock()
                .await
                .send(XRequest { id, call })
                .await
                .map_err(|e| BridgeError::TransportClosed(e.to_string()))?;
            match rx.await {
                Ok(Outcome::Ok { result }) => Ok(result),
                Ok(Outcome::Error { error }) => Err(BridgeError::from_wire(error)),
                Err(_) => Err(BridgeError::TransportClosed(
                    "reverse channel closed with call in flight".into(),
                )),
            }
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(id, timeout = ?self.timeout, "Forwarded call timed out");
                Err(BridgeError::ForwardTimeout(self.timeout))
            }
        }
    }

    /// Reserve a stream id whose events go to `sink`.
    pub fn open_stream(&self, sink: EventSink) -> u64 {
        let stream = self.next_stream.fetch_add(1, Ordering::Relaxed);
        self.streams.insert(stream, sink);
        stream
    }

    pub fn close_stream(&self, stream: u64) {
        self.streams.remove(&stream);
    }

    /// Fetch a file the foreign process provides.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, BridgeError> {
        let call = XCall::FileSystem(XFileSystemCall::ReadFile {
            path: path.to_string(),
        });
        match self.call(call).await? {
            CallResult::Bytes { data } => base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|e| BridgeError::Adapter(format!("foreign file {path}: {e}"))),
            CallResult::Text { text } => Ok(text.into_bytes()),
            other => Err(BridgeError::Adapter(format!(
                "unexpected reply to read_file: {other:?}"
            ))),
        }
    }

    /// Stop reading and fail everything still waiting. Idempotent.
    pub fn shutdown(&self) {
        if !self.closed.is_cancelled() {
            tracing::debug!("Closing reverse channel");
        }
        self.reader.abort();
        self.closed.cancel();
        self.pending.clear();
        self.streams.clear();
    }
}

/// Removes a call's reply slot however the call ends, including when the
/// caller's future is dropped.
struct PendingEntry<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl Drop for ReverseChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut reader: FramedRead<OwnedReadHalf, JsonCodec<XFrame>>,
    pending: Arc<Pending>,
    streams: Arc<Streams>,
    closed: CancellationToken,
) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(XFrame::Reply { id, outcome }) => match pending.remove(&id) {
                Some((_, tx)) => {
                    let _ = tx.send(outcome);
                }
                None => tracing::debug!(id, "Reply for unknown or timed out call"),
            },
            Ok(XFrame::Event { stream, value }) => {
                let Some(sink) = streams.get(&stream).map(|s| s.clone()) else {
                    tracing::trace!(stream, "Event for closed stream");
                    continue;
                };
                match nodeutil::decode(value) {
                    Ok(event) => sink.emit(event),
                    Err(e) => tracing::warn!(stream, error = %e, "Undecodable foreign event"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Reverse channel frame error");
                break;
            }
        }
    }
    tracing::info!("Reverse channel disconnected");
    closed.cancel();
    // Dropping the senders wakes every waiter with a closed error.
    pending.clear();
}
