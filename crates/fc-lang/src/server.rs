//! Per-connection request loop.
//!
//! Each accepted connection gets a reader (this task), a writer task draining
//! an outbound queue shared by replies and subscription events, and a
//! `JoinSet` of in-flight calls. A call that panics is answered with an
//! adapter error. When the connection ends, in-flight calls are aborted and
//! awaited before the connection's handles are released.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{Outcome, Request, ServerFrame};
use crate::bridge::transport;
use crate::error::BridgeError;
use crate::handle::{ConnectionId, Owner};
use crate::service::{CallContext, Router};

const OUTBOUND_DEPTH: usize = 256;

pub(crate) async fn serve_connection(
    stream: UnixStream,
    router: Arc<Router>,
    shutdown: CancellationToken,
) {
    let conn = ConnectionId::new();
    let owner = Owner::Connection(conn);
    let (mut reader, mut writer) = transport::framed::<Value, ServerFrame>(stream);
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_DEPTH);
    tracing::debug!(conn = %conn, "Connection opened");

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = writer.send(frame).await {
                tracing::debug!(conn = %conn, error = %e, "Write failed");
                break;
            }
        }
    });

    let ctx = CallContext {
        owner,
        listener: Some(out_tx.clone()),
    };
    let mut calls = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::debug!(conn = %conn, "Shutting down connection");
                break;
            }

            Some(joined) = calls.join_next(), if !calls.is_empty() => {
                match joined {
                    Err(e) if e.is_panic() => {
                        tracing::error!(conn = %conn, error = %e, "Call panicked");
                    }
                    _ => {}
                }
            }

            frame = reader.next() => match frame {
                Some(Ok(raw)) => match parse_request(raw) {
                    Ok(Request { id, call }) => {
                        let router = router.clone();
                        let ctx = ctx.clone();
                        let out = out_tx.clone();
                        calls.spawn(async move {
                            let outcome = AssertUnwindSafe(router.dispatch(&ctx, call))
                                .catch_unwind()
                                .await
                                .unwrap_or_else(|_| {
                                    tracing::error!(conn = %conn, id, "Call panicked");
                                    let error = BridgeError::Adapter("call panicked".into());
                                    Outcome::Error { error: error.to_wire() }
                                });
                            let _ = out.send(ServerFrame::reply(id, outcome)).await;
                        });
                    }
                    Err((id, e)) => {
                        tracing::debug!(conn = %conn, id, error = %e, "Rejected request");
                        let error = e.to_wire();
                        let _ = out_tx.send(ServerFrame::reply(id, Outcome::Error { error })).await;
                    }
                },
                Some(Err(e)) => {
                    tracing::warn!(conn = %conn, error = %e, "Bad frame, closing connection");
                    break;
                }
                None => {
                    tracing::debug!(conn = %conn, "Peer closed connection");
                    break;
                }
            }
        }
    }

    calls.shutdown().await;
    let released = router.table().release_all(owner);
    drop(ctx);
    drop(out_tx);
    writer_task.abort();
    tracing::info!(conn = %conn, released, "Connection closed");
}

/// A well-framed document that is not a known call still gets an answer,
/// provided it carries an id.
fn parse_request(raw: Value) -> Result<Request, (u64, BridgeError)> {
    let id = raw.get("id").and_then(Value::as_u64).unwrap_or(0);
    serde_json::from_value(raw)
        .map_err(|e| (id, BridgeError::InvalidArgument(format!("unrecognized request: {e}"))))
}
