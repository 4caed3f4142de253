//! Unix socket plumbing for the RPC endpoint and the reverse channel.

use std::io;
use std::path::Path;

use tokio::net::{UnixListener, UnixStream};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::JsonCodec;

/// Bind a listener at `path`, replacing a stale socket file left by a
/// previous run.
pub fn bind(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        tracing::debug!(path = %path.display(), "Removing stale socket");
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    tracing::trace!(path = %path.display(), "Bound socket");
    Ok(listener)
}

pub async fn connect(path: &Path) -> io::Result<UnixStream> {
    let stream = UnixStream::connect(path).await?;
    tracing::trace!(path = %path.display(), "Connected socket");
    Ok(stream)
}

/// Split a stream into a typed frame reader and writer.
pub fn framed<In, Out>(
    stream: UnixStream,
) -> (
    FramedRead<OwnedReadHalf, JsonCodec<In>>,
    FramedWrite<OwnedWriteHalf, JsonCodec<Out>>,
) {
    let (read, write) = stream.into_split();
    (
        FramedRead::new(read, JsonCodec::new()),
        FramedWrite::new(write, JsonCodec::new()),
    )
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};

    use super::*;

    #[tokio::test]
    async fn bind_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fc.sock");
        std::fs::write(&path, b"stale").unwrap();

        let listener = bind(&path).unwrap();
        let client = tokio::spawn({
            let path = path.clone();
            async move {
                let stream = connect(&path).await.unwrap();
                let (_, mut tx) = framed::<serde_json::Value, serde_json::Value>(stream);
                tx.send(serde_json::json!({"hello": "bridge"})).await.unwrap();
            }
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (mut rx, _) = framed::<serde_json::Value, serde_json::Value>(stream);
        let got = rx.next().await.unwrap().unwrap();
        assert_eq!(got["hello"], "bridge");
        client.await.unwrap();
    }
}
