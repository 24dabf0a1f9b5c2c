//! Owns one socket to the server: a background task reads and frames
//! incoming bytes while `send` writes commands and waits its turn on an
//! in-order pending-reply queue, the same split mini-redis's `Connection`
//! makes between buffered writes and a framed read loop, generalized here to
//! request/response correlation rather than a single read-then-respond cycle.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::frame::{Frame, FrameCodec};
use crate::job::Greeting;

/// Idle-read timeout enforced on every connection, per the wire protocol
/// contract: the server may legitimately block ~2s on FETCH, so this has to
/// be generous, but a fully silent socket past this point is worth surfacing.
const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Events a connection can surface to its owner without failing the
/// in-flight request.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// No bytes were read within [`IDLE_READ_TIMEOUT`]. The connection
    /// remains usable; this is purely informational.
    Timeout,
}

type PendingReply = oneshot::Sender<Result<Frame>>;

struct Shared {
    pending: Mutex<VecDeque<PendingReply>>,
    closed: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
}

/// A single connection to the server. Not `Clone`: the pool hands out
/// exclusive ownership per acquisition, matching the "callers never share a
/// connection" contract.
pub struct Connection {
    writer: Mutex<Box<dyn AsyncWrite + Unpin + Send>>,
    shared: Arc<Shared>,
    reader_task: tokio::task::JoinHandle<()>,
    pub greeting: Greeting,
}

impl Connection {
    /// Open a plain TCP connection to `addr`, read the initial `HI`
    /// greeting, and return it alongside the connection. Does not perform
    /// the HELLO handshake; see [`crate::handshake`].
    pub async fn connect_tcp(addr: &str) -> Result<Self> {
        let stream = dial(addr).await?;
        Self::from_stream(stream).await
    }

    /// As [`connect_tcp`], but wraps the socket in a TLS session negotiated
    /// against `domain` before the `HI` greeting is read. Requires the `tls`
    /// feature.
    ///
    /// [`connect_tcp`]: Connection::connect_tcp
    #[cfg(feature = "tls")]
    pub async fn connect_tls(addr: &str, domain: &str) -> Result<Self> {
        let stream = dial(addr).await?;
        let connector = tokio_native_tls::TlsConnector::from(
            native_tls::TlsConnector::new().map_err(|e| Error::Tls(e.to_string()))?,
        );
        let stream = connector
            .connect(domain, stream)
            .await
            .map_err(|e| Error::Tls(e.to_string()))?;
        Self::from_stream(stream).await
    }

    async fn from_stream<S>(stream: S) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            pending: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            events: broadcast::channel(16).0,
        });

        // The server sends the HI greeting unsolicited as soon as the socket
        // is open, so we must register a pending slot for it before the
        // reader task can possibly observe it.
        let (greeting_tx, greeting_rx) = oneshot::channel();
        shared.pending.lock().await.push_back(greeting_tx);

        let reader_task = tokio::spawn(read_loop(read_half, shared.clone()));

        let greeting_frame = greeting_rx
            .await
            .map_err(|_| Error::ConnectionClosed("closed before greeting".into()))??;

        let text = match greeting_frame {
            Frame::Simple(s) | Frame::Bulk(s) => s,
            other => {
                return Err(Error::Protocol(format!(
                    "expected HI greeting, got {:?}",
                    other
                )))
            }
        };
        let json_part = text
            .strip_prefix("HI ")
            .ok_or_else(|| Error::Protocol(format!("malformed greeting: {:?}", text)))?;
        let greeting: Greeting = serde_json::from_str(json_part)?;

        Ok(Self {
            writer: Mutex::new(Box::new(write_half)),
            shared,
            reader_task,
            greeting,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Join `tokens` with single spaces, append `\r\n`, write it, and await
    /// exactly the next reply in FIFO order.
    ///
    /// Returns `Ok(None)` for a null bulk reply, `Ok(Some(text))` otherwise,
    /// and `Err(Error::ServerError)` if the server replied with `-ERR`.
    pub async fn send(&self, tokens: &[&str]) -> Result<Option<String>> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed("connection already closed".into()));
        }

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.push_back(tx);

        let mut line = tokens.join(" ");
        line.push_str("\r\n");

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                self.shared.closed.store(true, Ordering::Release);
                return Err(e.into());
            }
        }

        let frame = rx
            .await
            .map_err(|_| Error::ConnectionClosed("closed while awaiting reply".into()))??;

        match frame {
            Frame::Null => Ok(None),
            Frame::Simple(s) | Frame::Bulk(s) => Ok(Some(s)),
            Frame::Error(e) => Err(Error::ServerError(e)),
        }
    }

    /// As [`send`], but fails with [`Error::ProtocolAssertion`] if the reply
    /// text is not byte-equal to `expected`.
    ///
    /// [`send`]: Connection::send
    pub async fn send_with_assert(&self, tokens: &[&str], expected: &str) -> Result<()> {
        let reply = self.send(tokens).await?;
        match reply.as_deref() {
            Some(actual) if actual == expected => Ok(()),
            actual => Err(Error::ProtocolAssertion {
                expected: expected.to_owned(),
                actual: actual.unwrap_or("<null>").to_owned(),
            }),
        }
    }

    /// Write `END\r\n` and close the socket. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut writer = self.writer.lock().await;
        // Best-effort: a write failure here just means the peer is already gone.
        let _ = writer.write_all(b"END\r\n").await;
        let _ = writer.shutdown().await;
        drain_pending(&self.shared).await;
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.reader_task.abort();
    }
}

async fn read_loop<R: AsyncRead + Unpin>(mut reader: R, shared: Arc<Shared>) {
    let mut codec = FrameCodec::new();
    let mut scratch = [0u8; 4096];

    loop {
        match codec.parse() {
            Ok(Some(frame)) => {
                resolve_next_pending(&shared, Ok(frame)).await;
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                fail_connection(&shared, e).await;
                return;
            }
        }

        match tokio::time::timeout(IDLE_READ_TIMEOUT, reader.read(&mut scratch)).await {
            Ok(Ok(0)) => {
                fail_connection(&shared, Error::ConnectionClosed("peer closed connection".into()))
                    .await;
                return;
            }
            Ok(Ok(n)) => {
                codec.buffer_mut().extend_from_slice(&scratch[..n]);
            }
            Ok(Err(e)) => {
                fail_connection(&shared, e.into()).await;
                return;
            }
            Err(_elapsed) => {
                debug!("connection idle read timeout");
                let _ = shared.events.send(ConnectionEvent::Timeout);
            }
        }
    }
}

async fn resolve_next_pending(shared: &Arc<Shared>, result: Result<Frame>) {
    let pending = shared.pending.lock().await.pop_front();
    if let Some(sender) = pending {
        let _ = sender.send(result);
    } else {
        warn!("received a frame with no pending request to resolve it");
    }
}

async fn fail_connection(shared: &Arc<Shared>, error: Error) {
    shared.closed.store(true, Ordering::Release);
    drain_pending_with(shared, error).await;
}

async fn drain_pending(shared: &Arc<Shared>) {
    drain_pending_with(
        shared,
        Error::ConnectionClosed("connection closed".into()),
    )
    .await;
}

async fn drain_pending_with(shared: &Arc<Shared>, error: Error) {
    let mut pending = shared.pending.lock().await;
    while let Some(sender) = pending.pop_front() {
        let message = error.to_string();
        let _ = sender.send(Err(Error::ConnectionClosed(message)));
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(value)
    }
}

async fn dial(addr: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn reads_greeting_and_sends_commands_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"+HI {\"v\":2}\r\n")
                .await
                .unwrap();

            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"PING\r\n");
            socket.write_all(b"+PONG\r\n").await.unwrap();

            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"FETCH q1\r\n");
            socket.write_all(b"$-1\r\n").await.unwrap();
        });

        let conn = Connection::connect_tcp(&addr.to_string()).await.unwrap();
        assert_eq!(conn.greeting.v, 2);

        let reply = conn.send(&["PING"]).await.unwrap();
        assert_eq!(reply.as_deref(), Some("PONG"));

        let reply = conn.send(&["FETCH", "q1"]).await.unwrap();
        assert_eq!(reply, None);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn server_error_surfaces_as_server_error() {
        let (client_io, mut server_io) = duplex(4096);
        tokio::spawn(async move {
            server_io.write_all(b"+HI {\"v\":2}\r\n").await.unwrap();
            let mut buf = vec![0u8; 64];
            let _ = server_io.read(&mut buf).await.unwrap();
            server_io
                .write_all(b"-ERR unknown command\r\n")
                .await
                .unwrap();
        });

        let conn = Connection::from_stream(client_io).await.unwrap();
        let err = conn.send(&["BOGUS"]).await.unwrap_err();
        assert!(matches!(err, Error::ServerError(_)));
    }

    #[tokio::test]
    async fn closing_drains_pending_requests() {
        let (client_io, server_io) = duplex(4096);
        let mut server_io = server_io;
        tokio::spawn(async move {
            server_io.write_all(b"+HI {\"v\":2}\r\n").await.unwrap();
        });

        let conn = Connection::from_stream(client_io).await.unwrap();
        conn.close().await.unwrap();
        // A second close is a no-op.
        conn.close().await.unwrap();
        let err = conn.send(&["PING"]).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed(_)));
    }
}
