//! Bidirectional relay between a client and its upstream
//!
//! A session runs one copy task per direction. The first task to finish
//! starts teardown: the shared token is cancelled, which both marks the
//! session as tearing down and wakes the other task so it drops its socket
//! halves. The session only returns once both tasks have reported back, so
//! neither socket outlives it.

use std::fmt;
use std::io;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProxyError;
use crate::proxy::backend::BackendCandidate;

/// Read buffer size for each relay direction.
pub const BUFFER_SIZE: usize = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToUpstream => f.write_str("client->upstream"),
            Direction::UpstreamToClient => f.write_str("upstream->client"),
        }
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub backend: BackendCandidate,
    pub bytes_to_upstream: u64,
    pub bytes_to_client: u64,
    /// Direction whose completion started teardown.
    pub first_closed: Direction,
    pub duration: Duration,
}

/// Signal sent by a relay task once it has stopped and released its halves.
#[derive(Debug)]
struct Completion {
    direction: Direction,
    copied: u64,
    result: io::Result<()>,
    /// Teardown had already started when the error occurred.
    suppressed: bool,
}

/// One client connection paired with its upstream connection.
pub struct Session {
    client: TcpStream,
    upstream: TcpStream,
    backend: BackendCandidate,
    teardown: CancellationToken,
}

impl Session {
    pub fn new(client: TcpStream, upstream: TcpStream, backend: BackendCandidate) -> Self {
        Self {
            client,
            upstream,
            backend,
            teardown: CancellationToken::new(),
        }
    }

    /// Relay until either side finishes, then tear down and wait for both
    /// directions to stop.
    ///
    /// Returns an error only for a relay failure seen before teardown began.
    pub async fn run(self) -> Result<SessionReport, ProxyError> {
        let started = Instant::now();
        let Session {
            client,
            upstream,
            backend,
            teardown,
        } = self;

        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();
        let (done_tx, mut done_rx) = mpsc::channel(2);

        tokio::spawn(relay(
            Direction::ClientToUpstream,
            client_read,
            upstream_write,
            teardown.clone(),
            done_tx.clone(),
        ));
        tokio::spawn(relay(
            Direction::UpstreamToClient,
            upstream_read,
            client_write,
            teardown.clone(),
            done_tx,
        ));

        let first = done_rx.recv().await;
        teardown.cancel();
        let second = done_rx.recv().await;

        let mut report = SessionReport {
            backend,
            bytes_to_upstream: 0,
            bytes_to_client: 0,
            first_closed: first
                .as_ref()
                .map(|c| c.direction)
                .unwrap_or(Direction::ClientToUpstream),
            duration: started.elapsed(),
        };
        let mut failure = None;

        // A missing completion means the relay task panicked; its halves were
        // dropped during unwinding.
        for completion in [first, second].into_iter().flatten() {
            match completion.direction {
                Direction::ClientToUpstream => report.bytes_to_upstream = completion.copied,
                Direction::UpstreamToClient => report.bytes_to_client = completion.copied,
            }

            let Err(e) = completion.result else {
                continue;
            };

            if completion.suppressed {
                tracing::debug!(
                    direction = %completion.direction,
                    error = %e,
                    "Relay stopped by teardown"
                );
            } else if failure.is_none() {
                failure = Some(ProxyError::Relay {
                    direction: completion.direction,
                    source: e,
                });
            } else {
                tracing::warn!(
                    direction = %completion.direction,
                    error = %e,
                    "Relay failed"
                );
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

async fn relay(
    direction: Direction,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    teardown: CancellationToken,
    done: mpsc::Sender<Completion>,
) {
    let mut copied = 0u64;

    let result = tokio::select! {
        res = copy_stream(&mut reader, &mut writer, &mut copied) => res,
        _ = teardown.cancelled() => Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "session torn down",
        )),
    };
    let suppressed = result.is_err() && teardown.is_cancelled();

    // Release both halves before signalling so the sockets are closed by the
    // time the session observes this completion.
    drop(reader);
    drop(writer);

    let _ = done
        .send(Completion {
            direction,
            copied,
            result,
            suppressed,
        })
        .await;
}

/// Copy `reader` into `writer` until EOF, counting bytes written.
async fn copy_stream<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        buf.clear();
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf).await?;
        *copied += n as u64;
    }
}
