use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;

use crate::error::RelayError;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

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

/// Outcome of both directions of a finished relay.
#[derive(Debug)]
pub struct RelayReport {
    pub sent: Result<u64, RelayError>,
    pub received: Result<u64, RelayError>,
}

impl RelayReport {
    pub fn bytes_sent(&self) -> u64 {
        transferred(&self.sent)
    }

    pub fn bytes_received(&self) -> u64 {
        transferred(&self.received)
    }
}

fn transferred(result: &Result<u64, RelayError>) -> u64 {
    match result {
        Ok(n) => *n,
        Err(e) => e.bytes,
    }
}

/// Copies bytes both ways until each direction has ended on its own, then
/// drops both sockets.
///
/// Each direction runs in its own task. A direction that ends, cleanly or
/// not, shuts down the write side of its destination and leaves the other
/// direction alone.
pub async fn relay(client: TcpStream, upstream: TcpStream) -> RelayReport {
    let (client_reader, client_writer) = client.into_split();
    let (upstream_reader, upstream_writer) = upstream.into_split();

    let out_task = tokio::spawn(pipe(
        client_reader,
        upstream_writer,
        Direction::ClientToUpstream,
    ));
    let in_task = tokio::spawn(pipe(
        upstream_reader,
        client_writer,
        Direction::UpstreamToClient,
    ));

    let (sent, received) = tokio::join!(out_task, in_task);

    RelayReport {
        sent: flatten(sent, Direction::ClientToUpstream),
        received: flatten(received, Direction::UpstreamToClient),
    }
}

async fn pipe<R>(
    mut reader: R,
    mut writer: OwnedWriteHalf,
    direction: Direction,
) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut bytes = 0u64;

    let result = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            break Err(e);
        }
        bytes += n as u64;
    };
    let _ = writer.shutdown().await;

    match result {
        Ok(()) => {
            tracing::trace!("{} finished after {} bytes", direction, bytes);
            Ok(bytes)
        }
        Err(source) => Err(RelayError {
            direction,
            bytes,
            source,
        }),
    }
}

fn flatten(
    joined: Result<Result<u64, RelayError>, tokio::task::JoinError>,
    direction: Direction,
) -> Result<u64, RelayError> {
    joined.unwrap_or_else(|e| {
        Err(RelayError {
            direction,
            bytes: 0,
            source: io::Error::other(e),
        })
    })
}
