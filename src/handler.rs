use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::domain_filter::DomainFilter;
use crate::error::ConnectionError;
use crate::fragment::{fragment, is_client_hello, TLS_RECORD_HEADER_LEN};
use crate::relay::{relay, RelayReport};
use crate::request::TunnelRequest;
use crate::stats::Stats;

// ============================================================================
// CONSTANTS
// ============================================================================

pub const HTTPS_PORT: &str = "443";
const READ_BUFFER_SIZE: usize = 1500;

// LF only, clients have always accepted it.
pub const RESPONSE_TUNNEL_OK: &[u8] = b"HTTP/1.1 200 OK\n\n";

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Immutable per-process settings, cloned into every connection task.
#[derive(Clone)]
pub struct ProxyConfig {
    pub filter: Arc<DomainFilter>,
    pub stats: Arc<Stats>,
    /// Fragment the intercepted read only if it looks like a ClientHello.
    pub verify_client_hello: bool,
}

// ============================================================================
// UPSTREAM DIALING
// ============================================================================

pub trait Dialer: Send + Sync {
    fn dial(&self, addr: &str) -> impl Future<Output = io::Result<TcpStream>> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer {
    pub connect_timeout: Option<Duration>,
}

impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> io::Result<TcpStream> {
        let stream = match self.connect_timeout {
            Some(limit) => timeout(limit, TcpStream::connect(addr))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??,
            None => TcpStream::connect(addr).await?,
        };
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

// ============================================================================
// CONNECTION HANDLER
// ============================================================================

#[derive(Debug)]
pub enum Outcome {
    /// Block list hit on port 443; nothing was sent or dialed.
    Blocked,
    Relayed { fragmented: bool, report: RelayReport },
}

/// Runs one client connection to completion.
///
/// Every error is terminal and surfaces to the client only as a closed
/// socket. The tunnel confirmation goes out before the upstream is dialed,
/// so a dial failure closes a connection that was already told `200 OK`.
pub async fn handle_connection<D: Dialer>(
    mut client: TcpStream,
    peer: SocketAddr,
    config: &ProxyConfig,
    dialer: &D,
) -> Result<Outcome, ConnectionError> {
    let _ = client.set_nodelay(true);

    let mut buf = [0u8; READ_BUFFER_SIZE];
    let n = client.read(&mut buf).await?;
    debug!("Read {} bytes from {}", n, peer);

    let request = TunnelRequest::parse(&buf[..n])?;
    let is_https = request.port == HTTPS_PORT;

    if is_https && config.filter.is_blocked(&request.host) {
        config.stats.blocked.fetch_add(1, Ordering::Relaxed);
        info!("Blocked: {}", request.host);
        return Ok(Outcome::Blocked);
    }

    client.write_all(RESPONSE_TUNNEL_OK).await?;

    let addr = request.address();
    let mut upstream = dialer
        .dial(&addr)
        .await
        .map_err(|source| ConnectionError::UpstreamDial { addr, source })?;

    let fragmented = if is_https && config.filter.should_fragment(&request.host) {
        intercept_first_record(&mut client, &mut upstream, config).await?
    } else {
        false
    };

    debug!("Tunnel {} -> {} (fragmented: {})", peer, request.address(), fragmented);

    let report = relay(client, upstream).await;

    config
        .stats
        .add_traffic(report.bytes_sent(), report.bytes_received());

    for err in [report.sent.as_ref().err(), report.received.as_ref().err()]
        .into_iter()
        .flatten()
    {
        if !crate::error::is_expected_error(&err.source) {
            debug!("Relay error for {}: {}", request.host, err);
        }
    }

    Ok(Outcome::Relayed { fragmented, report })
}

/// Reads once from the client and forwards that read as fragmented records.
///
/// A read of at most a record header is dropped. A failed read is logged and
/// the tunnel carries on without interception.
async fn intercept_first_record(
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    config: &ProxyConfig,
) -> Result<bool, ConnectionError> {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let n = match client.read(&mut buf).await {
        Ok(n) => n,
        Err(e) => {
            debug!("Failed to read first record: {}", e);
            return Ok(false);
        }
    };

    if n <= TLS_RECORD_HEADER_LEN {
        debug!("Dropped {} byte first read", n);
        return Ok(false);
    }

    let data = &buf[..n];

    if config.verify_client_hello && !is_client_hello(data) {
        debug!("First read is not a ClientHello, forwarding as is");
        upstream.write_all(data).await?;
        return Ok(false);
    }

    upstream
        .write_all(&fragment(&data[TLS_RECORD_HEADER_LEN..]))
        .await?;
    config.stats.fragmented.fetch_add(1, Ordering::Relaxed);

    Ok(true)
}

// ============================================================================
// TESTS
// ============================================================================
