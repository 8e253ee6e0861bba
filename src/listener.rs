use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::ConnectionError;
use crate::handler::{handle_connection, Dialer, Outcome, ProxyConfig};

const LISTEN_BACKLOG: i32 = 1024;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

/// Accepts connections until `shutdown` resolves, running each one in its
/// own task. Accept errors are logged and do not stop the loop.
pub async fn serve<D, S>(listener: TcpListener, config: ProxyConfig, dialer: Arc<D>, shutdown: S)
where
    D: Dialer + 'static,
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down listener");
                break;
            }
            res = listener.accept() => {
                let (stream, peer) = match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                };

                let config = config.clone();
                let dialer = dialer.clone();

                config.stats.total.fetch_add(1, Ordering::Relaxed);
                config.stats.active.fetch_add(1, Ordering::Relaxed);

                tokio::spawn(async move {
                    match handle_connection(stream, peer, &config, &*dialer).await {
                        Ok(Outcome::Blocked) => {}
                        Ok(Outcome::Relayed { fragmented, report }) => {
                            debug!(
                                "Closed tunnel from {}: sent={} received={} fragmented={}",
                                peer,
                                report.bytes_sent(),
                                report.bytes_received(),
                                fragmented
                            );
                        }
                        Err(ConnectionError::NotATunnelRequest) => {
                            debug!("Ignoring non-CONNECT request from {}", peer);
                        }
                        Err(e) => {
                            debug!("Connection error from {}: {}", peer, e);
                            config.stats.failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }

                    config.stats.active.fetch_sub(1, Ordering::Relaxed);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::{test_config, RedirectDialer};
    use crate::handler::RESPONSE_TUNNEL_OK;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_tcp_listener_binding() {
        let listener = bind("127.0.0.1:0".parse().unwrap());
        assert!(listener.is_ok());
    }

    #[tokio::test]
    async fn test_serve_dispatches_and_stops() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dialer = Arc::new(RedirectDialer::to(upstream.local_addr().unwrap()));
        let config = test_config(&[], &[]);
        let stats = config.stats.clone();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, config, dialer.clone(), async move {
            let _ = stop_rx.await;
        }));

        // a rejected connection does not stop the loop
        let mut rejected = TcpStream::connect(addr).await.unwrap();
        rejected.write_all(b"HEAD / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut received = Vec::new();
        rejected.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"CONNECT example.com:8443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut ok = [0u8; RESPONSE_TUNNEL_OK.len()];
        client.read_exact(&mut ok).await.unwrap();
        assert_eq!(&ok, RESPONSE_TUNNEL_OK);

        let (mut remote, _) = upstream.accept().await.unwrap();
        remote.write_all(b"pong").await.unwrap();
        let mut pong = [0u8; 4];
        client.read_exact(&mut pong).await.unwrap();
        assert_eq!(&pong, b"pong");

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stats.total.load(Ordering::Relaxed), 2);
        assert_eq!(*dialer.dialed.lock().unwrap(), vec!["example.com:8443".to_owned()]);
    }
}
