//! Opaque bidirectional byte relay between a client and its upstream.

use n0_error::{Result, StackResultExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::trace;

/// Bidirectionally forward data between a client reader/writer pair and an
/// upstream reader/writer pair until both directions reach EOF.
///
/// Each direction shuts down its write side once its copy finishes, so the
/// peer observes EOF rather than an abort. Returns bytes copied
/// client-to-upstream and upstream-to-client.
pub(crate) async fn forward_bidi(
    client_recv: &mut (impl AsyncRead + Send + Unpin),
    client_send: &mut (impl AsyncWrite + Send + Unpin),
    upstream_recv: &mut (impl AsyncRead + Send + Unpin),
    upstream_send: &mut (impl AsyncWrite + Send + Unpin),
) -> Result<(u64, u64)> {
    let start = Instant::now();
    let (r1, r2) = tokio::join!(
        async {
            let res = tokio::io::copy(client_recv, upstream_send).await;
            upstream_send.shutdown().await.ok();
            trace!(?res, elapsed=?start.elapsed(), "relay client-to-upstream finished");
            res
        },
        async {
            let res = tokio::io::copy(upstream_recv, client_send).await;
            client_send.shutdown().await.ok();
            trace!(?res, elapsed=?start.elapsed(), "relay upstream-to-client finished");
            res
        }
    );
    let r1 = r1.context("failed to copy client-to-upstream")?;
    let r2 = r2.context("failed to copy upstream-to-client")?;
    Ok((r1, r2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn relays_both_directions_until_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // echo server standing in for the upstream
        let echo = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                sock.write_all(&buf[..n]).await.unwrap();
            }
        });

        let upstream = TcpStream::connect(addr).await.unwrap();
        let (mut up_recv, mut up_send) = upstream.into_split();

        let (client, server) = tokio::io::duplex(64);
        let (mut srv_recv, mut srv_send) = tokio::io::split(server);

        let relay = tokio::spawn(async move {
            forward_bidi(&mut srv_recv, &mut srv_send, &mut up_recv, &mut up_send)
                .await
                .unwrap()
        });

        let (mut client_recv, mut client_send) = tokio::io::split(client);
        client_send.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client_recv.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        client_send.shutdown().await.unwrap();
        let (up_bytes, down_bytes) = relay.await.unwrap();
        assert_eq!(up_bytes, 4);
        assert_eq!(down_bytes, 4);
        echo.await.unwrap();
    }
}
