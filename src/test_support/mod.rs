pub(crate) mod socket_guard;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Serves a single response announcing `total` body bytes, writes `sent` of
/// them, signals, then keeps the connection open without sending more.
pub(crate) async fn stalled_body_server(
    total: usize,
    sent: usize,
) -> Option<(String, oneshot::Receiver<()>)> {
    if socket_guard::should_skip_socket_bound_test() {
        return None;
    }
    let listener = TcpListener::bind("127.0.0.1:0").await.ok()?;
    let addr = listener.local_addr().ok()?;
    let (signal, written) = oneshot::channel();
    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let mut request = Vec::new();
        let mut buf = [0_u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => request.extend_from_slice(&buf[..n]),
            }
        }
        let head = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/octet-stream\r\ncontent-length: {total}\r\n\r\n"
        );
        if socket.write_all(head.as_bytes()).await.is_err()
            || socket.write_all(&vec![b'x'; sent]).await.is_err()
        {
            return;
        }
        let _ = socket.flush().await;
        let _ = signal.send(());
        tokio::time::sleep(Duration::from_secs(30)).await;
    });
    Some((format!("http://{addr}"), written))
}
