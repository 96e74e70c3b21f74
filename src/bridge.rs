//! Bridges a local TCP connection to a multiplexed smux stream with a pair
//! of half-duplex byte-pumps. Grounded on `do_pipe1`/`do_pipe2` in
//! `examples/original_source/kcptun_client.cpp` / `server.cpp`: each
//! direction is an independent read-then-write loop over a fixed buffer,
//! and either side failing tears down both.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::smux::SmuxStream;

/// Matches the original pipe buffer size; large enough to amortize syscalls
/// without holding much memory per bridged connection.
const PIPE_BUF: usize = 4096;

/// Pumps bytes in both directions between `tcp` and `stream` until either
/// side closes or errors, then tears both down.
pub async fn run(tcp: TcpStream, stream: SmuxStream) {
    let (tcp_r, tcp_w) = tcp.into_split();
    let (stream_r, stream_w) = tokio::io::split(stream);

    tokio::select! {
        _ = pump(tcp_r, stream_w) => {}
        _ = pump(stream_r, tcp_w) => {}
    }
}

async fn pump<R, W>(mut reader: R, mut writer: W)
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PIPE_BUF];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn pump_copies_bytes_until_reader_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(&buf[..n]).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut out = [0u8; 16];
        let n = client.read(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"ping");

        server.await.unwrap();
    }
}
