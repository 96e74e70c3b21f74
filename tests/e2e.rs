//! End-to-end scenarios from spec.md §8: a client and server binary wired
//! together over loopback UDP, bridging to an in-process TCP echo target.
//! Scenario scale is reduced (KiB, not MiB) so the suite completes quickly
//! while still exercising the real client/server/bridge code paths.

use std::net::SocketAddr;
use std::time::Duration;

use kcptun::config::TunnelConfig;
use kcptun::kcp::session::KcpConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

async fn free_udp_addr() -> SocketAddr {
    UdpSocket::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap()
}

async fn free_tcp_addr() -> SocketAddr {
    TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap()
}

/// Binds a TCP echo target and returns its address; the listener task runs
/// for the lifetime of the test process.
async fn spawn_echo_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    let n = match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    if sock.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

fn fast_kcp() -> KcpConfig {
    KcpConfig {
        nodelay: true,
        interval: 10,
        resend: 2,
        nc: true,
        snd_wnd: 128,
        rcv_wnd: 512,
        mtu: 1350,
    }
}

async fn spawn_tunnel_pair(conns: usize) -> (SocketAddr, SocketAddr) {
    let server_udp = free_udp_addr().await;
    let target = spawn_echo_target().await;
    let client_tcp = free_tcp_addr().await;

    let server_config = TunnelConfig {
        localaddr: server_udp,
        remoteaddr: server_udp,
        targetaddr: target,
        conns: 1,
        scavenge_ttl: None,
        keepalive: Duration::from_secs(30),
        kcp: fast_kcp(),
        dscp: None,
        sockbuf: 1024 * 1024,
    };
    let client_config = TunnelConfig {
        localaddr: client_tcp,
        remoteaddr: server_udp,
        targetaddr: server_udp,
        conns,
        scavenge_ttl: None,
        keepalive: Duration::from_secs(30),
        kcp: fast_kcp(),
        dscp: None,
        sockbuf: 1024 * 1024,
    };

    tokio::spawn(kcptun::tunnel::server::run(server_config));
    tokio::spawn(kcptun::tunnel::client::run(client_config));

    // Give both accept loops a moment to bind before dialing.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (client_tcp, server_udp)
}

async fn connect_with_retry(addr: SocketAddr) -> TcpStream {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        match TcpStream::connect(addr).await {
            Ok(s) => return s,
            Err(_) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("failed to connect to {addr}: {e}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn echo_round_trips_within_deadline() {
    let (client_addr, _server_addr) = spawn_tunnel_pair(1).await;

    let mut sock = connect_with_retry(client_addr).await;
    sock.write_all(b"hello\n").await.unwrap();

    let mut buf = [0u8; 6];
    tokio::time::timeout(Duration::from_millis(500), sock.read_exact(&mut buf))
        .await
        .expect("echo should complete within deadline")
        .unwrap();
    assert_eq!(&buf, b"hello\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn large_transfer_round_trips_with_matching_digest() {
    use sha2::{Digest, Sha256};

    let (client_addr, _server_addr) = spawn_tunnel_pair(1).await;
    let mut sock = connect_with_retry(client_addr).await;

    let payload: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
    let expected_digest = {
        let mut hasher = Sha256::new();
        hasher.update(&payload);
        hasher.finalize()
    };

    let (mut read_half, mut write_half) = sock.into_split();
    let payload_clone = payload.clone();
    let writer = tokio::spawn(async move {
        write_half.write_all(&payload_clone).await.unwrap();
    });

    let mut received = Vec::with_capacity(payload.len());
    let mut buf = vec![0u8; 16 * 1024];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while received.len() < payload.len() && tokio::time::Instant::now() < deadline {
        let n = read_half.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }
    writer.await.unwrap();

    assert_eq!(received.len(), payload.len());
    let mut hasher = Sha256::new();
    hasher.update(&received);
    assert_eq!(hasher.finalize(), expected_digest);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_connections_multiplex_over_one_tunnel() {
    let (client_addr, _server_addr) = spawn_tunnel_pair(1).await;

    let mut handles = Vec::new();
    for i in 0..64u32 {
        handles.push(tokio::spawn(async move {
            let mut sock = connect_with_retry(client_addr).await;
            let payload = vec![(i % 256) as u8; 16 * 1024];
            let (mut read_half, mut write_half) = sock.split();

            let write_fut = write_half.write_all(&payload);
            let mut received = vec![0u8; payload.len()];
            let read_fut = read_half.read_exact(&mut received);

            let (write_res, read_res) = tokio::join!(write_fut, read_fut);
            write_res.unwrap();
            read_res.unwrap();
            assert_eq!(received, payload);
        }));
    }

    for handle in handles {
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("connection should round-trip within deadline")
            .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keepalive_timeout_destroys_session_when_peer_goes_silent() {
    use kcptun::kcp::session::{KcpSession, Transport};
    use kcptun::smux::session::{Role, SmuxConfig, SmuxSession};
    use std::sync::Arc;

    // A client session talking to an address nothing listens on: UDP sends
    // always succeed locally, but no reply ever arrives, simulating a
    // partitioned peer without needing to tear down a real one.
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let nobody = free_udp_addr().await;
    socket.connect(nobody).await.unwrap();

    let kcp = KcpSession::spawn(0x1234, fast_kcp(), Transport::Owned(Arc::new(socket)));
    let (smux, _accept) = SmuxSession::spawn(
        kcp,
        SmuxConfig {
            keepalive: Duration::from_millis(50),
            role: Role::Client,
        },
    );

    assert!(!smux.is_closed());
    tokio::time::timeout(Duration::from_millis(500), smux.closed())
        .await
        .expect("session should time out within 3*keepalive + interval");
    assert!(smux.is_closed());
}
