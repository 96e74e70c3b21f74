//! The server-side demultiplexer: a single shared UDP socket, a
//! source-endpoint-keyed table of live KCP sessions, and per-accepted-stream
//! dialing of the local TCP target. Grounded on `kcptun_server::servers_`
//! (keyed by UDP endpoint, conv learned from the first datagram) and
//! `Server` in `examples/original_source/kcptun_server.cpp` / `server.cpp`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};

use crate::config::TunnelConfig;
use crate::error::TunnelResult;
use crate::kcp::session::{KcpSession, Transport};
use crate::smux::session::{Role, SmuxConfig, SmuxSession};

type PeerTable = Arc<Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Bytes>>>>;

/// Runs the server: binds the shared UDP socket, demuxes inbound datagrams
/// by source address, and for every smux stream a peer opens, dials
/// `config.targetaddr` and bridges it.
pub async fn run(config: TunnelConfig) -> TunnelResult<()> {
    let socket = Arc::new(UdpSocket::bind(config.localaddr).await?);
    log::info!("kcptun server listening on {}", config.localaddr);

    {
        let sock2 = socket2::SockRef::from(&*socket);
        if let Err(err) = sock2.set_recv_buffer_size(config.sockbuf) {
            log::warn!("failed to set recv buffer size {} on server socket: {err}", config.sockbuf);
        }
        if let Err(err) = sock2.set_send_buffer_size(config.sockbuf) {
            log::warn!("failed to set send buffer size {} on server socket: {err}", config.sockbuf);
        }
    }

    if let Some(dscp) = config.dscp {
        let sock2 = socket2::SockRef::from(&*socket);
        if let Err(err) = sock2.set_tos((dscp << 2) as u32) {
            log::warn!("failed to set DSCP {dscp} on server socket: {err}");
        }
    }

    let (out_tx, out_rx) = mpsc::unbounded_channel::<(SocketAddr, Bytes)>();
    tokio::spawn(writer_task(socket.clone(), out_rx));

    let peers: PeerTable = Arc::new(Mutex::new(HashMap::new()));
    let mut recv_buf = vec![0u8; 65536];

    loop {
        let (n, peer) = socket.recv_from(&mut recv_buf).await?;
        if n < crate::kcp::KCP_OVERHEAD {
            // Too short to carry even one segment header (and thus a conv);
            // get_conv() requires a full header's worth of bytes.
            continue;
        }
        let datagram = Bytes::copy_from_slice(&recv_buf[..n]);

        let existing = {
            let table = peers.lock().await;
            table.get(&peer).cloned()
        };

        match existing {
            Some(in_tx) => {
                let _ = in_tx.send(datagram);
            }
            None => {
                let conv = crate::kcp::get_conv(&datagram);
                let (in_tx, in_rx) = mpsc::unbounded_channel();
                peers.lock().await.insert(peer, in_tx.clone());
                let _ = in_tx.send(datagram);

                spawn_session(conv, peer, in_rx, out_tx.clone(), peers.clone(), config.clone());
            }
        }
    }
}

async fn writer_task(socket: Arc<UdpSocket>, mut out_rx: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>) {
    while let Some((peer, pkt)) = out_rx.recv().await {
        let _ = socket.send_to(&pkt, peer).await;
    }
}

fn spawn_session(
    conv: u32,
    peer: SocketAddr,
    in_rx: mpsc::UnboundedReceiver<Bytes>,
    out_tx: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    peers: PeerTable,
    config: TunnelConfig,
) {
    tokio::spawn(async move {
        let kcp = KcpSession::spawn(conv, config.kcp, Transport::Shared { peer, out_tx, in_rx });
        let (smux, mut accept_rx) = SmuxSession::spawn(
            kcp.clone(),
            SmuxConfig {
                keepalive: config.keepalive,
                role: Role::Server,
            },
        );

        while let Some(stream) = accept_rx.recv().await {
            let target = config.targetaddr;
            tokio::spawn(async move {
                match TcpStream::connect(target).await {
                    Ok(tcp) => crate::bridge::run(tcp, stream).await,
                    Err(err) => log::warn!("failed to dial local target {target}: {err}"),
                }
            });
        }

        smux.closed().await;
        peers.lock().await.remove(&peer);
        log::debug!("server session for {peer} (conv {conv:#x}) torn down");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_is_read_from_first_four_bytes_little_endian() {
        // get_conv() requires a full segment header's worth of bytes.
        let mut datagram = vec![0u8; crate::kcp::KCP_OVERHEAD];
        datagram[..4].copy_from_slice(&[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(crate::kcp::get_conv(&datagram), 0x1234_5678);
    }
}
