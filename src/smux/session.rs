//! The smux session: one reader loop demultiplexing frames out of a single
//! KCP session, one writer task serializing frames back onto it, and
//! keepalive send/check timers. Grounded on `smux_sess` in
//! `examples/original_source/smux.cpp` (`do_receive_frame`/`handle_frame`,
//! `try_output`, the keepalive sender/checker pair).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;

use super::stream::{IngressState, SmuxStream};
use super::{HIGH_WATER, LOW_WATER};
use crate::codec::{Codec, Identity};
use crate::error::{TunnelError, TunnelResult};
use crate::frame::{Cmd, Frame, FrameHeader, FRAME_HEADER_LEN};
use crate::kcp::session::KcpSession;

struct StreamEntry {
    data_tx: mpsc::UnboundedSender<Bytes>,
    ingress: Arc<IngressState>,
}

/// Which side opened the session; only the client side allocates outbound
/// stream ids (odd, starting at 1), mirroring the original's
/// `nextStreamID_ += 2` convention used solely by `kcptun_client`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy)]
pub struct SmuxConfig {
    pub keepalive: Duration,
    pub role: Role,
}

/// A cheap, cloneable handle onto a running smux session.
#[derive(Clone)]
pub struct SmuxSession {
    next_id: Arc<AtomicU32>,
    egress_tx: mpsc::Sender<Frame>,
    streams: Arc<Mutex<HashMap<u32, StreamEntry>>>,
    dead_tx: Arc<watch::Sender<bool>>,
    dead_rx: watch::Receiver<bool>,
}

impl SmuxSession {
    /// Spawns the reader and writer tasks for a freshly-created KCP session
    /// and returns a handle plus the channel on which newly-accepted inbound
    /// streams (remote-initiated SYNs) are delivered.
    pub fn spawn(kcp: KcpSession, config: SmuxConfig) -> (SmuxSession, mpsc::UnboundedReceiver<SmuxStream>) {
        let (egress_tx, egress_rx) = mpsc::channel::<Frame>(256);
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let streams = Arc::new(Mutex::new(HashMap::new()));
        let (dead_tx, dead_rx) = watch::channel(false);
        let last_activity = Arc::new(AtomicU64::new(now_ms()));

        let start_id = match config.role {
            Role::Client => 1,
            Role::Server => 2,
        };

        let dead_tx = Arc::new(dead_tx);

        let session = SmuxSession {
            next_id: Arc::new(AtomicU32::new(start_id)),
            egress_tx: egress_tx.clone(),
            streams: streams.clone(),
            dead_tx: dead_tx.clone(),
            dead_rx: dead_rx.clone(),
        };

        tokio::spawn(writer_loop(kcp.clone(), egress_rx, dead_rx.clone()));
        tokio::spawn(reader_loop(
            kcp.clone(),
            streams,
            accept_tx,
            egress_tx.clone(),
            last_activity.clone(),
            dead_tx.clone(),
            dead_rx.clone(),
        ));
        tokio::spawn(keepalive_loop(kcp, egress_tx, last_activity, config.keepalive, dead_tx));

        (session, accept_rx)
    }

    pub fn is_closed(&self) -> bool {
        *self.dead_rx.borrow()
    }

    /// Forces this session closed, the scavenger's and a fatal-frame's
    /// external equivalent of the keepalive timeout / KCP dead-link paths.
    pub fn force_close(&self) {
        let _ = self.dead_tx.send(true);
    }

    pub async fn closed(&self) {
        let mut rx = self.dead_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    /// Opens a new outbound stream. Only meaningful from the client role;
    /// the server side only ever accepts.
    pub async fn connect(&self) -> TunnelResult<SmuxStream> {
        let stream_id = self.next_id.fetch_add(2, Ordering::Relaxed);
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let ingress = IngressState::new();
        self.streams.lock().await.insert(
            stream_id,
            StreamEntry {
                data_tx,
                ingress: ingress.clone(),
            },
        );

        self.egress_tx
            .send(Frame::syn(stream_id))
            .await
            .map_err(|_| TunnelError::Destroyed("smux session"))?;

        Ok(SmuxStream::new(stream_id, data_rx, ingress, self.egress_tx.clone()))
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

async fn writer_loop(kcp: KcpSession, mut egress_rx: mpsc::Receiver<Frame>, mut dead_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = dead_rx.changed() => {
                if *dead_rx.borrow() {
                    return;
                }
            }
            frame = egress_rx.recv() => {
                let Some(mut frame) = frame else { return };
                frame.payload = Identity.encode(frame.payload);
                let encoded = frame.encode().freeze();
                if kcp.send(encoded).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn keepalive_loop(
    kcp: KcpSession,
    egress_tx: mpsc::Sender<Frame>,
    last_activity: Arc<AtomicU64>,
    keepalive: Duration,
    dead_tx: Arc<watch::Sender<bool>>,
) {
    let mut ticker = tokio::time::interval(keepalive);
    let timeout_ms = keepalive.as_millis() as u64 * 3;
    let mut dead_rx = dead_tx.subscribe();
    loop {
        tokio::select! {
            _ = dead_rx.changed() => {
                if *dead_rx.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                if kcp.is_closed() {
                    let _ = dead_tx.send(true);
                    return;
                }
                let _ = egress_tx.try_send(Frame::nop());
                let idle = now_ms().saturating_sub(last_activity.load(Ordering::Acquire));
                if idle > timeout_ms {
                    let _ = dead_tx.send(true);
                    return;
                }
            }
        }
    }
}

async fn reader_loop(
    kcp: KcpSession,
    streams: Arc<Mutex<HashMap<u32, StreamEntry>>>,
    accept_tx: mpsc::UnboundedSender<SmuxStream>,
    egress_tx: mpsc::Sender<Frame>,
    last_activity: Arc<AtomicU64>,
    dead_tx: Arc<watch::Sender<bool>>,
    mut dead_rx: watch::Receiver<bool>,
) {
    let mut acc = BytesMut::new();

    loop {
        if kcp.is_closed() || *dead_rx.borrow() {
            break;
        }

        // Drain every complete frame already buffered before asking for more
        // bytes, so a single recv() that happens to land several frames at
        // once doesn't stall behind an unnecessary extra read.
        while acc.len() >= FRAME_HEADER_LEN {
            let mut header_bytes = [0u8; FRAME_HEADER_LEN];
            header_bytes.copy_from_slice(&acc[..FRAME_HEADER_LEN]);
            let header = match FrameHeader::decode(&header_bytes) {
                Ok(h) => h,
                Err(_) => {
                    let _ = dead_tx.send(true);
                    return;
                }
            };
            let total = FRAME_HEADER_LEN + header.length as usize;
            if acc.len() < total {
                break;
            }

            let payload = acc[FRAME_HEADER_LEN..total].to_vec();
            let _ = acc.split_to(total);

            last_activity.store(now_ms(), Ordering::Release);

            let payload = Identity.decode(Bytes::from(payload));
            dispatch(header, payload, &streams, &accept_tx, &egress_tx).await;
        }

        tokio::select! {
            _ = dead_rx.changed() => {
                if *dead_rx.borrow() {
                    break;
                }
            }
            result = kcp.recv(65536) => match result {
                Ok(chunk) if !chunk.is_empty() => acc.extend_from_slice(&chunk),
                Ok(_) => {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                Err(_) => break,
            }
        }
    }

    let _ = dead_tx.send(true);
}

async fn dispatch(
    header: FrameHeader,
    payload: Bytes,
    streams: &Arc<Mutex<HashMap<u32, StreamEntry>>>,
    accept_tx: &mpsc::UnboundedSender<SmuxStream>,
    egress_tx: &mpsc::Sender<Frame>,
) {
    match header.cmd {
        Cmd::Nop => {}
        Cmd::Syn => {
            let (data_tx, data_rx) = mpsc::unbounded_channel();
            let ingress = IngressState::new();
            streams.lock().await.insert(
                header.stream_id,
                StreamEntry {
                    data_tx,
                    ingress: ingress.clone(),
                },
            );
            let stream = SmuxStream::new(header.stream_id, data_rx, ingress, egress_tx.clone());
            let _ = accept_tx.send(stream);
        }
        Cmd::Fin => {
            streams.lock().await.remove(&header.stream_id);
        }
        Cmd::Psh => {
            let ingress = {
                let map = streams.lock().await;
                match map.get(&header.stream_id) {
                    Some(entry) => {
                        let _ = entry.data_tx.send(payload.clone());
                        Some(entry.ingress.clone())
                    }
                    None => None,
                }
            };

            if let Some(ingress) = ingress {
                ingress.buffered.fetch_add(payload.len(), Ordering::AcqRel);
                wait_for_drain(&ingress).await;
            }
        }
    }
}

/// Applies the back-pressure gate: once a stream's undelivered byte count
/// crosses [`HIGH_WATER`], the reader loop stalls here instead of
/// dispatching the next frame until the stream's consumer drains it back
/// down to [`LOW_WATER`].
async fn wait_for_drain(ingress: &Arc<IngressState>) {
    if ingress.buffered.load(Ordering::Acquire) < HIGH_WATER {
        return;
    }
    loop {
        ingress.drained.notified().await;
        if ingress.buffered.load(Ordering::Acquire) <= LOW_WATER {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kcp::session::{KcpConfig, Transport};
    use std::net::SocketAddr;
    use tokio::net::UdpSocket;

    async fn paired_sessions() -> (KcpSession, KcpSession) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr: SocketAddr = a.local_addr().unwrap();
        let b_addr: SocketAddr = b.local_addr().unwrap();
        a.connect(b_addr).await.unwrap();
        b.connect(a_addr).await.unwrap();
        let cfg = KcpConfig::default();
        let client = KcpSession::spawn(0xF00D, cfg, Transport::Owned(Arc::new(a)));
        let server = KcpSession::spawn(0xF00D, cfg, Transport::Owned(Arc::new(b)));
        (client, server)
    }

    #[tokio::test]
    async fn client_connect_is_observed_as_accept_on_server() {
        let (client_kcp, server_kcp) = paired_sessions().await;
        let (client, _client_accept) = SmuxSession::spawn(
            client_kcp,
            SmuxConfig {
                keepalive: Duration::from_secs(30),
                role: Role::Client,
            },
        );
        let (_server, mut server_accept) = SmuxSession::spawn(
            server_kcp,
            SmuxConfig {
                keepalive: Duration::from_secs(30),
                role: Role::Server,
            },
        );

        let mut stream = client.connect().await.unwrap();
        assert_eq!(stream.stream_id(), 1);

        use tokio::io::AsyncWriteExt;
        stream.write_all(b"ping").await.unwrap();

        let accepted = tokio::time::timeout(Duration::from_secs(2), server_accept.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(accepted.stream_id(), 1);
    }

    #[tokio::test]
    async fn force_close_marks_session_closed_and_is_observable() {
        let (client_kcp, _server_kcp) = paired_sessions().await;
        let (client, _accept) = SmuxSession::spawn(
            client_kcp,
            SmuxConfig {
                keepalive: Duration::from_secs(30),
                role: Role::Client,
            },
        );

        assert!(!client.is_closed());
        client.force_close();
        tokio::time::timeout(Duration::from_secs(1), client.closed()).await.unwrap();
        assert!(client.is_closed());
    }
}
