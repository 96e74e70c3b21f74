//! The client-side tunnel pool: a fixed-size table of lazily-dialed
//! KCP/smux tunnel pairs, a random slot chooser, and a one-shot scavenge
//! timer per tunnel. Grounded on `kcptun_client::locals_`,
//! `kcptun_client::async_choose_local` and `Local::run_scavenger` in
//! `examples/original_source/kcptun_client.cpp` / `local.cpp`: the original
//! schedules a single `scavengettl`-second timer per dialed tunnel (gated on
//! `FLAGS_autoexpire`/`FLAGS_scavengettl` by this crate's [`TunnelConfig`])
//! that unconditionally destroys the smux session, rather than periodically
//! sweeping for idle slots.

use std::net::SocketAddr;
use std::sync::Arc;

use rand::Rng;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex;

use crate::config::TunnelConfig;
use crate::error::TunnelResult;
use crate::kcp::session::{KcpSession, Transport};
use crate::smux::session::{Role, SmuxConfig, SmuxSession};
use crate::smux::SmuxStream;

/// One dialed KCP/smux pair, kept alive for as long as the pool (or an
/// in-flight caller) holds a strong reference to it.
struct Tunnel {
    smux: SmuxSession,
}

impl Tunnel {
    async fn dial(remote: SocketAddr, config: &TunnelConfig) -> TunnelResult<Arc<Tunnel>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(remote).await?;

        apply_sockbuf(&socket, config.sockbuf);
        if let Some(dscp) = config.dscp {
            apply_dscp(&socket, dscp);
        }

        let conv: u32 = rand::thread_rng().gen();
        let kcp = KcpSession::spawn(conv, config.kcp, Transport::Owned(Arc::new(socket)));
        let (smux, _accept_rx) = SmuxSession::spawn(
            kcp,
            SmuxConfig {
                keepalive: config.keepalive,
                role: Role::Client,
            },
        );

        if let Some(ttl) = config.scavenge_ttl {
            schedule_scavenge(smux.clone(), ttl);
        }

        Ok(Arc::new(Tunnel { smux }))
    }
}

/// Spawns the one-shot timer that retires a tunnel `ttl` after it was
/// dialed, forcing the pool to redial on next use. Mirrors
/// `Local::run_scavenger`'s `async_wait` on a single `high_resolution_timer`.
fn schedule_scavenge(smux: SmuxSession, ttl: std::time::Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        smux.force_close();
    });
}

/// A fixed-size table of lazily-populated tunnel slots, chosen at random per
/// new local connection so load spreads across the pool instead of pinning
/// every stream to a single KCP conversation.
pub struct TunnelPool {
    slots: Mutex<Vec<Option<Arc<Tunnel>>>>,
    remote: SocketAddr,
    config: TunnelConfig,
}

impl TunnelPool {
    pub fn new(config: TunnelConfig) -> Arc<TunnelPool> {
        let remote = config.remoteaddr;
        let n = config.conns;
        Arc::new(TunnelPool {
            slots: Mutex::new((0..n).map(|_| None).collect()),
            remote,
            config,
        })
    }

    async fn choose(&self) -> TunnelResult<Arc<Tunnel>> {
        let idx = {
            let slots = self.slots.lock().await;
            rand::thread_rng().gen_range(0..slots.len())
        };

        let mut slots = self.slots.lock().await;
        if let Some(tunnel) = &slots[idx] {
            if !tunnel.smux.is_closed() {
                return Ok(tunnel.clone());
            }
        }

        let tunnel = Tunnel::dial(self.remote, &self.config).await?;
        slots[idx] = Some(tunnel.clone());
        Ok(tunnel)
    }

    async fn open_stream(&self) -> TunnelResult<SmuxStream> {
        let tunnel = self.choose().await?;
        tunnel.smux.connect().await
    }
}

fn apply_dscp(socket: &UdpSocket, dscp: u32) {
    let sock2 = socket2::SockRef::from(socket);
    // DSCP occupies the top 6 bits of the IP TOS byte; best-effort only, a
    // failure here (unsupported platform or permission) is not fatal.
    if let Err(err) = sock2.set_tos((dscp << 2) as u32) {
        log::warn!("failed to set DSCP {dscp} on client tunnel socket: {err}");
    }
}

fn apply_sockbuf(socket: &UdpSocket, bytes: usize) {
    let sock2 = socket2::SockRef::from(socket);
    if let Err(err) = sock2.set_recv_buffer_size(bytes) {
        log::warn!("failed to set recv buffer size {bytes} on client tunnel socket: {err}");
    }
    if let Err(err) = sock2.set_send_buffer_size(bytes) {
        log::warn!("failed to set send buffer size {bytes} on client tunnel socket: {err}");
    }
}

/// Accepts local TCP connections and bridges each to a fresh smux stream
/// picked from the pool, the client half of `kcptun_client`'s accept loop.
pub async fn run(config: TunnelConfig) -> TunnelResult<()> {
    let listener = TcpListener::bind(config.localaddr).await?;
    log::info!("kcptun client listening on {}", config.localaddr);
    let pool = TunnelPool::new(config);

    loop {
        let (tcp, peer) = listener.accept().await?;
        let pool = pool.clone();
        tokio::spawn(async move {
            match pool.open_stream().await {
                Ok(stream) => {
                    log::debug!("bridging {peer} to smux stream {}", stream.stream_id());
                    crate::bridge::run(tcp, stream).await;
                }
                Err(err) => log::warn!("failed to open tunnel stream for {peer}: {err}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(remote: SocketAddr, scavenge_ttl: Option<Duration>) -> TunnelConfig {
        TunnelConfig {
            localaddr: "127.0.0.1:0".parse().unwrap(),
            remoteaddr: remote,
            targetaddr: remote,
            conns: 1,
            scavenge_ttl,
            keepalive: Duration::from_secs(30),
            kcp: crate::kcp::session::KcpConfig::default(),
            dscp: None,
            sockbuf: 4 * 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn scheduled_scavenge_forces_redial_on_next_choose() {
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let config = test_config(remote, Some(Duration::from_millis(20)));
        let pool = TunnelPool::new(config);

        let first = pool.choose().await.unwrap();
        let first_conv = first.smux.clone();
        drop(first);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(first_conv.is_closed());

        let second = pool.choose().await.unwrap();
        assert!(!second.smux.is_closed());
    }

    #[tokio::test]
    async fn disabled_scavenge_ttl_keeps_tunnel_around() {
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let config = test_config(remote, None);
        let pool = TunnelPool::new(config);

        let first = pool.choose().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!first.smux.is_closed());
    }
}
