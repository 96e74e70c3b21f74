//! The async adapter around [`Kcp`], grounded on `Session` in
//! `examples/original_source/sess.h` / `sess.cpp`: a single task owns the
//! engine exclusively (the Rust expression of the original's "single
//! io_service thread touches this kcp_" assumption) and is driven by a
//! monotonic timer plus three entry points — `send`, `recv`, `input` — each
//! re-expressed here as channel round-trips instead of raw callbacks, per
//! Design Note §9 of SPEC_FULL.md.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::engine::Kcp;
use super::error::{Error, KcpResult};

/// Internal stream-stash capacity, mirroring `stream_buf_`'s 65535-byte size
/// in the original `Session` adapter.
const STREAM_STASH_CAP: usize = 65536;

/// Per-session nodelay/window/mtu tuning, spec.md §4.2's tunables.
#[derive(Debug, Clone, Copy)]
pub struct KcpConfig {
    pub nodelay: bool,
    pub interval: u32,
    pub resend: i32,
    pub nc: bool,
    pub snd_wnd: u16,
    pub rcv_wnd: u16,
    pub mtu: usize,
}

impl Default for KcpConfig {
    fn default() -> Self {
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
}

/// Where a session's encoded segments go, and where its datagrams come from.
///
/// `Owned` is a client tunnel's dedicated, connected UDP socket (one KCP
/// session per socket). `Shared` is a server-side session multiplexed over
/// the demux socket owned by `tunnel::server::ServerDemux`: outgoing segments
/// go out through a shared sender, incoming datagrams arrive pre-routed on a
/// private channel.
pub enum Transport {
    Owned(Arc<UdpSocket>),
    Shared {
        peer: SocketAddr,
        out_tx: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
        in_rx: mpsc::UnboundedReceiver<Bytes>,
    },
}

/// `io::Write` shim handed to the engine as its output callback. Encoded
/// segments are copied into an owned `Bytes` and queued; the actor drains the
/// queue and performs the actual (async) socket send after the engine call
/// that produced them returns, honoring "must not re-enter the engine
/// synchronously".
struct ChannelOutput {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl io::Write for ChannelOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.tx.send(Bytes::copy_from_slice(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Command {
    Send(Bytes, oneshot::Sender<KcpResult<usize>>),
    Recv(usize, oneshot::Sender<KcpResult<Vec<u8>>>),
    WaitSnd(oneshot::Sender<usize>),
}

/// A cheap, cloneable handle to a running KCP session actor.
#[derive(Clone)]
pub struct KcpSession {
    conv: u32,
    cmd_tx: mpsc::UnboundedSender<Command>,
    dead_rx: watch::Receiver<bool>,
}

impl KcpSession {
    /// Spawns the actor task and returns a handle to it.
    pub fn spawn(conv: u32, config: KcpConfig, transport: Transport) -> KcpSession {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (dead_tx, dead_rx) = watch::channel(false);

        let output = ChannelOutput { tx: out_tx };
        let mut kcp = Kcp::new_stream(conv, output);
        kcp.set_nodelay(config.nodelay, config.interval as i32, config.resend, config.nc);
        kcp.set_wndsize(config.snd_wnd, config.rcv_wnd);
        let _ = kcp.set_mtu(config.mtu);

        let actor = KcpActor {
            kcp,
            snd_wnd: config.snd_wnd,
            out_rx,
            cmd_rx,
            transport,
            pending_read: None,
            pending_writes: VecDeque::new(),
            stream_stash: VecDeque::with_capacity(STREAM_STASH_CAP),
            dead_tx,
        };
        tokio::spawn(actor.run());

        KcpSession { conv, cmd_tx, dead_rx }
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    /// True once the engine has declared this conversation a dead link, or
    /// the actor task has otherwise gone away.
    pub fn is_closed(&self) -> bool {
        *self.dead_rx.borrow()
    }

    pub async fn closed(&self) {
        let mut rx = self.dead_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    pub async fn send(&self, buf: Bytes) -> KcpResult<usize> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Send(buf, tx)).is_err() {
            return Err(Error::IoError(io::Error::new(io::ErrorKind::BrokenPipe, "kcp session closed")));
        }
        rx.await
            .unwrap_or_else(|_| Err(Error::IoError(io::Error::new(io::ErrorKind::BrokenPipe, "kcp session closed"))))
    }

    pub async fn recv(&self, cap: usize) -> KcpResult<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Recv(cap, tx)).is_err() {
            return Err(Error::IoError(io::Error::new(io::ErrorKind::BrokenPipe, "kcp session closed")));
        }
        rx.await
            .unwrap_or_else(|_| Err(Error::IoError(io::Error::new(io::ErrorKind::BrokenPipe, "kcp session closed"))))
    }

    pub async fn wait_snd(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::WaitSnd(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

struct KcpActor {
    kcp: Kcp<ChannelOutput>,
    snd_wnd: u16,
    out_rx: mpsc::UnboundedReceiver<Bytes>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    transport: Transport,
    pending_read: Option<(usize, oneshot::Sender<KcpResult<Vec<u8>>>)>,
    pending_writes: VecDeque<(Bytes, oneshot::Sender<KcpResult<usize>>)>,
    stream_stash: VecDeque<u8>,
    dead_tx: watch::Sender<bool>,
}

fn now_ms() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    // Wraps every ~49 days, same as the reference `iclock()`; KCP's sequence
    // arithmetic is defined in terms of wrapping differences so this is safe.
    (SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        & 0xFFFF_FFFF) as u32
}

impl KcpActor {
    async fn run(mut self) {
        let mut recv_buf = vec![0u8; 65536];
        let mut sleep = Box::pin(tokio::time::sleep(Duration::from_millis(self.kcp.check(now_ms()) as u64)));

        loop {
            tokio::select! {
                _ = &mut sleep => {
                    let next = self.update();
                    sleep.as_mut().reset(Instant::now() + Duration::from_millis(next as u64));
                }
                datagram = recv_datagram(&mut self.transport, &mut recv_buf) => {
                    match datagram {
                        Some(data) => {
                            self.input(&data);
                        }
                        None => break,
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Send(buf, resp)) => self.handle_send(buf, resp),
                        Some(Command::Recv(cap, resp)) => self.handle_recv(cap, resp),
                        Some(Command::WaitSnd(resp)) => { let _ = resp.send(self.kcp.wait_snd()); }
                        None => break,
                    }
                }
            }

            self.drain_output().await;

            if self.kcp.is_dead_link() {
                break;
            }
        }

        self.fail_all();
        let _ = self.dead_tx.send(true);
    }

    fn input(&mut self, datagram: &[u8]) {
        if self.kcp.input(datagram).is_err() {
            return;
        }
        if self.pending_read.is_some() {
            self.try_serve_pending_read();
        }
    }

    fn handle_send(&mut self, buf: Bytes, resp: oneshot::Sender<KcpResult<usize>>) {
        if self.kcp.wait_snd() > 2 * self.snd_wnd as usize {
            self.pending_writes.push_back((buf, resp));
        } else {
            let result = self.kcp.send(&buf).map(|_| buf.len());
            let _ = resp.send(result);
        }
        let _ = self.update();
    }

    fn handle_recv(&mut self, cap: usize, resp: oneshot::Sender<KcpResult<Vec<u8>>>) {
        match self.try_satisfy_read(cap) {
            Some(result) => {
                let _ = resp.send(result);
            }
            None => {
                self.pending_read = Some((cap, resp));
            }
        }
    }

    fn try_serve_pending_read(&mut self) {
        let Some((cap, _)) = &self.pending_read else { return };
        let cap = *cap;
        if let Some(result) = self.try_satisfy_read(cap) {
            let (_, resp) = self.pending_read.take().unwrap();
            let _ = resp.send(result);
        }
    }

    fn try_satisfy_read(&mut self, cap: usize) -> Option<KcpResult<Vec<u8>>> {
        if !self.stream_stash.is_empty() {
            let n = cap.min(self.stream_stash.len());
            let data: Vec<u8> = self.stream_stash.drain(..n).collect();
            return Some(Ok(data));
        }

        let psz = match self.kcp.peeksize() {
            Ok(psz) if psz > 0 => psz,
            _ => return None,
        };

        let scratch_len = psz.max(cap).min(STREAM_STASH_CAP);
        let mut scratch = vec![0u8; scratch_len];
        match self.kcp.recv(&mut scratch) {
            Ok(n) => {
                scratch.truncate(n);
                if n > cap {
                    let tail = scratch.split_off(cap);
                    self.stream_stash.extend(tail);
                }
                Some(Ok(scratch))
            }
            Err(e) => Some(Err(e)),
        }
    }

    /// Runs one `update` pass (RTO/ack flush), serves queued writes that now
    /// fit the window, retries a pending read, and returns the delay (ms)
    /// until `update` must run again.
    fn update(&mut self) -> u32 {
        let current = now_ms();
        let _ = self.kcp.update(current);

        if self.pending_read.is_some() {
            self.try_serve_pending_read();
        }

        while self.kcp.wait_snd() < 2 * self.snd_wnd as usize {
            let Some((buf, resp)) = self.pending_writes.pop_front() else { break };
            let result = self.kcp.send(&buf).map(|_| buf.len());
            let _ = resp.send(result);
        }

        self.kcp.check(now_ms()).min(self.kcp_interval_cap())
    }

    fn kcp_interval_cap(&self) -> u32 {
        5000
    }

    async fn drain_output(&mut self) {
        while let Ok(pkt) = self.out_rx.try_recv() {
            match &self.transport {
                Transport::Owned(socket) => {
                    let _ = socket.send(&pkt).await;
                }
                Transport::Shared { peer, out_tx, .. } => {
                    let _ = out_tx.send((*peer, pkt));
                }
            }
        }
    }

    fn fail_all(&mut self) {
        if let Some((_, resp)) = self.pending_read.take() {
            let _ = resp.send(Err(Error::IoError(io::Error::new(io::ErrorKind::BrokenPipe, "kcp session destroyed"))));
        }
        while let Some((_, resp)) = self.pending_writes.pop_front() {
            let _ = resp.send(Err(Error::IoError(io::Error::new(io::ErrorKind::BrokenPipe, "kcp session destroyed"))));
        }
    }
}

async fn recv_datagram(transport: &mut Transport, scratch: &mut [u8]) -> Option<Bytes> {
    match transport {
        Transport::Owned(socket) => match socket.recv(scratch).await {
            Ok(n) => Some(Bytes::copy_from_slice(&scratch[..n])),
            Err(_) => None,
        },
        Transport::Shared { in_rx, .. } => in_rx.recv().await,
    }
}
