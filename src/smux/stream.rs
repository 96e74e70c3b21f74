//! A single multiplexed byte stream riding on a [`super::session::SmuxSession`].
//!
//! Ingress is delivered by the session's reader loop through an unbounded
//! channel paired with a shared byte counter (the session consults the
//! counter to apply back-pressure, see [`super::HIGH_WATER`]); egress goes
//! through a bounded channel shared by every stream on the session, giving
//! the single serializing output queue described in spec.md §4.4.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::frame::Frame;

type ReservePermitFut = Pin<Box<dyn Future<Output = Result<mpsc::OwnedPermit<Frame>, mpsc::error::SendError<()>>> + Send>>;

/// Ingress-side bookkeeping shared with the owning session's reader loop.
pub(crate) struct IngressState {
    pub buffered: AtomicUsize,
    pub drained: Notify,
}

impl IngressState {
    pub fn new() -> Arc<IngressState> {
        Arc::new(IngressState {
            buffered: AtomicUsize::new(0),
            drained: Notify::new(),
        })
    }
}

pub struct SmuxStream {
    stream_id: u32,
    data_rx: mpsc::UnboundedReceiver<Bytes>,
    read_leftover: Bytes,
    ingress: Arc<IngressState>,
    write_tx: mpsc::Sender<Frame>,
    permit_fut: Option<ReservePermitFut>,
    eof: bool,
    local_shutdown: bool,
}

impl SmuxStream {
    pub(crate) fn new(
        stream_id: u32,
        data_rx: mpsc::UnboundedReceiver<Bytes>,
        ingress: Arc<IngressState>,
        write_tx: mpsc::Sender<Frame>,
    ) -> SmuxStream {
        SmuxStream {
            stream_id,
            data_rx,
            read_leftover: Bytes::new(),
            ingress,
            write_tx,
            permit_fut: None,
            eof: false,
            local_shutdown: false,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }
}

impl AsyncRead for SmuxStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if !self.read_leftover.is_empty() {
            let n = self.read_leftover.len().min(buf.remaining());
            buf.put_slice(&self.read_leftover[..n]);
            self.read_leftover = self.read_leftover.split_off(n);
            return Poll::Ready(Ok(()));
        }

        if self.eof {
            return Poll::Ready(Ok(()));
        }

        match self.data_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                self.ingress.buffered.fetch_sub(chunk.len(), Ordering::AcqRel);
                self.ingress.drained.notify_one();

                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.read_leftover = chunk.slice(n..);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => {
                self.eof = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for SmuxStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        loop {
            if let Some(fut) = self.permit_fut.as_mut() {
                match fut.as_mut().poll(cx) {
                    Poll::Ready(Ok(permit)) => {
                        self.permit_fut = None;
                        let n = buf.len().min(crate::frame::MAX_FRAME_PAYLOAD);
                        let frame = Frame::psh(self.stream_id, Bytes::copy_from_slice(&buf[..n]))
                            .expect("length clamped to MAX_FRAME_PAYLOAD above");
                        permit.send(frame);
                        return Poll::Ready(Ok(n));
                    }
                    Poll::Ready(Err(_)) => {
                        return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "smux session closed")));
                    }
                    Poll::Pending => return Poll::Pending,
                }
            } else {
                let tx = self.write_tx.clone();
                self.permit_fut = Some(Box::pin(async move { tx.reserve_owned().await }));
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.local_shutdown {
            self.local_shutdown = true;
            let _ = self.write_tx.try_send(Frame::fin(self.stream_id));
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for SmuxStream {
    fn drop(&mut self) {
        if !self.local_shutdown {
            let _ = self.write_tx.try_send(Frame::fin(self.stream_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn read_delivers_chunks_and_updates_ingress_counter() {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (write_tx, _write_rx) = mpsc::channel(8);
        let ingress = IngressState::new();
        ingress.buffered.fetch_add(5, Ordering::AcqRel);
        data_tx.send(Bytes::from_static(b"hello")).unwrap();

        let mut stream = SmuxStream::new(1, data_rx, ingress.clone(), write_tx);
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(ingress.buffered.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn drop_without_shutdown_sends_fin() {
        let (_data_tx, data_rx) = mpsc::unbounded_channel::<Bytes>();
        let (write_tx, mut write_rx) = mpsc::channel(8);
        let ingress = IngressState::new();
        let stream = SmuxStream::new(3, data_rx, ingress, write_tx);
        drop(stream);
        let frame = write_rx.recv().await.unwrap();
        assert_eq!(frame.stream_id, 3);
        assert_eq!(frame.cmd, crate::frame::Cmd::Fin);
    }

    #[tokio::test]
    async fn closed_channel_yields_eof() {
        let (data_tx, data_rx) = mpsc::unbounded_channel::<Bytes>();
        let (write_tx, _write_rx) = mpsc::channel(8);
        drop(data_tx);
        let mut stream = SmuxStream::new(5, data_rx, IngressState::new(), write_tx);
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
