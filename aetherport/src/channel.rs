//! Adapts one data channel into a reliable bidirectional byte stream.
//!
//! Reads are buffered so coalesced datagram records drain without blocking the
//! transport. Writes respect the channel's buffered amount: past the
//! high-water mark the writer suspends until the transport signals the
//! low-water threshold. Exactly one writer is supported per channel.

use std::{
    future::Future,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::{oneshot, Notify},
    time::{Instant, Sleep},
};
use webrtc::data::data_channel::DataChannel;
use webrtc::data_channel::{data_channel_state::RTCDataChannelState, RTCDataChannel};

use crate::Error;

/// Read buffer size; large enough to absorb a full coalesced SCTP message.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Suspend writes once this much is queued in the transport.
pub const DEFAULT_HIGH_WATER: usize = 1024 * 1024;

/// Resume writes once the transport's queue drains below this.
pub const DEFAULT_LOW_WATER: usize = 512 * 1024;

/// The raw operations a channel transport must provide.
pub trait ChannelIo: Send + Sync + 'static {
    /// Bytes queued in the transport but not yet sent.
    fn buffered_amount(&self) -> usize;
    fn read(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;
    fn write(&self, data: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;
    fn close(&self) -> impl Future<Output = io::Result<()>> + Send;
}

type ReadFut = Pin<Box<dyn Future<Output = io::Result<Vec<u8>>> + Send>>;
type WriteFut = Pin<Box<dyn Future<Output = io::Result<usize>> + Send>>;
type UnitFut = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;
type WaitFut = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A byte stream over one channel, with write backpressure and optional
/// read/write deadlines.
///
/// A deadline failure surfaces a [`io::ErrorKind::TimedOut`] error but does
/// not poison the stream: the interrupted operation stays pending internally
/// and resumes on the next call once the deadline is cleared or extended.
pub struct ChannelStream<C: ChannelIo> {
    io: Arc<C>,
    low_water_notify: Arc<Notify>,
    high_water: usize,
    low_water: usize,

    readbuf: Bytes,
    read_fut: Option<ReadFut>,
    write_fut: Option<WriteFut>,
    wait_fut: Option<WaitFut>,
    close_fut: Option<UnitFut>,
    closed: bool,

    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<C: ChannelIo> ChannelStream<C> {
    /// Wraps a transport with the default watermarks. `low_water_notify` must
    /// be signalled by the transport whenever its queue drains below the
    /// low-water threshold.
    pub fn new(io: Arc<C>, low_water_notify: Arc<Notify>) -> Self {
        Self::with_watermarks(io, low_water_notify, DEFAULT_HIGH_WATER, DEFAULT_LOW_WATER)
    }

    pub fn with_watermarks(io: Arc<C>, low_water_notify: Arc<Notify>, high_water: usize, low_water: usize) -> Self {
        Self {
            io,
            low_water_notify,
            high_water,
            low_water,
            readbuf: Bytes::new(),
            read_fut: None,
            write_fut: None,
            wait_fut: None,
            close_fut: None,
            closed: false,
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// Sets or clears the absolute deadline for pending and future reads.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline.map(|at| Box::pin(tokio::time::sleep_until(at)));
    }

    /// Sets or clears the absolute deadline for pending and future writes.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline.map(|at| Box::pin(tokio::time::sleep_until(at)));
    }
}

fn deadline_expired(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
    match deadline {
        Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
        None => false,
    }
}

fn timed_out(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{op} deadline exceeded"))
}

impl<C: ChannelIo> AsyncRead for ChannelStream<C> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, out: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.readbuf.is_empty() {
                let n = this.readbuf.len().min(out.remaining());
                out.put_slice(&this.readbuf.split_to(n));
                return Poll::Ready(Ok(()));
            }

            let fut = this.read_fut.get_or_insert_with(|| {
                let io = Arc::clone(&this.io);
                Box::pin(async move {
                    let mut buf = vec![0u8; READ_BUFFER_SIZE];
                    let n = io.read(&mut buf).await?;
                    buf.truncate(n);
                    Ok(buf)
                })
            });

            match fut.as_mut().poll(cx) {
                Poll::Ready(Ok(buf)) => {
                    this.read_fut = None;
                    if buf.is_empty() {
                        return Poll::Ready(Ok(())); // EOF
                    }
                    this.readbuf = Bytes::from(buf);
                }
                Poll::Ready(Err(error)) => {
                    this.read_fut = None;
                    return Poll::Ready(Err(error));
                }
                Poll::Pending => {
                    if deadline_expired(&mut this.read_deadline, cx) {
                        return Poll::Ready(Err(timed_out("read")));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

impl<C: ChannelIo> AsyncWrite for ChannelStream<C> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<Result<usize, io::Error>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel is closed")));
        }

        loop {
            if let Some(fut) = &mut this.write_fut {
                return match fut.as_mut().poll(cx) {
                    Poll::Ready(result) => {
                        this.write_fut = None;
                        Poll::Ready(result)
                    }
                    Poll::Pending => {
                        if deadline_expired(&mut this.write_deadline, cx) {
                            return Poll::Ready(Err(timed_out("write")));
                        }
                        Poll::Pending
                    }
                };
            }

            if let Some(wait) = &mut this.wait_fut {
                match wait.as_mut().poll(cx) {
                    Poll::Ready(()) => {
                        this.wait_fut = None;
                        continue; // re-evaluate the watermark
                    }
                    Poll::Pending => {
                        // The low-water signal may have fired between the
                        // watermark check and the waiter registering.
                        if this.io.buffered_amount() <= this.low_water {
                            this.wait_fut = None;
                            continue;
                        }
                        if deadline_expired(&mut this.write_deadline, cx) {
                            return Poll::Ready(Err(timed_out("write")));
                        }
                        return Poll::Pending;
                    }
                }
            }

            if this.io.buffered_amount() > this.high_water {
                let notify = Arc::clone(&this.low_water_notify);
                this.wait_fut = Some(Box::pin(async move { notify.notified().await }));
                continue;
            }

            let io = Arc::clone(&this.io);
            let chunk = data.to_vec();
            this.write_fut = Some(Box::pin(async move { io.write(&chunk).await }));
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        if this.closed && this.close_fut.is_none() {
            return Poll::Ready(Ok(()));
        }

        let fut = this.close_fut.get_or_insert_with(|| {
            let io = Arc::clone(&this.io);
            Box::pin(async move { io.close().await })
        });

        match fut.as_mut().poll(cx) {
            Poll::Ready(result) => {
                this.close_fut = None;
                this.closed = true;
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A detached WebRTC data channel as a [`ChannelIo`].
pub struct DetachedChannel {
    dc: Arc<DataChannel>,
}

impl ChannelIo for DetachedChannel {
    fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount()
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.dc.read(buf).await.map_err(io::Error::other)
    }

    async fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.dc.write(&Bytes::copy_from_slice(data)).await.map_err(io::Error::other)
    }

    async fn close(&self) -> io::Result<()> {
        self.dc.close().await.map_err(io::Error::other)
    }
}

/// Waits for the data channel to open, detaches it and wraps it into a
/// [`ChannelStream`] wired to the channel's buffered-amount-low signal.
pub async fn open_channel_stream(dc: Arc<RTCDataChannel>) -> Result<ChannelStream<DetachedChannel>, Error> {
    wait_open(&dc).await?;

    let notify = Arc::new(Notify::new());
    dc.set_buffered_amount_low_threshold(DEFAULT_LOW_WATER).await;
    let low_water_notify = Arc::clone(&notify);
    dc.on_buffered_amount_low(Box::new(move || {
        let notify = Arc::clone(&low_water_notify);
        Box::pin(async move { notify.notify_waiters() })
    }))
    .await;

    let detached = dc.detach().await?;
    Ok(ChannelStream::new(Arc::new(DetachedChannel { dc: detached }), notify))
}

async fn wait_open(dc: &Arc<RTCDataChannel>) -> Result<(), Error> {
    if dc.ready_state() == RTCDataChannelState::Open {
        return Ok(());
    }

    let (tx, rx) = oneshot::channel::<Result<(), Error>>();
    let tx = Arc::new(std::sync::Mutex::new(Some(tx)));

    let on_open_tx = Arc::clone(&tx);
    dc.on_open(Box::new(move || {
        if let Some(tx) = on_open_tx.lock().unwrap().take() {
            let _ = tx.send(Ok(()));
        }
        Box::pin(async {})
    }));

    let on_error_tx = Arc::clone(&tx);
    dc.on_error(Box::new(move |error| {
        if let Some(tx) = on_error_tx.lock().unwrap().take() {
            let _ = tx.send(Err(Error::TransportFailed(error.to_string())));
        }
        Box::pin(async {})
    }));

    let on_close_tx = Arc::clone(&tx);
    dc.on_close(Box::new(move || {
        if let Some(tx) = on_close_tx.lock().unwrap().take() {
            let _ = tx.send(Err(Error::TransportFailed("channel closed before opening".to_string())));
        }
        Box::pin(async {})
    }));

    // The state may have flipped while the handlers were being installed.
    if dc.ready_state() == RTCDataChannelState::Open {
        return Ok(());
    }

    rx.await.map_err(|_| Error::StreamClosed)?
}
