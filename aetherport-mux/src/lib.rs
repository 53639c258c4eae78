//! Carry many independent byte streams inside one reliable connection.
//!
//! A [`Session`] splits the underlying connection into small framed commands:
//! SYN opens a stream, PSH carries data, FIN signals EOF, and NOP keeps the
//! connection alive. One side of the session is the client
//! (it allocates odd stream ids), the other the server (even ids); either side
//! may open and accept streams.
//!
//! Keepalive doubles as dead-peer detection: if nothing at all arrives for
//! longer than the configured timeout, the session shuts down and every open
//! stream reads EOF.

mod frame;

use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace};

use crate::frame::{Command, Frame};

/// Largest payload carried by a single data frame.
pub const MAX_FRAME_PAYLOAD: usize = frame::MAX_PAYLOAD;

#[derive(Error, Debug)]
pub enum Error {
    #[error("mux session closed")]
    SessionClosed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// How often a NOP frame is sent when the session is otherwise quiet.
    pub keepalive_interval: Duration,
    /// How long the peer may stay completely silent before the session is
    /// considered dead.
    pub keepalive_timeout: Duration,
    /// How many incoming streams may sit unaccepted.
    pub accept_backlog: usize,
    /// How many data frames each stream buffers before the session stops
    /// reading from the connection.
    pub stream_window: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(30),
            accept_backlog: 16,
            stream_window: 32,
        }
    }
}

struct Shared {
    out_tx: mpsc::Sender<Frame>,
    streams: Mutex<HashMap<u32, mpsc::Sender<Bytes>>>,
    next_stream_id: AtomicU32,
    token: CancellationToken,
    stream_window: usize,
}

/// One multiplexed session over a reliable connection.
pub struct Session {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Stream>>,
}

impl Session {
    /// Runs the client side of a session; streams opened here get odd ids.
    pub fn client<S>(conn: S, config: Config) -> Session
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Session::start(conn, config, 1)
    }

    /// Runs the server side of a session; streams opened here get even ids.
    pub fn server<S>(conn: S, config: Config) -> Session
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Session::start(conn, config, 2)
    }

    fn start<S>(conn: S, config: Config, first_stream_id: u32) -> Session
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(conn);
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(64);
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);
        let token = CancellationToken::new();
        let last_recv = Arc::new(Mutex::new(Instant::now()));

        let shared = Arc::new(Shared {
            out_tx,
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU32::new(first_stream_id),
            token: token.clone(),
            stream_window: config.stream_window,
        });

        // Writer: drains the frame queue onto the connection.
        let writer_token = token.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = writer_token.cancelled() => break,
                    frame = out_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };

                let result = async {
                    frame.write(&mut write_half).await?;
                    write_half.flush().await
                }
                .await;

                if let Err(error) = result {
                    debug!("mux write failed: {error}");
                    writer_token.cancel();
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        // Reader: parses frames and dispatches them to streams.
        let reader_shared = Arc::clone(&shared);
        let reader_token = token.clone();
        let reader_last_recv = Arc::clone(&last_recv);
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_token.cancelled() => break,
                    frame = Frame::read(&mut read_half) => match frame {
                        Ok(frame) => frame,
                        Err(error) => {
                            debug!("mux read ended: {error}");
                            break;
                        }
                    },
                };

                *reader_last_recv.lock().unwrap() = Instant::now();

                match frame.command {
                    Command::Nop => {}
                    Command::Syn => {
                        let (data_tx, data_rx) = mpsc::channel(reader_shared.stream_window);
                        reader_shared.streams.lock().unwrap().insert(frame.stream_id, data_tx);
                        let stream = Stream::new(frame.stream_id, Arc::clone(&reader_shared), data_rx);
                        if accept_tx.send(stream).await.is_err() {
                            break;
                        }
                    }
                    Command::Psh => {
                        let data_tx = reader_shared.streams.lock().unwrap().get(&frame.stream_id).cloned();
                        match data_tx {
                            Some(data_tx) => {
                                if data_tx.send(frame.payload).await.is_err() {
                                    reader_shared.streams.lock().unwrap().remove(&frame.stream_id);
                                }
                            }
                            None => trace!("mux data for unknown stream {}", frame.stream_id),
                        }
                    }
                    Command::Fin => {
                        reader_shared.streams.lock().unwrap().remove(&frame.stream_id);
                    }
                }
            }

            reader_token.cancel();
            reader_shared.streams.lock().unwrap().clear();
        });

        // Keepalive: ping periodically, give up on a silent peer.
        let keepalive_shared = Arc::clone(&shared);
        let keepalive_token = token;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.keepalive_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = keepalive_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if last_recv.lock().unwrap().elapsed() > config.keepalive_timeout {
                    debug!("mux peer timed out");
                    keepalive_token.cancel();
                    break;
                }
                if keepalive_shared.out_tx.send(Frame::nop()).await.is_err() {
                    break;
                }
            }
        });

        Session {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }

    /// Opens a new stream towards the peer.
    pub async fn open_stream(&self) -> Result<Stream, Error> {
        if self.shared.token.is_cancelled() {
            return Err(Error::SessionClosed);
        }

        let id = self.shared.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let (data_tx, data_rx) = mpsc::channel(self.shared.stream_window);
        self.shared.streams.lock().unwrap().insert(id, data_tx);

        if self.shared.out_tx.send(Frame::syn(id)).await.is_err() {
            self.shared.streams.lock().unwrap().remove(&id);
            return Err(Error::SessionClosed);
        }

        Ok(Stream::new(id, Arc::clone(&self.shared), data_rx))
    }

    /// Waits for the peer to open a stream.
    pub async fn accept_stream(&self) -> Result<Stream, Error> {
        self.accept_rx.lock().await.recv().await.ok_or(Error::SessionClosed)
    }

    /// Tears the session down. Every open stream reads EOF and further
    /// writes fail.
    pub fn close(&self) {
        self.shared.token.cancel();
    }

    /// Completes once the session is closed, whichever side caused it.
    pub async fn closed(&self) {
        self.shared.token.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.token.is_cancelled()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.token.cancel();
    }
}

/// One stream inside a [`Session`]. Bytes are FIFO within a stream; there is
/// no ordering across streams.
pub struct Stream {
    id: u32,
    shared: Arc<Shared>,
    data_rx: mpsc::Receiver<Bytes>,
    readbuf: Bytes,
    out: PollSender<Frame>,
    fin_sent: bool,
}

impl Stream {
    fn new(id: u32, shared: Arc<Shared>, data_rx: mpsc::Receiver<Bytes>) -> Stream {
        let out = PollSender::new(shared.out_tx.clone());
        Stream {
            id,
            shared,
            data_rx,
            readbuf: Bytes::new(),
            out,
            fin_sent: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl AsyncRead for Stream {
    fn poll_read(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.readbuf.is_empty() {
                let n = this.readbuf.len().min(buf.remaining());
                buf.put_slice(&this.readbuf.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match this.data_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.readbuf = chunk,
                // Sender gone: FIN arrived or the session died. Either way, EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<Result<usize, io::Error>> {
        let this = self.get_mut();
        if this.fin_sent {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream is shut down")));
        }

        match this.out.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let n = data.len().min(MAX_FRAME_PAYLOAD);
                let chunk = Bytes::copy_from_slice(&data[..n]);
                match this.out.send_item(Frame::psh(this.id, chunk)) {
                    Ok(()) => Poll::Ready(Ok(n)),
                    Err(_) => Poll::Ready(Err(session_closed())),
                }
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(session_closed())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: std::pin::Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        // Frames are flushed by the session's writer task.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        if this.fin_sent {
            return Poll::Ready(Ok(()));
        }

        match this.out.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let _ = this.out.send_item(Frame::fin(this.id));
                this.fin_sent = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(_)) => {
                this.fin_sent = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.shared.streams.lock().unwrap().remove(&self.id);
        if !self.fin_sent {
            let _ = self.shared.out_tx.try_send(Frame::fin(self.id));
        }
    }
}

fn session_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "mux session closed")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::{Config, Session};

    fn pair(config: Config) -> (Session, Session) {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        (Session::client(a, config.clone()), Session::server(b, config))
    }

    #[tokio::test]
    async fn open_accept_and_echo() {
        let (client, server) = pair(Config::default());

        let mut outbound = client.open_stream().await.unwrap();
        let mut inbound = server.accept_stream().await.unwrap();

        outbound.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        inbound.write_all(b"pong").await.unwrap();
        outbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn shutdown_propagates_eof() {
        let (client, server) = pair(Config::default());

        let mut outbound = client.open_stream().await.unwrap();
        let mut inbound = server.accept_stream().await.unwrap();

        outbound.write_all(b"last words").await.unwrap();
        outbound.shutdown().await.unwrap();

        let mut buf = Vec::new();
        inbound.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"last words");
    }

    #[tokio::test]
    async fn large_transfers_are_chunked_and_reassembled() {
        let (client, server) = pair(Config::default());

        let mut outbound = client.open_stream().await.unwrap();
        let mut inbound = server.accept_stream().await.unwrap();

        let data: Vec<u8> = (0..300_000usize).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();

        let writer = tokio::spawn(async move {
            outbound.write_all(&data).await.unwrap();
            outbound.shutdown().await.unwrap();
        });

        let mut buf = Vec::new();
        inbound.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn streams_do_not_interleave_data() {
        let (client, server) = pair(Config::default());

        let mut out_a = client.open_stream().await.unwrap();
        let mut out_b = client.open_stream().await.unwrap();
        let mut in_a = server.accept_stream().await.unwrap();
        let mut in_b = server.accept_stream().await.unwrap();

        assert_eq!(out_a.id(), in_a.id());
        assert_eq!(out_b.id(), in_b.id());

        out_a.write_all(b"aaaa").await.unwrap();
        out_b.write_all(b"bbbb").await.unwrap();

        let mut buf = [0u8; 4];
        in_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"aaaa");
        in_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"bbbb");
    }

    #[tokio::test]
    async fn keepalive_detects_a_silent_peer() {
        let (conn, silent_half) = tokio::io::duplex(1024 * 1024);
        let config = Config {
            keepalive_interval: Duration::from_millis(50),
            keepalive_timeout: Duration::from_millis(150),
            ..Config::default()
        };
        let session = Session::client(conn, config);

        // The far half never speaks; the session must give up on its own.
        tokio::time::timeout(Duration::from_secs(2), session.closed())
            .await
            .expect("session should close after the keepalive timeout");
        assert!(session.is_closed());
        drop(silent_half);
    }

    #[tokio::test]
    async fn session_close_fails_streams() {
        let (client, server) = pair(Config::default());

        let mut outbound = client.open_stream().await.unwrap();
        let mut inbound = server.accept_stream().await.unwrap();

        client.close();
        client.closed().await;

        // The server side notices the connection went away.
        let mut buf = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(2), inbound.read_to_end(&mut buf))
            .await
            .expect("inbound stream should reach EOF");

        // Writes on the closed side fail once the writer task is gone.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(outbound.write_all(b"x").await.is_err());
    }
}
