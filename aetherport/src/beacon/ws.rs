use std::{
    io,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::{ready, Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// What a WebSocket message contributes to a byte stream.
pub enum WsFrame {
    Data(Vec<u8>),
    /// Control traffic handled by the WebSocket layer itself.
    Ignore,
    Close,
}

/// Implemented for the message types of the WebSocket stacks in use.
pub trait WsMessage: Send {
    fn from_bytes(data: Vec<u8>) -> Self;
    fn into_frame(self) -> WsFrame;
}

impl WsMessage for tokio_tungstenite::tungstenite::Message {
    fn from_bytes(data: Vec<u8>) -> Self {
        Self::Binary(data)
    }

    fn into_frame(self) -> WsFrame {
        match self {
            Self::Binary(data) => WsFrame::Data(data),
            Self::Text(text) => WsFrame::Data(text.into_bytes()),
            Self::Close(_) => WsFrame::Close,
            _ => WsFrame::Ignore,
        }
    }
}

impl WsMessage for axum::extract::ws::Message {
    fn from_bytes(data: Vec<u8>) -> Self {
        Self::Binary(data)
    }

    fn into_frame(self) -> WsFrame {
        match self {
            Self::Binary(data) => WsFrame::Data(data),
            Self::Text(text) => WsFrame::Data(text.into_bytes()),
            Self::Close(_) => WsFrame::Close,
            _ => WsFrame::Ignore,
        }
    }
}

/// Presents a binary-message WebSocket as a plain byte stream.
pub struct WsByteStream<S, M> {
    inner: S,
    readbuf: Bytes,
    _marker: PhantomData<M>,
}

impl<S, M> WsByteStream<S, M> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            readbuf: Bytes::new(),
            _marker: PhantomData,
        }
    }
}

impl<S, M, E> AsyncRead for WsByteStream<S, M>
where
    S: Stream<Item = Result<M, E>> + Unpin + Send,
    M: WsMessage + Unpin,
    E: std::fmt::Display,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, out: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.readbuf.is_empty() {
                let n = this.readbuf.len().min(out.remaining());
                out.put_slice(&this.readbuf.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(msg)) => match msg.into_frame() {
                    WsFrame::Data(data) if data.is_empty() => continue,
                    WsFrame::Data(data) => this.readbuf = Bytes::from(data),
                    WsFrame::Ignore => continue,
                    WsFrame::Close => return Poll::Ready(Ok(())),
                },
                Some(Err(error)) => return Poll::Ready(Err(io::Error::other(error.to_string()))),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl<S, M, E> AsyncWrite for WsByteStream<S, M>
where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Unpin + Send,
    M: WsMessage + Unpin,
    E: std::fmt::Display,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<Result<usize, io::Error>> {
        let this = self.get_mut();
        if let Err(error) = ready!(Pin::new(&mut this.inner).poll_ready(cx)) {
            return Poll::Ready(Err(io::Error::other(error.to_string())));
        }

        match Pin::new(&mut this.inner).start_send(M::from_bytes(data.to_vec())) {
            Ok(()) => Poll::Ready(Ok(data.len())),
            Err(error) => Poll::Ready(Err(io::Error::other(error.to_string()))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_flush(cx)
            .map_err(|error| io::Error::other(error.to_string()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_close(cx)
            .map_err(|error| io::Error::other(error.to_string()))
    }
}
