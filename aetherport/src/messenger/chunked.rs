use std::future::Future;

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf},
    sync::Mutex,
};

use crate::{messenger::Messenger, Error};

/// Frames messages over a byte stream with a variable-width length prefix.
///
/// The prefix is the smallest little-endian encoding of the payload length, 1
/// to 8 bytes. When fewer than 8 bytes are used, a single `'\n'` follows the
/// prefix so the reader can tell where the length stops; the 8-byte form
/// carries no sentinel. A 5-byte payload goes out as `[0x05, 0x0A, ...]`, a
/// 300-byte payload as `[0x2C, 0x01, 0x0A, ...]`. This framing is the wire
/// contract with peers; both sides must produce it byte for byte.
pub struct ChunkedMessenger<S> {
    reader: Mutex<BufReader<ReadHalf<S>>>,
    writer: Mutex<WriteHalf<S>>,
}

impl<S> ChunkedMessenger<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(write_half),
        }
    }
}

fn prefix_len(n: u64) -> usize {
    for width in 1..8 {
        if n < 1u64 << (8 * width) {
            return width;
        }
    }
    8
}

impl<S> Messenger for ChunkedMessenger<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    fn recv(&self) -> impl Future<Output = Result<Vec<u8>, Error>> + Send {
        async {
            let mut reader = self.reader.lock().await;

            let mut byte = [0u8; 1];
            reader.read_exact(&mut byte).await?;
            let mut n = byte[0] as u64;

            let mut width = 1;
            while width < 8 {
                reader.read_exact(&mut byte).await?;
                if byte[0] == b'\n' {
                    break;
                }
                n |= (byte[0] as u64) << (8 * width);
                width += 1;
            }

            let mut payload = vec![0u8; n as usize];
            reader.read_exact(&mut payload).await?;
            Ok(payload)
        }
    }

    fn send(&self, msg: &[u8]) -> impl Future<Output = Result<(), Error>> + Send {
        async move {
            let n = msg.len() as u64;
            let width = prefix_len(n);

            let mut frame = Vec::with_capacity(width + 1 + msg.len());
            frame.extend_from_slice(&n.to_le_bytes()[..width]);
            if width < 8 {
                frame.push(b'\n');
            }
            frame.extend_from_slice(msg);

            let mut writer = self.writer.lock().await;
            writer.write_all(&frame).await?;
            writer.flush().await?;
            Ok(())
        }
    }

    fn close(&self) -> impl Future<Output = Result<(), Error>> + Send {
        async {
            self.writer.lock().await.shutdown().await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::ChunkedMessenger;
    use crate::messenger::Messenger;

    #[tokio::test]
    async fn wire_prefix_is_pinned() {
        let (near, mut far) = tokio::io::duplex(1024);
        let messenger = ChunkedMessenger::new(near);

        messenger.send(&[0xEE; 5]).await.unwrap();
        let mut buf = [0u8; 7];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..2], &[0x05, 0x0A]);
        assert_eq!(&buf[2..], &[0xEE; 5]);

        messenger.send(&[0x11; 300]).await.unwrap();
        let mut buf = vec![0u8; 303];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..3], &[0x2C, 0x01, 0x0A]);
        assert_eq!(&buf[3..], [0x11; 300].as_slice());
    }

    #[tokio::test]
    async fn messages_round_trip_at_width_boundaries() {
        let (near, far) = tokio::io::duplex(1024 * 1024);
        let a = ChunkedMessenger::new(near);
        let b = ChunkedMessenger::new(far);

        for len in [0usize, 1, 10, 255, 256, 65_535, 65_536, 1 << 20] {
            let msg: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
            let (sent, received) = tokio::join!(a.send(&msg), b.recv());
            sent.unwrap();
            assert_eq!(received.unwrap(), msg, "length {len}");
        }
    }

    #[tokio::test]
    async fn prefix_width_is_the_smallest_that_fits() {
        for (len, width) in [(0usize, 1usize), (255, 1), (256, 2), (65_535, 2), (65_536, 3)] {
            let (near, mut far) = tokio::io::duplex(1024 * 1024);
            let messenger = ChunkedMessenger::new(near);
            messenger.send(&vec![0u8; len]).await.unwrap();

            let mut frame = vec![0u8; width + 1 + len];
            far.read_exact(&mut frame).await.unwrap();
            assert_eq!(frame[width], b'\n', "length {len} should use a {width}-byte prefix");
        }
    }

    #[tokio::test]
    async fn close_makes_the_peer_see_eof() {
        let (near, far) = tokio::io::duplex(1024);
        let a = ChunkedMessenger::new(near);
        let b = ChunkedMessenger::new(far);

        a.send(b"bye").await.unwrap();
        a.close().await.unwrap();

        assert_eq!(b.recv().await.unwrap(), b"bye");
        assert!(b.recv().await.is_err());
    }
}
