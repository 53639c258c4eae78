use std::io::{Error, ErrorKind};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 8;

/// Largest payload one PSH frame can carry (the length field is 16 bits).
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Open a stream.
    Syn = 0,
    /// Close a stream; the peer's read side sees EOF.
    Fin = 1,
    /// Stream data.
    Psh = 2,
    /// Keepalive, carries nothing.
    Nop = 3,
}

impl Command {
    fn from_u8(value: u8) -> Option<Command> {
        match value {
            0 => Some(Command::Syn),
            1 => Some(Command::Fin),
            2 => Some(Command::Psh),
            3 => Some(Command::Nop),
            _ => None,
        }
    }
}

/// One mux frame: `ver(1) cmd(1) len(2 LE) stream_id(4 LE)` followed by `len`
/// payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn syn(stream_id: u32) -> Frame {
        Frame {
            command: Command::Syn,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn fin(stream_id: u32) -> Frame {
        Frame {
            command: Command::Fin,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn psh(stream_id: u32, payload: Bytes) -> Frame {
        Frame {
            command: Command::Psh,
            stream_id,
            payload,
        }
    }

    pub fn nop() -> Frame {
        Frame {
            command: Command::Nop,
            stream_id: 0,
            payload: Bytes::new(),
        }
    }

    pub async fn write<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> Result<(), Error> {
        debug_assert!(self.payload.len() <= MAX_PAYLOAD);

        let mut header = [0u8; HEADER_LEN];
        header[0] = VERSION;
        header[1] = self.command as u8;
        header[2..4].copy_from_slice(&(self.payload.len() as u16).to_le_bytes());
        header[4..8].copy_from_slice(&self.stream_id.to_le_bytes());

        writer.write_all(&header).await?;
        if !self.payload.is_empty() {
            writer.write_all(&self.payload).await?;
        }
        Ok(())
    }

    pub async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Frame, Error> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;

        if header[0] != VERSION {
            return Err(Error::new(ErrorKind::InvalidData, format!("invalid mux version: {}", header[0])));
        }
        let command = Command::from_u8(header[1])
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, format!("invalid mux command: {}", header[1])))?;
        let len = u16::from_le_bytes([header[2], header[3]]) as usize;
        let stream_id = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let payload = match len {
            0 => Bytes::new(),
            len => {
                let mut payload = vec![0u8; len];
                reader.read_exact(&mut payload).await?;
                Bytes::from(payload)
            }
        };

        Ok(Frame {
            command,
            stream_id,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{Command, Frame};

    #[tokio::test]
    async fn frames_round_trip() {
        let frames = [
            Frame::syn(1),
            Frame::fin(7),
            Frame::psh(3, Bytes::from_static(b"hello")),
            Frame::nop(),
            Frame::psh(u32::MAX, Bytes::from(vec![0xAB; super::MAX_PAYLOAD])),
        ];

        for frame in frames {
            let mut buf = Vec::new();
            frame.write(&mut buf).await.unwrap();
            let parsed = Frame::read(&mut buf.as_slice()).await.unwrap();
            assert_eq!(parsed, frame);
        }
    }

    #[tokio::test]
    async fn bad_version_and_command_are_rejected() {
        let mut buf = Vec::new();
        Frame::nop().write(&mut buf).await.unwrap();

        let mut bad_version = buf.clone();
        bad_version[0] = 9;
        assert!(Frame::read(&mut bad_version.as_slice()).await.is_err());

        let mut bad_command = buf;
        bad_command[1] = 200;
        assert!(Frame::read(&mut bad_command.as_slice()).await.is_err());
    }

    #[tokio::test]
    async fn header_layout_is_pinned() {
        let frame = Frame::psh(0x01020304, Bytes::from_static(b"xyz"));
        let mut buf = Vec::new();
        frame.write(&mut buf).await.unwrap();
        assert_eq!(&buf[..8], &[1, Command::Psh as u8, 3, 0, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&buf[8..], b"xyz");
    }
}
