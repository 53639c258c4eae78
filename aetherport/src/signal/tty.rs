use std::{future::Future, io::Write};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout},
    sync::Mutex,
};

use crate::{signal::Signal, Error};

/// The alphabet of a big-integer base-62 rendering: digits, then lowercase,
/// then uppercase.
const BASE62: &str = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Manual signalling over a terminal.
///
/// Each SDP blob travels as one line: zlib-deflated, then rendered as a base-62
/// big integer. A human copies the line from one side's prompt to the other.
/// ICE trickling is not available; the whole candidate set rides inside the
/// single SDP exchange.
pub struct SignalTty<R, W> {
    input: Mutex<BufReader<R>>,
    output: Mutex<W>,
}

impl SignalTty<Stdin, Stdout> {
    pub fn new() -> Self {
        Self::with_io(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl Default for SignalTty<Stdin, Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, W> SignalTty<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    pub fn with_io(input: R, output: W) -> Self {
        Self {
            input: Mutex::new(BufReader::new(input)),
            output: Mutex::new(output),
        }
    }

    async fn write_blob(&self, prompt: &str, text: &str) -> Result<(), Error> {
        let mut line = encode(text)?;
        line.push('\n');

        let mut output = self.output.lock().await;
        output.write_all(prompt.as_bytes()).await?;
        output.write_all(line.as_bytes()).await?;
        output.flush().await?;
        Ok(())
    }

    async fn read_blob(&self, prompt: &str) -> Result<String, Error> {
        {
            let mut output = self.output.lock().await;
            output.write_all(prompt.as_bytes()).await?;
            output.flush().await?;
        }

        let mut input = self.input.lock().await;
        loop {
            let mut line = String::new();
            if input.read_line(&mut line).await? == 0 {
                return Err(Error::StreamClosed);
            }

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            return decode(line);
        }
    }
}

fn encode(text: &str) -> Result<String, Error> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes())?;
    let compressed = encoder.finish()?;

    Ok(base_x::encode(BASE62, &compressed))
}

fn decode(line: &str) -> Result<String, Error> {
    let compressed =
        base_x::decode(BASE62, line).map_err(|_| Error::Signal(format!("invalid base62 string: {line}")))?;

    let mut text = String::new();
    std::io::Read::read_to_string(&mut ZlibDecoder::new(compressed.as_slice()), &mut text)
        .map_err(|error| Error::Signal(format!("inflating signalling blob failed: {error}")))?;
    Ok(text)
}

impl<R, W> Signal for SignalTty<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    fn send_offer(&self, offer: &str) -> impl Future<Output = Result<(), Error>> + Send {
        self.write_blob("Offer:\n", offer)
    }

    fn recv_offer(&self) -> impl Future<Output = Result<String, Error>> + Send {
        self.read_blob("Peer's Offer?\n")
    }

    fn send_answer(&self, answer: &str) -> impl Future<Output = Result<(), Error>> + Send {
        self.write_blob("Answer:\n", answer)
    }

    fn recv_answer(&self) -> impl Future<Output = Result<String, Error>> + Send {
        self.read_blob("Peer's Answer?\n")
    }

    fn supports_trickle(&self) -> bool {
        false
    }

    fn send_candidate(&self, _candidate: &str) -> impl Future<Output = Result<(), Error>> + Send {
        async { Ok(()) }
    }

    fn recv_candidate(&self) -> impl Future<Output = Result<String, Error>> + Send {
        async { Err(Error::Signal("ICE trickling is not supported over the terminal".to_string())) }
    }

    fn close(&self) -> impl Future<Output = Result<(), Error>> + Send {
        async { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::{decode, encode, SignalTty};
    use crate::signal::Signal;

    #[test]
    fn blobs_round_trip_through_base62_zlib() {
        for text in ["v=0\r\no=- 123 2 IN IP4 127.0.0.1\r\n", "x", "a longer blob with repetition repetition"] {
            let line = encode(text).unwrap();
            assert!(line.chars().all(|c| c.is_ascii_alphanumeric()));
            assert_eq!(decode(&line).unwrap(), text);
        }
    }

    #[test]
    fn garbage_lines_are_rejected() {
        assert!(decode("!!!not-base62!!!").is_err());
        assert!(decode("deadbeef").is_err()); // valid base62, not valid zlib
    }

    #[tokio::test]
    async fn recv_skips_blank_lines_and_reads_the_pasted_blob() {
        use tokio::io::AsyncWriteExt;

        let (mut typed, input) = tokio::io::duplex(64 * 1024);
        let tty = SignalTty::with_io(input, tokio::io::sink());

        let offer = "v=0\r\no=- 42 2 IN IP4 0.0.0.0\r\n";
        let line = encode(offer).unwrap();
        typed.write_all(format!("\n\n{line}\n").as_bytes()).await.unwrap();

        assert_eq!(tty.recv_offer().await.unwrap(), offer);
    }

    #[tokio::test]
    async fn send_prints_a_prompt_and_one_line() {
        use tokio::io::AsyncReadExt;

        let (output, mut printed) = tokio::io::duplex(64 * 1024);
        let tty = SignalTty::with_io(tokio::io::empty(), output);

        tty.send_offer("an offer").await.unwrap();

        let mut buf = vec![0u8; 1024];
        let n = printed.read(&mut buf).await.unwrap();
        let text = String::from_utf8(buf[..n].to_vec()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("Offer:"));
        assert_eq!(decode(lines.next().unwrap()).unwrap(), "an offer");
    }
}
