use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Copies bytes between two connections in both directions until both sides
/// are done.
///
/// When one direction reaches EOF, the other side's write half is shut down so
/// the close propagates. EOF is not an error; if both directions fail with
/// real errors the two are combined into one.
pub async fn relay<A, B>(a: A, b: B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Send,
    B: AsyncRead + AsyncWrite + Send,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = async {
        let result = tokio::io::copy(&mut a_read, &mut b_write).await;
        let _ = b_write.shutdown().await;
        result
    };
    let b_to_a = async {
        let result = tokio::io::copy(&mut b_read, &mut a_write).await;
        let _ = a_write.shutdown().await;
        result
    };

    let (sent, received) = tokio::join!(a_to_b, b_to_a);
    match (sent, received) {
        (Ok(sent), Ok(received)) => Ok((sent, received)),
        (Err(error), Ok(_)) | (Ok(_), Err(error)) => Err(error),
        (Err(a_error), Err(b_error)) => Err(io::Error::new(a_error.kind(), format!("{a_error}; {b_error}"))),
    }
}
