use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::error::{RebuilderError, Result};

/// Hard ceiling on a single frame. Both ends enforce it: senders refuse
/// to encode larger frames, receivers refuse to allocate for them.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Payload size for upload/download data frames, chosen to keep the full
/// encoded frame under [`MAX_FRAME_SIZE`].
pub const CHUNK_SIZE: usize = 3 * 1024 * 1024;

/// Sends one length-prefixed, postcard-encoded frame.
pub async fn send_frame<S, T>(stream: &mut S, msg: &T) -> Result<()>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = postcard::to_stdvec(msg)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(RebuilderError::Protocol(format!(
            "frame too large: {} bytes (max {} bytes)",
            data.len(),
            MAX_FRAME_SIZE
        )));
    }

    let len = data.len() as u32;
    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| map_io_error(e, "writing length prefix"))?;
    stream
        .write_all(&data)
        .await
        .map_err(|e| map_io_error(e, "writing frame"))?;
    stream
        .flush()
        .await
        .map_err(|e| map_io_error(e, "flushing stream"))?;

    Ok(())
}

/// Receives one frame, treating end-of-stream as a connection error.
pub async fn recv_frame<S, T>(stream: &mut S) -> Result<T>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match try_recv_frame(stream).await? {
        Some(msg) => Ok(msg),
        None => Err(RebuilderError::Connection(
            "connection closed by peer".to_string(),
        )),
    }
}

/// Receives one frame, returning `None` on a clean end-of-stream.
///
/// Used where the peer closing the connection is a signal rather than a
/// failure, e.g. the held-open `Acquire` call ending at release.
pub async fn try_recv_frame<S, T>(stream: &mut S) -> Result<Option<T>>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(map_io_error(e, "reading length prefix")),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(RebuilderError::Protocol(format!(
            "frame too large: {} bytes (max {} bytes)",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| map_io_error(e, "reading frame"))?;

    Ok(Some(postcard::from_bytes(&buf)?))
}

/// Map IO errors to transport error variants.
///
/// Connection-shaped failures become `Connection` (which the scheduler
/// treats as transient); everything else stays an IO error.
fn map_io_error(err: std::io::Error, context: &str) -> RebuilderError {
    match err.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::ConnectionRefused
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::NotConnected => {
            RebuilderError::Connection(format!("{}: connection lost", context))
        }
        _ => RebuilderError::Io(err),
    }
}
