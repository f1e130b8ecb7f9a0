//! Length-prefixed framing for the raw-socket transport.
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | i32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length does not include the prefix itself. Valid lengths are
//! `1..=MAX_FRAME_LEN`. Anything else means the stream is corrupted and the
//! connection must be dropped.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Largest accepted payload: 10 MiB.
pub const MAX_FRAME_LEN: i32 = 10 * 1024 * 1024;

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The length prefix is zero, negative, or above [`MAX_FRAME_LEN`].
    #[error("invalid frame length {0} (expected 1..={MAX_FRAME_LEN})")]
    InvalidLength(i64),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn validate_len(len: i64) -> Result<usize, FrameError> {
    if len <= 0 || len > i64::from(MAX_FRAME_LEN) {
        return Err(FrameError::InvalidLength(len));
    }
    Ok(len as usize)
}

/// Read a single frame, accumulating partial reads until the declared
/// length has arrived.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    let len = validate_len(i64::from(i32::from_le_bytes(len_buf)))?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::ConnectionClosed
        } else {
            FrameError::Io(e)
        }
    })?;

    Ok(payload)
}

/// Write a single frame. The caller must be the only writer on `writer`
/// for the duration of the call so prefix and body stay contiguous.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), FrameError> {
    let len = validate_len(payload.len() as i64)? as i32;

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;

    Ok(())
}

/// Check a payload against the frame limits without writing it.
pub fn check_frame_len(len: usize) -> Result<(), FrameError> {
    validate_len(len as i64).map(|_| ())
}
