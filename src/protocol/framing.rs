//! Length-prefixed protocol frames.
//!
//! Every backend message is `tag:u8 | length:i32 (big-endian, inclusive of
//! itself) | body[length-4]`. The SSLRequest/Startup messages the frontend
//! opens with are the only untagged exceptions; see
//! [`frontend`](super::frontend) for their encoders.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Maximum backend message size (1GB) - prevents memory exhaustion from
/// malformed length fields. This is more than enough.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024 * 1024;

/// A raw protocol frame: tag byte plus body (the 4-byte length excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Returns true if this is an ErrorResponse ('E')
    #[inline]
    pub fn is_error(&self) -> bool {
        self.tag == b'E'
    }

    /// Returns true if this is a ReadyForQuery ('Z')
    #[inline]
    pub fn is_ready_for_query(&self) -> bool {
        self.tag == b'Z'
    }

    /// Returns true if this is CopyBothResponse ('W')
    #[inline]
    pub fn is_copy_both_response(&self) -> bool {
        self.tag == b'W'
    }

    /// Returns true if this is CopyData ('d')
    #[inline]
    pub fn is_copy_data(&self) -> bool {
        self.tag == b'd'
    }
}

/// Read exactly one frame: 5 header bytes, then `length - 4` body bytes.
///
/// EOF before the full body arrives is an `Unavailable` fault - the stream
/// cannot be resynchronized mid-frame.
pub async fn read_frame<R: AsyncRead + Unpin>(rd: &mut R) -> Result<Frame> {
    let mut hdr = [0u8; 5];
    rd.read_exact(&mut hdr).await?;
    let tag = hdr[0];
    let len = i32::from_be_bytes([hdr[1], hdr[2], hdr[3], hdr[4]]);

    if len < 4 {
        return Err(Error::Fault(format!("invalid frame length: {len}")));
    }

    let payload_len = (len - 4) as usize;

    if payload_len > MAX_MESSAGE_SIZE {
        return Err(Error::Fault(format!(
            "frame too large: {payload_len} bytes (max {MAX_MESSAGE_SIZE})"
        )));
    }

    let mut buf = vec![0u8; payload_len];
    rd.read_exact(&mut buf).await?;
    Ok(Frame {
        tag,
        payload: Bytes::from(buf),
    })
}

/// Write raw pre-encoded frame bytes and flush.
///
/// The buffer may hold several frames; they hit the wire in one write so a
/// pipelined batch is never observed half-sent.
pub async fn write_all_flush<W: AsyncWrite + Unpin>(wr: &mut W, bytes: &[u8]) -> Result<()> {
    wr.write_all(bytes).await?;
    wr.flush().await?;
    Ok(())
}
