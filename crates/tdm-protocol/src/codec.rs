//! Length-prefixed frame codec.
//!
//! A stream is a sequence of frames `{ size: u32 little-endian, payload:
//! size bytes }`. The payload is a self-describing tagged binary object
//! (CBOR). The WebSocket transport carries the bare payload, one per
//! binary message; only the raw TCP transport uses the length prefix.
//!
//! The declared size is checked against a limit before any allocation;
//! oversized or structurally invalid frames are reported as errors and
//! the caller closes the connection.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length of the frame header, in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Errors that can occur while framing or encoding messages.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream between frames.
    #[error("stream closed")]
    Closed,

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("failed to decode message: {0}")]
    Decode(String),
}

/// Serializes a message into its payload encoding, without the frame
/// header. This is the form carried by WebSocket binary messages.
pub fn encode_payload<T: Serialize>(msg: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    ciborium::into_writer(msg, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Serializes a message into a complete frame: little-endian u32 size
/// followed by the payload.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = vec![0u8; FRAME_HEADER_LEN];
    ciborium::into_writer(msg, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
    let size = buf.len() - FRAME_HEADER_LEN;
    let size = u32::try_from(size).map_err(|_| CodecError::FrameTooLarge {
        size: u32::MAX,
        max: u32::MAX,
    })?;
    buf[..FRAME_HEADER_LEN].copy_from_slice(&size.to_le_bytes());
    Ok(buf)
}

/// Deserializes a message from its payload bytes.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    ciborium::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Reads one frame payload from the stream.
///
/// Returns `CodecError::Closed` when the peer closed the stream at a
/// frame boundary (or mid-frame; the distinction does not matter to the
/// caller, which tears the connection down either way).
pub async fn read_frame<R>(reader: &mut R, max_size: u32) -> Result<Vec<u8>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    if let Err(e) = reader.read_exact(&mut header).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(CodecError::Closed);
        }
        return Err(CodecError::Io(e));
    }

    let size = u32::from_le_bytes(header);
    if size > max_size {
        return Err(CodecError::FrameTooLarge {
            size,
            max: max_size,
        });
    }

    let mut payload = vec![0u8; size as usize];
    if let Err(e) = reader.read_exact(&mut payload).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(CodecError::Closed);
        }
        return Err(CodecError::Io(e));
    }
    Ok(payload)
}

/// Writes one frame (header plus payload) to the stream and flushes it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let size = u32::try_from(payload.len()).map_err(|_| CodecError::FrameTooLarge {
        size: u32::MAX,
        max: u32::MAX,
    })?;
    writer.write_all(&size.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
