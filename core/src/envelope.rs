//! Wire framing: `[u32 big-endian length][UTF-8 JSON payload]`, one message
//! per frame.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::GameMessage;

pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Upper bound on a single frame. Anything larger is a corrupt or hostile
/// peer, not a real message.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// A frame that could not be decoded. Callers must treat this as
/// connection-fatal: after a bad frame there is no way to find the next
/// frame boundary in the stream.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("i/o failure mid-frame: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(u32),
    #[error("malformed frame payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Serialize one message into a complete frame.
pub fn encode(message: &GameMessage) -> Result<Vec<u8>, serde_json::Error> {
    let payload = serde_json::to_vec(message)?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode exactly one frame from a byte slice.
pub fn decode(bytes: &[u8]) -> Result<GameMessage, DecodeError> {
    if bytes.len() < LENGTH_PREFIX_SIZE {
        return Err(truncated());
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(DecodeError::TooLarge(len));
    }
    let end = LENGTH_PREFIX_SIZE + len as usize;
    if bytes.len() < end {
        return Err(truncated());
    }
    Ok(serde_json::from_slice(&bytes[LENGTH_PREFIX_SIZE..end])?)
}

/// Read exactly one frame from the stream, blocking until the length
/// prefix and the full payload have arrived. A short read (peer went away
/// mid-frame) surfaces as `DecodeError::Io`.
pub async fn read_from<R>(input: &mut R) -> Result<GameMessage, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let len = input.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(DecodeError::TooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    input.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

fn truncated() -> DecodeError {
    DecodeError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "truncated frame",
    ))
}
