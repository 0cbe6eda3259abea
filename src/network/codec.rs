//! Wire codec for protocol messages.
//!
//! A frame is a `u32` little-endian length prefix followed by the MessagePack encoding of a single [`Message`].
//! Frames larger than the configured maximum are rejected on both ends.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{error::CodecError, message::Message};

const LEN_PREFIX: usize = 4;

/// Encode a value into bytes for transmission.
pub trait Encode {
    /// Serialize this value into a byte vector.
    fn encode(&self) -> Result<Vec<u8>, CodecError>;
}

/// Decode bytes received from the network into a value.
pub trait Decode: Sized {
    /// Deserialize a value from the given byte slice.
    fn decode(bytes: &[u8]) -> Result<Self, CodecError>;
}

impl Encode for Message {
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        rmp_serde::to_vec_named(self).map_err(CodecError::Encode)
    }
}

impl Decode for Message {
    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        rmp_serde::from_slice(bytes).map_err(CodecError::Decode)
    }
}

/// Encodes a message into a complete frame, length prefix included.
pub fn encode_frame(msg: &Message, max_frame_size: usize) -> Result<Vec<u8>, CodecError> {
    let body = msg.encode()?;
    if body.len() > max_frame_size || body.len() > u32::MAX as usize {
        return Err(CodecError::FrameTooLarge {
            len: body.len(),
            max: max_frame_size,
        });
    }

    let mut frame = Vec::with_capacity(LEN_PREFIX + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Writes a single message frame.
pub async fn write_frame<W>(io: &mut W, msg: &Message, max_frame_size: usize) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg, max_frame_size)?;
    io.write_all(&frame).await?;
    io.flush().await
}

/// Reads a single message frame.
///
/// Returns `Ok(None)` when the stream ended cleanly before a new frame started.
pub async fn read_frame<R>(io: &mut R, max_frame_size: usize) -> io::Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_PREFIX];
    match io.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            len,
            max: max_frame_size,
        }
        .into());
    }

    let mut data = vec![0u8; len];
    io.read_exact(&mut data).await?;
    Message::decode(&data).map(Some).map_err(io::Error::from)
}
