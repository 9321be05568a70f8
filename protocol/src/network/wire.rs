//! Length-prefixed JSON framing.
//!
//! ```text
//! ┌──────────────────┬─────────────────────────────┐
//! │ len: u32 (BE)    │ JSON body (len bytes)        │
//! └──────────────────┴─────────────────────────────┘
//! ```
//!
//! Frames larger than [`MAX_FRAME_BYTES`] are refused on both sides before
//! any body is read or written.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::MAX_FRAME_BYTES;
use crate::network::rpc::{Envelope, Response};

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("connection I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame body: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("frame of {size} bytes exceeds the {limit}-byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("no frame received within {0:?}")]
    Timeout(std::time::Duration),
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge {
            size: body.len(),
            limit: MAX_FRAME_BYTES,
        });
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let size = reader.read_u32().await? as usize;
    if size > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge {
            size,
            limit: MAX_FRAME_BYTES,
        });
    }
    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Client side of one exchange: send `envelope`, wait for the response.
pub async fn exchange<S>(stream: &mut S, envelope: &Envelope) -> Result<Response, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(stream, envelope).await?;
    read_frame(stream).await
}
