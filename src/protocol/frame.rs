//! Length-prefixed framing: `[4-byte big-endian length N][N bytes]`, where
//! the body is the bincode encoding of an [`Envelope`]. The length excludes
//! the prefix itself.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{FlotillaError, Result};
use crate::protocol::Envelope;

/// Frames above this are a fatal link error.
pub const MAX_FRAME_LEN: u32 = i32::MAX as u32;

pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(envelope)
        .map_err(|e| FlotillaError::Internal(format!("envelope encode failed: {e}")))?;
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(FlotillaError::ProtocolViolation(format!(
            "outbound frame of {} bytes exceeds the frame limit",
            body.len()
        )));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R) -> Result<Envelope>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(FlotillaError::ProtocolViolation(format!(
            "inbound frame of {len} bytes exceeds the frame limit"
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    bincode::deserialize(&body)
        .map_err(|e| FlotillaError::ProtocolViolation(format!("undecodable envelope: {e}")))
}
