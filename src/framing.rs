//! Length-prefixed frames over a byte stream.
//!
//! A frame is a `u32` little-endian length followed by that many bytes.
//! Readers reject frames larger than the configured cap before allocating.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub async fn write_frame<W>(stream: &mut W, data: &[u8], max_len: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > max_len || data.len() > u32::MAX as usize {
        return Err(Error::Transport(format!(
            "frame of {} bytes exceeds limit of {max_len}",
            data.len()
        )));
    }
    stream.write_u32_le(data.len() as u32).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` if the stream ends cleanly before a
/// length prefix.
pub async fn read_frame<R>(stream: &mut R, max_len: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match stream.read_u32_le().await {
        Ok(v) => v as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    if len > max_len {
        return Err(Error::Transport(format!(
            "frame of {len} bytes exceeds limit of {max_len}"
        )));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}
