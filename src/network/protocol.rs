//! Wire framing.
//!
//! After the handshake, every message in either direction is a frame:
//! an 8-byte token (only the low 32 bits are ever used, so it travels as
//! two little-endian u32 words with the high word zero), a little-endian
//! u32 payload length, then that many bytes of JSON.
//!
//! Handshake traffic predates framing and uses null-terminated JSON
//! documents instead.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Maximum accepted frame payload (256MB).
pub const MAX_MESSAGE_SIZE: u32 = 256 * 1024 * 1024;

/// Maximum accepted handshake message. Handshake documents are tiny; a
/// larger one means we are not talking to a real server.
pub const MAX_HANDSHAKE_MESSAGE: usize = 16 * 1024;

/// A decoded frame: the query token it belongs to plus the raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub token: u32,
    pub payload: Vec<u8>,
}

/// Write one frame and flush it.
pub async fn write_frame<T: AsyncWrite + Unpin>(
    stream: &mut T,
    token: u32,
    payload: &[u8],
) -> Result<()> {
    if payload.len() > MAX_MESSAGE_SIZE as usize {
        return Err(Error::PayloadTooLarge(payload.len()));
    }

    stream.write_u32_le(token).await?;
    stream.write_u32_le(0).await?;
    stream.write_u32_le(payload.len() as u32).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one complete frame.
///
/// A clean EOF at a frame boundary (or mid-frame) maps to
/// [`Error::Disconnected`]; anything else that violates the frame shape is a
/// malformed response.
pub async fn read_frame<T: AsyncRead + Unpin>(stream: &mut T) -> Result<Frame> {
    let token = read_u32(stream).await?;
    let high = read_u32(stream).await?;
    if high != 0 {
        return Err(Error::MalformedResponse(format!(
            "nonzero token high word {high:#x}"
        )));
    }

    let len = read_u32(stream).await?;
    if len > MAX_MESSAGE_SIZE {
        return Err(Error::MalformedResponse(format!(
            "frame length {len} exceeds {MAX_MESSAGE_SIZE}"
        )));
    }

    let mut payload = vec![0u8; len as usize];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(map_read_err)?;

    Ok(Frame { token, payload })
}

async fn read_u32<T: AsyncRead + Unpin>(stream: &mut T) -> Result<u32> {
    stream.read_u32_le().await.map_err(map_read_err)
}

fn map_read_err(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::Disconnected
    } else {
        Error::Io(err)
    }
}

/// Write one null-terminated handshake message.
pub async fn write_handshake_message<T: AsyncWrite + Unpin>(
    stream: &mut T,
    message: &[u8],
) -> Result<()> {
    stream.write_all(message).await?;
    stream.write_u8(0).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one null-terminated handshake message (terminator stripped).
pub async fn read_handshake_message<T: AsyncRead + Unpin>(stream: &mut T) -> Result<Vec<u8>> {
    let mut message = Vec::new();
    loop {
        let byte = stream.read_u8().await.map_err(map_read_err)?;
        if byte == 0 {
            return Ok(message);
        }
        message.push(byte);
        if message.len() > MAX_HANDSHAKE_MESSAGE {
            return Err(Error::Handshake("handshake message too long".into()));
        }
    }
}
