//! Protocol definitions for client-broker communication
//!
//! Messages are MessagePack encoded, each frame prefixed with its length as a
//! big-endian u32.

mod message;

pub use message::{ClientMessage, ServerMessage};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted frame payload (10 MB)
pub const MAX_MESSAGE_SIZE: u32 = 10 * 1024 * 1024;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Protocol version mismatch: client={client}, server={server}")]
    VersionMismatch { client: u32, server: u32 },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: u32, max: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Serialize a message to MessagePack bytes
pub fn serialize<T: Serialize>(msg: &T) -> ProtocolResult<Vec<u8>> {
    rmp_serde::to_vec(msg).map_err(|e| ProtocolError::MalformedMessage(e.to_string()))
}

/// Deserialize a message from MessagePack bytes
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    rmp_serde::from_slice(bytes)
        .map_err(|e| ProtocolError::MalformedMessage(format!("Failed to deserialize: {}", e)))
}

/// Frame a payload with its length prefix
///
/// Frame format: [4-byte length BE][payload]
pub fn frame_message(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Split one frame off the front of `buffer`
///
/// Returns (payload, remaining_bytes), or None if the frame is incomplete
pub fn unframe_message(buffer: &[u8]) -> ProtocolResult<Option<(Vec<u8>, &[u8])>> {
    let Some(prefix) = buffer.get(..4) else {
        return Ok(None);
    };
    let mut length_bytes = [0u8; 4];
    length_bytes.copy_from_slice(prefix);
    let message_length = check_size(u32::from_be_bytes(length_bytes))?;

    let total_length = 4 + message_length as usize;
    if buffer.len() < total_length {
        return Ok(None);
    }
    Ok(Some((buffer[4..total_length].to_vec(), &buffer[total_length..])))
}

fn check_size(size: u32) -> ProtocolResult<u32> {
    if size > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(size)
}

/// Check if client and broker protocol versions are compatible
pub fn check_version_compatibility(client_version: u32, server_version: u32) -> ProtocolResult<()> {
    if client_version != server_version {
        return Err(ProtocolError::VersionMismatch {
            client: client_version,
            server: server_version,
        });
    }
    Ok(())
}

/// Read one frame from a stream.
///
/// Returns None when the peer closed the stream between frames.
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> ProtocolResult<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = check_size(u32::from_be_bytes(len_bytes))? as usize;
    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer).await?;
    Ok(Some(buffer))
}

/// Serialize, frame and write one message
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> ProtocolResult<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let framed = frame_message(&serialize(msg)?);
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and deserialize one message
pub async fn read_typed<R, T>(reader: &mut R) -> ProtocolResult<Option<T>>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    match read_frame(reader).await? {
        Some(bytes) => deserialize(&bytes).map(Some),
        None => Ok(None),
    }
}
