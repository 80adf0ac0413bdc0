//! Frame codec for the executor wire protocol.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────┬────────────────────────┐
//! │ len (4B) │ kind(1B) │   msgpack payload      │
//! │ u32 BE   │ u8       │                        │
//! └──────────┴──────────┴────────────────────────┘
//! ```
//! The length counts the kind byte and the payload, not the prefix itself.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::types::{Error, Result};

/// Frame kind: envelope travelling from the initiator to the executor.
pub const FRAME_TO_EXECUTOR: u8 = 0x01;
/// Frame kind: envelope travelling from the executor back to the initiator.
pub const FRAME_FROM_EXECUTOR: u8 = 0x02;

fn invalid(msg: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

/// Read one frame as `(kind, payload)`.
///
/// `Ok(None)` means the peer closed the stream between frames. A length
/// above `max_frame_bytes` or without room for the kind byte is `InvalidData`.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let frame_len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };

    match frame_len {
        0 => return Err(invalid("frame has no kind byte".to_string())),
        len if len > max_frame_bytes => {
            return Err(invalid(format!(
                "frame of {} bytes exceeds limit of {}",
                len, max_frame_bytes
            )))
        }
        _ => {}
    }

    let kind = reader.read_u8().await?;
    let mut payload = vec![0u8; (frame_len - 1) as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some((kind, payload)))
}

/// Write one frame and flush it.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    kind: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let frame_len = u32::try_from(payload.len() + 1)
        .map_err(|_| invalid(format!("payload of {} bytes cannot be framed", payload.len())))?;
    let mut header = [0u8; 5];
    header[..4].copy_from_slice(&frame_len.to_be_bytes());
    header[4] = kind;
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Encode an envelope as named msgpack.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| {
        tracing::error!("envelope_encode_failed: {}", e);
        Error::codec(e.to_string())
    })
}

/// Decode an envelope from msgpack.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    rmp_serde::from_slice(payload).map_err(|e| Error::codec(format!("undecodable envelope: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FRAME_TO_EXECUTOR, b"hello").await.unwrap();
        assert_eq!(&buf[..4], &6u32.to_be_bytes());

        let mut cursor = Cursor::new(buf);
        let (kind, payload) = read_frame(&mut cursor, 1024).await.unwrap().unwrap();
        assert_eq!(kind, FRAME_TO_EXECUTOR);
        assert_eq!(payload, b"hello");

        // Nothing left: clean EOF
        assert!(read_frame(&mut cursor, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FRAME_FROM_EXECUTOR, &[0u8; 64]).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor, 16).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_zero_length_frame_rejected() {
        let mut cursor = Cursor::new(0u32.to_be_bytes().to_vec());
        let err = read_frame(&mut cursor, 16).await.unwrap_err();
        assert!(err.to_string().contains("no kind byte"));
    }

    #[test]
    fn test_decode_garbage_is_codec_error() {
        let err = decode::<serde_json::Value>(&[0xc1]).unwrap_err();
        assert_eq!(err.code(), "CodecError");
    }
}
