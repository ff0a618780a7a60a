//! Frame codec for the control and feed sockets.
//!
//! Every message crosses the socket as `u32 length | u32 crc32 | body`
//! (little-endian header, JSON body). The checksum covers the body bytes;
//! a mismatch poisons the session and the connection is dropped rather
//! than resynchronized.

use std::io;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while framing or unframing socket messages.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("timeout during socket operation")]
    Timeout,

    #[error("frame too large: {size} bytes (max: {max_size})")]
    TooLarge { size: usize, max_size: usize },

    #[error("crc32 mismatch: expected {expected:08x}, got {actual:08x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid frame length: {length}")]
    InvalidLength { length: u32 },

    #[error("peer connection closed")]
    PeerClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Codec bound to a maximum frame size.
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    /// Creates a codec rejecting frames larger than `max_frame_len` bytes.
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// Writes one framed message, bounded by `write_timeout`.
    pub async fn write_frame<T, W>(
        &self,
        writer: &mut W,
        message: &T,
        write_timeout: Duration,
    ) -> CodecResult<()>
    where
        T: Serialize,
        W: AsyncWrite + Unpin,
    {
        let body = serde_json::to_vec(message)?;
        if body.is_empty() {
            return Err(CodecError::InvalidLength { length: 0 });
        }
        if body.len() > self.max_frame_len {
            return Err(CodecError::TooLarge {
                size: body.len(),
                max_size: self.max_frame_len,
            });
        }

        let mut frame = Vec::with_capacity(8 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&checksum(&body).to_le_bytes());
        frame.extend_from_slice(&body);

        timeout(write_timeout, async {
            writer.write_all(&frame).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| CodecError::Timeout)?
        .map_err(CodecError::Io)
    }

    /// Reads one framed message.
    ///
    /// With `read_timeout` of `None` the read blocks until a frame arrives
    /// or the peer hangs up; control sessions sit idle between commands, so
    /// that is the normal server-side mode.
    pub async fn read_frame<T, R>(
        &self,
        reader: &mut R,
        read_timeout: Option<Duration>,
    ) -> CodecResult<T>
    where
        T: DeserializeOwned,
        R: AsyncRead + Unpin,
    {
        match read_timeout {
            Some(window) => timeout(window, self.read_frame_inner(reader))
                .await
                .map_err(|_| CodecError::Timeout)?,
            None => self.read_frame_inner(reader).await,
        }
    }

    async fn read_frame_inner<T, R>(&self, reader: &mut R) -> CodecResult<T>
    where
        T: DeserializeOwned,
        R: AsyncRead + Unpin,
    {
        let mut header = [0_u8; 8];
        if let Err(e) = reader.read_exact(&mut header).await {
            return Err(if e.kind() == io::ErrorKind::UnexpectedEof {
                CodecError::PeerClosed
            } else {
                CodecError::Io(e)
            });
        }

        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if length == 0 {
            return Err(CodecError::InvalidLength { length });
        }
        if length as usize > self.max_frame_len {
            return Err(CodecError::TooLarge {
                size: length as usize,
                max_size: self.max_frame_len,
            });
        }

        let mut body = vec![0_u8; length as usize];
        reader.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                CodecError::PeerClosed
            } else {
                CodecError::Io(e)
            }
        })?;

        let actual_crc = checksum(&body);
        if actual_crc != expected_crc {
            return Err(CodecError::CrcMismatch {
                expected: expected_crc,
                actual: actual_crc,
            });
        }

        Ok(serde_json::from_slice(&body)?)
    }
}

fn checksum(body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Cursor;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
        tag: String,
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let codec = FrameCodec::new(4096);
        let mut buf = Vec::new();
        let msg = Ping {
            seq: 7,
            tag: "hello".to_owned(),
        };
        codec
            .write_frame(&mut buf, &msg, Duration::from_secs(1))
            .await
            .expect("write");

        let mut cursor = Cursor::new(buf);
        let back: Ping = codec
            .read_frame(&mut cursor, Some(Duration::from_secs(1)))
            .await
            .expect("read");
        assert_eq!(back, msg);
    }

    #[tokio::test]
    async fn test_corrupted_body_is_rejected() {
        let codec = FrameCodec::new(4096);
        let mut buf = Vec::new();
        codec
            .write_frame(
                &mut buf,
                &Ping {
                    seq: 1,
                    tag: "x".to_owned(),
                },
                Duration::from_secs(1),
            )
            .await
            .expect("write");

        // Flip a byte in the body; the checksum no longer matches.
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        let mut cursor = Cursor::new(buf);
        let result: CodecResult<Ping> = codec
            .read_frame(&mut cursor, Some(Duration::from_secs(1)))
            .await;
        assert!(matches!(result, Err(CodecError::CrcMismatch { .. })));
    }

    #[tokio::test]
    async fn test_oversized_frames_are_refused_both_ways() {
        let codec = FrameCodec::new(16);
        let mut buf = Vec::new();
        let big = Ping {
            seq: 1,
            tag: "long-enough-to-overflow-the-limit".to_owned(),
        };
        let written = codec.write_frame(&mut buf, &big, Duration::from_secs(1)).await;
        assert!(matches!(written, Err(CodecError::TooLarge { .. })));

        // A forged header advertising a huge body is refused before reading it.
        let mut forged = Vec::new();
        forged.extend_from_slice(&1_000_000_u32.to_le_bytes());
        forged.extend_from_slice(&0_u32.to_le_bytes());
        let mut cursor = Cursor::new(forged);
        let result: CodecResult<Ping> = codec
            .read_frame(&mut cursor, Some(Duration::from_secs(1)))
            .await;
        assert!(matches!(result, Err(CodecError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn test_eof_maps_to_peer_closed() {
        let codec = FrameCodec::new(4096);
        let mut cursor = Cursor::new(Vec::new());
        let result: CodecResult<Ping> = codec.read_frame(&mut cursor, None).await;
        assert!(matches!(result, Err(CodecError::PeerClosed)));
    }
}
