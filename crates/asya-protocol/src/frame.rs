// SPDX-License-Identifier: MIT OR Apache-2.0
//! Length-prefixed frame I/O.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default frame body cap: 10 MiB.
pub const DEFAULT_MAX_FRAME: usize = 10 * 1024 * 1024;

/// Errors from frame reads and writes.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Underlying socket I/O failure.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream before a full frame arrived.
    #[error("stream closed mid-frame")]
    Eof,

    /// Declared or actual body length exceeded the configured cap.
    #[error("frame of {len} bytes exceeds cap of {max}")]
    TooLarge {
        /// Declared body length.
        len: usize,
        /// Configured cap.
        max: usize,
    },
}

/// Write one frame: 4-byte big-endian unsigned length, then the body.
///
/// The cap is enforced before anything touches the wire so an oversized
/// body never leaves a half-written frame behind.
pub async fn write_frame<W>(writer: &mut W, body: &[u8], max: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > max {
        return Err(FrameError::TooLarge {
            len: body.len(),
            max,
        });
    }
    let len = u32::try_from(body.len()).map_err(|_| FrameError::TooLarge {
        len: body.len(),
        max,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, enforcing the cap against the declared length.
///
/// Reads are exact-length; a short read is [`FrameError::Eof`], never a
/// truncated body.
pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    read_exact_or_eof(reader, &mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max {
        return Err(FrameError::TooLarge { len, max });
    }
    let mut body = vec![0u8; len];
    read_exact_or_eof(reader, &mut body).await?;
    Ok(body)
}

async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FrameError::Eof),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn roundtrip_simple_body() {
        let mut buf = Vec::new();
        write_frame(&mut buf, br#"{"n":1}"#, DEFAULT_MAX_FRAME)
            .await
            .unwrap();
        assert_eq!(&buf[..4], &7u32.to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        let body = read_frame(&mut cursor, DEFAULT_MAX_FRAME).await.unwrap();
        assert_eq!(body, br#"{"n":1}"#);
    }

    #[tokio::test]
    async fn empty_body_roundtrips() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"", DEFAULT_MAX_FRAME).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let body = read_frame(&mut cursor, DEFAULT_MAX_FRAME).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn write_rejects_body_over_cap() {
        let mut buf = Vec::new();
        let err = write_frame(&mut buf, &[0u8; 17], 16).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { len: 17, max: 16 }));
        assert!(buf.is_empty(), "nothing may reach the wire");
    }

    #[tokio::test]
    async fn body_exactly_at_cap_succeeds() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[7u8; 16], 16).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let body = read_frame(&mut cursor, 16).await.unwrap();
        assert_eq!(body.len(), 16);
    }

    #[tokio::test]
    async fn read_rejects_declared_length_over_cap() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1024u32.to_be_bytes());
        raw.extend_from_slice(&[0u8; 1024]);
        let mut cursor = std::io::Cursor::new(raw);
        let err = read_frame(&mut cursor, 16).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { len: 1024, max: 16 }));
    }

    #[tokio::test]
    async fn truncated_header_is_eof() {
        let mut cursor = std::io::Cursor::new(vec![0u8, 0]);
        let err = read_frame(&mut cursor, DEFAULT_MAX_FRAME).await.unwrap_err();
        assert!(matches!(err, FrameError::Eof));
    }

    #[tokio::test]
    async fn truncated_body_is_eof() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&8u32.to_be_bytes());
        raw.extend_from_slice(b"abc");
        let mut cursor = std::io::Cursor::new(raw);
        let err = read_frame(&mut cursor, DEFAULT_MAX_FRAME).await.unwrap_err();
        assert!(matches!(err, FrameError::Eof));
    }

    #[tokio::test]
    async fn back_to_back_frames_read_in_order() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"first", DEFAULT_MAX_FRAME).await.unwrap();
        write_frame(&mut buf, b"second", DEFAULT_MAX_FRAME).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(
            read_frame(&mut cursor, DEFAULT_MAX_FRAME).await.unwrap(),
            b"first"
        );
        assert_eq!(
            read_frame(&mut cursor, DEFAULT_MAX_FRAME).await.unwrap(),
            b"second"
        );
    }

    proptest! {
        #[test]
        fn any_body_roundtrips_byte_for_byte(body in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let mut buf = Vec::new();
                write_frame(&mut buf, &body, DEFAULT_MAX_FRAME).await.unwrap();
                let mut cursor = std::io::Cursor::new(buf);
                let back = read_frame(&mut cursor, DEFAULT_MAX_FRAME).await.unwrap();
                prop_assert_eq!(back, body);
                Ok(())
            })?;
        }
    }
}
