//! Length-prefixed message framing.
//!
//! Every frame is a 4-byte big-endian payload length followed by that many
//! bytes of UTF-8 JSON.  The reader consumes the full header and payload
//! before parsing; partial reads block.  Framing violations are fatal for
//! the connection.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Message, error_codes};

/// Hard payload cap: 16 MiB.  A frame of exactly this size is accepted;
/// one byte more is rejected.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte cap")]
    PayloadTooLarge { len: usize },
    #[error("zero-length frame")]
    EmptyFrame,
    #[error("malformed JSON payload: {0}")]
    MalformedJson(#[from] serde_json::Error),
}

impl FrameError {
    /// Wire error code reported to the peer before the connection closes.
    pub fn code(&self) -> &'static str {
        match self {
            FrameError::Io(_) | FrameError::EmptyFrame => error_codes::PROTOCOL_ERROR,
            FrameError::PayloadTooLarge { .. } => error_codes::PAYLOAD_TOO_LARGE,
            FrameError::MalformedJson(_) => error_codes::MALFORMED_JSON,
        }
    }
}

/// Reading half of a framed connection.  Exactly one reader per direction.
pub struct FramedReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next complete frame.
    ///
    /// Returns `Ok(None)` when the peer closes the connection cleanly at a
    /// frame boundary.  EOF inside a frame is an I/O error.
    pub async fn read_frame(&mut self) -> Result<Option<Message>, FrameError> {
        let mut header = [0u8; 4];
        let mut filled = 0;
        while filled < header.len() {
            let n = self.inner.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(FrameError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-header",
                )));
            }
            filled += n;
        }

        let len = u32::from_be_bytes(header) as usize;
        if len == 0 {
            return Err(FrameError::EmptyFrame);
        }
        if len > MAX_FRAME_LEN {
            return Err(FrameError::PayloadTooLarge { len });
        }

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await?;
        let msg = serde_json::from_slice(&payload)?;
        Ok(Some(msg))
    }
}

/// Writing half of a framed connection.  Exactly one writer per direction;
/// callers serialize writes through a single owner task.
pub struct FramedWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encode and write one frame, flushing before returning.
    pub async fn write_frame(&mut self, msg: &Message) -> Result<(), FrameError> {
        let payload = serde_json::to_vec(msg)?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(FrameError::PayloadTooLarge {
                len: payload.len(),
            });
        }
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush and shut down the underlying stream.
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
