//! Framed RESP connection to the store.

use super::StoreError;
use crate::protocols::resp::{parse, Frame, ParseResult};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// A byte stream that reads RESP frames and writes encoded requests.
///
/// `read_frame` only keeps state in the read buffer, so it is safe to use
/// as a `select!` branch.
pub struct RespConnection<S> {
    stream: S,
    buffer: BytesMut,
}

impl<S> RespConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
        }
    }

    /// Read the next frame, `None` on a clean EOF between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, StoreError> {
        loop {
            match parse(&self.buffer) {
                ParseResult::Complete(frame, consumed) => {
                    self.buffer.advance(consumed);
                    return Ok(Some(frame));
                }
                ParseResult::Incomplete => {}
                ParseResult::Error(e) => return Err(StoreError::Protocol(e)),
            }

            let n = self
                .stream
                .read_buf(&mut self.buffer)
                .await
                .map_err(|e| StoreError::ConnectionLost(e.to_string()))?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(StoreError::ConnectionLost(
                    "connection closed with incomplete frame".to_string(),
                ));
            }
        }
    }

    /// Write encoded request bytes and flush them.
    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        self.stream
            .write_all(bytes)
            .await
            .map_err(|e| StoreError::ConnectionLost(e.to_string()))?;
        self.stream
            .flush()
            .await
            .map_err(|e| StoreError::ConnectionLost(e.to_string()))
    }
}
