//! Length-prefixed framing over a byte stream.
//!
//! Every frame is a 4-byte big-endian payload length followed by the
//! payload. Both the router and remote peers go through [`FramedChannel`],
//! so the two directions are byte-identical by construction.
//!
//! A failed `send` or `receive` is logged here and returned as an
//! [`ChannelError`]; callers treat any error as "this connection is dead".

use log::{debug, error};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default ceiling on a single frame (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

const READ_CHUNK: usize = 8 * 1024;

/// Errors from the framing layer.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: u32 },
}

/// Prefix `payload` with its length.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, ChannelError> {
    let len = u32::try_from(payload.len()).map_err(|_| ChannelError::FrameTooLarge {
        size: payload.len(),
        max: u32::MAX,
    })?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

/// A bidirectional frame transport over one connection.
pub struct FramedChannel<S> {
    stream: S,
    peer: String,
    max_frame_size: u32,
    read_buf: Vec<u8>,
}

impl<S> FramedChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a connected stream. `peer` is only used in log lines.
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream,
            peer: peer.into(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buf: Vec::new(),
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write one frame. Returns once the whole frame is handed to the socket.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        match self.write_frame(payload).await {
            Ok(()) => {
                debug!("Sent {} bytes to {}", payload.len(), self.peer);
                Ok(())
            }
            Err(e) => {
                error!(
                    "Failed to send {} bytes to {}: {}",
                    payload.len(),
                    self.peer,
                    e
                );
                Err(e)
            }
        }
    }

    /// Read one whole frame, however the bytes arrive. Safe to cancel.
    pub async fn receive(&mut self) -> Result<Vec<u8>, ChannelError> {
        match self.read_frame().await {
            Ok(payload) => {
                debug!("Received {} bytes from {}", payload.len(), self.peer);
                Ok(payload)
            }
            Err(ChannelError::ConnectionClosed) => {
                debug!("Connection to {} closed", self.peer);
                Err(ChannelError::ConnectionClosed)
            }
            Err(e) => {
                error!("Failed to receive data from {}: {}", self.peer, e);
                Err(e)
            }
        }
    }

    /// Flush and shut down the write half. Errors are ignored: the
    /// connection is being discarded either way.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("Shutdown of {} failed: {}", self.peer, e);
        }
    }

    async fn write_frame(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        let bytes = encode_frame(payload)?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Cancel-safe: bytes already read stay buffered, so dropping a pending
    /// `receive` (in a `select!` or a timeout) never loses part of a frame.
    async fn read_frame(&mut self) -> Result<Vec<u8>, ChannelError> {
        loop {
            if let Some(payload) = self.take_buffered_frame()? {
                return Ok(payload);
            }
            self.read_buf.reserve(READ_CHUNK);
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                // A peer that hangs up mid-frame is still just a closed connection.
                return Err(ChannelError::ConnectionClosed);
            }
        }
    }

    fn take_buffered_frame(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        if self.read_buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.read_buf[..HEADER_LEN]);
        let len = u32::from_be_bytes(header);
        if len > self.max_frame_size {
            return Err(ChannelError::FrameTooLarge {
                size: len as usize,
                max: self.max_frame_size,
            });
        }

        let end = HEADER_LEN + len as usize;
        if self.read_buf.len() < end {
            return Ok(None);
        }
        let payload = self.read_buf[HEADER_LEN..end].to_vec();
        self.read_buf.drain(..end);
        Ok(Some(payload))
    }
}
