//! Putting sync messages on the wire
//!
//! Each [`Delivery`] class has its own shape and size limit. Reliable
//! messages (full states) are frames on an ordered byte stream:
//! `[u32 LE payload length][bincode payload]`. Unreliable messages (deltas,
//! acks) are one bincode payload per datagram. Limits are enforced when
//! encoding and again when decoding, before any length field is trusted.

use std::io;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::net::protocol::{self, DecodeError, EncodeError, MAX_DATAGRAM_SIZE, MAX_MESSAGE_SIZE};
use crate::net::server::Delivery;

impl Delivery {
    /// Largest encoded payload this delivery class carries
    pub const fn size_limit(self) -> usize {
        match self {
            Delivery::Reliable => MAX_MESSAGE_SIZE,
            Delivery::Unreliable => MAX_DATAGRAM_SIZE,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("Stream closed")]
    ConnectionClosed,
    #[error("{delivery:?} message of {len} bytes exceeds {limit}")]
    TooLarge {
        delivery: Delivery,
        len: usize,
        limit: usize,
    },
    #[error("{0}")]
    Encode(#[from] EncodeError),
    #[error("{0}")]
    Decode(#[from] DecodeError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Reject payloads `delivery` cannot carry
pub fn check_size(delivery: Delivery, len: usize) -> Result<(), FramingError> {
    let limit = delivery.size_limit();
    if len > limit {
        return Err(FramingError::TooLarge {
            delivery,
            len,
            limit,
        });
    }
    Ok(())
}

/// Encode one message for `delivery`, rejecting it if the class cannot carry it
pub fn encode_for<T: Serialize>(message: &T, delivery: Delivery) -> Result<Vec<u8>, FramingError> {
    let payload = protocol::encode(message)?;
    check_size(delivery, payload.len())?;
    Ok(payload)
}

/// Decode one received datagram
pub fn decode_datagram<T: DeserializeOwned>(datagram: &[u8]) -> Result<T, FramingError> {
    check_size(Delivery::Unreliable, datagram.len())?;
    Ok(protocol::decode_bounded::<T, MAX_DATAGRAM_SIZE>(datagram)?)
}

/// Encode `message` and write it as one frame. Returns the payload length.
pub async fn write_frame<W, T>(stream: &mut W, message: &T) -> Result<usize, FramingError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = encode_for(message, Delivery::Reliable)?;
    stream.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(payload.len())
}

/// Read and decode the next frame, returning the message and its payload length.
///
/// A payload that does not decode is still consumed whole, so after
/// [`FramingError::Decode`] the stream is positioned at the next frame.
/// Every other error leaves the stream unusable.
pub async fn read_frame<R, T>(stream: &mut R) -> Result<(T, usize), FramingError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    read_full(stream, &mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    check_size(Delivery::Reliable, len)?;

    let mut payload = vec![0u8; len];
    read_full(stream, &mut payload).await?;
    let message = protocol::decode(&payload)?;
    Ok((message, len))
}

async fn read_full<R: AsyncRead + Unpin>(stream: &mut R, buf: &mut [u8]) -> Result<(), FramingError> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FramingError::ConnectionClosed),
        Err(e) => Err(FramingError::Io(e)),
    }
}
