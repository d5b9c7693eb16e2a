//! Binary tunnel frames for raw byte streams (TCP/UDP)
//!
//! One frame travels as one binary message on the control channel:
//!
//! ```text
//! offset 0, 2 bytes  : connection id length N (big-endian u16)
//! offset 2, N bytes  : connection id, UTF-8
//! offset 2+N, rest   : payload
//! ```
//!
//! There is no payload length field; the enclosing transport message
//! delimits the frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the connection id length prefix
pub const ID_LEN_SIZE: usize = 2;

/// Decoded tunnel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub connection_id: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(connection_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            connection_id: connection_id.into(),
            payload: payload.into(),
        }
    }

    /// Encode this frame to bytes
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        encode(&self.connection_id, &self.payload)
    }

    /// Decode a frame from one transport message
    pub fn decode(buf: Bytes) -> Result<Self, FrameError> {
        decode(buf)
    }
}

/// Frame codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Incomplete frame")]
    Incomplete,

    #[error("Connection id too long: {0} bytes")]
    ConnectionIdTooLong(usize),

    #[error("Connection id is not valid UTF-8")]
    InvalidUtf8,

    #[error("Slice out of bounds: offset {offset}, length {length}, buffer {available}")]
    OutOfBounds {
        offset: usize,
        length: usize,
        available: usize,
    },
}

/// Encode a connection id and payload into one frame
pub fn encode(connection_id: &str, data: &[u8]) -> Result<Bytes, FrameError> {
    let id = connection_id.as_bytes();
    if id.len() > u16::MAX as usize {
        return Err(FrameError::ConnectionIdTooLong(id.len()));
    }

    let mut buf = BytesMut::with_capacity(ID_LEN_SIZE + id.len() + data.len());
    buf.put_u16(id.len() as u16);
    buf.put_slice(id);
    buf.put_slice(data);

    Ok(buf.freeze())
}

/// Encode `length` bytes of `data` starting at `offset`
pub fn encode_slice(
    connection_id: &str,
    data: &[u8],
    offset: usize,
    length: usize,
) -> Result<Bytes, FrameError> {
    let end = offset
        .checked_add(length)
        .filter(|end| *end <= data.len())
        .ok_or(FrameError::OutOfBounds {
            offset,
            length,
            available: data.len(),
        })?;

    encode(connection_id, &data[offset..end])
}

/// Decode one frame.
///
/// Returns [`FrameError::Incomplete`] when the buffer is shorter than the
/// length prefix or than the declared connection id. Since the transport
/// already delimits messages, callers treat this as a corrupt peer message
/// and drop it.
pub fn decode(mut buf: Bytes) -> Result<Frame, FrameError> {
    if buf.remaining() < ID_LEN_SIZE {
        return Err(FrameError::Incomplete);
    }

    let id_len = buf.get_u16() as usize;
    if buf.remaining() < id_len {
        return Err(FrameError::Incomplete);
    }

    let id = buf.split_to(id_len);
    let connection_id = std::str::from_utf8(&id)
        .map_err(|_| FrameError::InvalidUtf8)?
        .to_string();

    Ok(Frame {
        connection_id,
        payload: buf,
    })
}
