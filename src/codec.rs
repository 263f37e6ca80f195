//! Binary frame codec.
//!
//! Every frame on the wire is a fixed 8-byte header followed by the payload:
//!
//! ```text
//! +----------------+----------------+------------------------+
//! | data_len (u32) | msg_id (u32)   | payload (data_len B)   |
//! +----------------+----------------+------------------------+
//!   little-endian    little-endian
//! ```
//!
//! Decoding is always two reads: exactly one header, then exactly
//! `data_len` bytes of body. Frame boundaries are never inferred from
//! whatever a single socket read happened to return.

use crate::error::{ProtocolError, Result};
use crate::message::Message;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Header length of the default codec.
pub const HEADER_LEN: usize = 8;

/// Upper bound on the body buffer reserved before any body bytes arrive.
const BODY_PREALLOC: usize = 64 * 1024;

/// Parsed frame header. The body has not been read yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub data_len: u32,
    pub msg_id: u32,
}

/// Packs messages into frames and parses frame headers.
///
/// [`DataPack`] is the default; servers can install another implementation
/// through [`Server::with_packet`](crate::Server::with_packet).
pub trait Packet: Send + Sync + 'static {
    /// Number of bytes in a frame header.
    fn header_len(&self) -> usize;

    /// Encode a whole frame (header and payload).
    fn pack(&self, msg: &Message) -> Result<Bytes>;

    /// Parse a header read off the wire.
    ///
    /// Must reject oversize payloads here, before any body bytes are read.
    fn unpack(&self, header: &[u8]) -> Result<FrameHeader>;
}

/// Length-prefixed codec with an optional payload ceiling.
#[derive(Debug, Clone, Copy)]
pub struct DataPack {
    /// Largest accepted payload; 0 disables the check.
    max_packet_size: u32,
}

impl DataPack {
    pub fn new(max_packet_size: u32) -> Self {
        Self { max_packet_size }
    }

    pub fn max_packet_size(&self) -> u32 {
        self.max_packet_size
    }
}

impl Packet for DataPack {
    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn pack(&self, msg: &Message) -> Result<Bytes> {
        let length = u32::try_from(msg.data_len()).map_err(|_| ProtocolError::PayloadTooLarge {
            length: msg.data_len(),
        })?;

        let mut frame = BytesMut::with_capacity(HEADER_LEN + msg.data_len());
        frame.put_u32_le(length);
        frame.put_u32_le(msg.msg_id());
        frame.extend_from_slice(msg.data());
        Ok(frame.freeze())
    }

    fn unpack(&self, header: &[u8]) -> Result<FrameHeader> {
        if header.len() < HEADER_LEN {
            return Err(ProtocolError::ShortHeader {
                expected: HEADER_LEN,
                actual: header.len(),
            }
            .into());
        }

        let mut buf = header;
        let data_len = buf.get_u32_le();
        let msg_id = buf.get_u32_le();

        if self.max_packet_size > 0 && data_len > self.max_packet_size {
            return Err(ProtocolError::Oversize {
                length: data_len,
                max: self.max_packet_size,
            }
            .into());
        }

        Ok(FrameHeader { data_len, msg_id })
    }
}

/// Read exactly one message from `reader`.
///
/// Reads the header, validates it, then reads the body in a second,
/// separate read of exactly `data_len` bytes.
pub async fn read_message<R>(packet: &dyn Packet, reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = vec![0u8; packet.header_len()];
    reader.read_exact(&mut header).await?;
    let head = packet.unpack(&header)?;

    // Allocate as the body arrives; the declared length is not trusted.
    let len = head.data_len as usize;
    let mut body = BytesMut::with_capacity(len.min(BODY_PREALLOC));
    let mut limited = (&mut *reader).take(u64::from(head.data_len));
    while body.len() < len {
        if limited.read_buf(&mut body).await? == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
    }

    Ok(Message::new(head.msg_id, body.freeze()))
}
