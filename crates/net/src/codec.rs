//! Binary frame encoding/decoding
//!
//! Frame format (multi-byte fields big-endian):
//! ```text
//! +--------+--------------+--------+---------+----------+-----------+
//! | magic  | total length | kind   | version | sequence | payload   |
//! | 4      | 4            | 2      | 2       | 4        | variable  |
//! +--------+--------------+--------+---------+----------+-----------+
//! ```
//!
//! `total length` counts the header too. The decoder accumulates partial
//! reads and validates the header before it reserves room for a payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::protocol::{Message, MessageKind};

/// Stream alignment marker ("SAVI")
pub const MAGIC: u32 = 0x5341_5649;

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Protocol version written into every frame
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum payload size accepted by default (64KB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub total_length: u32,
    pub kind: u16,
    pub version: u16,
    pub sequence: u32,
}

impl FrameHeader {
    /// Parse a header from the first `HEADER_SIZE` bytes of `buf`
    fn parse(buf: &[u8]) -> Self {
        let mut cursor = &buf[..HEADER_SIZE];
        Self {
            magic: cursor.get_u32(),
            total_length: cursor.get_u32(),
            kind: cursor.get_u16(),
            version: cursor.get_u16(),
            sequence: cursor.get_u32(),
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.magic);
        buf.put_u32(self.total_length);
        buf.put_u16(self.kind);
        buf.put_u16(self.version);
        buf.put_u32(self.sequence);
    }
}

/// A serialized message body waiting for a header.
///
/// Cloning is cheap, so a room broadcast is serialized once and the same
/// `Outbound` is queued on every member session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub kind: MessageKind,
    pub payload: Bytes,
}

impl Outbound {
    pub fn from_message(msg: &Message) -> Result<Self> {
        Ok(Self {
            kind: msg.kind(),
            payload: msg.to_payload()?,
        })
    }

    /// Size of this frame on the wire
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Write header and payload into `buf`
    pub fn encode(&self, sequence: u32, buf: &mut BytesMut) {
        buf.reserve(self.encoded_size());
        FrameHeader {
            magic: MAGIC,
            total_length: self.encoded_size() as u32,
            kind: self.kind.code(),
            version: PROTOCOL_VERSION,
            sequence,
        }
        .write(buf);
        buf.put_slice(&self.payload);
    }

    /// Encode into a standalone buffer
    pub fn to_bytes(&self, sequence: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode(sequence, &mut buf);
        buf.freeze()
    }
}

/// A decoded message together with the sequence number it arrived with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub sequence: u32,
    pub message: Message,
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    AwaitingHeader,
    AwaitingPayload {
        kind: MessageKind,
        sequence: u32,
        len: usize,
    },
}

/// Streaming frame codec, one per connection.
///
/// Decoding keeps the header of a partially received frame so payload
/// bytes can trickle in over many reads. Encoding stamps a per-connection
/// sequence number starting at 1.
#[derive(Debug)]
pub struct FrameCodec {
    state: DecodeState,
    max_frame_size: usize,
    next_sequence: u32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            state: DecodeState::AwaitingHeader,
            max_frame_size,
            next_sequence: 1,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn take_sequence(&mut self) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence = sequence.checked_add(1).unwrap_or(1);
        sequence
    }

    /// Validate and consume a header. Returns None until 16 bytes are buffered.
    fn decode_header(&self, src: &mut BytesMut) -> Result<Option<(MessageKind, u32, usize)>> {
        if src.len() < HEADER_SIZE {
            src.reserve(HEADER_SIZE - src.len());
            return Ok(None);
        }

        let header = FrameHeader::parse(src);
        if header.magic != MAGIC {
            return Err(Error::Framing(header.magic));
        }
        if header.version != PROTOCOL_VERSION {
            return Err(Error::UnsupportedVersion(header.version));
        }
        let total = header.total_length as usize;
        if total < HEADER_SIZE {
            return Err(Error::TruncatedFrame(header.total_length));
        }

        // Reject before allocating anything for the payload
        let len = total - HEADER_SIZE;
        if len > self.max_frame_size {
            return Err(Error::OversizedFrame {
                size: len,
                max: self.max_frame_size,
            });
        }

        let kind =
            MessageKind::from_u16(header.kind).ok_or(Error::UnknownMessageKind(header.kind))?;

        src.advance(HEADER_SIZE);
        src.reserve(len);
        Ok(Some((kind, header.sequence, len)))
    }
}

impl Decoder for FrameCodec {
    type Item = Inbound;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>> {
        let (kind, sequence, len) = match self.state {
            DecodeState::AwaitingHeader => match self.decode_header(src)? {
                Some(header) => header,
                None => return Ok(None),
            },
            DecodeState::AwaitingPayload {
                kind,
                sequence,
                len,
            } => (kind, sequence, len),
        };

        if src.len() < len {
            self.state = DecodeState::AwaitingPayload {
                kind,
                sequence,
                len,
            };
            return Ok(None);
        }

        let payload = src.split_to(len);
        self.state = DecodeState::AwaitingHeader;

        let message = Message::from_payload(kind, &payload)?;
        Ok(Some(Inbound { sequence, message }))
    }
}

impl Encoder<Outbound> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<()> {
        if item.payload.len() > self.max_frame_size {
            return Err(Error::OversizedFrame {
                size: item.payload.len(),
                max: self.max_frame_size,
            });
        }
        let sequence = self.take_sequence();
        item.encode(sequence, dst);
        Ok(())
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let outbound = Outbound::from_message(&item)?;
        Encoder::<Outbound>::encode(self, outbound, dst)
    }
}
