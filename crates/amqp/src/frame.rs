use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::DEFAULT_MAX_FRAME_SIZE;

const HEADER_LEN: usize = 8;
const PROTOCOL_HEADER: &[u8; 4] = b"AMQP";

/// Layer announced by an 8-byte protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolId {
    Amqp,
    Sasl,
}

impl ProtocolId {
    fn id(self) -> u8 {
        match self {
            ProtocolId::Amqp => 0,
            ProtocolId::Sasl => 3,
        }
    }

    pub fn header(self) -> [u8; 8] {
        [b'A', b'M', b'Q', b'P', self.id(), 1, 0, 0]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Amqp,
    Sasl,
}

/// A raw frame. An AMQP frame with an empty body is a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub channel: u16,
    pub body: Bytes,
}

impl Frame {
    pub fn amqp(channel: u16, body: Bytes) -> Self {
        Self {
            frame_type: FrameType::Amqp,
            channel,
            body,
        }
    }

    pub fn sasl(body: Bytes) -> Self {
        Self {
            frame_type: FrameType::Sasl,
            channel: 0,
            body,
        }
    }

    pub fn heartbeat() -> Self {
        Self::amqp(0, Bytes::new())
    }

    pub fn is_heartbeat(&self) -> bool {
        self.frame_type == FrameType::Amqp && self.body.is_empty()
    }
}

/// Unit read from or written to the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wire {
    Header(ProtocolId),
    Frame(Frame),
}

/// Codec for protocol headers and frames on one byte stream.
///
/// A frame size field can never start with `AMQP` below the frame size
/// limit, so headers and frames are told apart by their first four bytes.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE as usize,
        }
    }

    pub fn with_max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size as usize;
        self
    }

    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size as usize;
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Encoder<Wire> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Wire, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Wire::Header(id) => dst.extend_from_slice(&id.header()),
            Wire::Frame(frame) => {
                let size = HEADER_LEN + frame.body.len();
                if size > u32::MAX as usize {
                    return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame too large"));
                }
                dst.reserve(size);
                dst.put_u32(size as u32);
                dst.put_u8(2);
                dst.put_u8(match frame.frame_type {
                    FrameType::Amqp => 0,
                    FrameType::Sasl => 1,
                });
                dst.put_u16(frame.channel);
                dst.extend_from_slice(&frame.body);
            }
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Wire;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        if &src[..4] == PROTOCOL_HEADER {
            let id = match (src[4], src[5], src[6], src[7]) {
                (0, 1, 0, 0) => ProtocolId::Amqp,
                (3, 1, 0, 0) => ProtocolId::Sasl,
                (id, major, minor, revision) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unsupported protocol header {id} {major}.{minor}.{revision}"),
                    ))
                }
            };
            src.advance(HEADER_LEN);
            return Ok(Some(Wire::Header(id)));
        }

        let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        let doff = src[4] as usize * 4;
        if size > self.max_frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame too large: {size} > {}", self.max_frame_size),
            ));
        }
        if doff < HEADER_LEN || size < doff {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad frame layout (size {size}, data offset {doff})"),
            ));
        }
        let frame_type = match src[5] {
            0 => FrameType::Amqp,
            1 => FrameType::Sasl,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown frame type {other}"),
                ))
            }
        };
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        let channel = u16::from_be_bytes([src[6], src[7]]);
        let mut raw = src.split_to(size);
        raw.advance(doff);
        Ok(Some(Wire::Frame(Frame {
            frame_type,
            channel,
            body: raw.freeze(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_then_frame_in_one_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Wire::Header(ProtocolId::Sasl), &mut buf).unwrap();
        codec
            .encode(Wire::Frame(Frame::sasl(Bytes::from_static(&[0x00, 0x53, 0x40, 0x45]))), &mut buf)
            .unwrap();

        assert_eq!(&buf[..8], b"AMQP\x03\x01\x00\x00");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Wire::Header(ProtocolId::Sasl)));
        match codec.decode(&mut buf).unwrap() {
            Some(Wire::Frame(frame)) => {
                assert_eq!(frame.frame_type, FrameType::Sasl);
                assert_eq!(frame.body.as_ref(), &[0x00, 0x53, 0x40, 0x45]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = FrameCodec::new();
        let mut full = BytesMut::new();
        codec
            .encode(Wire::Frame(Frame::amqp(3, Bytes::from_static(b"payload"))), &mut full)
            .unwrap();

        let mut partial = BytesMut::from(&full[..10]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        partial.extend_from_slice(&full[10..]);
        match codec.decode(&mut partial).unwrap() {
            Some(Wire::Frame(frame)) => {
                assert_eq!(frame.channel, 3);
                assert_eq!(frame.body.as_ref(), b"payload");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_heartbeat() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Wire::Frame(Frame::heartbeat()), &mut buf).unwrap();
        assert_eq!(buf.len(), 8);
        match codec.decode(&mut buf).unwrap() {
            Some(Wire::Frame(frame)) => assert!(frame.is_heartbeat()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::new().with_max_frame_size(512);
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        buf.put_u8(2);
        buf.put_u8(0);
        buf.put_u16(0);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_bad_data_offset_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(16);
        buf.put_u8(1);
        buf.put_u8(0);
        buf.put_u16(0);
        assert!(codec.decode(&mut buf).is_err());
    }
}
