// Copyright 2020 Joyent, Inc.

//! The frame envelope and its codec.

use bytes::{BufMut, Bytes, BytesMut};
use byteorder::{BigEndian, ByteOrder};
use num::FromPrimitive;
use num_derive::{FromPrimitive, ToPrimitive};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

const FR_OFF_SIZE: usize = 0x0;
const FR_OFF_TYPE: usize = 0x2;
const FR_OFF_ID: usize = 0x4;
const FR_OFF_PAYLOAD: usize = 0x10;

pub const FRAME_HEADER_SIZE: usize = FR_OFF_PAYLOAD;
pub const MAX_FRAME_SIZE: usize = 0xffff;
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - FRAME_HEADER_SIZE;

/// Frame id used by the init handshake.
pub const INIT_FRAME_ID: u32 = 0;
/// Frame id used for error frames that belong to no operation.
pub const CONNECTION_FRAME_ID: u32 = 0xffff_ffff;

/// Bit 0 of a call frame's flags: more fragments follow.
pub const FLAG_MORE_FRAGMENTS: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum FrameType {
    InitRequest = 0x01,
    InitResponse = 0x02,
    CallRequest = 0x03,
    CallResponse = 0x04,
    CallRequestContinue = 0x13,
    CallResponseContinue = 0x14,
    Cancel = 0xc0,
    Claim = 0xc1,
    PingRequest = 0xd0,
    PingResponse = 0xd1,
    Error = 0xff,
}

impl FrameType {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Frame types whose payload begins with a fragment flags byte.
    pub fn is_call(self) -> bool {
        matches!(
            self,
            FrameType::CallRequest
                | FrameType::CallResponse
                | FrameType::CallRequestContinue
                | FrameType::CallResponseContinue
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(id: u32, frame_type: FrameType, payload: Bytes) -> Frame {
        Frame {
            id,
            frame_type,
            payload,
        }
    }

    pub fn empty(id: u32, frame_type: FrameType) -> Frame {
        Frame::new(id, frame_type, Bytes::new())
    }

    /// The same frame under another id.
    pub fn with_id(&self, id: u32) -> Frame {
        Frame {
            id,
            frame_type: self.frame_type,
            payload: self.payload.clone(),
        }
    }

    pub fn size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// True when this is a call fragment with the more-fragments flag set.
    pub fn has_more_fragments(&self) -> bool {
        self.frame_type.is_call()
            && self
                .payload
                .first()
                .map_or(false, |flags| flags & FLAG_MORE_FRAGMENTS != 0)
    }
}

#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if buf.len() < FR_OFF_TYPE {
            return Ok(None);
        }

        let size =
            BigEndian::read_u16(&buf[FR_OFF_SIZE..FR_OFF_TYPE]) as usize;
        if size < FRAME_HEADER_SIZE {
            return Err(Error::FrameTooSmall(size));
        }
        if buf.len() < size {
            buf.reserve(size - buf.len());
            return Ok(None);
        }

        let raw = buf.split_to(size).freeze();
        let type_byte = raw[FR_OFF_TYPE];
        let frame_type = FromPrimitive::from_u8(type_byte)
            .ok_or(Error::UnknownFrameType(type_byte))?;
        let id = BigEndian::read_u32(&raw[FR_OFF_ID..FR_OFF_ID + 4]);

        Ok(Some(Frame {
            id,
            frame_type,
            payload: raw.slice(FR_OFF_PAYLOAD..),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<(), Error> {
        let size = frame.size();
        if size > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge(size));
        }

        buf.reserve(size);
        buf.put_u16(size as u16);
        buf.put_u8(frame.frame_type.as_byte());
        buf.put_u8(0);
        buf.put_u32(frame.id);
        buf.put_slice(&[0u8; 8]);
        buf.put_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use quickcheck::{quickcheck, Arbitrary, Gen};

    const TYPES: [FrameType; 11] = [
        FrameType::InitRequest,
        FrameType::InitResponse,
        FrameType::CallRequest,
        FrameType::CallResponse,
        FrameType::CallRequestContinue,
        FrameType::CallResponseContinue,
        FrameType::Cancel,
        FrameType::Claim,
        FrameType::PingRequest,
        FrameType::PingResponse,
        FrameType::Error,
    ];

    impl Arbitrary for Frame {
        fn arbitrary(g: &mut Gen) -> Frame {
            let frame_type = *g.choose(&TYPES).unwrap_or(&FrameType::Error);
            let mut payload: Vec<u8> = Arbitrary::arbitrary(g);
            payload.truncate(MAX_PAYLOAD_SIZE);
            Frame::new(u32::arbitrary(g), frame_type, Bytes::from(payload))
        }
    }

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn frame_round_trip() {
        fn prop(frame: Frame) -> bool {
            let mut buf = encode(frame.clone());
            let decoded = FrameCodec.decode(&mut buf).unwrap();
            decoded == Some(frame) && buf.is_empty()
        }
        quickcheck(prop as fn(Frame) -> bool);
    }

    #[test]
    fn header_layout() {
        let frame = Frame::new(
            0x0102_0304,
            FrameType::CallRequest,
            Bytes::from_static(b"abc"),
        );
        let buf = encode(frame);
        assert_eq!(buf.len(), 19);
        assert_eq!(&buf[..8], &[0x00, 0x13, 0x03, 0x00, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&buf[8..16], &[0u8; 8]);
        assert_eq!(&buf[16..], b"abc");
    }

    #[test]
    fn reserved_bytes_are_ignored() {
        let mut buf = encode(Frame::new(
            9,
            FrameType::PingRequest,
            Bytes::from_static(b"xy"),
        ));
        buf[3] = 0xaa;
        for b in &mut buf[8..16] {
            *b = 0x55;
        }
        let frame = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.id, 9);
        assert_eq!(frame.frame_type, FrameType::PingRequest);
        assert_eq!(&frame.payload[..], b"xy");
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut whole = encode(Frame::new(
            7,
            FrameType::PingRequest,
            Bytes::from_static(b"0123456789"),
        ));
        let tail = whole.split_off(10);
        let mut buf = whole;
        assert_eq!(FrameCodec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&tail);
        let frame = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.id, 7);
        assert_eq!(&frame.payload[..], b"0123456789");
    }

    #[test]
    fn rejects_bad_envelopes() {
        let mut buf = BytesMut::from(&[0x00, 0x05, 0x01][..]);
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(Error::FrameTooSmall(5))
        ));

        let mut buf = encode(Frame::empty(1, FrameType::PingRequest));
        buf[FR_OFF_TYPE] = 0x77;
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(Error::UnknownFrameType(0x77))
        ));

        let big = Frame::new(
            1,
            FrameType::CallRequest,
            Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]),
        );
        assert!(matches!(
            FrameCodec.encode(big, &mut BytesMut::new()),
            Err(Error::FrameTooLarge(_))
        ));
    }

    #[test]
    fn more_fragments_flag() {
        let f = Frame::new(1, FrameType::CallRequest, Bytes::from_static(&[1, 0]));
        assert!(f.has_more_fragments());
        let f = Frame::new(1, FrameType::CallResponse, Bytes::from_static(&[0]));
        assert!(!f.has_more_fragments());
        let f = Frame::new(1, FrameType::Error, Bytes::from_static(&[1]));
        assert!(!f.has_more_fragments());
    }
}
