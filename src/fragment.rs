// Copyright 2020 Joyent, Inc.

//! Splitting call arguments across frames and putting them back together.
//!
//! Within one fragment an argument is complete once another chunk follows
//! it.  The last chunk of a fragment that has the more-fragments flag set
//! continues in the first chunk of the next fragment, so a writer whose
//! argument ends exactly on a frame boundary starts the next frame with an
//! empty chunk for that argument.

use bytes::{BufMut, Bytes, BytesMut};
use byteorder::{BigEndian, ByteOrder};

use crate::checksum::ChecksumType;
use crate::error::{Error, Result};
use crate::message::{CallRequestHead, CallResponseHead, FragmentBody};
use crate::protocol::{Frame, FrameType, FLAG_MORE_FRAGMENTS, MAX_PAYLOAD_SIZE};

pub const MAX_ARG1_SIZE: usize = 16 * 1024;
pub const NUM_ARGS: usize = 3;

pub enum MessageHead<'a> {
    Request(&'a CallRequestHead),
    Response(&'a CallResponseHead),
}

impl<'a> MessageHead<'a> {
    fn frame_types(&self) -> (FrameType, FrameType) {
        match self {
            MessageHead::Request(_) => {
                (FrameType::CallRequest, FrameType::CallRequestContinue)
            }
            MessageHead::Response(_) => {
                (FrameType::CallResponse, FrameType::CallResponseContinue)
            }
        }
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            MessageHead::Request(head) => head.write(buf),
            MessageHead::Response(head) => head.write(buf),
        }
    }
}

struct PendingFrame {
    frame_type: FrameType,
    buf: BytesMut,
    checksum_offset: usize,
    chunks: Vec<Bytes>,
}

impl PendingFrame {
    fn room(&self) -> usize {
        MAX_PAYLOAD_SIZE - self.buf.len()
    }

    fn push_chunk(&mut self, chunk: Bytes) {
        self.buf.put_u16(chunk.len() as u16);
        self.buf.put_slice(&chunk);
        self.chunks.push(chunk);
    }
}

/// Writes one call request or response as a sequence of frames.
pub struct FragmentWriter<'a> {
    id: u32,
    head: MessageHead<'a>,
    checksum_type: ChecksumType,
    max_arg1: usize,
}

impl<'a> FragmentWriter<'a> {
    pub fn new(id: u32, head: MessageHead<'a>, checksum_type: ChecksumType) -> Self {
        FragmentWriter {
            id,
            head,
            checksum_type,
            max_arg1: MAX_ARG1_SIZE,
        }
    }

    pub fn max_arg1(mut self, max_arg1: usize) -> Self {
        self.max_arg1 = max_arg1;
        self
    }

    fn open(&self, first: bool) -> Result<PendingFrame> {
        let (first_type, cont_type) = self.head.frame_types();
        let mut buf = BytesMut::with_capacity(MAX_PAYLOAD_SIZE);
        let frame_type = if first {
            self.head.write(&mut buf)?;
            first_type
        } else {
            buf.put_u8(0);
            cont_type
        };
        buf.put_u8(self.checksum_type.as_byte());
        let checksum_offset = buf.len();
        buf.put_slice(&[0u8; 4][..self.checksum_type.size()]);
        Ok(PendingFrame {
            frame_type,
            buf,
            checksum_offset,
            chunks: Vec::new(),
        })
    }

    fn close(&self, mut pending: PendingFrame, more: bool, prior: &mut u32) -> Result<Frame> {
        pending.buf[0] = if more { FLAG_MORE_FRAGMENTS } else { 0 };
        let chunks: Vec<&[u8]> = pending.chunks.iter().map(|c| &c[..]).collect();
        let checksum = self.checksum_type.compute(*prior, &chunks)?;
        if self.checksum_type.size() > 0 {
            let off = pending.checksum_offset;
            BigEndian::write_u32(&mut pending.buf[off..off + 4], checksum);
        }
        *prior = checksum;
        Ok(Frame::new(self.id, pending.frame_type, pending.buf.freeze()))
    }

    pub fn write(&self, args: [Bytes; NUM_ARGS]) -> Result<Vec<Frame>> {
        if args[0].len() > self.max_arg1 {
            return Err(Error::Arg1TooLarge(args[0].len(), self.max_arg1));
        }

        let mut frames = Vec::new();
        let mut prior = 0u32;
        let mut cur = self.open(true)?;

        // arg1 and the length of arg2 have to fit in the first frame.
        if cur.room() < args[0].len() + 4 {
            return Err(Error::Arg1Fragmented);
        }

        for arg in args.iter() {
            let mut rest = arg.clone();
            let mut started = false;
            loop {
                let room = cur.room();
                let full = if rest.is_empty() { room < 2 } else { room <= 2 };
                if full {
                    let done = std::mem::replace(&mut cur, self.open(false)?);
                    frames.push(self.close(done, true, &mut prior)?);
                    if !started {
                        // terminates the previous argument
                        cur.push_chunk(Bytes::new());
                    }
                    continue;
                }
                let n = rest.len().min(room - 2);
                cur.push_chunk(rest.split_to(n));
                started = true;
                if rest.is_empty() {
                    break;
                }
            }
        }

        frames.push(self.close(cur, false, &mut prior)?);
        Ok(frames)
    }
}

/// Collects the fragments of one inbound message.
#[derive(Debug)]
pub struct Reassembly {
    checksum_type: Option<ChecksumType>,
    prior: u32,
    args: Vec<BytesMut>,
    open: bool,
    fragments: usize,
    complete: bool,
}

impl Default for Reassembly {
    fn default() -> Self {
        Reassembly::new()
    }
}

impl Reassembly {
    pub fn new() -> Reassembly {
        Reassembly {
            checksum_type: None,
            prior: 0,
            args: Vec::with_capacity(NUM_ARGS),
            open: false,
            fragments: 0,
            complete: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Adds the next fragment.  Returns true once the message is complete.
    pub fn push(&mut self, flags: u8, body: FragmentBody) -> Result<bool> {
        if self.complete {
            return Err(Error::UnexpectedFrame(
                "fragment after the last fragment".to_string(),
            ));
        }

        match self.checksum_type {
            None => self.checksum_type = Some(body.checksum_type),
            Some(t) if t != body.checksum_type => {
                return Err(Error::ChecksumTypeChanged)
            }
            Some(_) => (),
        }

        let chunks: Vec<&[u8]> = body.chunks.iter().map(|c| &c[..]).collect();
        self.prior = body
            .checksum_type
            .verify(self.prior, &chunks, body.checksum)?;

        let more = flags & FLAG_MORE_FRAGMENTS != 0;
        if self.fragments == 0 && more && body.chunks.len() < 2 {
            return Err(Error::Arg1Fragmented);
        }
        self.fragments += 1;

        for (i, chunk) in body.chunks.iter().enumerate() {
            if i == 0 && self.open {
                if let Some(last) = self.args.last_mut() {
                    last.extend_from_slice(chunk);
                }
                continue;
            }
            if self.args.len() == NUM_ARGS {
                return Err(Error::TooManyArgs);
            }
            self.args.push(BytesMut::from(&chunk[..]));
        }
        if !body.chunks.is_empty() {
            self.open = more;
        }

        self.complete = !more;
        Ok(self.complete)
    }

    /// The reassembled arguments; missing trailing arguments are empty.
    pub fn finish(self) -> [Bytes; NUM_ARGS] {
        let mut args = self.args.into_iter().map(BytesMut::freeze);
        [
            args.next().unwrap_or_default(),
            args.next().unwrap_or_default(),
            args.next().unwrap_or_default(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::message::{
        parse_call_request, parse_continuation, ResponseCode, Tracing,
        TransportHeaders,
    };

    fn head() -> CallRequestHead {
        CallRequestHead {
            flags: 0,
            ttl: 100,
            tracing: Tracing::default(),
            service: "svc".to_string(),
            headers: TransportHeaders::new().with("as", "raw"),
        }
    }

    fn bytes(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    fn reassemble(frames: &[Frame]) -> Result<[Bytes; NUM_ARGS]> {
        let mut r = Reassembly::new();
        for (i, frame) in frames.iter().enumerate() {
            let (flags, body) = if i == 0 {
                let (head, body) = parse_call_request(frame)?;
                (head.flags, body)
            } else {
                parse_continuation(frame)?
            };
            r.push(flags, body)?;
        }
        assert!(r.is_complete());
        Ok(r.finish())
    }

    #[test]
    fn small_message_is_one_frame() {
        let h = head();
        let w = FragmentWriter::new(5, MessageHead::Request(&h), ChecksumType::Crc32);
        let args = [
            Bytes::from_static(b"echo"),
            Bytes::from_static(b"head"),
            Bytes::from_static(b"body"),
        ];
        let frames = w.write(args.clone()).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].has_more_fragments());
        assert_eq!(reassemble(&frames).unwrap(), args);
    }

    #[test]
    fn large_args_span_continuations() {
        let h = head();
        for csum in &[ChecksumType::None, ChecksumType::Crc32, ChecksumType::Crc32c] {
            let w = FragmentWriter::new(5, MessageHead::Request(&h), *csum);
            let args = [
                Bytes::from_static(b"upload"),
                bytes(70_000, b'h'),
                bytes(200_000, b'b'),
            ];
            let frames = w.write(args.clone()).unwrap();
            assert!(frames.len() >= 5);
            assert_eq!(frames[0].frame_type, FrameType::CallRequest);
            for f in &frames[1..] {
                assert_eq!(f.frame_type, FrameType::CallRequestContinue);
                assert!(f.size() <= crate::protocol::MAX_FRAME_SIZE);
            }
            assert!(frames[..frames.len() - 1].iter().all(Frame::has_more_fragments));
            assert_eq!(reassemble(&frames).unwrap(), args);
        }
    }

    #[test]
    fn arg_ending_on_frame_boundary() {
        let h = head();
        let w = FragmentWriter::new(1, MessageHead::Request(&h), ChecksumType::Crc32);
        let first = w.open(true).unwrap();
        // fill the first frame exactly with arg1 and arg2
        let arg2_len = first.room() - 2 - 4 - 2;
        let args = [
            Bytes::from_static(b"four"),
            bytes(arg2_len, b'x'),
            Bytes::from_static(b"tail"),
        ];
        let frames = w.write(args.clone()).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].size(), crate::protocol::MAX_FRAME_SIZE);
        let (_, body) = parse_continuation(&frames[1]).unwrap();
        assert_eq!(body.chunks.len(), 2);
        assert!(body.chunks[0].is_empty());
        assert_eq!(reassemble(&frames).unwrap(), args);
    }

    #[test]
    fn arg1_limits_on_write() {
        let h = head();
        let w = FragmentWriter::new(1, MessageHead::Request(&h), ChecksumType::None);
        let args = [bytes(MAX_ARG1_SIZE + 1, b'a'), Bytes::new(), Bytes::new()];
        assert!(matches!(w.write(args), Err(Error::Arg1TooLarge(..))));

        let w = FragmentWriter::new(1, MessageHead::Request(&h), ChecksumType::None)
            .max_arg1(usize::MAX);
        let args = [bytes(MAX_PAYLOAD_SIZE, b'a'), Bytes::new(), Bytes::new()];
        assert!(matches!(w.write(args), Err(Error::Arg1Fragmented)));
    }

    #[test]
    fn fragmented_arg1_rejected_on_read() {
        // a first fragment holding only part of arg1
        let h = CallRequestHead {
            flags: FLAG_MORE_FRAGMENTS,
            ..head()
        };
        let mut buf = BytesMut::new();
        h.write(&mut buf).unwrap();
        buf.put_u8(ChecksumType::None.as_byte());
        buf.put_u16(3);
        buf.put_slice(b"ech");
        let frame = Frame::new(1, FrameType::CallRequest, buf.freeze());

        let (head, body) = parse_call_request(&frame).unwrap();
        let mut r = Reassembly::new();
        assert!(matches!(r.push(head.flags, body), Err(Error::Arg1Fragmented)));
    }

    #[test]
    fn corrupted_payloads() {
        let h = head();
        let args = [
            Bytes::from_static(b"echo"),
            Bytes::from_static(b"head"),
            Bytes::from_static(b"body"),
        ];
        for (csum, rejected) in &[(ChecksumType::Crc32, true), (ChecksumType::None, false)] {
            let w = FragmentWriter::new(1, MessageHead::Request(&h), *csum);
            let frame = w.write(args.clone()).unwrap().remove(0);
            let mut payload = BytesMut::from(&frame.payload[..]);
            let last = payload.len() - 1;
            payload[last] = b'x';
            let corrupted = Frame::new(1, frame.frame_type, payload.freeze());
            let result = reassemble(&[corrupted]);
            if *rejected {
                assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));
            } else {
                assert_eq!(&result.unwrap()[2][..], b"bodx" as &[u8]);
            }
        }
    }

    #[test]
    fn too_many_args_and_padding() {
        let mut r = Reassembly::new();
        let body = FragmentBody {
            checksum_type: ChecksumType::None,
            checksum: 0,
            chunks: vec![Bytes::from_static(b"a"); 4],
        };
        assert!(matches!(r.push(0, body), Err(Error::TooManyArgs)));

        let mut r = Reassembly::new();
        let body = FragmentBody {
            checksum_type: ChecksumType::None,
            checksum: 0,
            chunks: vec![Bytes::from_static(b"ping")],
        };
        assert!(r.push(0, body).unwrap());
        let args = r.finish();
        assert_eq!(&args[0][..], b"ping");
        assert!(args[1].is_empty() && args[2].is_empty());
    }

    #[test]
    fn checksum_type_must_not_change() {
        let mut r = Reassembly::new();
        let first = FragmentBody {
            checksum_type: ChecksumType::None,
            checksum: 0,
            chunks: vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
        };
        assert!(!r.push(FLAG_MORE_FRAGMENTS, first).unwrap());
        let second = FragmentBody {
            checksum_type: ChecksumType::Crc32,
            checksum: 0,
            chunks: vec![Bytes::from_static(b"c")],
        };
        assert!(matches!(r.push(0, second), Err(Error::ChecksumTypeChanged)));
    }

    #[test]
    fn responses_use_response_frame_types() {
        let h = CallResponseHead {
            flags: 0,
            code: ResponseCode::Error,
            tracing: Tracing::default(),
            headers: TransportHeaders::new(),
        };
        let w = FragmentWriter::new(3, MessageHead::Response(&h), ChecksumType::Crc32c);
        let frames = w
            .write([Bytes::new(), Bytes::new(), bytes(100_000, b'r')])
            .unwrap();
        assert_eq!(frames[0].frame_type, FrameType::CallResponse);
        assert_eq!(frames[1].frame_type, FrameType::CallResponseContinue);
    }
}
