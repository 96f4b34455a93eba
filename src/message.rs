// Copyright 2020 Joyent, Inc.

//! Typed frame payloads.
//!
//! Length prefixes are written as `~N` in the layouts below: a big-endian
//! length of N bytes followed by that many bytes of data.
//!
//! ```text
//! init:          version:2 nh:2 (key~2 value~2){nh}
//! call request:  flags:1 ttl:4 tracing:25 service~1 nh:1 (hk~1 hv~1){nh}
//!                csumtype:1 (csum:4){0,1} (arg~2)*
//! call response: flags:1 code:1 tracing:25 nh:1 (hk~1 hv~1){nh}
//!                csumtype:1 (csum:4){0,1} (arg~2)*
//! continuation:  flags:1 csumtype:1 (csum:4){0,1} (arg~2)*
//! cancel:        ttl:4 tracing:25 why~2
//! claim:         ttl:4 tracing:25
//! error:         code:1 tracing:25 message~2
//! tracing:       spanid:8 parentid:8 traceid:8 traceflags:1
//! ```

use std::collections::HashSet;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use byteorder::{BigEndian, ByteOrder};

use crate::checksum::ChecksumType;
use crate::error::{Error, ErrorCode, Result};
use crate::protocol::{Frame, FrameType};

pub const PROTOCOL_VERSION: u16 = 2;
pub const TRACING_SIZE: usize = 25;

pub const MAX_HEADERS: usize = 128;
pub const MAX_HEADER_KEY_SIZE: usize = 16;
pub const MAX_HEADER_VALUE_SIZE: usize = 0xff;
const MAX_ERROR_MESSAGE_SIZE: usize = 0x4000;

pub const INIT_HOST_PORT: &str = "host_port";
pub const INIT_PROCESS_NAME: &str = "process_name";
/// Advertised by callers that do not accept connections.
pub const EPHEMERAL_HOST_PORT: &str = "0.0.0.0:0";

/// Well-known transport header keys.
pub mod headers {
    pub const ARG_SCHEME: &str = "as";
    pub const CALLER_NAME: &str = "cn";
    pub const RETRY_FLAGS: &str = "re";
    pub const SHARD_KEY: &str = "sk";
    pub const ROUTING_DELEGATE: &str = "rd";
}

// Fixed offsets into a call request payload.
const CALL_OFF_FLAGS: usize = 0;
const CALL_OFF_TTL: usize = 1;
const CALL_OFF_TRACING: usize = 5;
const CALL_OFF_SERVICE: usize = 30;

/// Bounds-checked reads from a payload.
pub(crate) struct Reader {
    buf: Bytes,
}

impl Reader {
    pub(crate) fn new(buf: Bytes) -> Reader {
        Reader { buf }
    }

    pub(crate) fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    fn need(&self, n: usize, what: &'static str) -> Result<()> {
        if self.buf.remaining() < n {
            Err(Error::Truncated(what))
        } else {
            Ok(())
        }
    }

    pub(crate) fn u8(&mut self, what: &'static str) -> Result<u8> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn u16(&mut self, what: &'static str) -> Result<u16> {
        self.need(2, what)?;
        Ok(self.buf.get_u16())
    }

    pub(crate) fn u32(&mut self, what: &'static str) -> Result<u32> {
        self.need(4, what)?;
        Ok(self.buf.get_u32())
    }

    pub(crate) fn u64(&mut self, what: &'static str) -> Result<u64> {
        self.need(8, what)?;
        Ok(self.buf.get_u64())
    }

    pub(crate) fn bytes(&mut self, n: usize, what: &'static str) -> Result<Bytes> {
        self.need(n, what)?;
        Ok(self.buf.split_to(n))
    }

    pub(crate) fn bytes2(&mut self, what: &'static str) -> Result<Bytes> {
        let n = self.u16(what)? as usize;
        self.bytes(n, what)
    }

    pub(crate) fn str1(&mut self, what: &'static str) -> Result<String> {
        let n = self.u8(what)? as usize;
        let raw = self.bytes(n, what)?;
        utf8(raw, what)
    }

    pub(crate) fn str2(&mut self, what: &'static str) -> Result<String> {
        let raw = self.bytes2(what)?;
        utf8(raw, what)
    }
}

fn utf8(raw: Bytes, what: &'static str) -> Result<String> {
    String::from_utf8(raw.to_vec()).map_err(|_| Error::InvalidUtf8(what))
}

fn put_str1(buf: &mut BytesMut, s: &str) {
    buf.put_u8(s.len() as u8);
    buf.put_slice(s.as_bytes());
}

fn put_str2(buf: &mut BytesMut, s: &[u8]) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Tracing {
    pub span_id: u64,
    pub parent_id: u64,
    pub trace_id: u64,
    pub flags: u8,
}

impl Tracing {
    /// Starts a new trace.
    pub fn root() -> Tracing {
        let span_id = rand::random::<u64>();
        Tracing {
            span_id,
            parent_id: 0,
            trace_id: span_id,
            flags: 0,
        }
    }

    /// A span for a call made on behalf of this one.
    pub fn child(&self) -> Tracing {
        if self.trace_id == 0 {
            return Tracing::root();
        }
        Tracing {
            span_id: rand::random::<u64>(),
            parent_id: self.span_id,
            trace_id: self.trace_id,
            flags: self.flags,
        }
    }

    pub(crate) fn read(r: &mut Reader) -> Result<Tracing> {
        Ok(Tracing {
            span_id: r.u64("tracing")?,
            parent_id: r.u64("tracing")?,
            trace_id: r.u64("tracing")?,
            flags: r.u8("tracing")?,
        })
    }

    fn from_slice(buf: &[u8]) -> Tracing {
        Tracing {
            span_id: BigEndian::read_u64(&buf[0..8]),
            parent_id: BigEndian::read_u64(&buf[8..16]),
            trace_id: BigEndian::read_u64(&buf[16..24]),
            flags: buf[24],
        }
    }

    pub(crate) fn write(&self, buf: &mut BytesMut) {
        buf.put_u64(self.span_id);
        buf.put_u64(self.parent_id);
        buf.put_u64(self.trace_id);
        buf.put_u8(self.flags);
    }
}

/// Ordered key/value transport headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportHeaders {
    entries: Vec<(String, String)>,
}

impl TransportHeaders {
    pub fn new() -> TransportHeaders {
        TransportHeaders::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Sets `key`, replacing any existing value.
    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn with<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.set(key, value);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.entries.len() > MAX_HEADERS {
            return Err(Error::TooManyHeaders(self.entries.len()));
        }
        let mut seen = HashSet::new();
        for (k, v) in &self.entries {
            if k.is_empty() {
                return Err(Error::EmptyHeaderKey);
            }
            if k.len() > MAX_HEADER_KEY_SIZE {
                return Err(Error::HeaderKeyTooLong(k.len()));
            }
            if v.len() > MAX_HEADER_VALUE_SIZE {
                return Err(Error::HeaderValueTooLong(v.len()));
            }
            if !seen.insert(k.as_str()) {
                return Err(Error::DuplicateHeader(k.clone()));
            }
        }
        Ok(())
    }

    pub(crate) fn read(r: &mut Reader) -> Result<TransportHeaders> {
        let nh = r.u8("header count")? as usize;
        if nh > MAX_HEADERS {
            return Err(Error::TooManyHeaders(nh));
        }
        let mut headers = TransportHeaders {
            entries: Vec::with_capacity(nh),
        };
        for _ in 0..nh {
            let k = r.str1("header key")?;
            let v = r.str1("header value")?;
            headers.entries.push((k, v));
        }
        headers.validate()?;
        Ok(headers)
    }

    pub(crate) fn write(&self, buf: &mut BytesMut) -> Result<()> {
        self.validate()?;
        buf.put_u8(self.entries.len() as u8);
        for (k, v) in &self.entries {
            put_str1(buf, k);
            put_str1(buf, v);
        }
        Ok(())
    }
}

/// The identity a peer advertises during the init handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub host_port: String,
    pub process_name: String,
}

impl Identity {
    pub fn is_ephemeral(&self) -> bool {
        self.host_port == EPHEMERAL_HOST_PORT
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitMessage {
    pub version: u16,
    pub headers: Vec<(String, String)>,
}

impl InitMessage {
    pub fn new(identity: &Identity) -> InitMessage {
        InitMessage {
            version: PROTOCOL_VERSION,
            headers: vec![
                (INIT_HOST_PORT.to_string(), identity.host_port.clone()),
                (INIT_PROCESS_NAME.to_string(), identity.process_name.clone()),
            ],
        }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn identity(&self) -> Result<Identity> {
        let host_port = self.get(INIT_HOST_PORT).ok_or_else(|| {
            Error::InvalidInit(format!("missing {}", INIT_HOST_PORT))
        })?;
        let process_name = self.get(INIT_PROCESS_NAME).ok_or_else(|| {
            Error::InvalidInit(format!("missing {}", INIT_PROCESS_NAME))
        })?;
        Ok(Identity {
            host_port: host_port.to_string(),
            process_name: process_name.to_string(),
        })
    }

    pub fn read(payload: Bytes) -> Result<InitMessage> {
        let mut r = Reader::new(payload);
        let version = r.u16("init version")?;
        if version != PROTOCOL_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let nh = r.u16("init header count")? as usize;
        let mut headers = Vec::with_capacity(nh.min(MAX_HEADERS));
        for _ in 0..nh {
            let k = r.str2("init header key")?;
            let v = r.str2("init header value")?;
            headers.push((k, v));
        }
        Ok(InitMessage { version, headers })
    }

    pub fn to_frame(&self, frame_type: FrameType) -> Frame {
        let mut buf = BytesMut::new();
        buf.put_u16(self.version);
        buf.put_u16(self.headers.len() as u16);
        for (k, v) in &self.headers {
            put_str2(&mut buf, k.as_bytes());
            put_str2(&mut buf, v.as_bytes());
        }
        Frame::new(crate::protocol::INIT_FRAME_ID, frame_type, buf.freeze())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequestHead {
    pub flags: u8,
    /// Milliseconds.
    pub ttl: u32,
    pub tracing: Tracing,
    pub service: String,
    pub headers: TransportHeaders,
}

impl CallRequestHead {
    pub(crate) fn read(r: &mut Reader) -> Result<CallRequestHead> {
        let flags = r.u8("flags")?;
        let ttl = r.u32("ttl")?;
        if ttl == 0 {
            return Err(Error::InvalidTtl);
        }
        let tracing = Tracing::read(r)?;
        let service = r.str1("service")?;
        let headers = TransportHeaders::read(r)?;
        Ok(CallRequestHead {
            flags,
            ttl,
            tracing,
            service,
            headers,
        })
    }

    pub(crate) fn write(&self, buf: &mut BytesMut) -> Result<()> {
        if self.ttl == 0 {
            return Err(Error::InvalidTtl);
        }
        if self.service.len() > 0xff {
            return Err(Error::ServiceNameTooLong(self.service.len()));
        }
        buf.put_u8(self.flags);
        buf.put_u32(self.ttl);
        self.tracing.write(buf);
        put_str1(buf, &self.service);
        self.headers.write(buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Ok = 0x00,
    Error = 0x01,
}

impl ResponseCode {
    pub fn from_byte(b: u8) -> ResponseCode {
        if b == 0 {
            ResponseCode::Ok
        } else {
            ResponseCode::Error
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResponseHead {
    pub flags: u8,
    pub code: ResponseCode,
    pub tracing: Tracing,
    pub headers: TransportHeaders,
}

impl CallResponseHead {
    pub(crate) fn read(r: &mut Reader) -> Result<CallResponseHead> {
        Ok(CallResponseHead {
            flags: r.u8("flags")?,
            code: ResponseCode::from_byte(r.u8("response code")?),
            tracing: Tracing::read(r)?,
            headers: TransportHeaders::read(r)?,
        })
    }

    pub(crate) fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(self.flags);
        buf.put_u8(self.code as u8);
        self.tracing.write(buf);
        self.headers.write(buf)
    }
}

/// The checksum and argument chunks that end every call fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentBody {
    pub checksum_type: ChecksumType,
    pub checksum: u32,
    pub chunks: Vec<Bytes>,
}

impl FragmentBody {
    pub(crate) fn read(r: &mut Reader) -> Result<FragmentBody> {
        let checksum_type = ChecksumType::from_byte(r.u8("checksum type")?)?;
        let checksum = match checksum_type.size() {
            0 => 0,
            _ => r.u32("checksum")?,
        };
        let mut chunks = Vec::new();
        while !r.is_empty() {
            chunks.push(r.bytes2("argument")?);
        }
        Ok(FragmentBody {
            checksum_type,
            checksum,
            chunks,
        })
    }
}

pub fn parse_call_request(frame: &Frame) -> Result<(CallRequestHead, FragmentBody)> {
    let mut r = Reader::new(frame.payload.clone());
    let head = CallRequestHead::read(&mut r)?;
    let body = FragmentBody::read(&mut r)?;
    Ok((head, body))
}

pub fn parse_call_response(frame: &Frame) -> Result<(CallResponseHead, FragmentBody)> {
    let mut r = Reader::new(frame.payload.clone());
    let head = CallResponseHead::read(&mut r)?;
    let body = FragmentBody::read(&mut r)?;
    Ok((head, body))
}

/// Parses a continuation frame into its flags and body.
pub fn parse_continuation(frame: &Frame) -> Result<(u8, FragmentBody)> {
    let mut r = Reader::new(frame.payload.clone());
    let flags = r.u8("flags")?;
    let body = FragmentBody::read(&mut r)?;
    Ok((flags, body))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub tracing: Tracing,
    pub message: String,
}

impl ErrorMessage {
    pub fn new<S: Into<String>>(code: ErrorCode, tracing: Tracing, message: S) -> Self {
        ErrorMessage {
            code,
            tracing,
            message: message.into(),
        }
    }

    pub fn from_error(e: &Error, tracing: Tracing) -> ErrorMessage {
        let message = match e {
            Error::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ErrorMessage::new(e.code(), tracing, message)
    }

    pub fn read(frame: &Frame) -> Result<ErrorMessage> {
        let mut r = Reader::new(frame.payload.clone());
        let code = ErrorCode::from_byte(r.u8("error code")?);
        let tracing = Tracing::read(&mut r)?;
        let raw = r.bytes2("error message")?;
        Ok(ErrorMessage {
            code,
            tracing,
            message: String::from_utf8_lossy(&raw).into_owned(),
        })
    }

    pub fn to_frame(&self, id: u32) -> Frame {
        let mut msg = self.message.as_bytes();
        if msg.len() > MAX_ERROR_MESSAGE_SIZE {
            msg = &msg[..MAX_ERROR_MESSAGE_SIZE];
        }
        let mut buf = BytesMut::with_capacity(1 + TRACING_SIZE + 2 + msg.len());
        buf.put_u8(self.code.as_byte());
        self.tracing.write(&mut buf);
        put_str2(&mut buf, msg);
        Frame::new(id, FrameType::Error, buf.freeze())
    }

    pub fn into_error(self) -> Error {
        Error::Remote {
            code: self.code,
            message: self.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelMessage {
    pub ttl: u32,
    pub tracing: Tracing,
    pub why: String,
}

impl CancelMessage {
    pub fn read(frame: &Frame) -> Result<CancelMessage> {
        let mut r = Reader::new(frame.payload.clone());
        Ok(CancelMessage {
            ttl: r.u32("ttl")?,
            tracing: Tracing::read(&mut r)?,
            why: r.str2("cancel reason")?,
        })
    }

    pub fn to_frame(&self, id: u32) -> Frame {
        let mut buf = BytesMut::new();
        buf.put_u32(self.ttl);
        self.tracing.write(&mut buf);
        put_str2(&mut buf, self.why.as_bytes());
        Frame::new(id, FrameType::Cancel, buf.freeze())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimMessage {
    pub ttl: u32,
    pub tracing: Tracing,
}

impl ClaimMessage {
    pub fn read(frame: &Frame) -> Result<ClaimMessage> {
        let mut r = Reader::new(frame.payload.clone());
        Ok(ClaimMessage {
            ttl: r.u32("ttl")?,
            tracing: Tracing::read(&mut r)?,
        })
    }

    pub fn to_frame(&self, id: u32) -> Frame {
        let mut buf = BytesMut::new();
        buf.put_u32(self.ttl);
        self.tracing.write(&mut buf);
        Frame::new(id, FrameType::Claim, buf.freeze())
    }
}

/// Reads the fixed-offset head of a call request without decoding the
/// transport headers or arguments.
#[derive(Debug, Clone, Copy)]
pub struct LazyCallRequest<'a> {
    payload: &'a [u8],
}

impl<'a> LazyCallRequest<'a> {
    pub fn new(frame: &'a Frame) -> Result<LazyCallRequest<'a>> {
        if frame.payload.len() <= CALL_OFF_SERVICE {
            return Err(Error::Truncated("call request head"));
        }
        Ok(LazyCallRequest {
            payload: &frame.payload,
        })
    }

    pub fn flags(&self) -> u8 {
        self.payload[CALL_OFF_FLAGS]
    }

    pub fn ttl(&self) -> u32 {
        BigEndian::read_u32(&self.payload[CALL_OFF_TTL..CALL_OFF_TRACING])
    }

    pub fn tracing(&self) -> Tracing {
        Tracing::from_slice(&self.payload[CALL_OFF_TRACING..CALL_OFF_SERVICE])
    }

    pub fn service(&self) -> Result<&'a str> {
        let len = self.payload[CALL_OFF_SERVICE] as usize;
        let start = CALL_OFF_SERVICE + 1;
        let raw = self
            .payload
            .get(start..start + len)
            .ok_or(Error::Truncated("service"))?;
        std::str::from_utf8(raw).map_err(|_| Error::InvalidUtf8("service"))
    }
}

/// Copies a call request frame under a new id with its ttl replaced.
pub fn rewrite_call_request(frame: &Frame, id: u32, ttl: u32) -> Frame {
    let mut payload = BytesMut::from(&frame.payload[..]);
    BigEndian::write_u32(&mut payload[CALL_OFF_TTL..CALL_OFF_TRACING], ttl);
    Frame::new(id, frame.frame_type, payload.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_head() -> CallRequestHead {
        CallRequestHead {
            flags: 0,
            ttl: 1500,
            tracing: Tracing {
                span_id: 1,
                parent_id: 2,
                trace_id: 3,
                flags: 1,
            },
            service: "keyvalue".to_string(),
            headers: TransportHeaders::new()
                .with(headers::ARG_SCHEME, "raw")
                .with(headers::CALLER_NAME, "wat"),
        }
    }

    fn request_frame(head: &CallRequestHead) -> Frame {
        let mut buf = BytesMut::new();
        head.write(&mut buf).unwrap();
        buf.put_u8(0);
        put_str2(&mut buf, b"get");
        Frame::new(9, FrameType::CallRequest, buf.freeze())
    }

    #[test]
    fn call_request_head_round_trip() {
        let head = request_head();
        let frame = request_frame(&head);
        let (parsed, body) = parse_call_request(&frame).unwrap();
        assert_eq!(parsed, head);
        assert_eq!(body.checksum_type, ChecksumType::None);
        assert_eq!(body.chunks, vec![Bytes::from_static(b"get")]);
    }

    #[test]
    fn lazy_reads_match_full_parse() {
        let head = request_head();
        let frame = request_frame(&head);
        let lazy = LazyCallRequest::new(&frame).unwrap();
        assert_eq!(lazy.flags(), 0);
        assert_eq!(lazy.ttl(), 1500);
        assert_eq!(lazy.tracing(), head.tracing);
        assert_eq!(lazy.service().unwrap(), "keyvalue");

        let rewritten = rewrite_call_request(&frame, 44, 900);
        assert_eq!(rewritten.id, 44);
        let lazy = LazyCallRequest::new(&rewritten).unwrap();
        assert_eq!(lazy.ttl(), 900);
        assert_eq!(lazy.service().unwrap(), "keyvalue");
        assert_eq!(&rewritten.payload[5..], &frame.payload[5..]);
    }

    #[test]
    fn zero_ttl_rejected_both_ways() {
        let mut head = request_head();
        head.ttl = 0;
        assert!(matches!(
            head.write(&mut BytesMut::new()),
            Err(Error::InvalidTtl)
        ));

        let mut frame = request_frame(&request_head());
        frame = rewrite_call_request(&frame, 1, 0);
        assert!(matches!(parse_call_request(&frame), Err(Error::InvalidTtl)));
    }

    #[test]
    fn header_limits() {
        let mut h = TransportHeaders::new();
        for i in 0..=MAX_HEADERS {
            h.set(format!("k{}", i), "v");
        }
        assert!(matches!(h.validate(), Err(Error::TooManyHeaders(129))));

        let h = TransportHeaders::new().with("a-very-long-header-key", "v");
        assert!(matches!(h.validate(), Err(Error::HeaderKeyTooLong(22))));

        let h = TransportHeaders::new().with("", "v");
        assert!(matches!(h.validate(), Err(Error::EmptyHeaderKey)));

        let mut h = TransportHeaders::new().with("as", "json");
        h.set("as", "thrift");
        assert_eq!(h.len(), 1);
        assert_eq!(h.get("as"), Some("thrift"));

        // duplicates can only arrive off the wire
        let mut buf = BytesMut::new();
        buf.put_u8(2);
        for _ in 0..2 {
            put_str1(&mut buf, "as");
            put_str1(&mut buf, "raw");
        }
        let mut r = Reader::new(buf.freeze());
        assert!(matches!(
            TransportHeaders::read(&mut r),
            Err(Error::DuplicateHeader(_))
        ));
    }

    #[test]
    fn init_identity() {
        let id = Identity {
            host_port: "10.0.0.1:4040".to_string(),
            process_name: "relay[12]".to_string(),
        };
        let frame = InitMessage::new(&id).to_frame(FrameType::InitRequest);
        assert_eq!(frame.id, 0);
        let init = InitMessage::read(frame.payload.clone()).unwrap();
        assert_eq!(init.identity().unwrap(), id);

        let partial = InitMessage {
            version: PROTOCOL_VERSION,
            headers: vec![(INIT_HOST_PORT.to_string(), "h:1".to_string())],
        };
        let frame = partial.to_frame(FrameType::InitRequest);
        let init = InitMessage::read(frame.payload).unwrap();
        assert!(matches!(init.identity(), Err(Error::InvalidInit(_))));

        let mut old = InitMessage::new(&id);
        old.version = 1;
        let frame = old.to_frame(FrameType::InitRequest);
        assert!(matches!(
            InitMessage::read(frame.payload),
            Err(Error::UnsupportedVersion(1))
        ));
    }

    #[test]
    fn error_message_round_trip() {
        let msg = ErrorMessage::new(ErrorCode::Busy, Tracing::default(), "try later");
        let frame = msg.to_frame(12);
        assert_eq!(frame.frame_type, FrameType::Error);
        assert_eq!(ErrorMessage::read(&frame).unwrap(), msg);

        let e = ErrorMessage::from_error(&Error::busy("try later"), Tracing::default());
        assert_eq!(e, msg);
    }

    #[test]
    fn cancel_and_claim() {
        let cancel = CancelMessage {
            ttl: 10,
            tracing: Tracing::default(),
            why: "caller gone".to_string(),
        };
        assert_eq!(CancelMessage::read(&cancel.to_frame(3)).unwrap(), cancel);
        let claim = ClaimMessage {
            ttl: 10,
            tracing: Tracing::root(),
        };
        assert_eq!(ClaimMessage::read(&claim.to_frame(3)).unwrap(), claim);
    }

    #[test]
    fn tracing_children_keep_the_trace() {
        let root = Tracing::root();
        assert_eq!(root.parent_id, 0);
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_id, root.span_id);
        assert_ne!(Tracing::default().child().trace_id, 0);
    }
}
