// Copyright 2020 Joyent, Inc.

//! Errors produced by the transport, and the wire error codes they map to.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use num::FromPrimitive;
use num_derive::{FromPrimitive, ToPrimitive};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error codes carried by error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum ErrorCode {
    Timeout = 0x01,
    Cancelled = 0x02,
    Busy = 0x03,
    Declined = 0x04,
    Unexpected = 0x05,
    BadRequest = 0x06,
    NetworkError = 0x07,
    Unhealthy = 0x08,
    ProtocolError = 0xff,
}

impl ErrorCode {
    /// Unknown codes are treated as unexpected errors.
    pub fn from_byte(b: u8) -> ErrorCode {
        FromPrimitive::from_u8(b).unwrap_or(ErrorCode::Unexpected)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Timeout => "timeout",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Busy => "busy",
            ErrorCode::Declined => "declined",
            ErrorCode::Unexpected => "unexpected",
            ErrorCode::BadRequest => "bad request",
            ErrorCode::NetworkError => "network error",
            ErrorCode::Unhealthy => "unhealthy",
            ErrorCode::ProtocolError => "protocol error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),

    // Envelope and frame level
    #[error("frame size {0} exceeds the maximum frame size")]
    FrameTooLarge(usize),
    #[error("frame size {0} is smaller than the frame header")]
    FrameTooSmall(usize),
    #[error("unknown frame type {0:#04x}")]
    UnknownFrameType(u8),
    #[error("truncated payload while reading {0}")]
    Truncated(&'static str),
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),

    // Call payloads
    #[error("invalid ttl: ttl must be greater than zero")]
    InvalidTtl,
    #[error("arg1 must fit entirely within the first frame")]
    Arg1Fragmented,
    #[error("arg1 is {0} bytes, larger than the {1} byte limit")]
    Arg1TooLarge(usize, usize),
    #[error("too many arguments")]
    TooManyArgs,
    #[error("too many transport headers ({0})")]
    TooManyHeaders(usize),
    #[error("transport header key is {0} bytes, longer than 16")]
    HeaderKeyTooLong(usize),
    #[error("transport header value is {0} bytes, longer than 255")]
    HeaderValueTooLong(usize),
    #[error("empty transport header key")]
    EmptyHeaderKey,
    #[error("duplicate transport header {0:?}")]
    DuplicateHeader(String),
    #[error("service name is {0} bytes, longer than 255")]
    ServiceNameTooLong(usize),
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    // Checksums
    #[error("unsupported checksum type {0:#04x}")]
    UnsupportedChecksum(u8),
    #[error("checksum mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("checksum type changed between fragments")]
    ChecksumTypeChanged,

    // Handshake
    #[error("invalid init: {0}")]
    InvalidInit(String),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
    #[error("init handshake did not complete within {0:?}")]
    InitTimeout(Duration),

    // Call outcomes
    #[error("{code}: {message}")]
    Remote { code: ErrorCode, message: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("declined: {0}")]
    Declined(String),
    #[error("connection reset: {0}")]
    ConnectionReset(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("no peer available for {0}")]
    NoPeerAvailable(String),
    #[error("no such service {0:?}")]
    NoSuchService(String),
    #[error("no such endpoint {endpoint:?} for service {service:?}")]
    NoSuchEndpoint { service: String, endpoint: String },
    #[error("handler dropped the response without sending it")]
    ResponseDropped,

    // Admission control
    #[error("channel has {0} pending requests, the maximum")]
    MaxPending(usize),
    #[error("service {service:?} has {limit} pending requests, the maximum")]
    MaxPendingForService { service: String, limit: usize },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn remote<S: Into<String>>(code: ErrorCode, message: S) -> Error {
        Error::Remote {
            code,
            message: message.into(),
        }
    }

    pub fn busy<S: Into<String>>(message: S) -> Error {
        Error::remote(ErrorCode::Busy, message)
    }

    pub fn declined<S: Into<String>>(message: S) -> Error {
        Error::remote(ErrorCode::Declined, message)
    }

    pub fn unexpected<S: Into<String>>(message: S) -> Error {
        Error::remote(ErrorCode::Unexpected, message)
    }

    pub fn bad_request<S: Into<String>>(message: S) -> Error {
        Error::remote(ErrorCode::BadRequest, message)
    }

    /// The wire error code this error is reported as.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Io(_)
            | Error::ConnectionReset(_)
            | Error::ConnectionClosed
            | Error::InitTimeout(_) => ErrorCode::NetworkError,
            Error::FrameTooLarge(_)
            | Error::FrameTooSmall(_)
            | Error::UnknownFrameType(_)
            | Error::UnexpectedFrame(_)
            | Error::ChecksumMismatch { .. }
            | Error::ChecksumTypeChanged
            | Error::InvalidInit(_)
            | Error::UnsupportedVersion(_) => ErrorCode::ProtocolError,
            Error::Truncated(_)
            | Error::InvalidTtl
            | Error::Arg1Fragmented
            | Error::Arg1TooLarge(..)
            | Error::TooManyArgs
            | Error::TooManyHeaders(_)
            | Error::HeaderKeyTooLong(_)
            | Error::HeaderValueTooLong(_)
            | Error::EmptyHeaderKey
            | Error::DuplicateHeader(_)
            | Error::ServiceNameTooLong(_)
            | Error::InvalidUtf8(_)
            | Error::UnsupportedChecksum(_)
            | Error::NoSuchService(_)
            | Error::NoSuchEndpoint { .. }
            | Error::Config(_) => ErrorCode::BadRequest,
            Error::Remote { code, .. } => *code,
            Error::Timeout(_) => ErrorCode::Timeout,
            Error::Declined(_) | Error::NoPeerAvailable(_) => {
                ErrorCode::Declined
            }
            Error::MaxPending(_) | Error::MaxPendingForService { .. } => {
                ErrorCode::Busy
            }
            Error::ResponseDropped => ErrorCode::Unexpected,
        }
    }

    /// Whether the error means the connection that produced it can no
    /// longer be trusted and must be reset.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::FrameTooLarge(_)
                | Error::FrameTooSmall(_)
                | Error::UnknownFrameType(_)
                | Error::UnexpectedFrame(_)
                | Error::ChecksumMismatch { .. }
                | Error::ChecksumTypeChanged
                | Error::TooManyHeaders(_)
                | Error::HeaderKeyTooLong(_)
                | Error::InvalidInit(_)
                | Error::UnsupportedVersion(_)
                | Error::InitTimeout(_)
        )
    }

    /// Errors raised by local admission control rather than by a peer.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            Error::MaxPending(_) | Error::MaxPendingForService { .. }
        )
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_codes_are_unexpected() {
        assert_eq!(ErrorCode::from_byte(0x06), ErrorCode::BadRequest);
        assert_eq!(ErrorCode::from_byte(0xff), ErrorCode::ProtocolError);
        assert_eq!(ErrorCode::from_byte(0x42), ErrorCode::Unexpected);
        assert_eq!(ErrorCode::Unhealthy.as_byte(), 0x08);
    }

    #[test]
    fn classification() {
        assert_eq!(Error::InvalidTtl.code(), ErrorCode::BadRequest);
        assert_eq!(Error::Arg1Fragmented.code(), ErrorCode::BadRequest);
        assert_eq!(
            Error::ChecksumMismatch {
                expected: 1,
                actual: 2
            }
            .code(),
            ErrorCode::ProtocolError
        );
        assert_eq!(Error::busy("full").code(), ErrorCode::Busy);
        assert_eq!(Error::ConnectionClosed.code(), ErrorCode::NetworkError);
        assert!(Error::TooManyHeaders(129).is_fatal());
        assert!(!Error::Arg1Fragmented.is_fatal());
        assert!(Error::MaxPending(4).is_admission());
    }

    #[test]
    fn remote_display() {
        let e = Error::declined("connection draining: shutdown");
        assert_eq!(e.to_string(), "declined: connection draining: shutdown");
    }
}
