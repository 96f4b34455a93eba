// Copyright 2020 Joyent, Inc.

//! TChannel: a multiplexed peer-to-peer RPC transport
//!
//! Calls travel over persistent TCP connections as binary frames.  Any
//! number of calls can be outstanding on one connection at once; frames are
//! correlated to their call by a per-connection frame id.
//!
//! Frame layout
//!
//! Every frame starts with a 16 byte header followed by the payload:
//!
//! * SIZE      2-byte big-endian unsigned integer.  The size of the whole
//!           frame, header included.  The largest frame is 0xffff bytes.
//!
//! * TYPE      1-byte integer identifying the payload (init, call request,
//!           call response, continuation, cancel, claim, ping, error).
//!
//! * RESERVED  1 byte, always zero.
//!
//! * ID        4-byte big-endian unsigned integer.  The id of the operation
//!           the frame belongs to.  Id 0 is used by the init handshake.
//!
//! * RESERVED  8 bytes, always zero.
//!
//! * PAYLOAD   SIZE - 16 bytes, laid out according to TYPE.
//!
//! Call requests and responses carry three arguments (arg1 names the
//! endpoint, arg2 and arg3 are opaque to the transport).  Arguments that do
//! not fit in one frame continue in continuation frames; arg1 must always
//! fit in the first frame.  A running checksum covers the argument bytes of
//! every fragment of a message.
//!
//! The main entry point is [`Channel`](channel::Channel), which listens for
//! connections, routes inbound calls by service name to registered
//! endpoints or to a [`RelayHandler`](relay::RelayHandler), and issues
//! outbound calls with peer selection and retries.

#![allow(missing_docs)]

pub mod channel;
pub mod checksum;
pub mod config;
pub mod connection;
pub mod error;
pub mod fragment;
pub mod handler;
pub mod message;
mod operations;
pub mod peer;
pub mod peers;
pub mod protocol;
pub mod relay;
pub mod request;
pub mod server;

pub use channel::{Channel, SubChannel};
pub use config::{ChannelOptions, Direction};
pub use error::{Error, ErrorCode, Result};
pub use request::{RequestOptions, RetryFlags};
