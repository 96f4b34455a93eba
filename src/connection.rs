// Copyright 2020 Joyent, Inc.

//! One TCP connection.
//!
//! Each connection is run by a driver task that owns the socket and the
//! operation tables.  [`Connection`] is a cheap handle that talks to the
//! driver over a command channel; nothing else touches the tables, so
//! frames on a connection are processed strictly in arrival order.
//!
//! ```text
//! Unidentified --init--> Identified --drain--> Draining
//!       |                    |                    |
//!       +--------------------+--------------------+--> Closed
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use slog::{debug, error, info, o, warn, Drain, Logger};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep_until;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::checksum::ChecksumType;
use crate::config::ChannelOptions;
use crate::error::{Error, ErrorCode, Result};
use crate::fragment::{FragmentWriter, MessageHead, Reassembly};
use crate::handler::{IncomingCall, Reply, Responder, Route, ServiceNameRouter};
use crate::message::{
    parse_call_request, parse_call_response, parse_continuation,
    rewrite_call_request, CallRequestHead, CallResponseHead, CancelMessage,
    ClaimMessage, ErrorMessage, Identity, InitMessage, LazyCallRequest,
    ResponseCode, Tracing, TransportHeaders, EPHEMERAL_HOST_PORT,
};
use crate::operations::{
    expired, InKind, InOp, OperationTable, OutKind, OutOp, PendingPing, Timed,
};
use crate::protocol::{Frame, FrameCodec, FrameType, CONNECTION_FRAME_ID};
use crate::relay::{RelayBack, RelayEntryGuard, RelayRequest};

const DEFAULT_CALL_TTL: Duration = Duration::from_secs(2);
const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionDirection {
    In,
    Out,
}

impl ConnectionDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionDirection::In => "in",
            ConnectionDirection::Out => "out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unidentified,
    Identified,
    Draining,
    Closed,
}

/// Decides which services keep being served while a connection drains.
pub type DrainExempt = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A single call to issue on a connection.
#[derive(Debug, Clone)]
pub struct OutgoingCall {
    pub service: String,
    pub arg1: Bytes,
    pub arg2: Bytes,
    pub arg3: Bytes,
    pub headers: TransportHeaders,
    pub tracing: Tracing,
    pub ttl: Duration,
    /// Falls back to the channel's checksum type.
    pub checksum_type: Option<ChecksumType>,
}

impl OutgoingCall {
    pub fn new<A, B, C>(service: &str, arg1: A, arg2: B, arg3: C) -> OutgoingCall
    where
        A: Into<Bytes>,
        B: Into<Bytes>,
        C: Into<Bytes>,
    {
        OutgoingCall {
            service: service.to_string(),
            arg1: arg1.into(),
            arg2: arg2.into(),
            arg3: arg3.into(),
            headers: TransportHeaders::new(),
            tracing: Tracing::root(),
            ttl: DEFAULT_CALL_TTL,
            checksum_type: None,
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.set(key, value);
        self
    }

    pub fn tracing(mut self, tracing: Tracing) -> Self {
        self.tracing = tracing;
        self
    }

    pub fn checksum(mut self, checksum_type: ChecksumType) -> Self {
        self.checksum_type = Some(checksum_type);
        self
    }
}

/// The response to an outbound call.  `ok` is false for application
/// level errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResponse {
    pub ok: bool,
    pub headers: TransportHeaders,
    pub tracing: Tracing,
    pub arg1: Bytes,
    pub arg2: Bytes,
    pub arg3: Bytes,
}

pub(crate) enum Command {
    Call {
        call: OutgoingCall,
        reply: oneshot::Sender<Result<CallResponse>>,
    },
    Respond {
        id: u32,
        seq: u64,
        reply: Reply,
    },
    Ping {
        timeout: Duration,
        reply: oneshot::Sender<Result<Duration>>,
    },
    Drain {
        reason: String,
        exempt: Option<DrainExempt>,
    },
    Close,
    RelayOut {
        frame: Frame,
        ttl: Duration,
        service: String,
        back: RelayBack,
        reply: oneshot::Sender<Result<u32>>,
    },
    RelayOutCont {
        out_id: u32,
        frame: Frame,
    },
    RelayBound {
        in_id: u32,
        seq: u64,
        target: Connection,
        out_id: u32,
        entry: RelayEntryGuard,
    },
    RelayBack {
        in_id: u32,
        seq: u64,
        frame: Frame,
        last: bool,
    },
    RelayFailed {
        in_id: u32,
        seq: u64,
        error: Error,
    },
    RelayCancel {
        out_id: u32,
    },
}

#[derive(Clone)]
pub(crate) struct DrainRequest {
    pub(crate) reason: String,
    pub(crate) exempt: Option<DrainExempt>,
}

/// State shared by every connection of one channel.
pub struct ConnectionContext {
    identity: RwLock<Identity>,
    pub(crate) options: ChannelOptions,
    pub(crate) router: Arc<ServiceNameRouter>,
    connections: Mutex<HashMap<u64, Connection>>,
    pub(crate) drain: RwLock<Option<DrainRequest>>,
    next_connection_id: AtomicU64,
    pub(crate) log: Logger,
}

impl ConnectionContext {
    pub fn new(
        options: ChannelOptions,
        router: Arc<ServiceNameRouter>,
        log: Option<&Logger>,
    ) -> Arc<ConnectionContext> {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        Arc::new(ConnectionContext {
            identity: RwLock::new(Identity {
                host_port: EPHEMERAL_HOST_PORT.to_string(),
                process_name: options.process_name.clone(),
            }),
            options,
            router,
            connections: Mutex::new(HashMap::new()),
            drain: RwLock::new(None),
            next_connection_id: AtomicU64::new(1),
            log,
        })
    }

    pub fn identity(&self) -> Identity {
        self.identity.read().clone()
    }

    pub(crate) fn set_host_port(&self, host_port: String) {
        self.identity.write().host_port = host_port;
    }

    /// Every live connection, inbound and outbound.
    pub fn connections(&self) -> Vec<Connection> {
        let mut conns: Vec<Connection> =
            self.connections.lock().values().cloned().collect();
        conns.sort_by_key(Connection::id);
        conns
    }
}

struct Shared {
    id: u64,
    direction: ConnectionDirection,
    socket_addr: SocketAddr,
    remote: RwLock<Option<Identity>>,
    state: watch::Receiver<ConnectionState>,
    close_error: Mutex<Option<Error>>,
    in_ops: AtomicUsize,
    out_ops: AtomicUsize,
}

#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Command>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("direction", &self.shared.direction)
            .field("remote", &self.remote_name())
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Starts the driver for an established socket.
    pub fn spawn(
        stream: TcpStream,
        direction: ConnectionDirection,
        ctx: Arc<ConnectionContext>,
    ) -> Result<Connection> {
        let socket_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Unidentified);
        let id = ctx.next_connection_id.fetch_add(1, Ordering::Relaxed);

        let conn = Connection {
            shared: Arc::new(Shared {
                id,
                direction,
                socket_addr,
                remote: RwLock::new(None),
                state: state_rx,
                close_error: Mutex::new(None),
                in_ops: AtomicUsize::new(0),
                out_ops: AtomicUsize::new(0),
            }),
            tx,
        };

        let log = ctx.log.new(o!(
            "connection" => id,
            "direction" => direction.as_str(),
            "remote_addr" => socket_addr.to_string()
        ));
        let drain = ctx.drain.read().clone();
        let driver = Driver {
            conn: conn.clone(),
            ctx: Arc::clone(&ctx),
            state_tx,
            writer: FramedWrite::new(write_half, FrameCodec),
            ops: OperationTable::new(),
            pings: HashMap::new(),
            queued: Vec::new(),
            identified: false,
            drain,
            next_seq: 1,
            remote_name: socket_addr.to_string(),
            log,
        };

        ctx.connections.lock().insert(id, conn.clone());
        tokio::spawn(driver.run(FramedRead::new(read_half, FrameCodec), rx));
        Ok(conn)
    }

    /// Dials `host_port` and starts an outbound connection.
    pub async fn dial(host_port: &str, ctx: Arc<ConnectionContext>) -> Result<Connection> {
        let stream = TcpStream::connect(host_port).await?;
        Connection::spawn(stream, ConnectionDirection::Out, ctx)
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn direction(&self) -> ConnectionDirection {
        self.shared.direction
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.shared.socket_addr
    }

    pub fn remote_identity(&self) -> Option<Identity> {
        self.shared.remote.read().clone()
    }

    /// The advertised host:port of the remote, or its socket address when
    /// it is ephemeral or not yet identified.
    pub fn remote_name(&self) -> String {
        match &*self.shared.remote.read() {
            Some(identity) if !identity.is_ephemeral() => identity.host_port.clone(),
            _ => self.shared.socket_addr.to_string(),
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.shared
            .remote
            .read()
            .as_ref()
            .map_or(false, Identity::is_ephemeral)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_identified(&self) -> bool {
        self.shared.remote.read().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Number of inbound operations being served.
    pub fn in_ops_len(&self) -> usize {
        self.shared.in_ops.load(Ordering::Relaxed)
    }

    /// Number of outbound operations awaiting a response.
    pub fn out_ops_len(&self) -> usize {
        self.shared.out_ops.load(Ordering::Relaxed)
    }

    pub fn close_error(&self) -> Error {
        self.shared
            .close_error
            .lock()
            .clone()
            .unwrap_or(Error::ConnectionClosed)
    }

    pub async fn wait_identified(&self) -> Result<()> {
        let mut rx = self.shared.state.clone();
        loop {
            let state = *rx.borrow();
            if state == ConnectionState::Closed {
                return Err(self.close_error());
            }
            if self.is_identified() {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(self.close_error());
            }
        }
    }

    /// Resolves once the connection has closed, with the error that
    /// closed it, if any.
    pub async fn closed(&self) -> Option<Error> {
        let mut rx = self.shared.state.clone();
        loop {
            if *rx.borrow() == ConnectionState::Closed {
                return self.shared.close_error.lock().clone();
            }
            if rx.changed().await.is_err() {
                return self.shared.close_error.lock().clone();
            }
        }
    }

    pub(crate) fn send(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).map_err(|_| Error::ConnectionClosed)
    }

    pub async fn call(&self, call: OutgoingCall) -> Result<CallResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Call { call, reply })?;
        rx.await.map_err(|_| self.close_error())?
    }

    pub async fn ping(&self) -> Result<Duration> {
        self.ping_timeout(DEFAULT_PING_TIMEOUT).await
    }

    pub async fn ping_timeout(&self, timeout: Duration) -> Result<Duration> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Ping { timeout, reply })?;
        rx.await.map_err(|_| self.close_error())?
    }

    /// Stops accepting new calls and closes once every non-exempt
    /// operation has finished.
    pub async fn drain(&self, reason: &str, exempt: Option<DrainExempt>) {
        let cmd = Command::Drain {
            reason: reason.to_string(),
            exempt,
        };
        if self.send(cmd).is_ok() {
            self.closed().await;
        }
    }

    pub fn close(&self) {
        let _ = self.send(Command::Close);
    }

    pub(crate) fn respond(&self, id: u32, seq: u64, reply: Reply) {
        let _ = self.send(Command::Respond { id, seq, reply });
    }

    /// Forwards a relayed call request; resolves with the outbound id.
    pub(crate) async fn relay_out(
        &self,
        frame: Frame,
        ttl: Duration,
        service: String,
        back: RelayBack,
    ) -> Result<u32> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RelayOut {
            frame,
            ttl,
            service,
            back,
            reply,
        })?;
        rx.await.map_err(|_| self.close_error())?
    }
}

/// What to do with a call fragment once it has been parsed.
enum Step {
    Wait,
    Complete,
    Fail(Tracing, Error),
}

struct Driver {
    conn: Connection,
    ctx: Arc<ConnectionContext>,
    state_tx: watch::Sender<ConnectionState>,
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    ops: OperationTable<InOp, OutOp>,
    pings: HashMap<u32, PendingPing>,
    /// Commands that need an identified connection.
    queued: Vec<Command>,
    identified: bool,
    drain: Option<DrainRequest>,
    next_seq: u64,
    remote_name: String,
    log: Logger,
}

impl Driver {
    async fn run(
        mut self,
        mut reader: FramedRead<OwnedReadHalf, FrameCodec>,
        mut rx: mpsc::UnboundedReceiver<Command>,
    ) {
        let result = self.serve(&mut reader, &mut rx).await;
        self.shutdown(result, &mut rx).await;
    }

    async fn serve(
        &mut self,
        reader: &mut FramedRead<OwnedReadHalf, FrameCodec>,
        rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<()> {
        if self.conn.direction() == ConnectionDirection::Out {
            let init = InitMessage::new(&self.ctx.identity());
            self.write(init.to_frame(FrameType::InitRequest)).await?;
        }

        let init_timeout = self.ctx.options.init_timeout();
        let init_deadline = tokio::time::Instant::now() + init_timeout;
        let mut next_sweep = self.next_sweep();

        loop {
            let identified = self.identified;
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(frame)) => self.handle_frame(frame).await?,
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(Error::ConnectionReset(
                            "remote closed the connection".to_string(),
                        ))
                    }
                },
                cmd = rx.recv() => match cmd {
                    Some(Command::Close) | None => return Ok(()),
                    Some(cmd) => self.handle_command(cmd).await?,
                },
                _ = sleep_until(init_deadline), if !identified => {
                    return Err(Error::InitTimeout(init_timeout));
                }
                _ = sleep_until(next_sweep) => {
                    self.sweep().await?;
                    next_sweep = self.next_sweep();
                }
            }

            self.publish_counts();
            if self.drain_complete() {
                info!(self.log, "drain complete");
                return Ok(());
            }
        }
    }

    fn next_sweep(&self) -> tokio::time::Instant {
        tokio::time::Instant::now() + self.ctx.options.fuzzed_check_interval()
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn alloc_id(&mut self) -> u32 {
        let pings = &self.pings;
        self.ops.alloc_id(|id| pings.contains_key(&id))
    }

    fn publish_counts(&self) {
        let queued_calls = self
            .queued
            .iter()
            .filter(|cmd| matches!(cmd, Command::Call { .. } | Command::RelayOut { .. }))
            .count();
        self.conn.shared.in_ops.store(self.ops.in_len(), Ordering::Relaxed);
        self.conn
            .shared
            .out_ops
            .store(self.ops.out_len() + queued_calls, Ordering::Relaxed);
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    fn is_exempt(&self, drain: &DrainRequest, service: &str) -> bool {
        drain.exempt.as_ref().map_or(false, |f| f(service))
            || self.ctx.router.is_drain_exempt(service)
    }

    fn drain_complete(&self) -> bool {
        let drain = match &self.drain {
            Some(drain) => drain,
            None => return false,
        };
        !self.ops.in_ops().any(|op| !self.is_exempt(drain, &op.service))
            && !self.ops.out_ops().any(|op| !self.is_exempt(drain, &op.service))
    }

    fn checksum_type(&self) -> ChecksumType {
        self.ctx.options.checksum_type
    }

    async fn write(&mut self, frame: Frame) -> Result<()> {
        self.writer.send(frame).await
    }

    async fn write_all(&mut self, frames: Vec<Frame>) -> Result<()> {
        if frames.is_empty() {
            return Ok(());
        }
        for frame in frames {
            self.writer.feed(frame).await?;
        }
        self.writer.flush().await
    }

    /// Answers a call with an error frame, unless the error means the
    /// connection has to be reset.
    async fn reject(&mut self, id: u32, tracing: Tracing, e: Error) -> Result<()> {
        if e.is_fatal() {
            return Err(e);
        }
        debug!(self.log, "rejecting call"; "id" => id, "error" => %e);
        self.write(ErrorMessage::from_error(&e, tracing).to_frame(id)).await
    }

    fn log_unknown(&self, id: u32, what: &str) {
        if self.ops.is_tombstone(id) {
            debug!(self.log, "dropping late frame for finished operation";
                "id" => id, "frame" => what);
        } else {
            info!(self.log, "dropping frame for unknown operation";
                "id" => id, "frame" => what);
        }
    }

    // ── Handshake ──

    async fn identify(&mut self, identity: Identity) -> Result<()> {
        if identity.is_ephemeral() && self.conn.direction() == ConnectionDirection::Out {
            return Err(Error::InvalidInit(
                "an ephemeral peer may not accept connections".to_string(),
            ));
        }
        if !identity.is_ephemeral() {
            self.remote_name = identity.host_port.clone();
        }
        info!(self.log, "connection identified";
            "remote" => &self.remote_name,
            "process_name" => &identity.process_name);
        *self.conn.shared.remote.write() = Some(identity);
        self.identified = true;
        self.set_state(if self.drain.is_some() {
            ConnectionState::Draining
        } else {
            ConnectionState::Identified
        });

        for cmd in std::mem::take(&mut self.queued) {
            self.handle_command(cmd).await?;
        }
        Ok(())
    }

    async fn handle_init_request(&mut self, frame: Frame) -> Result<()> {
        if self.identified || self.conn.direction() == ConnectionDirection::Out {
            return Err(Error::UnexpectedFrame(
                "init request on an initialized or outbound connection".to_string(),
            ));
        }
        let identity = InitMessage::read(frame.payload)?.identity()?;
        let reply = InitMessage::new(&self.ctx.identity());
        self.write(reply.to_frame(FrameType::InitResponse)).await?;
        self.identify(identity).await
    }

    async fn handle_init_response(&mut self, frame: Frame) -> Result<()> {
        if self.identified || self.conn.direction() == ConnectionDirection::In {
            return Err(Error::UnexpectedFrame(
                "init response on an initialized or inbound connection".to_string(),
            ));
        }
        let identity = InitMessage::read(frame.payload)?.identity()?;
        self.identify(identity).await
    }

    // ── Inbound frames ──

    async fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        match frame.frame_type {
            FrameType::InitRequest => return self.handle_init_request(frame).await,
            FrameType::InitResponse => return self.handle_init_response(frame).await,
            _ => (),
        }

        if !self.identified {
            if frame.frame_type == FrameType::Error {
                let msg = ErrorMessage::read(&frame)?;
                return Err(Error::InvalidInit(format!(
                    "remote rejected init: {}",
                    msg.message
                )));
            }
            return Err(Error::UnexpectedFrame(format!(
                "{:?} before init",
                frame.frame_type
            )));
        }

        match frame.frame_type {
            FrameType::CallRequest => self.handle_call_request(frame).await,
            FrameType::CallRequestContinue => self.handle_call_request_continue(frame).await,
            FrameType::CallResponse | FrameType::CallResponseContinue => {
                self.handle_call_response(frame).await
            }
            FrameType::Error => self.handle_error(frame),
            FrameType::PingRequest => {
                self.write(Frame::empty(frame.id, FrameType::PingResponse)).await
            }
            FrameType::PingResponse => {
                self.handle_ping_response(frame.id);
                Ok(())
            }
            FrameType::Cancel => {
                match CancelMessage::read(&frame) {
                    Ok(cancel) => info!(self.log, "ignoring cancel";
                        "id" => frame.id, "why" => cancel.why),
                    Err(e) => warn!(self.log, "bad cancel frame"; "error" => %e),
                }
                Ok(())
            }
            FrameType::Claim => {
                if let Err(e) = ClaimMessage::read(&frame) {
                    warn!(self.log, "bad claim frame"; "error" => %e);
                }
                debug!(self.log, "ignoring claim"; "id" => frame.id);
                Ok(())
            }
            FrameType::InitRequest | FrameType::InitResponse => Ok(()),
        }
    }

    async fn handle_call_request(&mut self, frame: Frame) -> Result<()> {
        let id = frame.id;
        if self.ops.contains_in(id) {
            warn!(self.log, "dropping call request reusing a live id"; "id" => id);
            return Ok(());
        }

        let (tracing, ttl, service) = match LazyCallRequest::new(&frame) {
            Ok(lazy) => {
                let tracing = lazy.tracing();
                match lazy.service() {
                    Ok(service) => (tracing, lazy.ttl(), service.to_string()),
                    Err(e) => return self.reject(id, tracing, e).await,
                }
            }
            Err(e) => return self.reject(id, Tracing::default(), e).await,
        };
        if ttl == 0 {
            return self.reject(id, tracing, Error::InvalidTtl).await;
        }
        if let Some(drain) = &self.drain {
            if !self.is_exempt(drain, &service) {
                let e = Error::declined(format!("connection draining: {}", drain.reason));
                return self.reject(id, tracing, e).await;
            }
        }

        let seq = self.next_seq();
        let started = Instant::now();
        let timeout = Duration::from_millis(u64::from(ttl));
        match self.ctx.router.route(&service) {
            Route::Local(handler) => {
                let (head, body) = match parse_call_request(&frame) {
                    Ok(parsed) => parsed,
                    Err(e) => return self.reject(id, tracing, e).await,
                };
                let mut reassembly = Reassembly::new();
                let complete = match reassembly.push(head.flags, body) {
                    Ok(complete) => complete,
                    Err(e) => return self.reject(id, tracing, e).await,
                };
                self.ops.insert_in(
                    id,
                    InOp {
                        seq,
                        service,
                        tracing,
                        started,
                        timeout,
                        kind: InKind::Receiving {
                            head,
                            reassembly,
                            handler,
                        },
                    },
                );
                if complete {
                    self.dispatch(id).await?;
                }
                Ok(())
            }
            Route::Relay(relay) => {
                self.ops.insert_in(
                    id,
                    InOp {
                        seq,
                        service: service.clone(),
                        tracing,
                        started,
                        timeout,
                        kind: InKind::RelayPending {
                            buffered: Vec::new(),
                        },
                    },
                );
                relay.forward(RelayRequest {
                    inbound: self.conn.clone(),
                    in_id: id,
                    seq,
                    frame,
                    service,
                    tracing,
                    deadline: started + timeout,
                });
                Ok(())
            }
            Route::Unhandled => self.reject(id, tracing, Error::NoSuchService(service)).await,
        }
    }

    async fn handle_call_request_continue(&mut self, frame: Frame) -> Result<()> {
        let id = frame.id;
        let op = match self.ops.in_op_mut(id) {
            Some(op) => op,
            None => {
                self.log_unknown(id, "call request continuation");
                return Ok(());
            }
        };

        let tracing = op.tracing;
        let step = match &mut op.kind {
            InKind::Receiving { reassembly, .. } => {
                match parse_continuation(&frame)
                    .and_then(|(flags, body)| reassembly.push(flags, body))
                {
                    Ok(true) => Step::Complete,
                    Ok(false) => Step::Wait,
                    Err(e) => Step::Fail(tracing, e),
                }
            }
            InKind::RelayPending { buffered } => {
                buffered.push(frame);
                Step::Wait
            }
            InKind::RelayBound { target, out_id, .. } => {
                let _ = target.send(Command::RelayOutCont {
                    out_id: *out_id,
                    frame,
                });
                Step::Wait
            }
            InKind::Serving => {
                warn!(self.log, "continuation for a call already dispatched"; "id" => id);
                Step::Wait
            }
        };

        match step {
            Step::Wait => Ok(()),
            Step::Complete => self.dispatch(id).await,
            Step::Fail(tracing, e) => {
                self.ops.remove_in(id);
                self.reject(id, tracing, e).await
            }
        }
    }

    /// Hands a fully received call to its handler.
    async fn dispatch(&mut self, id: u32) -> Result<()> {
        let max_arg1 = self.ctx.options.max_arg1_size;
        let op = match self.ops.in_op_mut(id) {
            Some(op) => op,
            None => return Ok(()),
        };
        let (head, reassembly, handler) =
            match std::mem::replace(&mut op.kind, InKind::Serving) {
                InKind::Receiving {
                    head,
                    reassembly,
                    handler,
                } => (head, reassembly, handler),
                other => {
                    op.kind = other;
                    return Ok(());
                }
            };
        let (seq, timeout, tracing) = (op.seq, op.timeout, op.tracing);

        let [arg1, arg2, arg3] = reassembly.finish();
        if arg1.len() > max_arg1 {
            self.ops.remove_in(id);
            return self
                .reject(id, tracing, Error::Arg1TooLarge(arg1.len(), max_arg1))
                .await;
        }

        let call = IncomingCall {
            service: head.service,
            arg1,
            arg2,
            arg3,
            headers: head.headers,
            tracing: head.tracing,
            ttl: timeout,
            remote: self.remote_name.clone(),
        };
        handler.handle_request(call, Responder::new(self.conn.clone(), id, seq));
        Ok(())
    }

    async fn handle_call_response(&mut self, frame: Frame) -> Result<()> {
        let id = frame.id;
        let last = !frame.has_more_fragments();
        let first = frame.frame_type == FrameType::CallResponse;

        let op = match self.ops.out_op_mut(id) {
            Some(op) => op,
            None => {
                self.log_unknown(id, "call response");
                return Ok(());
            }
        };

        let step = match &mut op.kind {
            OutKind::Relay(back) => {
                back.forward(frame, last);
                if last {
                    self.ops.remove_out(id);
                }
                return Ok(());
            }
            OutKind::Local { receiving, .. } => {
                let pushed = if first {
                    if receiving.is_some() {
                        Err(Error::UnexpectedFrame("second call response".to_string()))
                    } else {
                        parse_call_response(&frame).and_then(|(head, body)| {
                            let mut reassembly = Reassembly::new();
                            let complete = reassembly.push(head.flags, body)?;
                            *receiving = Some((head, reassembly));
                            Ok(complete)
                        })
                    }
                } else {
                    match receiving {
                        Some((_, reassembly)) => parse_continuation(&frame)
                            .and_then(|(flags, body)| reassembly.push(flags, body)),
                        None => Err(Error::UnexpectedFrame(
                            "continuation before call response".to_string(),
                        )),
                    }
                };
                match pushed {
                    Ok(true) => Step::Complete,
                    Ok(false) => Step::Wait,
                    Err(e) => Step::Fail(Tracing::default(), e),
                }
            }
        };

        match step {
            Step::Wait => Ok(()),
            Step::Complete => {
                if let Some(OutOp {
                    kind:
                        OutKind::Local {
                            reply,
                            receiving: Some((head, reassembly)),
                        },
                    ..
                }) = self.ops.remove_out(id)
                {
                    let [arg1, arg2, arg3] = reassembly.finish();
                    let _ = reply.send(Ok(CallResponse {
                        ok: head.code == ResponseCode::Ok,
                        headers: head.headers,
                        tracing: head.tracing,
                        arg1,
                        arg2,
                        arg3,
                    }));
                }
                Ok(())
            }
            Step::Fail(_, e) => {
                if let Some(op) = self.ops.remove_out(id) {
                    // the remote may still send fragments for this id
                    let until = op.deadline() + self.ctx.options.tombstone_ttl_offset();
                    self.ops.add_tombstone(id, until);
                    if let OutKind::Local { reply, .. } = op.kind {
                        let _ = reply.send(Err(e.clone()));
                    }
                }
                if e.is_fatal() {
                    Err(e)
                } else {
                    warn!(self.log, "bad call response"; "id" => id, "error" => %e);
                    Ok(())
                }
            }
        }
    }

    fn handle_error(&mut self, frame: Frame) -> Result<()> {
        let id = frame.id;
        let msg = match ErrorMessage::read(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(self.log, "unreadable error frame"; "id" => id, "error" => %e);
                return Ok(());
            }
        };

        if id == CONNECTION_FRAME_ID {
            error!(self.log, "remote reported a connection error";
                "code" => %msg.code, "message" => &msg.message);
            return Err(Error::ConnectionReset(format!(
                "remote error: {}: {}",
                msg.code, msg.message
            )));
        }

        if let Some(ping) = self.pings.remove(&id) {
            let _ = ping.reply.send(Err(msg.into_error()));
            return Ok(());
        }

        match self.ops.remove_out(id) {
            Some(op) => match op.kind {
                OutKind::Local { reply, .. } => {
                    let _ = reply.send(Err(msg.into_error()));
                }
                OutKind::Relay(back) => back.forward(frame, true),
            },
            None => self.log_unknown(id, "error"),
        }
        Ok(())
    }

    fn handle_ping_response(&mut self, id: u32) {
        match self.pings.remove(&id) {
            Some(ping) => {
                let _ = ping.reply.send(Ok(ping.started.elapsed()));
            }
            None => self.log_unknown(id, "ping response"),
        }
    }

    // ── Commands ──

    async fn handle_command(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::Call { call, reply } => self.start_call(call, reply).await,
            Command::Respond { id, seq, reply } => self.send_response(id, seq, reply).await,
            Command::Ping { timeout, reply } => {
                if !self.identified {
                    self.queued.push(Command::Ping { timeout, reply });
                    return Ok(());
                }
                let id = self.alloc_id();
                self.pings.insert(
                    id,
                    PendingPing {
                        started: Instant::now(),
                        timeout,
                        reply,
                    },
                );
                self.write(Frame::empty(id, FrameType::PingRequest)).await
            }
            Command::Drain { reason, exempt } => {
                info!(self.log, "draining connection"; "reason" => &reason);
                self.drain = Some(DrainRequest { reason, exempt });
                if self.identified {
                    self.set_state(ConnectionState::Draining);
                }
                Ok(())
            }
            Command::Close => Ok(()),
            Command::RelayOut {
                frame,
                ttl,
                service,
                back,
                reply,
            } => {
                if !self.identified {
                    self.queued.push(Command::RelayOut {
                        frame,
                        ttl,
                        service,
                        back,
                        reply,
                    });
                    return Ok(());
                }
                self.start_relay(frame, ttl, service, back, reply).await
            }
            Command::RelayOutCont { out_id, frame } => {
                if self.ops.out_op_mut(out_id).is_some() {
                    self.write(frame.with_id(out_id)).await
                } else {
                    Ok(())
                }
            }
            Command::RelayBound {
                in_id,
                seq,
                target,
                out_id,
                entry,
            } => {
                self.bind_relay(in_id, seq, target, out_id, entry);
                Ok(())
            }
            Command::RelayBack {
                in_id,
                seq,
                frame,
                last,
            } => {
                if !self.in_op_is(in_id, seq) {
                    debug!(self.log, "dropping relayed frame for finished call"; "id" => in_id);
                    return Ok(());
                }
                if last {
                    self.ops.remove_in(in_id);
                }
                self.write(frame.with_id(in_id)).await
            }
            Command::RelayFailed { in_id, seq, error } => {
                if !self.in_op_is(in_id, seq) {
                    return Ok(());
                }
                match self.ops.remove_in(in_id) {
                    Some(op) => {
                        info!(self.log, "relayed call failed";
                            "id" => in_id, "service" => &op.service, "error" => %error);
                        let msg = ErrorMessage::from_error(&error, op.tracing);
                        self.write(msg.to_frame(in_id)).await
                    }
                    None => Ok(()),
                }
            }
            Command::RelayCancel { out_id } => {
                if let Some(op) = self.ops.remove_out(out_id) {
                    let until = op.deadline() + self.ctx.options.tombstone_ttl_offset();
                    self.ops.add_tombstone(out_id, until);
                }
                Ok(())
            }
        }
    }

    fn in_op_is(&mut self, id: u32, seq: u64) -> bool {
        matches!(self.ops.in_op_mut(id), Some(op) if op.seq == seq)
    }

    fn draining_error(&self) -> Option<Error> {
        self.drain
            .as_ref()
            .map(|drain| Error::Declined(format!("connection draining: {}", drain.reason)))
    }

    async fn start_call(
        &mut self,
        call: OutgoingCall,
        reply: oneshot::Sender<Result<CallResponse>>,
    ) -> Result<()> {
        if !self.identified {
            self.queued.push(Command::Call { call, reply });
            return Ok(());
        }
        if let Some(e) = self.draining_error() {
            let _ = reply.send(Err(e));
            return Ok(());
        }

        let id = self.alloc_id();
        let head = CallRequestHead {
            flags: 0,
            ttl: call.ttl.as_millis().min(u128::from(u32::MAX)) as u32,
            tracing: call.tracing,
            service: call.service.clone(),
            headers: call.headers,
        };
        let checksum_type = call.checksum_type.unwrap_or_else(|| self.checksum_type());
        let written = FragmentWriter::new(id, MessageHead::Request(&head), checksum_type)
            .max_arg1(self.ctx.options.max_arg1_size)
            .write([call.arg1, call.arg2, call.arg3]);
        let frames = match written {
            Ok(frames) => frames,
            Err(e) => {
                let _ = reply.send(Err(e));
                return Ok(());
            }
        };

        self.ops.insert_out(
            id,
            OutOp {
                service: call.service,
                started: Instant::now(),
                timeout: call.ttl,
                kind: OutKind::Local {
                    reply,
                    receiving: None,
                },
            },
        );
        self.write_all(frames).await
    }

    async fn send_response(&mut self, id: u32, seq: u64, reply: Reply) -> Result<()> {
        let serving = matches!(
            self.ops.in_op_mut(id),
            Some(op) if op.seq == seq && matches!(op.kind, InKind::Serving)
        );
        let op = match self.ops.remove_in(id) {
            Some(op) if serving => op,
            Some(other) => {
                self.ops.insert_in(id, other);
                info!(self.log, "discarding response for a reused id"; "id" => id);
                return Ok(());
            }
            None => {
                info!(self.log, "discarding response for a call that is no longer pending";
                    "id" => id);
                return Ok(());
            }
        };

        let frames = match reply {
            Reply::Response(response) => {
                let head = CallResponseHead {
                    flags: 0,
                    code: if response.ok {
                        ResponseCode::Ok
                    } else {
                        ResponseCode::Error
                    },
                    tracing: op.tracing,
                    headers: response.headers,
                };
                let written =
                    FragmentWriter::new(id, MessageHead::Response(&head), self.checksum_type())
                        .write([Bytes::new(), response.arg2, response.arg3]);
                match written {
                    Ok(frames) => frames,
                    Err(e) => {
                        error!(self.log, "failed to write response";
                            "id" => id, "error" => %e);
                        let msg = ErrorMessage::new(ErrorCode::Unexpected, op.tracing, e.to_string());
                        vec![msg.to_frame(id)]
                    }
                }
            }
            Reply::Error(code, message) => {
                vec![ErrorMessage::new(code, op.tracing, message).to_frame(id)]
            }
        };
        self.write_all(frames).await
    }

    async fn start_relay(
        &mut self,
        frame: Frame,
        ttl: Duration,
        service: String,
        back: RelayBack,
        reply: oneshot::Sender<Result<u32>>,
    ) -> Result<()> {
        if let Some(drain) = &self.drain {
            if !self.is_exempt(drain, &service) {
                let e = Error::Declined(format!("connection draining: {}", drain.reason));
                let _ = reply.send(Err(e));
                return Ok(());
            }
        }

        let id = self.alloc_id();
        let ttl_ms = ttl.as_millis().max(1).min(u128::from(u32::MAX)) as u32;
        let out = rewrite_call_request(&frame, id, ttl_ms);
        self.ops.insert_out(
            id,
            OutOp {
                service,
                started: Instant::now(),
                timeout: Duration::from_millis(u64::from(ttl_ms)),
                kind: OutKind::Relay(back),
            },
        );
        let _ = reply.send(Ok(id));
        self.write(out).await
    }

    fn bind_relay(
        &mut self,
        in_id: u32,
        seq: u64,
        target: Connection,
        out_id: u32,
        entry: RelayEntryGuard,
    ) {
        let pending = matches!(
            self.ops.in_op_mut(in_id),
            Some(op) if op.seq == seq && matches!(op.kind, InKind::RelayPending { .. })
        );
        if !pending {
            let _ = target.send(Command::RelayCancel { out_id });
            return;
        }
        if let Some(op) = self.ops.in_op_mut(in_id) {
            let bound = InKind::RelayBound {
                target: target.clone(),
                out_id,
                _entry: entry,
            };
            if let InKind::RelayPending { buffered } = std::mem::replace(&mut op.kind, bound) {
                for frame in buffered {
                    let _ = target.send(Command::RelayOutCont { out_id, frame });
                }
            }
        }
    }

    // ── Timeouts ──

    async fn sweep(&mut self) -> Result<()> {
        let now = Instant::now();
        let offset = self.ctx.options.tombstone_ttl_offset();

        for id in self.ops.expired_out(now) {
            if let Some(op) = self.ops.remove_out(id) {
                self.ops.add_tombstone(id, op.deadline() + offset);
                debug!(self.log, "outbound call timed out";
                    "id" => id, "service" => &op.service);
                let e = Error::Timeout(op.timeout);
                match op.kind {
                    OutKind::Local { reply, .. } => {
                        let _ = reply.send(Err(e));
                    }
                    OutKind::Relay(back) => back.fail(e),
                }
            }
        }

        let mut frames = Vec::new();
        for id in self.ops.expired_in(now) {
            if let Some(op) = self.ops.remove_in(id) {
                info!(self.log, "inbound call timed out";
                    "id" => id, "service" => &op.service);
                if let InKind::RelayBound { target, out_id, .. } = &op.kind {
                    let _ = target.send(Command::RelayCancel { out_id: *out_id });
                }
                let msg = ErrorMessage::from_error(&Error::Timeout(op.timeout), op.tracing);
                frames.push(msg.to_frame(id));
            }
        }

        for id in expired(&self.pings, now) {
            if let Some(ping) = self.pings.remove(&id) {
                let _ = ping.reply.send(Err(Error::Timeout(ping.timeout)));
            }
        }

        self.ops.reap_tombstones(now);
        self.write_all(frames).await
    }

    // ── Teardown ──

    async fn shutdown(mut self, result: Result<()>, rx: &mut mpsc::UnboundedReceiver<Command>) {
        let cause = match result {
            Ok(()) => {
                info!(self.log, "connection closed");
                None
            }
            Err(e) => {
                match e.code() {
                    ErrorCode::NetworkError => {
                        info!(self.log, "connection reset"; "error" => %e)
                    }
                    _ => error!(self.log, "connection failed"; "error" => %e),
                }
                Some(e)
            }
        };

        if let Some(e) = &cause {
            if e.code() == ErrorCode::ProtocolError || e.code() == ErrorCode::BadRequest {
                let msg = ErrorMessage::from_error(e, Tracing::default());
                let _ = self.write(msg.to_frame(CONNECTION_FRAME_ID)).await;
            }
        }

        rx.close();
        let reset = match &cause {
            Some(e) => Error::ConnectionReset(e.to_string()),
            None => Error::ConnectionClosed,
        };

        let (ins, outs) = self.ops.take_all();
        for (_, op) in outs {
            match op.kind {
                OutKind::Local { reply, .. } => {
                    let _ = reply.send(Err(reset.clone()));
                }
                OutKind::Relay(back) => {
                    back.fail(Error::remote(ErrorCode::NetworkError, reset.to_string()))
                }
            }
        }
        for (_, op) in ins {
            if let InKind::RelayBound { target, out_id, .. } = op.kind {
                let _ = target.send(Command::RelayCancel { out_id });
            }
        }
        for (_, ping) in self.pings.drain() {
            let _ = ping.reply.send(Err(reset.clone()));
        }

        let mut leftover = std::mem::take(&mut self.queued);
        while let Ok(cmd) = rx.try_recv() {
            leftover.push(cmd);
        }
        for cmd in leftover {
            fail_command(cmd, &reset);
        }

        let _ = self.writer.get_mut().shutdown().await;

        *self.conn.shared.close_error.lock() = cause;
        self.publish_counts();
        self.ctx.connections.lock().remove(&self.conn.id());
        self.set_state(ConnectionState::Closed);
    }
}

fn fail_command(cmd: Command, e: &Error) {
    match cmd {
        Command::Call { reply, .. } => {
            let _ = reply.send(Err(e.clone()));
        }
        Command::Ping { reply, .. } => {
            let _ = reply.send(Err(e.clone()));
        }
        Command::RelayOut { reply, .. } => {
            let _ = reply.send(Err(e.clone()));
        }
        Command::RelayBound { target, out_id, .. } => {
            let _ = target.send(Command::RelayCancel { out_id });
        }
        _ => (),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    use crate::handler::{EndpointTable, OutgoingResponse};

    async fn pair(router: Arc<ServiceNameRouter>) -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_ctx = ConnectionContext::new(ChannelOptions::default(), router, None);
        server_ctx.set_host_port(addr.to_string());
        let client_ctx = ConnectionContext::new(
            ChannelOptions::default(),
            Arc::new(ServiceNameRouter::new()),
            None,
        );

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            Connection::spawn(stream, ConnectionDirection::In, server_ctx).unwrap()
        });
        let client = Connection::dial(&addr.to_string(), client_ctx).await.unwrap();
        let server = accept.await.unwrap();
        (client, server)
    }

    fn echo_router() -> Arc<ServiceNameRouter> {
        let table = EndpointTable::new("echo", None);
        table.register("echo", |call: IncomingCall| async move {
            Ok(OutgoingResponse::ok(call.arg2, call.arg3))
        });
        let router = Arc::new(ServiceNameRouter::new());
        router.register("echo", Arc::new(table));
        router
    }

    #[tokio::test]
    async fn handshake_and_call() {
        let (client, server) = pair(echo_router()).await;
        client.wait_identified().await.unwrap();
        server.wait_identified().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Identified);
        // the client never listened, so it is ephemeral
        assert!(server.is_ephemeral());
        assert_eq!(server.remote_name(), server.socket_addr().to_string());

        let res = client
            .call(OutgoingCall::new("echo", "echo", "head", "body"))
            .await
            .unwrap();
        assert!(res.ok);
        assert_eq!(&res.arg2[..], b"head");
        assert_eq!(&res.arg3[..], b"body");
        assert!(client.ping().await.is_ok());
        assert_eq!(client.out_ops_len(), 0);
    }

    #[tokio::test]
    async fn unknown_service_and_endpoint() {
        let (client, _server) = pair(echo_router()).await;
        match client.call(OutgoingCall::new("nope", "echo", "", "")).await {
            Err(Error::Remote { code, .. }) => assert_eq!(code, ErrorCode::BadRequest),
            other => panic!("unexpected result {:?}", other),
        }
        match client.call(OutgoingCall::new("echo", "nope", "", "")).await {
            Err(Error::Remote { code, message }) => {
                assert_eq!(code, ErrorCode::BadRequest);
                assert!(message.contains("nope"));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn zero_ttl_fails_before_sending() {
        let (client, server) = pair(echo_router()).await;
        let call = OutgoingCall::new("echo", "echo", "", "").ttl(Duration::from_millis(0));
        assert!(matches!(client.call(call).await, Err(Error::InvalidTtl)));
        assert_eq!(client.out_ops_len(), 0);
        assert_eq!(server.in_ops_len(), 0);
    }

    #[tokio::test]
    async fn close_resets_pending_calls() {
        let table = EndpointTable::new("slow", None);
        table.register("wait", |_call: IncomingCall| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(OutgoingResponse::ok("", ""))
        });
        let router = Arc::new(ServiceNameRouter::new());
        router.register("slow", Arc::new(table));
        let (client, server) = pair(router).await;
        client.wait_identified().await.unwrap();

        let pending = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call(OutgoingCall::new("slow", "wait", "", "").ttl(Duration::from_secs(5)))
                    .await
            })
        };
        while server.in_ops_len() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        server.close();
        assert!(matches!(
            pending.await.unwrap(),
            Err(Error::ConnectionReset(_))
        ));
        client.closed().await;
        assert!(client.is_closed());
        assert_eq!(client.out_ops_len(), 0);
    }
}
