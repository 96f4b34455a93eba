// Copyright 2020 Joyent, Inc.

//! Request handlers and service routing.
//!
//! A connection hands each fully reassembled inbound call, together with a
//! [`Responder`], to the [`Handler`] registered for the call's service.
//! Calls for services with no local handler go to the channel's relay, if
//! it has one.

use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use slog::{debug, o, Drain, Logger};

use crate::connection::Connection;
use crate::error::{Error, ErrorCode, Result};
use crate::message::{headers, Tracing, TransportHeaders};
use crate::relay::RelayHandler;

/// An inbound call whose arguments have all arrived.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub service: String,
    pub arg1: Bytes,
    pub arg2: Bytes,
    pub arg3: Bytes,
    pub headers: TransportHeaders,
    pub tracing: Tracing,
    pub ttl: Duration,
    /// host:port of the calling peer.
    pub remote: String,
}

impl IncomingCall {
    pub fn endpoint(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.arg1)
    }

    pub fn caller_name(&self) -> Option<&str> {
        self.headers.get(headers::CALLER_NAME)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingResponse {
    pub ok: bool,
    pub headers: TransportHeaders,
    pub arg2: Bytes,
    pub arg3: Bytes,
}

impl OutgoingResponse {
    pub fn ok<A: Into<Bytes>, B: Into<Bytes>>(arg2: A, arg3: B) -> Self {
        OutgoingResponse {
            ok: true,
            headers: TransportHeaders::new(),
            arg2: arg2.into(),
            arg3: arg3.into(),
        }
    }

    /// An application level error response.
    pub fn not_ok<A: Into<Bytes>, B: Into<Bytes>>(arg2: A, arg3: B) -> Self {
        OutgoingResponse {
            ok: false,
            ..OutgoingResponse::ok(arg2, arg3)
        }
    }

    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.set(key, value);
        self
    }
}

#[derive(Debug)]
pub(crate) enum Reply {
    Response(OutgoingResponse),
    Error(ErrorCode, String),
}

/// Sends the single response to one inbound call.
///
/// Dropping a responder without using it answers the call with an
/// unexpected error.
pub struct Responder {
    conn: Connection,
    id: u32,
    seq: u64,
    sent: bool,
}

impl Responder {
    pub(crate) fn new(conn: Connection, id: u32, seq: u64) -> Responder {
        Responder {
            conn,
            id,
            seq,
            sent: false,
        }
    }

    pub fn send(mut self, response: OutgoingResponse) {
        self.finish(Reply::Response(response));
    }

    pub fn send_ok<A: Into<Bytes>, B: Into<Bytes>>(self, arg2: A, arg3: B) {
        self.send(OutgoingResponse::ok(arg2, arg3));
    }

    pub fn send_not_ok<A: Into<Bytes>, B: Into<Bytes>>(self, arg2: A, arg3: B) {
        self.send(OutgoingResponse::not_ok(arg2, arg3));
    }

    pub fn send_error<S: Into<String>>(mut self, code: ErrorCode, message: S) {
        self.finish(Reply::Error(code, message.into()));
    }

    pub fn send_result(self, result: Result<OutgoingResponse>) {
        match result {
            Ok(response) => self.send(response),
            Err(Error::Remote { code, message }) => self.send_error(code, message),
            Err(e) => {
                let code = e.code();
                self.send_error(code, e.to_string())
            }
        }
    }

    fn finish(&mut self, reply: Reply) {
        self.sent = true;
        self.conn.respond(self.id, self.seq, reply);
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.sent {
            let message = Error::ResponseDropped.to_string();
            self.finish(Reply::Error(ErrorCode::Unexpected, message));
        }
    }
}

pub trait Handler: Send + Sync {
    /// Must not block; long running work belongs on a spawned task.
    fn handle_request(&self, call: IncomingCall, responder: Responder);
}

type EndpointFn = Arc<
    dyn Fn(IncomingCall) -> BoxFuture<'static, Result<OutgoingResponse>>
        + Send
        + Sync,
>;

/// Dispatches calls for one service to async endpoint functions by arg1.
pub struct EndpointTable {
    service: String,
    endpoints: RwLock<HashMap<String, EndpointFn>>,
    log: Logger,
}

impl EndpointTable {
    pub fn new(service: &str, log: Option<&Logger>) -> EndpointTable {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        EndpointTable {
            service: service.to_string(),
            endpoints: RwLock::new(HashMap::new()),
            log: log.new(o!("service" => service.to_string())),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn register<F, Fut>(&self, endpoint: &str, f: F)
    where
        F: Fn(IncomingCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<OutgoingResponse>> + Send + 'static,
    {
        let f: EndpointFn = Arc::new(move |call| f(call).boxed());
        self.endpoints.write().insert(endpoint.to_string(), f);
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.read().keys().cloned().collect()
    }
}

impl Handler for EndpointTable {
    fn handle_request(&self, call: IncomingCall, responder: Responder) {
        let endpoint = call.endpoint().into_owned();
        let f = self.endpoints.read().get(&endpoint).cloned();
        match f {
            Some(f) => {
                debug!(self.log, "handling call"; "endpoint" => &endpoint);
                tokio::spawn(async move {
                    responder.send_result(f(call).await);
                });
            }
            None => {
                let e = Error::NoSuchEndpoint {
                    service: self.service.clone(),
                    endpoint,
                };
                responder.send_error(e.code(), e.to_string());
            }
        }
    }
}

/// Where an inbound call for a service goes.
pub enum Route {
    Local(Arc<dyn Handler>),
    Relay(Arc<RelayHandler>),
    Unhandled,
}

#[derive(Default)]
pub struct ServiceNameRouter {
    services: RwLock<HashMap<String, Arc<dyn Handler>>>,
    relay: RwLock<Option<Arc<RelayHandler>>>,
}

impl ServiceNameRouter {
    pub fn new() -> ServiceNameRouter {
        ServiceNameRouter::default()
    }

    pub fn register(&self, service: &str, handler: Arc<dyn Handler>) {
        self.services.write().insert(service.to_string(), handler);
    }

    pub fn unregister(&self, service: &str) -> Option<Arc<dyn Handler>> {
        self.services.write().remove(service)
    }

    pub fn handler(&self, service: &str) -> Option<Arc<dyn Handler>> {
        self.services.read().get(service).cloned()
    }

    pub fn set_relay(&self, relay: Option<Arc<RelayHandler>>) {
        *self.relay.write() = relay;
    }

    pub fn relay(&self) -> Option<Arc<RelayHandler>> {
        self.relay.read().clone()
    }

    pub fn route(&self, service: &str) -> Route {
        if let Some(handler) = self.handler(service) {
            return Route::Local(handler);
        }
        match self.relay() {
            Some(relay) => Route::Relay(relay),
            None => Route::Unhandled,
        }
    }

    /// Services the relay keeps forwarding while the channel drains.
    pub fn is_drain_exempt(&self, service: &str) -> bool {
        self.relay
            .read()
            .as_ref()
            .map_or(false, |relay| relay.is_drain_exempt(service))
    }
}
