// Copyright 2020 Joyent, Inc.

//! The top level object of the crate.
//!
//! A [`Channel`] owns the listening socket, every connection, the peer
//! registry and the routing table for inbound calls.  [`SubChannel`]s are
//! per-service views that keep their own peer list and endpoint table.
//!
//! ```no_run
//! # async fn run() -> tchannel::Result<()> {
//! use tchannel::{Channel, ChannelOptions};
//! use tchannel::handler::OutgoingResponse;
//!
//! let server = Channel::new(ChannelOptions::default(), None)?;
//! let addr = server.listen("127.0.0.1:0").await?;
//! server.sub_channel("echo").register("echo", |call| async move {
//!     Ok(OutgoingResponse::ok(call.arg2, call.arg3))
//! });
//!
//! let client = Channel::new(ChannelOptions::default(), None)?;
//! let echo = client.sub_channel("echo");
//! echo.add_peer(&addr.to_string());
//! let res = echo.call("echo", "head", "body").await?;
//! assert_eq!(&res.arg3[..], b"body");
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use slog::{info, o, warn, Drain, Logger};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::ChannelOptions;
use crate::connection::{CallResponse, Connection, ConnectionContext, DrainExempt, DrainRequest};
use crate::error::Result;
use crate::handler::{EndpointTable, Handler, IncomingCall, OutgoingResponse, ServiceNameRouter};
use crate::peer::Peer;
use crate::peers::{PeerList, PeerRegistry, RandomSource, ThreadRandom};
use crate::relay::RelayHandler;
use crate::request::{OutgoingRequest, RequestDefaults, RequestOptions, Services};
use crate::server;

struct Inner {
    options: ChannelOptions,
    ctx: Arc<ConnectionContext>,
    router: Arc<ServiceNameRouter>,
    registry: Arc<PeerRegistry>,
    services: Arc<Services>,
    root_peers: Arc<PeerList>,
    sub_peers: RwLock<HashMap<String, Arc<PeerList>>>,
    tables: Mutex<HashMap<String, Arc<EndpointTable>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    log: Logger,
}

#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    pub fn new(options: ChannelOptions, log: Option<&Logger>) -> Result<Channel> {
        options.validate()?;
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("process_name" => options.process_name.clone()));

        let router = Arc::new(ServiceNameRouter::new());
        let ctx = ConnectionContext::new(options.clone(), Arc::clone(&router), Some(&log));
        let registry = PeerRegistry::new(Arc::clone(&ctx));
        let root_peers = Arc::new(PeerList::new(
            Arc::clone(&registry),
            options.prefer_connection_direction,
        ));
        let services = Services::new(options.max_pending, options.max_pending_for_service);

        Ok(Channel {
            inner: Arc::new(Inner {
                options,
                ctx,
                router,
                registry,
                services,
                root_peers,
                sub_peers: RwLock::new(HashMap::new()),
                tables: Mutex::new(HashMap::new()),
                listener: Mutex::new(None),
                log,
            }),
        })
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.inner.options
    }

    /// Starts accepting connections.  Until a channel listens it calls out
    /// as an ephemeral peer that cannot be dialed back.
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        self.inner.ctx.set_host_port(local.to_string());
        info!(self.inner.log, "listening"; "address" => %local);

        let task = server::make_task(
            listener,
            Arc::clone(&self.inner.ctx),
            Arc::clone(&self.inner.registry),
            &self.inner.log,
        );
        if let Some(old) = self.inner.listener.lock().replace(task) {
            old.abort();
        }
        Ok(local)
    }

    pub fn host_port(&self) -> String {
        self.inner.ctx.identity().host_port
    }

    /// Serves `service` with a custom handler.
    pub fn register(&self, service: &str, handler: Arc<dyn Handler>) {
        self.inner.tables.lock().remove(service);
        self.inner.router.register(service, handler);
    }

    /// The endpoint table serving `service`, created on first use.
    pub fn endpoints(&self, service: &str) -> Arc<EndpointTable> {
        let mut tables = self.inner.tables.lock();
        if let Some(table) = tables.get(service) {
            return Arc::clone(table);
        }
        let table = Arc::new(EndpointTable::new(service, Some(&self.inner.log)));
        tables.insert(service.to_string(), Arc::clone(&table));
        self.inner.router.register(service, table.clone());
        table
    }

    pub fn sub_channel(&self, service: &str) -> SubChannel {
        self.sub_channel_with_random(service, Arc::new(ThreadRandom))
    }

    /// Like `sub_channel`, with peer selection drawing from `random` when
    /// the sub channel is created by this call.
    pub fn sub_channel_with_random(
        &self,
        service: &str,
        random: Arc<dyn RandomSource>,
    ) -> SubChannel {
        let peers = {
            let mut subs = self.inner.sub_peers.write();
            let peers = subs.entry(service.to_string()).or_insert_with(|| {
                Arc::new(PeerList::with_random(
                    Arc::clone(&self.inner.registry),
                    self.inner.options.prefer_connection_direction,
                    random,
                ))
            });
            Arc::clone(peers)
        };
        SubChannel {
            service: service.to_string(),
            peers,
            channel: self.clone(),
        }
    }

    /// The channel-wide peer list.
    pub fn peers(&self) -> Arc<PeerList> {
        Arc::clone(&self.inner.root_peers)
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.inner.registry)
    }

    /// The relay for services this channel does not serve, created and
    /// installed on first use.
    pub fn relay(&self) -> Arc<RelayHandler> {
        if let Some(relay) = self.inner.router.relay() {
            return relay;
        }
        let relay = Arc::new(RelayHandler::new(
            Arc::clone(&self.inner.registry),
            self.inner.options.prefer_connection_direction,
            Some(&self.inner.log),
        ));
        self.inner.router.set_relay(Some(Arc::clone(&relay)));
        relay
    }

    fn defaults(&self) -> RequestDefaults {
        RequestDefaults {
            timeout: self.inner.options.request_timeout(),
            retry_limit: self.inner.options.retry_limit,
            caller_name: self.inner.options.process_name.clone(),
        }
    }

    /// A request over the channel-wide peer list.
    pub fn request(&self, options: RequestOptions) -> OutgoingRequest {
        self.request_with(options, self.peers())
    }

    fn request_with(&self, options: RequestOptions, peers: Arc<PeerList>) -> OutgoingRequest {
        OutgoingRequest::new(
            options,
            peers,
            Arc::clone(&self.inner.services),
            self.defaults(),
            &self.inner.log,
        )
    }

    /// Outgoing requests admitted and not yet finished.
    pub fn pending(&self) -> usize {
        self.inner.services.pending()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner.ctx.connections()
    }

    /// Drains every connection, including ones accepted from now on, and
    /// resolves once they have all closed.
    /// A channel drains once; later calls are logged and ignored.
    pub async fn drain(&self, reason: &str, exempt: Option<DrainExempt>) {
        {
            let mut drain = self.inner.ctx.drain.write();
            if let Some(current) = drain.as_ref() {
                warn!(self.inner.log, "channel already draining";
                    "reason" => reason, "current" => &current.reason);
                return;
            }
            *drain = Some(DrainRequest {
                reason: reason.to_string(),
                exempt: exempt.clone(),
            });
        }
        info!(self.inner.log, "draining channel"; "reason" => reason);
        let conns = self.connections();
        join_all(conns.iter().map(|c| c.drain(reason, exempt.clone()))).await;
    }

    pub fn close(&self) {
        info!(self.inner.log, "closing channel");
        if let Some(task) = self.inner.listener.lock().take() {
            task.abort();
        }
        self.inner.router.set_relay(None);
        self.inner.registry.close();
        for conn in self.connections() {
            conn.close();
        }
    }
}

/// A view of a channel scoped to one service.
#[derive(Clone)]
pub struct SubChannel {
    service: String,
    peers: Arc<PeerList>,
    channel: Channel,
}

impl SubChannel {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn peers(&self) -> Arc<PeerList> {
        Arc::clone(&self.peers)
    }

    pub fn add_peer(&self, host_port: &str) -> Arc<Peer> {
        self.peers.add(host_port)
    }

    /// Serves `endpoint` of this sub channel's service.
    pub fn register<F, Fut>(&self, endpoint: &str, f: F)
    where
        F: Fn(IncomingCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<OutgoingResponse>> + Send + 'static,
    {
        self.channel.endpoints(&self.service).register(endpoint, f);
    }

    pub fn request_options(&self) -> RequestOptions {
        RequestOptions::new(&self.service)
    }

    /// A request over this sub channel's peers.  The service is always
    /// this sub channel's.
    pub fn request(&self, mut options: RequestOptions) -> OutgoingRequest {
        options.service = self.service.clone();
        self.channel.request_with(options, self.peers())
    }

    /// Calls `endpoint` with default options.
    pub async fn call<B, C>(&self, endpoint: &str, arg2: B, arg3: C) -> Result<CallResponse>
    where
        B: Into<Bytes>,
        C: Into<Bytes>,
    {
        let mut req = self.request(self.request_options());
        req.send(Bytes::from(endpoint.to_string()), arg2, arg3).await
    }
}
