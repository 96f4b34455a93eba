// Copyright 2020 Joyent, Inc.

//! Forwarding calls for services this process does not serve itself.
//!
//! The relay reads only the fixed head of an inbound call request (service
//! name, ttl, tracing), picks a downstream peer for the service and hands
//! the frames over unchanged apart from the frame id and ttl.  Response,
//! continuation and error frames travel back the same way.  While a call is
//! in flight a [`RelayEntry`] records which inbound id maps to which
//! outbound id; the entry goes away with the inbound operation that owns it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use slog::{debug, info, o, warn, Drain, Logger};
use tokio::sync::broadcast;

use crate::config::Direction;
use crate::connection::{Command, Connection};
use crate::error::{Error, ErrorCode, Result};
use crate::message::Tracing;
use crate::peer::Peer;
use crate::peers::{PeerList, PeerRegistry};
use crate::protocol::Frame;

const MIN_HOP_TTL: Duration = Duration::from_millis(1);
const ROLE_EVENT_CAPACITY: usize = 64;
const NO_PEER: &str = "no peer available for request";

/// Sends frames for one relayed call back to the inbound connection.
#[derive(Clone)]
pub(crate) struct RelayBack {
    conn: Connection,
    in_id: u32,
    seq: u64,
}

impl RelayBack {
    pub(crate) fn new(conn: Connection, in_id: u32, seq: u64) -> RelayBack {
        RelayBack { conn, in_id, seq }
    }

    pub(crate) fn forward(&self, frame: Frame, last: bool) {
        let _ = self.conn.send(Command::RelayBack {
            in_id: self.in_id,
            seq: self.seq,
            frame,
            last,
        });
    }

    pub(crate) fn fail(&self, error: Error) {
        let _ = self.conn.send(Command::RelayFailed {
            in_id: self.in_id,
            seq: self.seq,
            error,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEntry {
    pub service: String,
    pub inbound_conn: u64,
    pub inbound_frame_id: u32,
    pub outbound_conn: u64,
    pub outbound_frame_id: u32,
}

type RelayTable = Arc<Mutex<HashMap<(u64, u32), RelayEntry>>>;

/// Removes its entry from the relay table when dropped.
pub(crate) struct RelayEntryGuard {
    table: RelayTable,
    key: (u64, u32),
}

impl Drop for RelayEntryGuard {
    fn drop(&mut self) {
        self.table.lock().remove(&self.key);
    }
}

/// An inbound call the connection has handed to the relay.
pub(crate) struct RelayRequest {
    pub(crate) inbound: Connection,
    pub(crate) in_id: u32,
    pub(crate) seq: u64,
    pub(crate) frame: Frame,
    pub(crate) service: String,
    pub(crate) tracing: Tracing,
    pub(crate) deadline: Instant,
}

/// Membership changes of the relay's downstream peer lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleEvent {
    /// The first downstream peer for `service` was added.
    EnterForward { service: String },
    /// The last downstream peer for `service` was removed.
    LeaveForward { service: String },
}

pub struct RelayHandler {
    registry: Arc<PeerRegistry>,
    prefer: Direction,
    services: RwLock<HashMap<String, Arc<PeerList>>>,
    entries: RelayTable,
    drain_exempt: RwLock<HashSet<String>>,
    events: broadcast::Sender<RoleEvent>,
    log: Logger,
}

impl RelayHandler {
    pub fn new(
        registry: Arc<PeerRegistry>,
        prefer: Direction,
        log: Option<&Logger>,
    ) -> RelayHandler {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let (events, _) = broadcast::channel(ROLE_EVENT_CAPACITY);
        RelayHandler {
            registry,
            prefer,
            services: RwLock::new(HashMap::new()),
            entries: Arc::new(Mutex::new(HashMap::new())),
            drain_exempt: RwLock::new(HashSet::new()),
            events,
            log: log.new(o!("component" => "relay")),
        }
    }

    /// Adds a downstream peer for `service`.
    pub fn add_peer(&self, service: &str, host_port: &str) -> Arc<Peer> {
        let (list, entered) = {
            let mut services = self.services.write();
            let list = services.entry(service.to_string()).or_insert_with(|| {
                Arc::new(PeerList::new(Arc::clone(&self.registry), self.prefer))
            });
            let entered = list.is_empty();
            (Arc::clone(list), entered)
        };
        let peer = list.add(host_port);
        if entered {
            info!(self.log, "forwarding service"; "service" => service);
            let _ = self.events.send(RoleEvent::EnterForward {
                service: service.to_string(),
            });
        }
        peer
    }

    /// Returns false if the peer was not listed for `service`.
    pub fn remove_peer(&self, service: &str, host_port: &str) -> bool {
        let left = {
            let mut services = self.services.write();
            let list = match services.get(service) {
                Some(list) => Arc::clone(list),
                None => return false,
            };
            if list.delete(host_port).is_none() {
                return false;
            }
            if list.is_empty() {
                services.remove(service);
            }
            list.is_empty()
        };
        if left {
            info!(self.log, "no longer forwarding service"; "service" => service);
            let _ = self.events.send(RoleEvent::LeaveForward {
                service: service.to_string(),
            });
        }
        true
    }

    pub fn peers_for(&self, service: &str) -> Vec<String> {
        self.list(service)
            .map(|list| {
                list.peers()
                    .iter()
                    .map(|p| p.host_port().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<String> = self.services.read().keys().cloned().collect();
        services.sort();
        services
    }

    fn list(&self, service: &str) -> Option<Arc<PeerList>> {
        self.services.read().get(service).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoleEvent> {
        self.events.subscribe()
    }

    /// Services that keep being relayed while the channel drains.
    pub fn set_drain_exempt_services<I, S>(&self, services: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.drain_exempt.write() = services.into_iter().map(Into::into).collect();
    }

    pub fn is_drain_exempt(&self, service: &str) -> bool {
        self.drain_exempt.read().contains(service)
    }

    /// Relayed calls currently in flight.
    pub fn active_entries(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn entries(&self) -> Vec<RelayEntry> {
        self.entries.lock().values().cloned().collect()
    }

    fn insert_entry(&self, entry: RelayEntry) -> RelayEntryGuard {
        let key = (entry.inbound_conn, entry.inbound_frame_id);
        self.entries.lock().insert(key, entry);
        RelayEntryGuard {
            table: Arc::clone(&self.entries),
            key,
        }
    }

    pub(crate) fn forward(self: &Arc<Self>, req: RelayRequest) {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            let back = RelayBack::new(req.inbound.clone(), req.in_id, req.seq);
            if let Err(e) = relay.bind(&req, &back).await {
                debug!(relay.log, "cannot relay call";
                    "service" => &req.service,
                    "trace_id" => req.tracing.trace_id,
                    "error" => %e);
                back.fail(e);
            }
        });
    }

    /// Opens the downstream leg of a relayed call and tells the inbound
    /// connection about it.
    async fn bind(&self, req: &RelayRequest, back: &RelayBack) -> Result<()> {
        let list = self
            .list(&req.service)
            .ok_or_else(|| Error::declined(NO_PEER))?;
        // never relay back to ourselves
        let mut tried = HashSet::new();
        tried.insert(self.registry.local_host_port());

        loop {
            let remaining = time_left(req.deadline)?;
            let peer = list
                .choose_peer(&tried)
                .ok_or_else(|| Error::declined(NO_PEER))?;
            tried.insert(peer.host_port().to_string());

            let conn = match tokio::time::timeout(
                remaining,
                peer.wait_for_identified(list.preference()),
            )
            .await
            {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    info!(self.log, "downstream peer unavailable";
                        "peer" => peer.host_port(), "error" => %e);
                    continue;
                }
                Err(_) => return Err(out_of_time()),
            };

            let ttl = time_left(req.deadline)?;
            let out_id = match conn
                .relay_out(req.frame.clone(), ttl, req.service.clone(), back.clone())
                .await
            {
                Ok(id) => id,
                Err(e) => {
                    info!(self.log, "downstream connection refused call";
                        "peer" => peer.host_port(), "error" => %e);
                    continue;
                }
            };

            let entry = self.insert_entry(RelayEntry {
                service: req.service.clone(),
                inbound_conn: req.inbound.id(),
                inbound_frame_id: req.in_id,
                outbound_conn: conn.id(),
                outbound_frame_id: out_id,
            });
            let bound = Command::RelayBound {
                in_id: req.in_id,
                seq: req.seq,
                target: conn.clone(),
                out_id,
                entry,
            };
            if req.inbound.send(bound).is_err() {
                warn!(self.log, "inbound connection closed before relay was bound";
                    "service" => &req.service);
                let _ = conn.send(Command::RelayCancel { out_id });
            }
            return Ok(());
        }
    }
}

fn out_of_time() -> Error {
    Error::remote(ErrorCode::Timeout, "ttl expired before the call could be relayed")
}

fn time_left(deadline: Instant) -> Result<Duration> {
    match deadline.checked_duration_since(Instant::now()) {
        Some(d) if d >= MIN_HOP_TTL => Ok(d),
        _ => Err(out_of_time()),
    }
}
