// Copyright 2020 Joyent, Inc.

//! Peer lists and load-aware peer selection.
//!
//! Every channel owns one [`PeerRegistry`] holding the [`Peer`] objects for
//! all host:ports it knows.  A [`PeerList`] is a view onto a subset of the
//! registry, so sub channels and relay services that name the same
//! host:port share its connections.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use slog::{debug, Logger};

use crate::config::Direction;
use crate::connection::{Connection, ConnectionContext};
use crate::peer::Peer;

/// Source of the draws used to weight peer selection.
pub trait RandomSource: Send + Sync {
    /// A value in [0, 1).
    fn next(&self) -> f64;
}

pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Replays a fixed sequence of draws, cycling when it runs out.
pub struct SequenceRandom {
    values: Vec<f64>,
    next: AtomicUsize,
}

impl SequenceRandom {
    pub fn new(values: Vec<f64>) -> SequenceRandom {
        SequenceRandom {
            values,
            next: AtomicUsize::new(0),
        }
    }
}

impl RandomSource for SequenceRandom {
    fn next(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        self.values[i % self.values.len()]
    }
}

pub struct PeerRegistry {
    ctx: Arc<ConnectionContext>,
    peers: Mutex<HashMap<String, Arc<Peer>>>,
    log: Logger,
}

impl PeerRegistry {
    pub fn new(ctx: Arc<ConnectionContext>) -> Arc<PeerRegistry> {
        let log = ctx.log.clone();
        Arc::new(PeerRegistry {
            ctx,
            peers: Mutex::new(HashMap::new()),
            log,
        })
    }

    pub(crate) fn local_host_port(&self) -> String {
        self.ctx.identity().host_port
    }

    pub fn get(&self, host_port: &str) -> Option<Arc<Peer>> {
        self.peers.lock().get(host_port).cloned()
    }

    pub fn get_or_create(&self, host_port: &str) -> Arc<Peer> {
        let mut peers = self.peers.lock();
        match peers.get(host_port) {
            Some(peer) => Arc::clone(peer),
            None => {
                let peer = Peer::new(host_port, Arc::clone(&self.ctx));
                peers.insert(host_port.to_string(), Arc::clone(&peer));
                peer
            }
        }
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<_> = self.peers.lock().values().cloned().collect();
        peers.sort_by(|a, b| a.host_port().cmp(b.host_port()));
        peers
    }

    /// Drops a peer nothing refers to any more.
    pub(crate) fn forget(&self, host_port: &str) {
        let mut peers = self.peers.lock();
        let unused = peers
            .get(host_port)
            .map_or(false, |peer| !peer.is_referenced());
        if unused {
            peers.remove(host_port);
        }
    }

    /// Files an accepted connection under its remote peer once the
    /// handshake says who the remote is.  Ephemeral peers are forgotten
    /// when their connection closes.
    pub(crate) fn add_inbound(self: &Arc<Self>, conn: Connection) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            if conn.wait_identified().await.is_err() {
                return;
            }
            let host_port = conn.remote_name();
            debug!(registry.log, "adding inbound connection to peer";
                "peer" => &host_port, "connection" => conn.id());
            let peer = registry.get_or_create(&host_port);
            peer.add_connection(conn.clone());
            if conn.is_ephemeral() {
                conn.closed().await;
                if peer.count_connections(Direction::Any) == 0 {
                    registry.forget(&host_port);
                }
            }
        });
    }

    pub fn close(&self) {
        for peer in self.peers.lock().values() {
            peer.close();
        }
    }
}

pub struct PeerList {
    registry: Arc<PeerRegistry>,
    peers: RwLock<Vec<Arc<Peer>>>,
    random: Arc<dyn RandomSource>,
    prefer: Direction,
}

impl PeerList {
    pub fn new(registry: Arc<PeerRegistry>, prefer: Direction) -> PeerList {
        PeerList::with_random(registry, prefer, Arc::new(ThreadRandom))
    }

    pub fn with_random(
        registry: Arc<PeerRegistry>,
        prefer: Direction,
        random: Arc<dyn RandomSource>,
    ) -> PeerList {
        PeerList {
            registry,
            peers: RwLock::new(Vec::new()),
            random,
            prefer,
        }
    }

    pub fn preference(&self) -> Direction {
        self.prefer
    }

    /// Adds a peer, or returns the one already listed under `host_port`.
    pub fn add(&self, host_port: &str) -> Arc<Peer> {
        let mut peers = self.peers.write();
        if let Some(peer) = peers.iter().find(|p| p.host_port() == host_port) {
            return Arc::clone(peer);
        }
        let peer = self.registry.get_or_create(host_port);
        peer.acquire();
        peers.push(Arc::clone(&peer));
        peer
    }

    pub fn get(&self, host_port: &str) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .iter()
            .find(|p| p.host_port() == host_port)
            .cloned()
    }

    /// Removes a peer, closing its connections when no other list in the
    /// process holds it.
    pub fn delete(&self, host_port: &str) -> Option<Arc<Peer>> {
        let peer = {
            let mut peers = self.peers.write();
            let i = peers.iter().position(|p| p.host_port() == host_port)?;
            peers.remove(i)
        };
        self.release(&peer);
        Some(peer)
    }

    pub fn clear(&self) {
        let peers = std::mem::take(&mut *self.peers.write());
        for peer in &peers {
            self.release(peer);
        }
    }

    fn release(&self, peer: &Arc<Peer>) {
        if peer.release() == 0 {
            peer.close();
            self.registry.forget(peer.host_port());
        }
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// In insertion order.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.read().clone()
    }

    /// The best scoring peer not in `exclude`.  Ties go to the peer added
    /// first.
    pub fn choose_peer(&self, exclude: &HashSet<String>) -> Option<Arc<Peer>> {
        let peers = self.peers.read();
        let mut best: Option<(f64, &Arc<Peer>)> = None;
        for peer in peers.iter().filter(|p| !exclude.contains(p.host_port())) {
            let score = peer.score(self.prefer, self.random.next());
            if best.map_or(true, |(top, _)| score > top) {
                best = Some((score, peer));
            }
        }
        best.map(|(_, peer)| Arc::clone(peer))
    }
}
