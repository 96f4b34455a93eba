// Copyright 2020 Joyent, Inc.

//! A remote endpoint and the connections this process has to it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use slog::{debug, info, o, Logger};

use crate::config::Direction;
use crate::connection::{Connection, ConnectionContext, ConnectionDirection, ConnectionState};
use crate::error::Result;

const UNIDENTIFIED_TIER: (f64, f64) = (0.1, 0.3);
const IDENTIFIED_TIER: (f64, f64) = (0.4, 0.6);

fn preferred(pref: Direction, direction: ConnectionDirection) -> bool {
    match pref {
        Direction::Any => true,
        Direction::In => direction == ConnectionDirection::In,
        Direction::Out => direction == ConnectionDirection::Out,
    }
}

fn usable(conn: &Connection) -> bool {
    matches!(
        conn.state(),
        ConnectionState::Unidentified | ConnectionState::Identified
    )
}

fn identified(conn: &Connection) -> bool {
    conn.state() == ConnectionState::Identified
}

pub struct Peer {
    host_port: String,
    ctx: Arc<ConnectionContext>,
    /// Oldest first.
    conns: Mutex<Vec<Connection>>,
    dial_lock: tokio::sync::Mutex<()>,
    list_refs: AtomicUsize,
    log: Logger,
}

impl Peer {
    pub(crate) fn new(host_port: &str, ctx: Arc<ConnectionContext>) -> Arc<Peer> {
        let log = ctx.log.new(o!("peer" => host_port.to_string()));
        Arc::new(Peer {
            host_port: host_port.to_string(),
            ctx,
            conns: Mutex::new(Vec::new()),
            dial_lock: tokio::sync::Mutex::new(()),
            list_refs: AtomicUsize::new(0),
            log,
        })
    }

    pub fn host_port(&self) -> &str {
        &self.host_port
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.conns.lock().clone()
    }

    pub fn count_connections(&self, direction: Direction) -> usize {
        self.conns
            .lock()
            .iter()
            .filter(|c| !c.is_closed() && preferred(direction, c.direction()))
            .count()
    }

    /// The newest identified connection of the preferred kind, else the
    /// newest identified one of any kind, else the newest live one, which
    /// may still be in its handshake.
    pub fn get_identified_connection(&self, pref: Direction) -> Option<Connection> {
        let conns = self.conns.lock();
        conns
            .iter()
            .rev()
            .find(|c| identified(c) && preferred(pref, c.direction()))
            .or_else(|| conns.iter().rev().find(|c| identified(c)))
            .or_else(|| conns.iter().rev().find(|c| usable(c)))
            .cloned()
    }

    fn has_identified(&self, pref: Direction) -> bool {
        self.conns
            .lock()
            .iter()
            .any(|c| identified(c) && preferred(pref, c.direction()))
    }

    /// An existing connection that satisfies `pref`, if any.  `Out` is only
    /// satisfied by an outbound connection.
    fn existing(&self, pref: Direction) -> Option<Connection> {
        let conns = self.conns.lock();
        let live = || conns.iter().rev().filter(|c| usable(c));
        let found = match pref {
            Direction::Out => live().find(|c| c.direction() == ConnectionDirection::Out),
            Direction::In => live()
                .find(|c| c.direction() == ConnectionDirection::In)
                .or_else(|| live().next()),
            Direction::Any => live().find(|c| identified(c)).or_else(|| live().next()),
        };
        found.cloned()
    }

    /// Returns a usable connection, dialing one if the peer has none that
    /// satisfies `pref`.
    pub async fn connect(self: &Arc<Self>, pref: Direction) -> Result<Connection> {
        if let Some(conn) = self.existing(pref) {
            return Ok(conn);
        }

        let _dialing = self.dial_lock.lock().await;
        if let Some(conn) = self.existing(pref) {
            return Ok(conn);
        }
        debug!(self.log, "dialing peer");
        let conn = Connection::dial(&self.host_port, Arc::clone(&self.ctx)).await?;
        self.add_connection(conn.clone());
        Ok(conn)
    }

    /// Like `connect`, but resolves only once the connection is identified.
    pub async fn wait_for_identified(self: &Arc<Self>, pref: Direction) -> Result<Connection> {
        let conn = self.connect(pref).await?;
        conn.wait_identified().await?;
        Ok(conn)
    }

    pub(crate) fn add_connection(self: &Arc<Self>, conn: Connection) {
        {
            let mut conns = self.conns.lock();
            if conns.iter().any(|c| c.id() == conn.id()) {
                return;
            }
            conns.push(conn.clone());
        }

        let peer = Arc::downgrade(self);
        tokio::spawn(async move {
            let reason = conn.closed().await;
            if let Some(peer) = peer.upgrade() {
                peer.conns.lock().retain(|c| c.id() != conn.id());
                match reason {
                    Some(e) => info!(peer.log, "connection to peer reset";
                        "connection" => conn.id(), "error" => %e),
                    None => debug!(peer.log, "connection to peer closed";
                        "connection" => conn.id()),
                }
            }
        });
    }

    /// Outbound calls awaiting a response across all connections.
    pub fn pending(&self) -> usize {
        self.conns.lock().iter().map(Connection::out_ops_len).sum()
    }

    /// Selection score for one draw of `r` in [0, 1).  Peers with an
    /// identified connection of the preferred kind always outrank those
    /// without, and more pending calls lower the score within a tier.
    pub fn score(&self, pref: Direction, r: f64) -> f64 {
        let (base, width) = if self.has_identified(pref) {
            IDENTIFIED_TIER
        } else {
            UNIDENTIFIED_TIER
        };
        let exponent = (1 + self.pending()).min(i32::MAX as usize) as i32;
        base + width * r.powi(exponent)
    }

    pub(crate) fn acquire(&self) -> usize {
        self.list_refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the remaining number of peer lists holding this peer.
    pub(crate) fn release(&self) -> usize {
        let prev = self
            .list_refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    pub fn is_referenced(&self) -> bool {
        self.list_refs.load(Ordering::SeqCst) > 0
    }

    pub fn close(&self) {
        for conn in self.conns.lock().iter() {
            conn.close();
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("host_port", &self.host_port)
            .field("connections", &self.conns.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::ChannelOptions;
    use crate::handler::ServiceNameRouter;

    fn peer() -> Arc<Peer> {
        let ctx = ConnectionContext::new(
            ChannelOptions::default(),
            Arc::new(ServiceNameRouter::new()),
            None,
        );
        Peer::new("127.0.0.1:4040", ctx)
    }

    #[test]
    fn unconnected_peer_scores_in_low_tier() {
        let p = peer();
        assert_eq!(p.count_connections(Direction::Any), 0);
        assert!(p.get_identified_connection(Direction::Any).is_none());
        let low = p.score(Direction::Any, 0.0);
        let high = p.score(Direction::Any, 0.999);
        assert!((low - 0.1).abs() < 1e-9);
        assert!(high < 0.4);
    }

    #[test]
    fn list_references() {
        let p = peer();
        assert!(!p.is_referenced());
        assert_eq!(p.acquire(), 1);
        assert_eq!(p.acquire(), 2);
        assert_eq!(p.release(), 1);
        assert_eq!(p.release(), 0);
        assert_eq!(p.release(), 0);
    }

    #[tokio::test]
    async fn dial_failure_is_an_error() {
        let ctx = ConnectionContext::new(
            ChannelOptions::default(),
            Arc::new(ServiceNameRouter::new()),
            None,
        );
        // nothing listens on port 1
        let p = Peer::new("127.0.0.1:1", ctx);
        assert!(p.connect(Direction::Any).await.is_err());
        assert_eq!(p.count_connections(Direction::Any), 0);
    }
}
