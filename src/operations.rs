// Copyright 2020 Joyent, Inc.

//! Per-connection bookkeeping of in-flight operations.
//!
//! `in_ops` holds calls this side is serving, `out_ops` calls it initiated,
//! both keyed by frame id.  An outbound id that finishes without its
//! response (timeout, cancel) stays behind as a tombstone until shortly
//! after its ttl would have expired, so late frames for it are dropped
//! quietly and the id is not handed out again in the meantime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::connection::{CallResponse, Connection};
use crate::error::Result;
use crate::fragment::Reassembly;
use crate::handler::Handler;
use crate::message::{CallRequestHead, CallResponseHead, Tracing};
use crate::protocol::Frame;
use crate::relay::{RelayBack, RelayEntryGuard};

const MAX_OPERATION_ID: u32 = 0xffff_fffe;

pub(crate) trait Timed {
    fn deadline(&self) -> Instant;
}

pub(crate) struct OutOp {
    pub(crate) service: String,
    pub(crate) started: Instant,
    pub(crate) timeout: Duration,
    pub(crate) kind: OutKind,
}

pub(crate) enum OutKind {
    Local {
        reply: oneshot::Sender<Result<CallResponse>>,
        receiving: Option<(CallResponseHead, Reassembly)>,
    },
    Relay(RelayBack),
}

impl Timed for OutOp {
    fn deadline(&self) -> Instant {
        self.started + self.timeout
    }
}

pub(crate) struct InOp {
    pub(crate) seq: u64,
    pub(crate) service: String,
    pub(crate) tracing: Tracing,
    pub(crate) started: Instant,
    pub(crate) timeout: Duration,
    pub(crate) kind: InKind,
}

pub(crate) enum InKind {
    Receiving {
        head: CallRequestHead,
        reassembly: Reassembly,
        handler: Arc<dyn Handler>,
    },
    Serving,
    RelayPending {
        buffered: Vec<Frame>,
    },
    RelayBound {
        target: Connection,
        out_id: u32,
        _entry: RelayEntryGuard,
    },
}

impl Timed for InOp {
    fn deadline(&self) -> Instant {
        self.started + self.timeout
    }
}

pub(crate) struct PendingPing {
    pub(crate) started: Instant,
    pub(crate) timeout: Duration,
    pub(crate) reply: oneshot::Sender<Result<Duration>>,
}

impl Timed for PendingPing {
    fn deadline(&self) -> Instant {
        self.started + self.timeout
    }
}

pub(crate) struct OperationTable<I, O> {
    in_ops: HashMap<u32, I>,
    out_ops: HashMap<u32, O>,
    tombstones: HashMap<u32, Instant>,
    next_id: u32,
}

impl<I: Timed, O: Timed> OperationTable<I, O> {
    pub(crate) fn new() -> Self {
        OperationTable {
            in_ops: HashMap::new(),
            out_ops: HashMap::new(),
            tombstones: HashMap::new(),
            next_id: 1,
        }
    }

    /// Next free outbound id, skipping ids that are live, tombstoned, or
    /// claimed by `in_use`.
    pub(crate) fn alloc_id<F: Fn(u32) -> bool>(&mut self, in_use: F) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = if id >= MAX_OPERATION_ID { 1 } else { id + 1 };
            if !self.out_ops.contains_key(&id)
                && !self.tombstones.contains_key(&id)
                && !in_use(id)
            {
                return id;
            }
        }
    }

    pub(crate) fn contains_in(&self, id: u32) -> bool {
        self.in_ops.contains_key(&id)
    }

    pub(crate) fn insert_in(&mut self, id: u32, op: I) {
        self.in_ops.insert(id, op);
    }

    pub(crate) fn in_op_mut(&mut self, id: u32) -> Option<&mut I> {
        self.in_ops.get_mut(&id)
    }

    pub(crate) fn remove_in(&mut self, id: u32) -> Option<I> {
        self.in_ops.remove(&id)
    }

    pub(crate) fn insert_out(&mut self, id: u32, op: O) {
        self.tombstones.remove(&id);
        self.out_ops.insert(id, op);
    }

    pub(crate) fn out_op_mut(&mut self, id: u32) -> Option<&mut O> {
        self.out_ops.get_mut(&id)
    }

    pub(crate) fn remove_out(&mut self, id: u32) -> Option<O> {
        self.out_ops.remove(&id)
    }

    /// Keeps the id of an outbound op that will never see its response
    /// reserved until `until`.
    pub(crate) fn add_tombstone(&mut self, id: u32, until: Instant) {
        self.tombstones.insert(id, until);
    }

    pub(crate) fn is_tombstone(&self, id: u32) -> bool {
        self.tombstones.contains_key(&id)
    }

    pub(crate) fn expired_in(&self, now: Instant) -> Vec<u32> {
        expired(&self.in_ops, now)
    }

    pub(crate) fn expired_out(&self, now: Instant) -> Vec<u32> {
        expired(&self.out_ops, now)
    }

    pub(crate) fn reap_tombstones(&mut self, now: Instant) {
        self.tombstones.retain(|_, until| *until > now);
    }

    pub(crate) fn in_len(&self) -> usize {
        self.in_ops.len()
    }

    pub(crate) fn out_len(&self) -> usize {
        self.out_ops.len()
    }

    pub(crate) fn in_ops(&self) -> impl Iterator<Item = &I> {
        self.in_ops.values()
    }

    pub(crate) fn out_ops(&self) -> impl Iterator<Item = &O> {
        self.out_ops.values()
    }

    /// Empties both tables, for a connection that is going away.
    pub(crate) fn take_all(&mut self) -> (Vec<(u32, I)>, Vec<(u32, O)>) {
        self.tombstones.clear();
        (self.in_ops.drain().collect(), self.out_ops.drain().collect())
    }
}

pub(crate) fn expired<T: Timed>(ops: &HashMap<u32, T>, now: Instant) -> Vec<u32> {
    ops.iter()
        .filter(|(_, op)| op.deadline() <= now)
        .map(|(id, _)| *id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Op(Instant);

    impl Timed for Op {
        fn deadline(&self) -> Instant {
            self.0
        }
    }

    fn table() -> OperationTable<Op, Op> {
        OperationTable::new()
    }

    #[test]
    fn ids_skip_live_and_tombstoned() {
        let now = Instant::now();
        let mut t = table();
        assert_eq!(t.alloc_id(|_| false), 1);
        t.insert_out(2, Op(now));
        t.insert_out(3, Op(now));
        assert!(t.remove_out(3).is_some());
        t.add_tombstone(3, now + Duration::from_secs(1));
        assert_eq!(t.alloc_id(|id| id == 4), 5);
        assert!(t.is_tombstone(3));
        assert_eq!(t.out_len(), 1);

        t.reap_tombstones(now + Duration::from_secs(2));
        assert!(!t.is_tombstone(3));
    }

    #[test]
    fn ids_wrap_around() {
        let mut t = table();
        t.next_id = MAX_OPERATION_ID;
        assert_eq!(t.alloc_id(|_| false), MAX_OPERATION_ID);
        assert_eq!(t.alloc_id(|_| false), 1);
    }

    #[test]
    fn expiry_scan() {
        let now = Instant::now();
        let mut t = table();
        t.insert_in(7, Op(now - Duration::from_millis(1)));
        t.insert_in(8, Op(now + Duration::from_secs(5)));
        t.insert_out(9, Op(now));
        assert_eq!(t.expired_in(now), vec![7]);
        assert_eq!(t.expired_out(now), vec![9]);
        assert!(t.remove_in(7).is_some());
        assert!(t.remove_in(7).is_none());
        assert!(t.contains_in(8));
    }

    #[test]
    fn take_all_leaves_nothing() {
        let now = Instant::now();
        let mut t = table();
        t.insert_in(1, Op(now));
        t.insert_out(1, Op(now));
        t.insert_out(2, Op(now));
        let (ins, outs) = t.take_all();
        assert_eq!(ins.len(), 1);
        assert_eq!(outs.len(), 2);
        assert_eq!(t.in_len() + t.out_len(), 0);
    }
}
