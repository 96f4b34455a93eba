// Copyright 2020 Joyent, Inc.

//! Outgoing requests with retry and failover.
//!
//! An [`OutgoingRequest`] makes one logical call.  Each attempt goes to a
//! peer that has not been tried yet for this call; retryable failures move
//! on to the next peer until the retry limit or the ttl budget runs out.
//! Every attempt is kept, so callers can see exactly what happened.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use slog::{debug, info, o, Logger};

use crate::checksum::ChecksumType;
use crate::config::Direction;
use crate::connection::{CallResponse, OutgoingCall};
use crate::error::{Error, ErrorCode, Result};
use crate::message::{headers, Tracing, TransportHeaders};
use crate::peer::Peer;
use crate::peers::PeerList;

const MIN_ATTEMPT_TTL: Duration = Duration::from_millis(1);

/// Which failures a call may be retried on.  Busy and declined calls are
/// always retried unless `never` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryFlags {
    pub never: bool,
    pub on_connection_error: bool,
    pub on_timeout: bool,
}

impl Default for RetryFlags {
    fn default() -> Self {
        RetryFlags {
            never: false,
            on_connection_error: true,
            on_timeout: true,
        }
    }
}

impl RetryFlags {
    /// Parses the value of the `re` transport header.
    pub fn parse(value: &str) -> RetryFlags {
        let mut flags = RetryFlags {
            never: false,
            on_connection_error: false,
            on_timeout: false,
        };
        for c in value.chars() {
            match c {
                'n' => flags.never = true,
                'c' => flags.on_connection_error = true,
                't' => flags.on_timeout = true,
                _ => (),
            }
        }
        flags
    }

    pub fn encode(&self) -> String {
        if self.never {
            return "n".to_string();
        }
        let mut s = String::new();
        if self.on_connection_error {
            s.push('c');
        }
        if self.on_timeout {
            s.push('t');
        }
        s
    }

    pub fn should_retry(&self, e: &Error) -> bool {
        if self.never || e.is_admission() {
            return false;
        }
        match e.code() {
            ErrorCode::Busy | ErrorCode::Declined => true,
            ErrorCode::Timeout => self.on_timeout,
            ErrorCode::NetworkError | ErrorCode::Unexpected => self.on_connection_error,
            ErrorCode::Cancelled
            | ErrorCode::BadRequest
            | ErrorCode::Unhealthy
            | ErrorCode::ProtocolError => false,
        }
    }
}

/// Decides whether a not-ok application response deserves another attempt.
pub type ApplicationRetry = Arc<dyn Fn(&CallResponse) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RequestOptions {
    pub service: String,
    /// Budget for the whole call, retries included.  Defaults to the
    /// channel's request timeout.
    pub timeout: Option<Duration>,
    pub timeout_per_attempt: Option<Duration>,
    /// Retries after the first attempt.  Defaults to the channel's limit.
    pub retry_limit: Option<usize>,
    pub retry_flags: RetryFlags,
    /// A root call starts a fresh budget and ignores any parent deadline.
    pub has_no_parent: bool,
    pub parent_deadline: Option<Instant>,
    pub tracing: Option<Tracing>,
    pub checksum_type: Option<ChecksumType>,
    pub headers: TransportHeaders,
    /// Sends every attempt to this peer instead of choosing one.
    pub host: Option<String>,
    pub should_application_retry: Option<ApplicationRetry>,
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("service", &self.service)
            .field("timeout", &self.timeout)
            .field("retry_limit", &self.retry_limit)
            .field("retry_flags", &self.retry_flags)
            .field("has_no_parent", &self.has_no_parent)
            .field("host", &self.host)
            .finish()
    }
}

impl RequestOptions {
    pub fn new(service: &str) -> RequestOptions {
        RequestOptions {
            service: service.to_string(),
            timeout: None,
            timeout_per_attempt: None,
            retry_limit: None,
            retry_flags: RetryFlags::default(),
            has_no_parent: true,
            parent_deadline: None,
            tracing: None,
            checksum_type: None,
            headers: TransportHeaders::new(),
            host: None,
            should_application_retry: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout_per_attempt(mut self, timeout: Duration) -> Self {
        self.timeout_per_attempt = Some(timeout);
        self
    }

    pub fn retry_limit(mut self, limit: usize) -> Self {
        self.retry_limit = Some(limit);
        self
    }

    pub fn retry_flags(mut self, flags: RetryFlags) -> Self {
        self.retry_flags = flags;
        self
    }

    /// Makes this a call on behalf of a parent whose budget ends at
    /// `deadline`.
    pub fn parent(mut self, deadline: Instant, tracing: &Tracing) -> Self {
        self.has_no_parent = false;
        self.parent_deadline = Some(deadline);
        self.tracing = Some(tracing.child());
        self
    }

    pub fn checksum(mut self, checksum_type: ChecksumType) -> Self {
        self.checksum_type = Some(checksum_type);
        self
    }

    pub fn header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.set(key, value);
        self
    }

    pub fn host(mut self, host_port: &str) -> Self {
        self.host = Some(host_port.to_string());
        self
    }

    pub fn should_application_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallResponse) -> bool + Send + Sync + 'static,
    {
        self.should_application_retry = Some(Arc::new(f));
        self
    }
}

#[derive(Default)]
struct PendingCounts {
    total: usize,
    per_service: HashMap<String, usize>,
}

/// Channel-wide admission control for outgoing requests.
pub struct Services {
    max_pending: Option<usize>,
    max_pending_for_service: Option<usize>,
    pending: Mutex<PendingCounts>,
}

impl Services {
    pub fn new(max_pending: Option<usize>, max_pending_for_service: Option<usize>) -> Arc<Services> {
        Arc::new(Services {
            max_pending,
            max_pending_for_service,
            pending: Mutex::new(PendingCounts::default()),
        })
    }

    /// Counts a new request against the limits.  The channel-wide limit is
    /// checked first.
    pub fn admit(self: &Arc<Self>, service: &str) -> Result<PendingGuard> {
        let mut pending = self.pending.lock();
        if let Some(max) = self.max_pending {
            if pending.total >= max {
                return Err(Error::MaxPending(max));
            }
        }
        let for_service = pending.per_service.get(service).copied().unwrap_or(0);
        if let Some(limit) = self.max_pending_for_service {
            if for_service >= limit {
                return Err(Error::MaxPendingForService {
                    service: service.to_string(),
                    limit,
                });
            }
        }
        pending.total += 1;
        pending.per_service.insert(service.to_string(), for_service + 1);
        Ok(PendingGuard {
            services: Arc::clone(self),
            service: service.to_string(),
        })
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().total
    }

    pub fn pending_for(&self, service: &str) -> usize {
        self.pending
            .lock()
            .per_service
            .get(service)
            .copied()
            .unwrap_or(0)
    }
}

pub struct PendingGuard {
    services: Arc<Services>,
    service: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut pending = self.services.pending.lock();
        pending.total = pending.total.saturating_sub(1);
        let left = match pending.per_service.get_mut(&self.service) {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n
            }
            None => return,
        };
        if left == 0 {
            pending.per_service.remove(&self.service);
        }
    }
}

/// One try of a request against one peer.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub peer: String,
    pub started: Instant,
    pub outcome: Result<CallResponse>,
}

impl Attempt {
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.outcome.as_ref().err().map(Error::code)
    }
}

/// Defaults the request picks up from its channel.
#[derive(Clone)]
pub(crate) struct RequestDefaults {
    pub(crate) timeout: Duration,
    pub(crate) retry_limit: usize,
    pub(crate) caller_name: String,
}

pub struct OutgoingRequest {
    options: RequestOptions,
    peers: Arc<PeerList>,
    services: Arc<Services>,
    defaults: RequestDefaults,
    attempts: Vec<Attempt>,
    log: Logger,
}

impl OutgoingRequest {
    pub(crate) fn new(
        options: RequestOptions,
        peers: Arc<PeerList>,
        services: Arc<Services>,
        defaults: RequestDefaults,
        log: &Logger,
    ) -> OutgoingRequest {
        OutgoingRequest {
            log: log.new(o!("service" => options.service.clone())),
            options,
            peers,
            services,
            defaults,
            attempts: Vec::new(),
        }
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    fn deadline(&self, start: Instant) -> Instant {
        let timeout = self.options.timeout.unwrap_or(self.defaults.timeout);
        let own = start + timeout;
        match self.options.parent_deadline {
            Some(parent) if !self.options.has_no_parent => own.min(parent),
            _ => own,
        }
    }

    fn choose(&self, tried: &HashSet<String>) -> Option<Arc<Peer>> {
        match &self.options.host {
            Some(host) if tried.contains(host) => None,
            Some(host) => Some(self.peers.add(host)),
            None => self.peers.choose_peer(tried),
        }
    }

    /// What to report once there is nothing left to try.
    fn give_up(&self, fallback: Error) -> Result<CallResponse> {
        match self.attempts.last() {
            Some(attempt) => attempt.outcome.clone(),
            None => Err(fallback),
        }
    }

    pub async fn send<A, B, C>(&mut self, arg1: A, arg2: B, arg3: C) -> Result<CallResponse>
    where
        A: Into<Bytes>,
        B: Into<Bytes>,
        C: Into<Bytes>,
    {
        let (arg1, arg2, arg3) = (arg1.into(), arg2.into(), arg3.into());
        let _pending = self.services.admit(&self.options.service)?;

        let start = Instant::now();
        let deadline = self.deadline(start);
        let retry_limit = self.options.retry_limit.unwrap_or(self.defaults.retry_limit);
        let tracing = self.options.tracing.unwrap_or_else(Tracing::root);

        let mut headers = self.options.headers.clone();
        headers.set(headers::RETRY_FLAGS, self.options.retry_flags.encode());
        if headers.get(headers::CALLER_NAME).is_none() {
            headers.set(headers::CALLER_NAME, self.defaults.caller_name.clone());
        }

        let mut tried = HashSet::new();
        loop {
            let budget = match deadline.checked_duration_since(Instant::now()) {
                Some(left) if left >= MIN_ATTEMPT_TTL => left,
                _ => return self.give_up(Error::Timeout(deadline.saturating_duration_since(start))),
            };
            let peer = match self.choose(&tried) {
                Some(peer) => peer,
                None => {
                    let e = Error::NoPeerAvailable(self.options.service.clone());
                    return self.give_up(e);
                }
            };
            tried.insert(peer.host_port().to_string());

            let ttl = match self.options.timeout_per_attempt {
                Some(per_attempt) => budget.min(per_attempt),
                None => budget,
            };
            let call = OutgoingCall {
                service: self.options.service.clone(),
                arg1: arg1.clone(),
                arg2: arg2.clone(),
                arg3: arg3.clone(),
                headers: headers.clone(),
                tracing,
                ttl,
                checksum_type: self.options.checksum_type,
            };

            let started = Instant::now();
            let outcome = attempt(&peer, self.peers.preference(), call).await;
            let retry = match &outcome {
                Ok(res) => {
                    !res.ok
                        && self
                            .options
                            .should_application_retry
                            .as_ref()
                            .map_or(false, |f| f(res))
                }
                Err(e) => self.options.retry_flags.should_retry(e),
            };

            match &outcome {
                Ok(res) => debug!(self.log, "attempt finished";
                    "peer" => peer.host_port(), "ok" => res.ok),
                Err(e) => info!(self.log, "attempt failed";
                    "peer" => peer.host_port(), "error" => %e, "retry" => retry),
            }
            self.attempts.push(Attempt {
                peer: peer.host_port().to_string(),
                started,
                outcome: outcome.clone(),
            });

            if !retry || self.attempts.len() > retry_limit {
                return outcome;
            }
        }
    }
}

async fn attempt(
    peer: &Arc<Peer>,
    pref: Direction,
    mut call: OutgoingCall,
) -> Result<CallResponse> {
    let started = Instant::now();
    let conn = match tokio::time::timeout(call.ttl, peer.wait_for_identified(pref)).await {
        Ok(conn) => conn?,
        Err(_) => return Err(Error::Timeout(call.ttl)),
    };
    let left = call.ttl.checked_sub(started.elapsed()).unwrap_or_default();
    if left < MIN_ATTEMPT_TTL {
        return Err(Error::Timeout(call.ttl));
    }
    call.ttl = left;
    conn.call(call).await
}
