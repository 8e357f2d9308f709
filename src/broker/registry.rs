//! Broker registry records.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::protocol::{Message, MessageId};

use super::fan::FanMessage;

/// Routing identity assigned by the ROUTER socket.
pub type Identity = Vec<u8>;

/// Lifetimes span this many broker timeouts past the last frame seen.
pub const LIFETIME_FACTOR: u32 = 4;

/// Liveness clock for a peer.
#[derive(Debug, Clone)]
pub struct Lifetime {
    /// Time of the last frame received from the peer.
    pub expiration: Instant,
    pub next_heartbeat: Instant,
    timeout: Duration,
}

impl Lifetime {
    pub fn new(now: Instant, timeout: Duration) -> Self {
        Self {
            expiration: now,
            next_heartbeat: now + timeout,
            timeout,
        }
    }

    pub fn refresh(&mut self, now: Instant) {
        self.expiration = now;
        self.next_heartbeat = now + self.timeout;
    }

    pub fn alive(&self, now: Instant) -> bool {
        now < self.expiration + self.timeout * LIFETIME_FACTOR
    }

    pub fn heartbeat_due(&self, now: Instant) -> bool {
        now > self.next_heartbeat
    }

    /// Push the next beacon out one timeout without refreshing liveness.
    pub fn beacon_sent(&mut self, now: Instant) {
        self.next_heartbeat = now + self.timeout;
    }
}

/// A request forwarded to a dispatcher and not yet answered.
#[derive(Debug, Clone)]
pub struct Outstanding {
    /// The request as received, carrying the originator's route.
    pub message: Message,
    pub sent: Instant,
}

/// Broker view of a dispatcher.
#[derive(Debug)]
pub struct DispatcherRecord {
    pub name: String,
    pub identity: Identity,
    pub ready: bool,
    pub lifetime: Lifetime,
    pub outstanding: HashMap<MessageId, Outstanding>,
    /// Keyword → type tag, learned from `identify` replies.
    pub keywords: HashMap<String, String>,
}

impl DispatcherRecord {
    pub fn new(name: &str, identity: Identity, now: Instant, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            identity,
            ready: false,
            lifetime: Lifetime::new(now, timeout),
            outstanding: HashMap::new(),
            keywords: HashMap::new(),
        }
    }
}

/// Broker view of a client.
#[derive(Debug)]
pub struct ClientRecord {
    pub lifetime: Lifetime,
    pub outstanding: HashSet<MessageId>,
}

impl ClientRecord {
    pub fn new(now: Instant, timeout: Duration) -> Self {
        Self {
            lifetime: Lifetime::new(now, timeout),
            outstanding: HashSet::new(),
        }
    }
}

/// Broker view of a service.
#[derive(Debug, Default)]
pub struct ServiceRecord {
    /// Ordered by name so fan replies join deterministically.
    pub dispatchers: BTreeMap<String, DispatcherRecord>,
    pub clients: HashMap<Identity, ClientRecord>,
    /// Keyword → owning dispatcher name.
    pub keywords: HashMap<String, String>,
    pub fans: HashMap<MessageId, FanMessage>,
}

impl ServiceRecord {
    pub fn ready_dispatchers(&self) -> impl Iterator<Item = &DispatcherRecord> {
        self.dispatchers.values().filter(|d| d.ready)
    }
}
