//! Observed keywords.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::keyword::{CallbackHandle, CallbackSet, KeywordType, Value};
use crate::protocol::{Command, Direction, Message};

use super::task::Sequence;
use super::ClientShared;

/// Names accepted by [`ClientKeyword::item`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKey {
    Ascii,
    Binary,
    Broadcasts,
    Name,
    Monitored,
    Monitor,
    Populated,
    Reads,
    Writes,
    Timestamp,
    Units,
}

impl FromStr for ItemKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "ascii" => ItemKey::Ascii,
            "binary" => ItemKey::Binary,
            "broadcasts" => ItemKey::Broadcasts,
            "name" => ItemKey::Name,
            "monitored" => ItemKey::Monitored,
            "monitor" => ItemKey::Monitor,
            "populated" => ItemKey::Populated,
            "reads" => ItemKey::Reads,
            "writes" => ItemKey::Writes,
            "timestamp" => ItemKey::Timestamp,
            "units" => ItemKey::Units,
            other => return Err(Error::KeyNotFound(format!("no keyword item '{other}'"))),
        })
    }
}

/// Result of [`ClientKeyword::item`].
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Text(String),
    Value(Value),
    Flag(bool),
    Count(u64),
    Timestamp(Option<SystemTime>),
    Units(Option<String>),
}

/// Traffic seen by a keyword.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub reads: u64,
    pub writes: u64,
    pub broadcasts: u64,
}

#[derive(Debug, Default)]
struct Cache {
    last_value: Option<String>,
    last_read: Option<SystemTime>,
    populated: bool,
    reads: u64,
    writes: u64,
    broadcasts: u64,
    units: Option<Option<String>>,
}

/// A keyword as seen by a client.
///
/// The cache is fed by `update` replies and, while monitored, by
/// broadcasts. Callbacks fire only for broadcasts of a monitored keyword.
pub struct ClientKeyword {
    name: String,
    service: Weak<ClientShared>,
    ktype: KeywordType,
    /// Owning dispatcher, learned from `identify`.
    dispatcher: Option<String>,
    cache: Mutex<Cache>,
    monitored: AtomicBool,
    callbacks: CallbackSet<ClientKeyword>,
}

impl fmt::Debug for ClientKeyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientKeyword")
            .field("name", &self.name)
            .field("type", &self.ktype.tag())
            .field("monitored", &self.monitored())
            .finish()
    }
}

impl ClientKeyword {
    pub(crate) fn new(
        name: String,
        service: Weak<ClientShared>,
        ktype: KeywordType,
        dispatcher: Option<String>,
    ) -> Self {
        Self {
            name,
            service,
            ktype,
            dispatcher,
            cache: Mutex::new(Cache::default()),
            monitored: AtomicBool::new(false),
            callbacks: CallbackSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keyword_type(&self) -> &KeywordType {
        &self.ktype
    }

    pub fn dispatcher(&self) -> Option<&str> {
        self.dispatcher.as_deref()
    }

    pub fn monitored(&self) -> bool {
        self.monitored.load(Ordering::SeqCst)
    }

    pub fn populated(&self) -> bool {
        self.cache.lock().populated
    }

    /// Last cached value in wire form.
    pub fn value(&self) -> Option<String> {
        self.cache.lock().last_value.clone()
    }

    /// Last cached value in human form.
    pub fn ascii(&self) -> Option<String> {
        self.value().map(|v| self.ktype.ascii(&v))
    }

    /// Last cached value in native form.
    pub fn binary(&self) -> Option<Value> {
        self.value().and_then(|v| self.ktype.cast(&v).ok())
    }

    /// When the cache was last refreshed.
    pub fn timestamp(&self) -> Option<SystemTime> {
        self.cache.lock().last_read
    }

    /// Read, write, and broadcast counts.
    pub fn counters(&self) -> Counters {
        let cache = self.cache.lock();
        Counters {
            reads: cache.reads,
            writes: cache.writes,
            broadcasts: cache.broadcasts,
        }
    }

    fn service(&self) -> Result<Arc<ClientShared>> {
        self.service.upgrade().ok_or(Error::Shutdown)
    }

    fn request(&self, service: &ClientShared, command: Command) -> Message {
        let mut message = Message::new(Direction::CDQ, command)
            .with_service(&service.name)
            .with_keyword(&self.name);
        message.dispatcher = self.dispatcher.clone();
        message
    }

    /// Store a value received from the dispatcher.
    pub(crate) fn receive(&self, wire: &str, broadcast: bool) {
        let mut cache = self.cache.lock();
        cache.last_value = Some(wire.to_string());
        cache.last_read = Some(SystemTime::now());
        cache.populated = true;
        if broadcast {
            cache.broadcasts += 1;
        } else {
            cache.reads += 1;
        }
    }

    /// Run callbacks with `self`; returns how many succeeded.
    pub(crate) fn notify(&self) -> usize {
        self.callbacks.invoke_all(self)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Issue `update` without waiting. The cache is refreshed when the reply
    /// arrives, whether or not the sequence is awaited.
    pub fn read_async(self: &Arc<Self>, timeout: Option<Duration>) -> Result<Sequence> {
        let service = self.service()?;
        let weak = Arc::downgrade(self);
        service.queue.submit(
            self.request(&service, Command::Update),
            timeout,
            Some(Box::new(move |reply: &Message| {
                if let (Some(keyword), Some(value)) = (weak.upgrade(), reply.payload.as_text()) {
                    keyword.receive(&value, false);
                }
            })),
        )
    }

    /// Read the current value in human form.
    pub async fn read(self: &Arc<Self>, timeout: Option<Duration>) -> Result<String> {
        let reply = self.read_async(timeout)?.wait(None).await?;
        self.reply_value(&reply).map(|v| self.ktype.ascii(&v))
    }

    /// Read the current value in native form.
    pub async fn read_binary(self: &Arc<Self>, timeout: Option<Duration>) -> Result<Value> {
        let reply = self.read_async(timeout)?.wait(None).await?;
        let wire = self.reply_value(&reply)?;
        Ok(self.ktype.cast(&wire)?)
    }

    /// Read both views: (native, human).
    pub async fn read_both(self: &Arc<Self>, timeout: Option<Duration>) -> Result<(Value, String)> {
        let reply = self.read_async(timeout)?.wait(None).await?;
        let wire = self.reply_value(&reply)?;
        Ok((self.ktype.cast(&wire)?, self.ktype.ascii(&wire)))
    }

    fn reply_value(&self, reply: &Message) -> Result<String> {
        reply
            .payload
            .as_text()
            .ok_or_else(|| Error::Dispatcher(format!("{} has no value", self.name)))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Issue `modify` without waiting.
    ///
    /// The value is canonicalized locally when possible; a value the local
    /// type rejects is sent as-is so the dispatcher reports the error.
    pub fn write_async(&self, value: impl Into<Value>, timeout: Option<Duration>) -> Result<Sequence> {
        let service = self.service()?;
        let value = value.into();
        let wire = self
            .ktype
            .translate_value(&value)
            .unwrap_or_else(|_| value.to_string());
        self.cache.lock().writes += 1;
        service.queue.submit(
            self.request(&service, Command::Modify).with_payload(wire),
            timeout,
            None,
        )
    }

    /// Write and wait; returns the value the dispatcher stored.
    pub async fn write(&self, value: impl Into<Value>, timeout: Option<Duration>) -> Result<String> {
        let reply = self.write_async(value, timeout)?.wait(None).await?;
        Ok(reply.payload_text())
    }

    /// Wait for an earlier asynchronous read or write; returns the reply
    /// value in human form.
    pub async fn wait(&self, sequence: Sequence, timeout: Option<Duration>) -> Result<String> {
        let reply = sequence.wait(timeout).await?;
        Ok(self.ktype.ascii(&reply.payload_text()))
    }

    /// Wait for a value expression to become true.
    pub async fn waitfor(&self, expression: &str, _timeout: Option<Duration>) -> Result<bool> {
        Err(Error::NotImplemented(format!(
            "waitfor expressions ('{expression}')"
        )))
    }

    // ========================================================================
    // Monitoring
    // ========================================================================

    /// Start or stop delivering broadcasts to this keyword. With `prime`,
    /// a synchronous read populates the cache first.
    pub async fn monitor(
        self: &Arc<Self>,
        start: bool,
        prime: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if !start {
            self.monitored.store(false, Ordering::SeqCst);
            debug!(keyword = %self.name, "Monitoring stopped");
            return Ok(());
        }
        if prime {
            // A BLANK reply leaves the cache unpopulated.
            self.read_async(timeout)?.wait(None).await?;
        }
        self.monitored.store(true, Ordering::SeqCst);
        debug!(keyword = %self.name, "Monitoring started");
        Ok(())
    }

    pub fn callback(&self, handle: CallbackHandle<ClientKeyword>, remove: bool, preferred: bool) {
        if remove {
            self.callbacks.remove(&handle);
        } else {
            self.callbacks.add(handle, preferred);
        }
    }

    // ========================================================================
    // Items
    // ========================================================================

    /// Indexed accessor. `ascii`/`binary` use the cache while monitored and
    /// populated, and read otherwise.
    pub async fn item(self: &Arc<Self>, key: ItemKey) -> Result<Item> {
        let cached = self.monitored() && self.populated();
        Ok(match key {
            ItemKey::Ascii if cached => Item::Text(self.ascii().unwrap_or_default()),
            ItemKey::Ascii => Item::Text(self.read(None).await?),
            ItemKey::Binary if cached => match self.binary() {
                Some(value) => Item::Value(value),
                None => Item::Value(self.read_binary(None).await?),
            },
            ItemKey::Binary => Item::Value(self.read_binary(None).await?),
            ItemKey::Broadcasts => Item::Count(self.counters().broadcasts),
            ItemKey::Name => Item::Text(self.name.clone()),
            ItemKey::Monitored | ItemKey::Monitor => Item::Flag(self.monitored()),
            ItemKey::Populated => Item::Flag(self.populated()),
            ItemKey::Reads => Item::Count(self.counters().reads),
            ItemKey::Writes => Item::Count(self.counters().writes),
            ItemKey::Timestamp => Item::Timestamp(self.timestamp()),
            ItemKey::Units => Item::Units(self.units().await?),
        })
    }

    /// Units string, fetched once from the dispatcher.
    pub async fn units(&self) -> Result<Option<String>> {
        let cached = self.cache.lock().units.clone();
        if let Some(units) = cached {
            return Ok(units);
        }
        let service = self.service()?;
        let reply = service
            .queue
            .call(self.request(&service, Command::Units), None)
            .await?;
        let units: Option<String> = serde_json::from_str(&reply.payload_text())
            .map_err(|e| Error::Dispatcher(format!("invalid units for {}: {e}", self.name)))?;
        self.cache.lock().units = Some(units.clone());
        Ok(units)
    }
}
