//! Authoritative keywords.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, warn};

use crate::keyword::{CallbackHandle, CallbackSet, History, KeywordError, KeywordType, Value};
use crate::protocol::{Command, Direction, Message, Payload};

use super::ServiceShared;

/// Authoritative read/write behaviour of a keyword.
///
/// The defaults keep the value in memory only. Hooks run on blocking
/// threads with the keyword's operation lock held.
pub trait KeywordHooks: Send + Sync {
    /// Canonicalize an incoming value. Return
    /// [`KeywordError::NoWriteNecessary`] to skip the write.
    fn prewrite(&self, keyword: &Keyword, value: &str) -> Result<String, KeywordError> {
        keyword.keyword_type().translate(value)
    }

    /// Push a validated value to the authoritative source.
    fn write(&self, _keyword: &Keyword, _value: &str) -> Result<(), KeywordError> {
        Ok(())
    }

    /// Runs before every authoritative read.
    fn preread(&self, _keyword: &Keyword) -> Result<(), KeywordError> {
        Ok(())
    }

    /// Fetch the current value from the authoritative source.
    fn read(&self, keyword: &Keyword) -> Result<Option<String>, KeywordError> {
        Ok(keyword.value())
    }

    /// Adjust a freshly read value before it is recorded.
    fn postread(&self, _keyword: &Keyword, value: String) -> Result<String, KeywordError> {
        Ok(value)
    }
}

/// Hooks for keywords whose value lives only in memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryHooks;

impl KeywordHooks for MemoryHooks {}

/// Static attributes of a keyword.
#[derive(Debug, Clone, Default)]
pub struct KeywordOptions {
    pub read_only: bool,
    pub write_only: bool,
    /// Applied at `begin()` when no value is present.
    pub initial: Option<String>,
    pub period: Option<Duration>,
    pub units: Option<String>,
}

#[derive(Debug, Default)]
struct KeywordState {
    value: Option<String>,
    history: History,
}

/// A keyword owned by this dispatcher.
pub struct Keyword {
    name: String,
    service: Weak<ServiceShared>,
    ktype: KeywordType,
    options: KeywordOptions,
    hooks: Arc<dyn KeywordHooks>,
    /// Serializes modify/update; reentrant so callbacks may write.
    op_lock: ReentrantMutex<()>,
    state: Mutex<KeywordState>,
    callbacks: CallbackSet<Keyword>,
    acting: AtomicBool,
}

impl fmt::Debug for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyword")
            .field("name", &self.name)
            .field("type", &self.ktype.tag())
            .field("value", &self.value())
            .finish()
    }
}

impl Keyword {
    pub(crate) fn new(
        name: String,
        service: Weak<ServiceShared>,
        ktype: KeywordType,
        options: KeywordOptions,
        hooks: Arc<dyn KeywordHooks>,
    ) -> Self {
        Self {
            name,
            service,
            ktype,
            options,
            hooks,
            op_lock: ReentrantMutex::new(()),
            state: Mutex::new(KeywordState::default()),
            callbacks: CallbackSet::new(),
            acting: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keyword_type(&self) -> &KeywordType {
        &self.ktype
    }

    pub fn options(&self) -> &KeywordOptions {
        &self.options
    }

    pub fn units(&self) -> Option<&str> {
        self.options.units.as_deref()
    }

    /// Current value in wire form, `None` until first set.
    pub fn value(&self) -> Option<String> {
        self.state.lock().value.clone()
    }

    /// Native view of the current value.
    pub fn binary(&self) -> Option<Value> {
        self.value().and_then(|v| self.ktype.cast(&v).ok())
    }

    /// Snapshot of the value history, oldest first.
    pub fn history(&self) -> History {
        self.state.lock().history.clone()
    }

    pub fn callback(&self, handle: CallbackHandle<Keyword>, remove: bool, preferred: bool) {
        if remove {
            self.callbacks.remove(&handle);
        } else {
            self.callbacks.add(handle, preferred);
        }
    }

    // ========================================================================
    // Value flow
    // ========================================================================

    /// Record a new value: append history, update memory, broadcast when the
    /// value changed (or `force`), then run callbacks unless already inside
    /// one. Returns whether the value changed.
    pub fn set(&self, value: &str, force: bool) -> bool {
        let _op = self.op_lock.lock();

        let changed = {
            let mut state = self.state.lock();
            let changed = state.value.as_deref() != Some(value);
            state.value = Some(value.to_string());
            state.history.push(value, SystemTime::now());
            changed
        };

        if changed || force {
            self.broadcast(Payload::text(value));

            if !self.acting.swap(true, Ordering::SeqCst) {
                self.callbacks.invoke_all(self);
                self.acting.store(false, Ordering::SeqCst);
            }
        }
        changed
    }

    /// prewrite → check → write → set. Returns the stored value.
    pub fn modify(&self, value: &str) -> Result<String, KeywordError> {
        if self.options.read_only {
            return Err(KeywordError::ReadOnly(self.name.clone()));
        }
        let _op = self.op_lock.lock();

        let translated = match self.hooks.prewrite(self, value) {
            Ok(translated) => translated,
            Err(KeywordError::NoWriteNecessary) => {
                debug!(keyword = %self.name, "No write necessary");
                return Ok(self.value().unwrap_or_else(|| value.to_string()));
            }
            Err(e) => return Err(e),
        };
        self.ktype.check(&translated)?;
        self.hooks.write(self, &translated)?;
        self.set(&translated, false);
        Ok(translated)
    }

    /// preread → read → postread → set. `None` when the keyword has never
    /// held a value.
    pub fn update(&self) -> Result<Option<String>, KeywordError> {
        if self.options.write_only {
            return Err(KeywordError::WriteOnly(self.name.clone()));
        }
        let _op = self.op_lock.lock();

        self.hooks.preread(self)?;
        let Some(value) = self.hooks.read(self)? else {
            return Ok(None);
        };
        let value = self.hooks.postread(self, value)?;
        self.set(&value, false);
        Ok(Some(value))
    }

    /// Add `delta` to an integer keyword.
    pub fn increment(&self, delta: i64) -> Result<String, KeywordError> {
        if !self.ktype.is_integer() {
            return Err(KeywordError::Type(format!(
                "{} is not an integer keyword",
                self.name
            )));
        }
        let _op = self.op_lock.lock();

        let current = self
            .value()
            .ok_or_else(|| KeywordError::NoValue(self.name.clone()))?;
        let current = match self.ktype.cast(&current)? {
            Value::Int(i) => i,
            other => {
                return Err(KeywordError::Invalid(format!(
                    "{other} is not an integer"
                )))
            }
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| KeywordError::Invalid("integer overflow".to_string()))?;
        self.modify(&next.to_string())
    }

    /// Publish `payload` as a broadcast of this keyword.
    pub fn broadcast(&self, payload: Payload) {
        let Some(service) = self.service.upgrade() else {
            warn!(keyword = %self.name, "Broadcast after service shutdown dropped");
            return;
        };
        let message = Message::new(Direction::CDB, Command::Broadcast)
            .with_service(&service.name)
            .with_dispatcher(service.dispatcher.clone())
            .with_keyword(&self.name)
            .with_payload(payload);
        service.publish(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::ServiceShared;
    use crate::keyword::CallbackHandle;
    use tokio::sync::mpsc;

    struct Fixture {
        shared: Arc<ServiceShared>,
        broadcasts: mpsc::UnboundedReceiver<Message>,
    }

    impl Fixture {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                shared: Arc::new(ServiceShared::new("testsvc", "disp", tx)),
                broadcasts: rx,
            }
        }

        fn keyword(&self, name: &str, ktype: KeywordType) -> Arc<Keyword> {
            self.shared
                .insert_keyword(name, ktype, KeywordOptions::default(), Arc::new(MemoryHooks))
        }

        fn drain(&mut self) -> Vec<String> {
            let mut values = Vec::new();
            while let Ok(message) = self.broadcasts.try_recv() {
                values.push(message.payload_text());
            }
            values
        }
    }

    struct SkipSame;

    impl KeywordHooks for SkipSame {
        fn prewrite(&self, keyword: &Keyword, value: &str) -> Result<String, KeywordError> {
            let translated = keyword.keyword_type().translate(value)?;
            if keyword.value().as_deref() == Some(translated.as_str()) {
                return Err(KeywordError::NoWriteNecessary);
            }
            Ok(translated)
        }
    }

    #[test]
    fn test_value_none_until_set() {
        let fixture = Fixture::new();
        let keyword = fixture.keyword("k", KeywordType::String);
        assert_eq!(keyword.value(), None);
        assert_eq!(keyword.update().unwrap(), None);
        assert!(keyword.history().is_empty());
    }

    #[test]
    fn test_broadcast_only_on_change() {
        let mut fixture = Fixture::new();
        let keyword = fixture.keyword("state", KeywordType::String);

        assert!(keyword.set("a", false));
        assert!(!keyword.set("a", false));
        assert!(!keyword.set("a", true));
        assert!(keyword.set("b", false));

        assert_eq!(fixture.drain(), vec!["a", "a", "b"]);
        assert_eq!(keyword.history().len(), 4);
        assert_eq!(keyword.history().last().unwrap().value, "b");
    }

    #[test]
    fn test_broadcast_message_fields() {
        let mut fixture = Fixture::new();
        let keyword = fixture.keyword("state", KeywordType::String);
        keyword.set("x", false);

        let message = fixture.broadcasts.try_recv().unwrap();
        assert_eq!(message.direction, Direction::CDB);
        assert_eq!(message.service.as_deref(), Some("testsvc"));
        assert_eq!(message.dispatcher.as_deref(), Some("disp"));
        assert_eq!(message.keyword.as_deref(), Some("STATE"));
    }

    #[test]
    fn test_modify_translates_and_checks() {
        let fixture = Fixture::new();
        let flag = fixture.keyword("flag", KeywordType::Boolean);
        assert_eq!(flag.modify("yes").unwrap(), "1");
        assert_eq!(flag.binary(), Some(Value::Bool(true)));

        let count = fixture.keyword("count", KeywordType::Integer);
        let err = count.modify("2147483648").unwrap_err();
        assert!(err.to_string().contains("integer range"));
        assert_eq!(count.value(), None);
    }

    #[test]
    fn test_read_only_and_write_only() {
        let fixture = Fixture::new();
        let ro = fixture.shared.insert_keyword(
            "ro",
            KeywordType::String,
            KeywordOptions {
                read_only: true,
                ..Default::default()
            },
            Arc::new(MemoryHooks),
        );
        assert!(matches!(ro.modify("x"), Err(KeywordError::ReadOnly(_))));

        let wo = fixture.shared.insert_keyword(
            "wo",
            KeywordType::String,
            KeywordOptions {
                write_only: true,
                ..Default::default()
            },
            Arc::new(MemoryHooks),
        );
        assert!(matches!(wo.update(), Err(KeywordError::WriteOnly(_))));
    }

    #[test]
    fn test_no_write_necessary_skips_broadcast() {
        let mut fixture = Fixture::new();
        let keyword = fixture.shared.insert_keyword(
            "k",
            KeywordType::Integer,
            KeywordOptions::default(),
            Arc::new(SkipSame),
        );

        assert_eq!(keyword.modify("5").unwrap(), "5");
        assert_eq!(keyword.modify("5.0").unwrap(), "5");
        assert_eq!(fixture.drain(), vec!["5"]);
        assert_eq!(keyword.history().len(), 1);
    }

    #[test]
    fn test_recursive_callback_single_extra_broadcast() {
        let mut fixture = Fixture::new();
        let keyword = fixture.keyword("echo", KeywordType::String);

        keyword.callback(
            CallbackHandle::function(|kw: &Keyword| {
                let next = format!("{}!", kw.value().unwrap_or_default());
                kw.set(&next, false);
                Ok(())
            }),
            false,
            false,
        );

        keyword.modify("hi").unwrap();
        assert_eq!(fixture.drain(), vec!["hi", "hi!"]);
        assert_eq!(keyword.value().as_deref(), Some("hi!"));
    }

    struct Scaled;

    impl KeywordHooks for Scaled {
        fn read(&self, _: &Keyword) -> Result<Option<String>, KeywordError> {
            Ok(Some("21".to_string()))
        }

        fn postread(&self, _: &Keyword, value: String) -> Result<String, KeywordError> {
            Ok(format!("{value}.5"))
        }
    }

    #[test]
    fn test_update_runs_read_hooks() {
        let mut fixture = Fixture::new();
        let keyword = fixture.shared.insert_keyword(
            "temp",
            KeywordType::Double,
            KeywordOptions::default(),
            Arc::new(Scaled),
        );

        assert_eq!(keyword.update().unwrap().as_deref(), Some("21.5"));
        assert_eq!(keyword.value().as_deref(), Some("21.5"));
        assert_eq!(fixture.drain(), vec!["21.5"]);
    }

    #[test]
    fn test_increment() {
        let fixture = Fixture::new();
        let count = fixture.keyword("count", KeywordType::Integer);
        assert!(matches!(count.increment(1), Err(KeywordError::NoValue(_))));

        count.modify("41").unwrap();
        assert_eq!(count.increment(1).unwrap(), "42");

        let text = fixture.keyword("text", KeywordType::String);
        assert!(matches!(text.increment(1), Err(KeywordError::Type(_))));
    }
}
