//! Dispatcher: the authoritative side of a service.
//!
//! ## Lifecycle
//! ```text
//! new() → prepare() → setup(populate keywords) → begin() → shutdown()
//! ```
//!
//! `begin()` applies initial values, starts the publisher, registers with
//! the broker (welcome → ready), and starts the worker pool and scheduler.

mod handler;
mod keyword;
mod pool;
mod publisher;
mod scheduler;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tmq::Context;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::catalog::KeywordCatalog;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::keyword::KeywordType;
use crate::protocol::{canonical_keyword, canonical_service, Message};
use crate::transport;

pub use keyword::{Keyword, KeywordHooks, KeywordOptions, MemoryHooks};
pub use pool::PoolSettings;
pub use scheduler::{Refresh, Scheduler, SchedulerState, MAX_FAILURES, MIN_PERIOD};

use pool::Pooler;

/// Implicit dispatcher name.
pub const DEFAULT_NAME: &str = "DEFAULT";

/// Dispatcher settings, derived from the process [`Config`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub service: String,
    pub name: String,
    pub broker: String,
    pub publish: String,
    pub pool: PoolSettings,
    pub join_timeout: Duration,
    pub error_on_join_timeout: bool,
    /// Reject keywords the catalog does not know or assigns elsewhere.
    pub strict: bool,
}

impl DispatcherConfig {
    pub fn new(service: &str, name: Option<&str>, config: &Config) -> Self {
        Self {
            service: canonical_service(service),
            name: name.unwrap_or(DEFAULT_NAME).to_string(),
            broker: config.zmq.broker.clone(),
            publish: config.zmq.publish.clone(),
            pool: PoolSettings {
                size: config.zmq.pool,
                handshake_timeout: config.request_timeout(),
                worker_deadline: config.request_timeout(),
                heartbeat_interval: config.broker_timeout(),
                drain_timeout: config.join_timeout(),
            },
            join_timeout: config.join_timeout(),
            error_on_join_timeout: config.zmq.error_on_join_timeout,
            strict: config.core.strict,
        }
    }
}

// ============================================================================
// Shared service state
// ============================================================================

/// State shared by the service handle, its keywords, and its workers.
pub struct ServiceShared {
    pub(crate) name: String,
    pub(crate) dispatcher: String,
    keywords: RwLock<BTreeMap<String, Arc<Keyword>>>,
    publisher: mpsc::UnboundedSender<Message>,
}

impl ServiceShared {
    pub(crate) fn new(
        name: &str,
        dispatcher: &str,
        publisher: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            name: canonical_service(name),
            dispatcher: dispatcher.to_string(),
            keywords: RwLock::new(BTreeMap::new()),
            publisher,
        }
    }

    pub fn keyword(&self, name: &str) -> Option<Arc<Keyword>> {
        self.keywords.read().get(&canonical_keyword(name)).cloned()
    }

    pub fn keyword_names(&self) -> Vec<String> {
        self.keywords.read().keys().cloned().collect()
    }

    pub(crate) fn keywords(&self) -> Vec<Arc<Keyword>> {
        self.keywords.read().values().cloned().collect()
    }

    pub(crate) fn publish(&self, message: Message) {
        if self.publisher.send(message).is_err() {
            warn!(service = %self.name, "Publisher stopped, broadcast dropped");
        }
    }

    pub(crate) fn insert_keyword(
        self: &Arc<Self>,
        name: &str,
        ktype: KeywordType,
        options: KeywordOptions,
        hooks: Arc<dyn KeywordHooks>,
    ) -> Arc<Keyword> {
        let name = canonical_keyword(name);
        let keyword = Arc::new(Keyword::new(
            name.clone(),
            Arc::downgrade(self),
            ktype,
            options,
            hooks,
        ));
        self.keywords.write().insert(name, Arc::clone(&keyword));
        keyword
    }
}

// ============================================================================
// Service
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Prepared,
    Running,
    Stopped,
}

/// A dispatcher for one service.
pub struct DispatcherService {
    config: DispatcherConfig,
    shared: Arc<ServiceShared>,
    catalog: Option<Arc<dyn KeywordCatalog>>,
    scheduler: Scheduler,
    context: Context,
    publish_rx: Option<mpsc::UnboundedReceiver<Message>>,
    publish_socket: Option<transport::Publish>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    phase: Phase,
}

impl DispatcherService {
    pub fn new(config: DispatcherConfig, catalog: Option<Arc<dyn KeywordCatalog>>) -> Self {
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(ServiceShared::new(&config.service, &config.name, publish_tx)),
            config,
            catalog,
            scheduler: Scheduler::new(),
            context: Context::new(),
            publish_rx: Some(publish_rx),
            publish_socket: None,
            shutdown,
            tasks: Vec::new(),
            phase: Phase::Created,
        }
    }

    /// Construct, prepare, run `setup`, and begin.
    pub async fn start<F>(
        config: DispatcherConfig,
        catalog: Option<Arc<dyn KeywordCatalog>>,
        setup: F,
    ) -> Result<Self>
    where
        F: FnOnce(&mut DispatcherService) -> Result<()>,
    {
        let mut service = Self::new(config, catalog);
        service.prepare()?;
        setup(&mut service)?;
        service.begin().await?;
        Ok(service)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn dispatcher_name(&self) -> &str {
        &self.shared.dispatcher
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn keyword(&self, name: &str) -> Option<Arc<Keyword>> {
        self.shared.keyword(name)
    }

    pub fn keyword_names(&self) -> Vec<String> {
        self.shared.keyword_names()
    }

    /// Open the broadcast socket.
    pub fn prepare(&mut self) -> Result<()> {
        if self.phase != Phase::Created {
            return Err(Error::Dispatcher("service already prepared".to_string()));
        }
        self.publish_socket = Some(transport::connect_publisher(
            &self.context,
            &self.config.publish,
        )?);
        self.phase = Phase::Prepared;
        Ok(())
    }

    /// Create a keyword, consulting the catalog for ownership and metadata.
    ///
    /// Returns `Ok(None)` when the catalog assigns the keyword to another
    /// dispatcher and strict mode is off.
    pub fn add_keyword(
        &mut self,
        name: &str,
        ktype: KeywordType,
        hooks: Option<Arc<dyn KeywordHooks>>,
    ) -> Result<Option<Arc<Keyword>>> {
        let name = canonical_keyword(name);
        let mut options = KeywordOptions::default();

        if let Some(catalog) = &self.catalog {
            match catalog.lookup(&self.shared.name, &name) {
                Some(spec) => {
                    if let Some(expected) = spec.dispatcher.as_deref() {
                        if expected != self.shared.dispatcher {
                            let error = Error::WrongDispatcher {
                                keyword: name.clone(),
                                expected: expected.to_string(),
                                actual: self.shared.dispatcher.clone(),
                            };
                            if self.config.strict {
                                return Err(error);
                            }
                            warn!(error = %error, "Skipping keyword");
                            return Ok(None);
                        }
                    }
                    options = KeywordOptions {
                        read_only: spec.read_only,
                        write_only: spec.write_only,
                        initial: spec.initial.clone(),
                        period: spec.period(),
                        units: spec.units.clone(),
                    };
                }
                None if self.config.strict => {
                    return Err(Error::KeyNotFound(format!(
                        "{name} is not in the catalog for service '{}'",
                        self.shared.name
                    )));
                }
                None => {
                    warn!(keyword = %name, service = %self.shared.name, "Keyword not in catalog");
                }
            }
        }

        let hooks = hooks.unwrap_or_else(|| Arc::new(MemoryHooks));
        Ok(Some(self.shared.insert_keyword(&name, ktype, options, hooks)))
    }

    /// Create a keyword with explicit options, bypassing the catalog.
    pub fn add_keyword_with(
        &mut self,
        name: &str,
        ktype: KeywordType,
        options: KeywordOptions,
        hooks: Option<Arc<dyn KeywordHooks>>,
    ) -> Arc<Keyword> {
        let hooks = hooks.unwrap_or_else(|| Arc::new(MemoryHooks));
        self.shared.insert_keyword(name, ktype, options, hooks)
    }

    /// Default setup: create every catalog keyword owned by this dispatcher
    /// (or by no dispatcher in particular).
    pub fn populate_from_catalog(&mut self) -> Result<usize> {
        let Some(catalog) = self.catalog.clone() else {
            return Ok(0);
        };

        let mut created = 0;
        for spec in catalog.keywords(&self.shared.name) {
            let owned = spec
                .dispatcher
                .as_deref()
                .map_or(true, |d| d == self.shared.dispatcher);
            if !owned {
                continue;
            }
            let ktype = spec.keyword_type()?;
            if self.add_keyword(&spec.name, ktype, None)?.is_some() {
                created += 1;
            }
        }
        Ok(created)
    }

    /// Apply initial values, then start publisher, pool, and scheduler.
    pub async fn begin(&mut self) -> Result<()> {
        if self.phase != Phase::Prepared {
            return Err(Error::Dispatcher(
                "service must be prepared before begin".to_string(),
            ));
        }

        for keyword in self.shared.keywords() {
            if keyword.value().is_some() {
                continue;
            }
            if let Some(initial) = keyword.options().initial.clone() {
                match keyword.keyword_type().translate(&initial) {
                    Ok(value) => {
                        keyword.set(&value, false);
                    }
                    Err(e) => warn!(
                        keyword = %keyword.name(),
                        error = %e,
                        "Invalid initial value ignored"
                    ),
                }
            }
        }

        let (Some(socket), Some(rx)) = (self.publish_socket.take(), self.publish_rx.take()) else {
            return Err(Error::Dispatcher("publisher already started".to_string()));
        };
        self.tasks.push((
            "publisher",
            tokio::spawn(publisher::run(socket, rx, self.shutdown.subscribe())),
        ));

        let pooler = match Pooler::connect(
            &self.context,
            &self.config.broker,
            Arc::clone(&self.shared),
            self.config.pool.clone(),
        )
        .await
        {
            Ok(pooler) => pooler,
            Err(e) => {
                self.stop_tasks().await?;
                return Err(e);
            }
        };
        self.tasks
            .push(("pooler", tokio::spawn(pooler.run(self.shutdown.subscribe()))));

        for keyword in self.shared.keywords() {
            if let Some(period) = keyword.options().period {
                if let Err(e) = self.scheduler.period(&keyword, period) {
                    warn!(keyword = %keyword.name(), error = %e, "Period not scheduled");
                }
            }
        }
        self.tasks.push((
            "scheduler",
            self.scheduler.spawn(self.shutdown.subscribe()),
        ));

        self.phase = Phase::Running;
        info!(
            service = %self.shared.name,
            dispatcher = %self.shared.dispatcher,
            keywords = self.shared.keywords.read().len(),
            "Dispatcher running"
        );
        Ok(())
    }

    /// Stop every task, waiting up to the join timeout for each.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.phase == Phase::Stopped {
            return Ok(());
        }
        self.phase = Phase::Stopped;
        let result = self.stop_tasks().await;
        info!(service = %self.shared.name, dispatcher = %self.shared.dispatcher, "Dispatcher stopped");
        result
    }

    async fn stop_tasks(&mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        join_all(
            std::mem::take(&mut self.tasks),
            self.config.join_timeout,
            self.config.error_on_join_timeout,
        )
        .await
    }
}

impl Drop for DispatcherService {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Join named tasks, each bounded by `timeout`.
pub(crate) async fn join_all(
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    timeout: Duration,
    error_on_timeout: bool,
) -> Result<()> {
    let mut failed = None;
    for (name, mut handle) in tasks {
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task = name, error = %e, "Task ended abnormally"),
            Err(_) => {
                warn!(task = name, timeout = ?timeout, "Task did not stop in time");
                handle.abort();
                failed.get_or_insert(name);
            }
        }
    }
    match failed {
        Some(name) if error_on_timeout => Err(Error::Join(name)),
        _ => Ok(()),
    }
}
