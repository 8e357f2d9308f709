//! Client: remote keywords behind a local cache.
//!
//! ## Startup
//! ```text
//! UBQ/check → "Broker Alive"
//! CBQ/lookup("subscribe") → broadcast endpoint
//! SUB(service name) → subscription task
//! ```
//!
//! Keywords are created lazily on first access through `CSQ/identify`,
//! which tells the client the keyword's type and owning dispatcher.

mod keyword;
mod subscription;
mod task;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tmq::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispatcher::join_all;
use crate::error::{Error, Result};
use crate::keyword::KeywordType;
use crate::protocol::{canonical_keyword, canonical_service, Command, Direction, Message};
use crate::transport;

pub use keyword::{ClientKeyword, Counters, Item, ItemKey};
pub use task::Sequence;

use task::TaskQueue;

/// State shared by the client handle, its keywords, and its tasks.
pub(crate) struct ClientShared {
    pub(crate) name: String,
    pub(crate) queue: TaskQueue,
    keywords: RwLock<BTreeMap<String, Arc<ClientKeyword>>>,
}

impl ClientShared {
    pub(crate) fn keyword(&self, name: &str) -> Option<Arc<ClientKeyword>> {
        self.keywords.read().get(&canonical_keyword(name)).cloned()
    }
}

/// Client connection to one service.
pub struct ClientService {
    shared: Arc<ClientShared>,
    broker: String,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    join_timeout: Duration,
    error_on_join_timeout: bool,
    stopped: bool,
    context: Context,
}

impl std::fmt::Debug for ClientService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientService")
            .field("broker", &self.broker)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl ClientService {
    /// Connect to `name` through the configured broker.
    ///
    /// Fails with [`Error::Locate`] naming the service when the broker is
    /// unreachable or cannot report its broadcast endpoint. No task is left
    /// running on failure.
    pub async fn connect(name: &str, config: &Config) -> Result<Self> {
        let name = canonical_service(name);
        let context = Context::new();
        let (shutdown, _) = watch::channel(false);

        let socket = transport::connect_dealer(&context, &config.zmq.broker)?;
        let (queue, queue_task) =
            TaskQueue::spawn(socket, config.request_timeout(), shutdown.subscribe());

        let mut service = Self {
            shared: Arc::new(ClientShared {
                name: name.clone(),
                queue,
                keywords: RwLock::new(BTreeMap::new()),
            }),
            broker: config.zmq.broker.clone(),
            shutdown,
            tasks: vec![("task queue", queue_task)],
            join_timeout: config.join_timeout(),
            error_on_join_timeout: config.zmq.error_on_join_timeout,
            stopped: false,
            context,
        };

        if let Err(e) = service.start().await {
            if let Err(stop) = service.shutdown().await {
                warn!(service = %name, error = %stop, "Cleanup after failed connect");
            }
            return Err(Error::Locate {
                service: name,
                reason: e.to_string(),
            });
        }

        info!(service = %service.shared.name, broker = %service.broker, "Client connected");
        Ok(service)
    }

    async fn start(&mut self) -> Result<()> {
        let check = self
            .shared
            .queue
            .call(Message::new(Direction::UBQ, Command::Check), None)
            .await?;
        if check.payload_text() != "Broker Alive" {
            return Err(Error::Routing(format!(
                "unexpected broker check response '{}'",
                check.payload_text()
            )));
        }

        let lookup = Message::new(Direction::CBQ, Command::Lookup)
            .with_service(&self.shared.name)
            .with_payload("subscribe");
        let endpoint = self.shared.queue.call(lookup, None).await?.payload_text();
        let endpoint = transport::resolve_endpoint(&endpoint, &self.broker);

        let socket =
            transport::connect_subscriber(&self.context, &endpoint, self.shared.name.as_bytes())?;
        self.tasks.push((
            "subscription",
            tokio::spawn(subscription::run(
                socket,
                Arc::clone(&self.shared),
                self.shutdown.subscribe(),
            )),
        ));
        debug!(service = %self.shared.name, endpoint = %endpoint, "Subscribed");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether any dispatcher of this service is registered with the broker.
    pub async fn locate(&self) -> Result<bool> {
        let request = Message::new(Direction::CBQ, Command::Locate).with_service(&self.shared.name);
        let reply = self.shared.queue.call(request, None).await?;
        Ok(reply.payload_text() == "yes")
    }

    /// Names of every keyword across the service's dispatchers.
    pub async fn enumerate(&self) -> Result<Vec<String>> {
        let request =
            Message::new(Direction::CSQ, Command::Enumerate).with_service(&self.shared.name);
        let reply = self.shared.queue.call(request, None).await?;
        Ok(reply
            .payload
            .as_text()
            .map(|names| {
                names
                    .split(':')
                    .filter(|n| !n.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// The keyword `name`, identified on first access.
    pub async fn keyword(&self, name: &str) -> Result<Arc<ClientKeyword>> {
        let name = canonical_keyword(name);
        if let Some(keyword) = self.shared.keyword(&name) {
            return Ok(keyword);
        }

        let request = Message::new(Direction::CSQ, Command::Identify)
            .with_service(&self.shared.name)
            .with_keyword(&name);
        let not_found = || Error::KeyNotFound(format!("{name} in service '{}'", self.shared.name));

        let reply = match self.shared.queue.call(request, None).await {
            Ok(reply) => reply,
            Err(Error::Dispatcher(reason)) => {
                debug!(keyword = %name, reason = %reason, "Identify failed");
                return Err(not_found());
            }
            Err(e) => return Err(e),
        };

        // Blank means nobody owns it; a ':' means several dispatchers claim it.
        let tag = reply.payload.as_text().ok_or_else(not_found)?;
        if tag.contains(':') {
            return Err(not_found());
        }
        let ktype = KeywordType::from_tag(&tag).map_err(|_| not_found())?;

        let keyword = Arc::new(ClientKeyword::new(
            name.clone(),
            Arc::downgrade(&self.shared),
            ktype,
            reply.dispatcher.clone(),
        ));
        // Another caller may have raced us here; keep the first.
        let keyword = Arc::clone(
            self.shared
                .keywords
                .write()
                .entry(name)
                .or_insert(keyword),
        );
        Ok(keyword)
    }

    /// Stop the subscription and task queue.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        let _ = self.shutdown.send(true);
        let result = join_all(
            std::mem::take(&mut self.tasks),
            self.join_timeout,
            self.error_on_join_timeout,
        )
        .await;
        debug!(service = %self.shared.name, "Client stopped");
        result
    }
}

impl Drop for ClientService {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
