//! Worker pool and the pooler that feeds it from the broker connection.
//!
//! The pooler owns the DEALER socket. Requests go to the most recently idle
//! worker (LIFO); with no idle worker they wait in a backlog. A worker that
//! misses its deadline is declared defunct and replaced, so a stuck handler
//! never shrinks the pool; its eventual reply is still forwarded.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tmq::Context;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{Command, Direction, Kind, Message, Role};
use crate::transport::{self, Dealer};

use super::{handler, ServiceShared};

/// Worker pool parameters.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub size: usize,
    /// Limit on each of the welcome and ready exchanges.
    pub handshake_timeout: Duration,
    /// How long a worker may hold a request before it is declared defunct.
    pub worker_deadline: Duration,
    pub heartbeat_interval: Duration,
    /// How long shutdown waits for in-flight requests.
    pub drain_timeout: Duration,
}

// ============================================================================
// Workers
// ============================================================================

type Reply = (usize, Message);

struct Worker {
    id: usize,
    requests: mpsc::Sender<Message>,
}

async fn run_worker(
    id: usize,
    service: Arc<ServiceShared>,
    mut requests: mpsc::Receiver<Message>,
    replies: mpsc::UnboundedSender<Reply>,
) {
    while let Some(request) = requests.recv().await {
        let shared = Arc::clone(&service);
        let job = request.clone();
        let reply = match tokio::task::spawn_blocking(move || handler::handle(&shared, &job)).await
        {
            Ok(reply) => reply,
            Err(e) => request.error(format!("handler failed: {e}")),
        };
        if replies.send((id, reply)).is_err() {
            break;
        }
    }
    debug!(worker = id, "Worker stopped");
}

/// Idle/active bookkeeping for a set of workers.
pub(crate) struct WorkerPool {
    service: Arc<ServiceShared>,
    deadline: Duration,
    idle: Vec<Worker>,
    active: HashMap<usize, (Worker, Instant)>,
    backlog: VecDeque<Message>,
    replies_tx: mpsc::UnboundedSender<Reply>,
    replies_rx: mpsc::UnboundedReceiver<Reply>,
    next_id: usize,
}

impl WorkerPool {
    pub(crate) fn new(service: Arc<ServiceShared>, size: usize, deadline: Duration) -> Self {
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let mut pool = Self {
            service,
            deadline,
            idle: Vec::with_capacity(size),
            active: HashMap::new(),
            backlog: VecDeque::new(),
            replies_tx,
            replies_rx,
            next_id: 0,
        };
        for _ in 0..size.max(1) {
            let worker = pool.spawn_worker();
            pool.idle.push(worker);
        }
        pool
    }

    fn spawn_worker(&mut self) -> Worker {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(run_worker(
            id,
            Arc::clone(&self.service),
            rx,
            self.replies_tx.clone(),
        ));
        Worker { id, requests: tx }
    }

    /// Hand a request to an idle worker, or queue it.
    pub(crate) fn submit(&mut self, request: Message) {
        let Some(worker) = self.idle.pop() else {
            self.backlog.push_back(request);
            return;
        };
        match worker.requests.try_send(request) {
            Ok(()) => {
                self.active
                    .insert(worker.id, (worker, Instant::now() + self.deadline));
            }
            Err(e) => {
                error!(worker = worker.id, "Worker unavailable, replacing");
                self.backlog.push_front(e.into_inner());
                let replacement = self.spawn_worker();
                self.idle.push(replacement);
                self.drain_backlog();
            }
        }
    }

    fn drain_backlog(&mut self) {
        while !self.idle.is_empty() {
            let Some(request) = self.backlog.pop_front() else {
                break;
            };
            self.submit(request);
        }
    }

    /// Next finished reply. Frees the worker and feeds it from the backlog.
    pub(crate) async fn next_reply(&mut self) -> Option<Message> {
        let (id, reply) = self.replies_rx.recv().await?;
        if let Some((worker, _)) = self.active.remove(&id) {
            self.idle.push(worker);
            self.drain_backlog();
        } else {
            debug!(worker = id, "Late reply from defunct worker");
        }
        Some(reply)
    }

    /// Replace workers past their deadline. Returns how many were replaced.
    pub(crate) fn reap(&mut self, now: Instant) -> usize {
        let defunct: Vec<usize> = self
            .active
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &defunct {
            self.active.remove(id);
            warn!(worker = id, "Worker missed its deadline, replacing");
            let replacement = self.spawn_worker();
            self.idle.push(replacement);
        }
        self.drain_backlog();
        defunct.len()
    }

    pub(crate) fn busy(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn queued(&self) -> usize {
        self.backlog.len()
    }
}

// ============================================================================
// Pooler
// ============================================================================

/// Broker-facing half of the dispatcher.
pub(crate) struct Pooler {
    socket: Dealer,
    service: Arc<ServiceShared>,
    settings: PoolSettings,
}

impl Pooler {
    /// Connect and register: `welcome` → `confirmed`, then `ready`.
    pub(crate) async fn connect(
        context: &Context,
        endpoint: &str,
        service: Arc<ServiceShared>,
        settings: PoolSettings,
    ) -> Result<Self> {
        let socket = transport::connect_dealer(context, endpoint)?;
        let mut pooler = Self {
            socket,
            service,
            settings,
        };
        pooler.exchange(Command::Welcome, "confirmed").await?;
        pooler.exchange(Command::Ready, "ready").await?;

        info!(
            service = %pooler.service.name,
            dispatcher = %pooler.service.dispatcher,
            broker = %endpoint,
            "Registered with broker"
        );
        Ok(pooler)
    }

    fn registration(&self, command: Command) -> Message {
        Message::new(Direction::DBQ, command)
            .with_service(&self.service.name)
            .with_dispatcher(self.service.dispatcher.clone())
    }

    async fn exchange(&mut self, command: Command, expected: &str) -> Result<()> {
        let request = self.registration(command);
        self.socket.send(transport::encode(&request)).await?;

        let deadline = tokio::time::Instant::now() + self.settings.handshake_timeout;
        loop {
            let received = tokio::time::timeout_at(deadline, self.socket.next()).await;
            let multipart = match received {
                Err(_) => {
                    return Err(Error::Dispatcher(format!(
                        "no '{command}' response from broker within {:?}",
                        self.settings.handshake_timeout
                    )))
                }
                Ok(None) => return Err(Error::Shutdown),
                Ok(Some(multipart)) => multipart?,
            };

            let reply = match transport::decode(&multipart) {
                Ok(reply) if reply.id == request.id => reply,
                Ok(other) => {
                    debug!(id = %other.id, "Ignoring message during registration");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Unparseable message during registration");
                    continue;
                }
            };

            if reply.direction.is_error() {
                return Err(Error::Dispatcher(reply.payload_text()));
            }
            if reply.payload_text() != expected {
                return Err(Error::Dispatcher(format!(
                    "unexpected '{command}' response: {}",
                    reply.payload_text()
                )));
            }
            return Ok(());
        }
    }

    /// Route requests until shutdown, then drain in-flight work.
    pub(crate) async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut pool = WorkerPool::new(
            Arc::clone(&self.service),
            self.settings.size,
            self.settings.worker_deadline,
        );
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                incoming = self.socket.next() => match incoming {
                    Some(Ok(multipart)) => self.on_request(&mut pool, transport::frames(&multipart)).await,
                    Some(Err(e)) => error!(error = %e, "Dealer receive failed"),
                    None => {
                        warn!("Broker connection closed");
                        break;
                    }
                },
                Some(reply) = pool.next_reply() => self.send(&reply).await,
                _ = heartbeat.tick() => {
                    let beat = self.registration(Command::Heartbeat);
                    self.send(&beat).await;
                }
            }
            pool.reap(Instant::now());
        }

        self.drain(&mut pool).await;
        info!(service = %self.service.name, "Pooler stopped");
    }

    async fn on_request(&mut self, pool: &mut WorkerPool, frames: Vec<Vec<u8>>) {
        let message = match Message::from_frames(frames.clone()) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Unparseable request");
                let reply = handler::parser_error(&frames, &e);
                self.send(&reply).await;
                return;
            }
        };

        let direction = message.direction;
        match (direction.origin, direction.responder, direction.kind) {
            (Role::Dispatcher, Role::Broker, Kind::Reply) => {
                debug!(command = %message.command, "Broker acknowledged");
            }
            (Role::Dispatcher, Role::Broker, Kind::Error) => {
                warn!(error = %message.payload_text(), "Broker rejected dispatcher, re-registering");
                for command in [Command::Welcome, Command::Ready] {
                    let request = self.registration(command);
                    self.send(&request).await;
                }
            }
            (_, _, Kind::Query) => pool.submit(message),
            _ => debug!(direction = %direction, "Ignoring unexpected message"),
        }
    }

    async fn send(&mut self, message: &Message) {
        if let Err(e) = self.socket.send(transport::encode(message)).await {
            error!(error = %e, id = %message.id, "Dealer send failed");
        }
    }

    async fn drain(&mut self, pool: &mut WorkerPool) {
        let deadline = tokio::time::Instant::now() + self.settings.drain_timeout;
        while pool.busy() > 0 {
            match tokio::time::timeout_at(deadline, pool.next_reply()).await {
                Ok(Some(reply)) => self.send(&reply).await,
                Ok(None) => break,
                Err(_) => {
                    warn!(busy = pool.busy(), "Drain timed out");
                    break;
                }
            }
        }
        if pool.queued() > 0 {
            warn!(dropped = pool.queued(), "Queued requests dropped at shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{Keyword, KeywordHooks, KeywordOptions, MemoryHooks};
    use crate::keyword::{KeywordError, KeywordType};

    struct SlowRead;

    impl KeywordHooks for SlowRead {
        fn read(&self, _: &Keyword) -> std::result::Result<Option<String>, KeywordError> {
            std::thread::sleep(Duration::from_millis(400));
            Ok(Some("slow".to_string()))
        }
    }

    fn service() -> Arc<ServiceShared> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ServiceShared::new("svc", "disp", tx));
        shared.insert_keyword(
            "FAST",
            KeywordType::String,
            KeywordOptions::default(),
            Arc::new(MemoryHooks),
        );
        shared.insert_keyword(
            "SLOW",
            KeywordType::String,
            KeywordOptions::default(),
            Arc::new(SlowRead),
        );
        shared
    }

    fn heartbeat() -> Message {
        Message::new(Direction::BDQ, Command::Heartbeat).with_service("svc")
    }

    fn update(keyword: &str) -> Message {
        Message::new(Direction::CDQ, Command::Update)
            .with_service("svc")
            .with_keyword(keyword)
    }

    #[tokio::test]
    async fn test_backlog_is_served() {
        let mut pool = WorkerPool::new(service(), 1, Duration::from_secs(5));
        let first = heartbeat();
        let second = heartbeat();
        pool.submit(first.clone());
        pool.submit(second.clone());
        assert_eq!(pool.busy(), 1);
        assert_eq!(pool.queued(), 1);

        let a = pool.next_reply().await.unwrap();
        let b = pool.next_reply().await.unwrap();
        assert_eq!(a.id, first.id);
        assert_eq!(b.id, second.id);
        assert_eq!(pool.busy(), 0);
        assert_eq!(pool.queued(), 0);
    }

    #[tokio::test]
    async fn test_defunct_worker_replaced() {
        let mut pool = WorkerPool::new(service(), 1, Duration::from_millis(50));
        let slow = update("SLOW");
        pool.submit(slow.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.reap(Instant::now()), 1);
        assert_eq!(pool.busy(), 0);

        let fast = heartbeat();
        pool.submit(fast.clone());
        let first = pool.next_reply().await.unwrap();
        assert_eq!(first.id, fast.id);

        // The stuck request still answers eventually.
        let late = pool.next_reply().await.unwrap();
        assert_eq!(late.id, slow.id);
        assert_eq!(late.payload_text(), "slow");
    }
}
