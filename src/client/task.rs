//! Client task queue.
//!
//! One task owns the client's DEALER and runs requests strictly one at a
//! time: send, wait for the reply carrying the same identifier (or the
//! task's deadline), complete. Replies that arrive for an earlier, already
//! timed-out request are discarded.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::protocol::{Message, MessageId};
use crate::transport::{self, Dealer};

/// Runs on the queue task when a successful reply arrives.
pub(crate) type OnReply = Box<dyn FnOnce(&Message) + Send>;

struct Task {
    request: Message,
    timeout: Duration,
    on_reply: Option<OnReply>,
    done: oneshot::Sender<Result<Message>>,
}

impl Task {
    fn finish(self, result: Result<Message>) {
        let result = match (result, self.on_reply) {
            (Ok(reply), Some(on_reply)) => {
                on_reply(&reply);
                Ok(reply)
            }
            (result, _) => result,
        };
        // The caller may have given up waiting.
        let _ = self.done.send(result);
    }
}

/// Handle to an in-flight request.
#[derive(Debug)]
pub struct Sequence {
    id: MessageId,
    done: oneshot::Receiver<Result<Message>>,
}

impl Sequence {
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Wait for the reply. `None` waits as long as the queue's own deadline
    /// for the request allows.
    pub async fn wait(self, timeout: Option<Duration>) -> Result<Message> {
        let received = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.done)
                .await
                .map_err(|_| Error::Timeout(timeout))?,
            None => self.done.await,
        };
        received.map_err(|_| Error::Shutdown)?
    }
}

/// Sender side of the queue.
#[derive(Clone)]
pub(crate) struct TaskQueue {
    tasks: mpsc::UnboundedSender<Task>,
    default_timeout: Duration,
}

impl TaskQueue {
    pub(crate) fn spawn(
        socket: Dealer,
        default_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(socket, rx, shutdown));
        (
            Self {
                tasks: tx,
                default_timeout,
            },
            handle,
        )
    }

    pub(crate) fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Enqueue `request` and return immediately.
    pub(crate) fn submit(
        &self,
        request: Message,
        timeout: Option<Duration>,
        on_reply: Option<OnReply>,
    ) -> Result<Sequence> {
        let (done, rx) = oneshot::channel();
        let id = request.id;
        self.tasks
            .send(Task {
                request,
                timeout: timeout.unwrap_or(self.default_timeout),
                on_reply,
                done,
            })
            .map_err(|_| Error::Shutdown)?;
        Ok(Sequence { id, done: rx })
    }

    /// Enqueue `request` and wait for its reply.
    pub(crate) async fn call(&self, request: Message, timeout: Option<Duration>) -> Result<Message> {
        self.submit(request, timeout, None)?.wait(None).await
    }
}

async fn run(
    mut socket: Dealer,
    mut tasks: mpsc::UnboundedReceiver<Task>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let task = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            task = tasks.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        if let Err(e) = socket.send(transport::encode(&task.request)).await {
            error!(error = %e, id = %task.request.id, "Request send failed");
            task.finish(Err(e.into()));
            continue;
        }

        let deadline = tokio::time::Instant::now() + task.timeout;
        let result = loop {
            let received = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break None;
                    }
                    continue;
                }
                received = tokio::time::timeout_at(deadline, socket.next()) => received,
            };

            let multipart = match received {
                Err(_) => break Some(Err(Error::Timeout(task.timeout))),
                Ok(None) => break None,
                Ok(Some(Err(e))) => break Some(Err(e.into())),
                Ok(Some(Ok(multipart))) => multipart,
            };

            match transport::decode(&multipart) {
                Ok(reply) if reply.id == task.request.id => break Some(reply_result(reply)),
                Ok(stale) => {
                    debug!(id = %stale.id, command = %stale.command, "Discarding stale reply");
                }
                Err(e) => warn!(error = %e, "Unparseable reply discarded"),
            }
        };

        match result {
            Some(result) => task.finish(result),
            None => {
                task.finish(Err(Error::Shutdown));
                break;
            }
        }
    }

    tasks.close();
    while let Ok(task) = tasks.try_recv() {
        task.finish(Err(Error::Shutdown));
    }
    debug!("Task queue stopped");
}

fn reply_result(reply: Message) -> Result<Message> {
    if reply.direction.is_error() {
        Err(Error::Dispatcher(reply.payload_text()))
    } else {
        Ok(reply)
    }
}
