//! Broadcast subscription task.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::protocol::{Direction, Message};
use crate::transport::{self, Subscribe};

use super::ClientShared;

/// Receive broadcasts for one service until shutdown.
pub(crate) async fn run(
    mut socket: Subscribe,
    service: Arc<ClientShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            incoming = socket.next() => match incoming {
                Some(Ok(multipart)) => match transport::decode(&multipart) {
                    Ok(message) => deliver(&service, message).await,
                    Err(e) => warn!(service = %service.name, error = %e, "Unparseable broadcast"),
                },
                Some(Err(e)) => error!(service = %service.name, error = %e, "Subscription receive failed"),
                None => break,
            },
        }
    }
    debug!(service = %service.name, "Subscription stopped");
}

async fn deliver(service: &ClientShared, message: Message) {
    if message.direction != Direction::CDB {
        return;
    }
    // Topic filtering is by prefix; "tel" also receives "telescope".
    if message.service.as_deref() != Some(service.name.as_str()) {
        return;
    }
    let Some(name) = message.keyword.as_deref() else {
        return;
    };
    let Some(keyword) = service.keyword(name) else {
        return;
    };
    if !keyword.monitored() {
        return;
    }
    let Some(value) = message.payload.as_text() else {
        return;
    };

    keyword.receive(&value, true);
    // Awaited so callbacks for one keyword run in arrival order.
    if let Err(e) = tokio::task::spawn_blocking(move || keyword.notify()).await {
        error!(keyword = %name, error = %e, "Callback task failed");
    }
}
