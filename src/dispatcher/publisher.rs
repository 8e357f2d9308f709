//! Broadcast publisher task.
//!
//! Keywords enqueue broadcasts from any thread; this task owns the PUB
//! socket and sends them in order.

use futures::SinkExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

use crate::protocol::Message;
use crate::transport::{self, Publish};

pub(crate) async fn run(
    mut socket: Publish,
    mut broadcasts: mpsc::UnboundedReceiver<Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            message = broadcasts.recv() => match message {
                Some(message) => send(&mut socket, &message).await,
                None => break,
            },
        }
    }

    // Flush what was queued before shutdown.
    while let Ok(message) = broadcasts.try_recv() {
        send(&mut socket, &message).await;
    }
    debug!("Publisher stopped");
}

async fn send(socket: &mut Publish, message: &Message) {
    if let Err(e) = socket.send(transport::encode(message)).await {
        error!(error = %e, keyword = ?message.keyword, "Broadcast send failed");
    }
}
