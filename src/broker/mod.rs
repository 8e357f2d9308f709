//! Broker: registration, routing, fan queries, liveness, broadcast relay.
//!
//! ```text
//! clients/dispatchers --ROUTER(broker)--> BrokerState --ROUTER--> peers
//! dispatchers --PUB--> SUB(publish) --relay--> PUB(subscribe) --> clients
//! ```

mod fan;
mod registry;
mod state;

use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tmq::Context;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::protocol::Message;
use crate::transport::{self, Publish, Router, Subscribe};

pub use fan::FanMessage;
pub use registry::{
    ClientRecord, DispatcherRecord, Identity, Lifetime, Outstanding, ServiceRecord,
    LIFETIME_FACTOR,
};
pub use state::{BrokerSettings, BrokerState, DEFAULT_DISPATCHER, TIMED_OUT};

/// A running broker's sockets and routing state.
pub struct Broker {
    state: BrokerState,
    router: Router,
    relay_in: Subscribe,
    relay_out: Publish,
    _context: Context,
}

impl Broker {
    /// Bind the three broker endpoints from `config`.
    pub fn bind(config: &Config) -> Result<Self> {
        let context = Context::new();
        let router = transport::bind_router(&context, &config.zmq.broker)?;
        let relay_in = transport::bind_relay(&context, &config.zmq.publish)?;
        let relay_out = transport::bind_publisher(&context, &config.zmq.subscribe)?;

        info!(
            broker = %config.zmq.broker,
            publish = %config.zmq.publish,
            subscribe = %config.zmq.subscribe,
            "Broker bound"
        );

        Ok(Self {
            state: BrokerState::new(BrokerSettings {
                timeout: config.broker_timeout(),
                publish: config.zmq.publish.clone(),
                subscribe: config.zmq.subscribe.clone(),
            }),
            router,
            relay_in,
            relay_out,
            _context: context,
        })
    }

    /// Run the event loop until `shutdown` turns true (or its sender drops).
    ///
    /// Errors handling a single message are logged and never stop the loop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let poll = self.state.settings().timeout;
        info!(poll = ?poll, "Broker started");

        loop {
            let outgoing = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    Vec::new()
                }
                incoming = self.router.next() => match incoming {
                    Some(Ok(multipart)) => {
                        let frames = transport::frames(&multipart);
                        self.state.handle_frames(frames, Instant::now())
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Router receive failed");
                        Vec::new()
                    }
                    None => {
                        warn!("Router socket closed");
                        break;
                    }
                },
                broadcast = self.relay_in.next() => {
                    match broadcast {
                        Some(Ok(multipart)) => {
                            if let Err(e) = self.relay_out.send(multipart).await {
                                error!(error = %e, "Broadcast relay failed");
                            }
                        }
                        Some(Err(e)) => error!(error = %e, "Relay receive failed"),
                        None => {
                            warn!("Relay socket closed");
                            break;
                        }
                    }
                    Vec::new()
                }
                _ = tokio::time::sleep(poll) => Vec::new(),
            };

            self.send_all(outgoing).await;
            let maintenance = self.state.tick(Instant::now());
            self.send_all(maintenance).await;
        }

        info!("Broker stopped");
        Ok(())
    }

    async fn send_all(&mut self, messages: Vec<Message>) {
        for message in messages {
            debug!(
                direction = %message.direction,
                command = %message.command,
                id = %message.id,
                "Broker send"
            );
            if let Err(e) = self.router.send(transport::encode(&message)).await {
                error!(error = %e, id = %message.id, "Router send failed");
            }
        }
    }
}
