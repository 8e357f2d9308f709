//! Transport-free broker core.
//!
//! Every handler takes a decoded message and the current instant and returns
//! the messages to send on the ROUTER socket, each carrying its destination
//! route. The socket loop in [`super::Broker`] only moves frames.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::protocol::{
    salvage_id, timestamp, Command, Direction, Message, MessageId, Payload, ProtocolError,
};

use super::fan::FanMessage;
use super::registry::{
    ClientRecord, DispatcherRecord, Identity, Outstanding, ServiceRecord, LIFETIME_FACTOR,
};

/// Implicit dispatcher name.
pub const DEFAULT_DISPATCHER: &str = "DEFAULT";

/// Payload of the error sent for requests stranded on an expired dispatcher.
pub const TIMED_OUT: &str = "Dispatcher Timed Out";

/// Broker parameters the routing core needs.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Poll timeout and unit of peer liveness.
    pub timeout: Duration,
    /// Endpoint dispatchers publish to, reported by `lookup`.
    pub publish: String,
    /// Endpoint clients subscribe to, reported by `lookup`.
    pub subscribe: String,
}

/// Registry and routing rules.
#[derive(Debug)]
pub struct BrokerState {
    settings: BrokerSettings,
    services: HashMap<String, ServiceRecord>,
    /// Dispatcher identity → (service, dispatcher name).
    identities: HashMap<Identity, (String, String)>,
}

impl BrokerState {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            settings,
            services: HashMap::new(),
            identities: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Decode and handle raw frames from the ROUTER socket.
    pub fn handle_frames(&mut self, frames: Vec<Vec<u8>>, now: Instant) -> Vec<Message> {
        let identity = frames.first().cloned();
        let id = salvage_id(&frames);
        match Message::from_frames(frames) {
            Ok(message) => self.handle(message, now),
            Err(e) => parse_error(identity, id, &e).into_iter().collect(),
        }
    }

    /// Route one message.
    pub fn handle(&mut self, message: Message, now: Instant) -> Vec<Message> {
        let Some(identity) = message.route.first().cloned() else {
            warn!(direction = %message.direction, "Message without routing identity dropped");
            return Vec::new();
        };

        if let Some(record) = self.dispatcher_mut(&identity) {
            record.lifetime.refresh(now);
        }

        let direction = message.direction;
        let code = direction.code();
        match code.as_str() {
            "UBQ" => vec![self.handle_unidentified(&message)],
            "DBQ" => vec![self.handle_registration(message, identity, now)],
            "DBE" | "DBP" => {
                debug!(direction = %direction, "Discarding dispatcher-to-broker reply");
                Vec::new()
            }
            "BDP" | "BDE" => Vec::new(),
            "CBQ" => vec![self.handle_broker_query(&message)],
            "CDQ" => self.route_to_dispatcher(message, identity, now),
            "CDP" | "CDE" => self.route_to_client(message, &identity),
            "CSQ" => self.open_fan(message, identity, now),
            "SDP" | "SDE" => {
                self.record_fan_response(message, &identity);
                Vec::new()
            }
            _ if direction.is_query() => {
                vec![message.error(format!("direction {direction} is not handled by the broker"))]
            }
            _ => {
                debug!(direction = %direction, "Unroutable message dropped");
                Vec::new()
            }
        }
    }

    /// Periodic maintenance: expire dispatchers, resolve fans, send due
    /// heartbeats, prune idle clients.
    pub fn tick(&mut self, now: Instant) -> Vec<Message> {
        let mut outgoing = Vec::new();
        let mut forgotten = Vec::new();

        for (service_name, service) in &mut self.services {
            for reply in expire_dispatchers(service_name, service, now, &mut forgotten) {
                outgoing.push(reply);
            }
            outgoing.extend(resolve_fans(service_name, service, now));

            for record in service.dispatchers.values_mut() {
                if record.lifetime.heartbeat_due(now) {
                    record.lifetime.beacon_sent(now);
                    outgoing.push(
                        Message::new(Direction::BDQ, Command::Heartbeat)
                            .with_service(service_name)
                            .with_dispatcher(record.name.clone())
                            .with_route(vec![record.identity.clone()]),
                    );
                }
            }

            service
                .clients
                .retain(|_, c| !c.outstanding.is_empty() || c.lifetime.alive(now));
        }

        for identity in forgotten {
            self.identities.remove(&identity);
        }
        outgoing
    }

    // ========================================================================
    // Broker-terminated requests
    // ========================================================================

    fn handle_unidentified(&self, message: &Message) -> Message {
        match message.command {
            Command::Check => message.reply("Broker Alive"),
            other => message.error(format!("unsupported command '{other}'")),
        }
    }

    fn handle_broker_query(&self, message: &Message) -> Message {
        match message.command {
            Command::Lookup => match message.payload_text().as_str() {
                "subscribe" => message.reply(self.settings.subscribe.clone()),
                "publish" => message.reply(self.settings.publish.clone()),
                other => message.error(format!("unknown lookup target '{other}'")),
            },
            Command::Locate => {
                let found = message
                    .service
                    .as_ref()
                    .and_then(|name| self.services.get(name))
                    .is_some_and(|s| s.ready_dispatchers().next().is_some());
                message.reply(if found { "yes" } else { "no" })
            }
            other => message.error(format!("unsupported command '{other}'")),
        }
    }

    fn handle_registration(&mut self, message: Message, identity: Identity, now: Instant) -> Message {
        let Some(service_name) = message.service.clone() else {
            return message.error("service name is required");
        };
        let name = message
            .dispatcher
            .clone()
            .unwrap_or_else(|| DEFAULT_DISPATCHER.to_string());

        match message.command {
            Command::Welcome => {
                self.register(&service_name, &name, identity, now);
                message.reply("confirmed")
            }
            Command::Ready => match self.dispatcher_mut(&identity) {
                Some(record) if record.name == name => {
                    record.ready = true;
                    info!(service = %service_name, dispatcher = %name, "Dispatcher ready");
                    message.reply("ready")
                }
                _ => message.error(format!("dispatcher '{name}' is not registered")),
            },
            Command::Heartbeat => {
                if self.identities.contains_key(&identity) {
                    message.reply(timestamp())
                } else {
                    message.error(format!("dispatcher '{name}' is not registered"))
                }
            }
            other => message.error(format!("unsupported command '{other}'")),
        }
    }

    fn register(&mut self, service_name: &str, name: &str, identity: Identity, now: Instant) {
        // An identity re-registering under a different name releases the old one.
        if let Some((old_service, old_name)) = self.identities.get(&identity).cloned() {
            if old_service != service_name || old_name != name {
                if let Some(service) = self.services.get_mut(&old_service) {
                    service.dispatchers.remove(&old_name);
                    forget_dispatcher(service, &old_name);
                }
            }
        }

        let service = self.services.entry(service_name.to_string()).or_default();
        let record = DispatcherRecord::new(name, identity.clone(), now, self.settings.timeout);
        if let Some(previous) = service.dispatchers.insert(name.to_string(), record) {
            if previous.identity != identity {
                warn!(
                    service = %service_name,
                    dispatcher = %name,
                    dropped = previous.outstanding.len(),
                    "Dispatcher replaced by a new connection"
                );
                self.identities.remove(&previous.identity);
                for id in previous.outstanding.keys() {
                    for client in service.clients.values_mut() {
                        client.outstanding.remove(id);
                    }
                }
            }
        }

        info!(service = %service_name, dispatcher = %name, "Dispatcher registered");
        self.identities
            .insert(identity, (service_name.to_string(), name.to_string()));
    }

    // ========================================================================
    // Point requests
    // ========================================================================

    fn route_to_dispatcher(
        &mut self,
        message: Message,
        client: Identity,
        now: Instant,
    ) -> Vec<Message> {
        let Some(service_name) = message.service.clone() else {
            return vec![message.error("service name is required")];
        };
        let timeout = self.settings.timeout;
        let Some(service) = self.services.get_mut(&service_name) else {
            return vec![message.error(format!(
                "no dispatchers available for service '{service_name}'"
            ))];
        };

        let target = match (&message.dispatcher, &message.keyword) {
            (Some(name), _) => name.clone(),
            (None, Some(keyword)) => match service.keywords.get(keyword) {
                Some(owner) => owner.clone(),
                None => {
                    return vec![message.error(format!(
                        "no dispatcher known for keyword {keyword} in service '{service_name}'"
                    ))]
                }
            },
            (None, None) => return vec![message.error("dispatcher or keyword is required")],
        };

        let Some(record) = service.dispatchers.get_mut(&target).filter(|d| d.ready) else {
            return vec![message.error(format!(
                "dispatcher '{target}' is not available for service '{service_name}'"
            ))];
        };

        let mut forwarded = message.clone().with_route(vec![record.identity.clone()]);
        forwarded.dispatcher = Some(target);
        record.outstanding.insert(
            message.id,
            Outstanding {
                message: message.clone(),
                sent: now,
            },
        );

        let client_record = service
            .clients
            .entry(client)
            .or_insert_with(|| ClientRecord::new(now, timeout));
        client_record.lifetime.refresh(now);
        client_record.outstanding.insert(message.id);

        vec![forwarded]
    }

    fn route_to_client(&mut self, message: Message, identity: &[u8]) -> Vec<Message> {
        let Some((service_name, name)) = self.identities.get(identity).cloned() else {
            debug!(id = %message.id, "Reply from unregistered peer dropped");
            return Vec::new();
        };
        let Some(service) = self.services.get_mut(&service_name) else {
            return Vec::new();
        };
        let Some(record) = service.dispatchers.get_mut(&name) else {
            return Vec::new();
        };
        let Some(outstanding) = record.outstanding.remove(&message.id) else {
            debug!(id = %message.id, dispatcher = %name, "Unsolicited reply dropped");
            return Vec::new();
        };

        if !message.direction.is_error() && message.payload.is_data() {
            if let Some(keyword) = &message.keyword {
                service.keywords.insert(keyword.clone(), name.clone());
                if message.command == Command::Identify {
                    record
                        .keywords
                        .insert(keyword.clone(), message.payload_text());
                }
            }
        }

        let route = outstanding.message.route;
        if let Some(client) = route.first().and_then(|c| service.clients.get_mut(c)) {
            client.outstanding.remove(&message.id);
        }

        let mut reply = message.with_route(route);
        reply.dispatcher = Some(name);
        vec![reply]
    }

    // ========================================================================
    // Fan queries
    // ========================================================================

    fn open_fan(&mut self, message: Message, client: Identity, now: Instant) -> Vec<Message> {
        let Some(service_name) = message.service.clone() else {
            return vec![message.error("service name is required")];
        };
        let timeout = self.settings.timeout;
        let deadline = now + timeout * LIFETIME_FACTOR;

        let Some(service) = self.services.get_mut(&service_name) else {
            let fan = FanMessage::new(message, Vec::new(), deadline);
            return vec![fan.resolve(&service_name)];
        };

        if let Some(reply) = short_circuit(service, &message) {
            return vec![reply];
        }

        let targets: Vec<(String, Identity)> = service
            .ready_dispatchers()
            .map(|d| (d.name.clone(), d.identity.clone()))
            .collect();

        let fan = FanMessage::new(
            message.clone(),
            targets.iter().map(|(name, _)| name.clone()),
            deadline,
        );
        if targets.is_empty() {
            return vec![fan.resolve(&service_name)];
        }

        let outgoing = targets
            .into_iter()
            .map(|(name, identity)| {
                let mut query = message.clone().with_route(vec![identity]);
                query.direction = Direction::SDQ;
                query.dispatcher = Some(name);
                query
            })
            .collect();

        let client_record = service
            .clients
            .entry(client)
            .or_insert_with(|| ClientRecord::new(now, timeout));
        client_record.lifetime.refresh(now);
        client_record.outstanding.insert(message.id);
        service.fans.insert(message.id, fan);

        outgoing
    }

    fn record_fan_response(&mut self, message: Message, identity: &[u8]) {
        let Some((service_name, name)) = self.identities.get(identity).cloned() else {
            debug!(id = %message.id, "Fan response from unregistered peer dropped");
            return;
        };
        let fan = self
            .services
            .get_mut(&service_name)
            .and_then(|s| s.fans.get_mut(&message.id));
        match fan {
            Some(fan) => {
                fan.record(&name, message);
            }
            None => debug!(id = %message.id, dispatcher = %name, "Late fan response dropped"),
        }
    }

    fn dispatcher_mut(&mut self, identity: &[u8]) -> Option<&mut DispatcherRecord> {
        let (service, name) = self.identities.get(identity)?;
        self.services.get_mut(service)?.dispatchers.get_mut(name)
    }

    #[cfg(test)]
    fn service(&self, name: &str) -> Option<&ServiceRecord> {
        self.services.get(name)
    }
}

/// Answer an `identify` from the ownership and type caches.
fn short_circuit(service: &ServiceRecord, message: &Message) -> Option<Message> {
    if message.command != Command::Identify {
        return None;
    }
    let keyword = message.keyword.as_ref()?;
    let owner = service.keywords.get(keyword)?;
    let record = service.dispatchers.get(owner).filter(|d| d.ready)?;
    let type_tag = record.keywords.get(keyword)?;

    let mut reply = message.reply(type_tag.clone());
    reply.dispatcher = Some(owner.clone());
    Some(reply)
}

fn expire_dispatchers(
    service_name: &str,
    service: &mut ServiceRecord,
    now: Instant,
    forgotten: &mut Vec<Identity>,
) -> Vec<Message> {
    let expired: Vec<String> = service
        .dispatchers
        .values()
        .filter(|d| !d.lifetime.alive(now))
        .map(|d| d.name.clone())
        .collect();

    let mut replies = Vec::new();
    for name in expired {
        let Some(record) = service.dispatchers.remove(&name) else {
            continue;
        };
        warn!(
            service = %service_name,
            dispatcher = %name,
            outstanding = record.outstanding.len(),
            "Dispatcher expired"
        );

        for (id, outstanding) in record.outstanding {
            debug!(id = %id, age = ?now.duration_since(outstanding.sent), "Failing stranded request");
            if let Some(client) = outstanding
                .message
                .route
                .first()
                .and_then(|c| service.clients.get_mut(c))
            {
                client.outstanding.remove(&id);
            }
            replies.push(outstanding.message.error(TIMED_OUT));
        }

        forget_dispatcher(service, &name);
        forgotten.push(record.identity);
    }
    replies
}

/// Drop a departed dispatcher from pending fans and the ownership cache.
fn forget_dispatcher(service: &mut ServiceRecord, name: &str) {
    for fan in service.fans.values_mut() {
        fan.forget(name);
    }
    service.keywords.retain(|_, owner| owner != name);
}

fn resolve_fans(service_name: &str, service: &mut ServiceRecord, now: Instant) -> Vec<Message> {
    let complete: Vec<MessageId> = service
        .fans
        .iter()
        .filter(|(_, fan)| fan.is_complete(now))
        .map(|(id, _)| *id)
        .collect();

    let mut replies = Vec::new();
    for id in complete {
        let Some(fan) = service.fans.remove(&id) else {
            continue;
        };
        scrape(service, &fan);

        if let Some(client) = fan
            .request
            .route
            .first()
            .and_then(|c| service.clients.get_mut(c))
        {
            client.outstanding.remove(&id);
        }
        replies.push(fan.resolve(service_name));
    }
    replies
}

/// Learn keyword ownership (and types) from a completed fan.
fn scrape(service: &mut ServiceRecord, fan: &FanMessage) {
    if let (Command::Identify, Some(keyword)) = (fan.request.command, &fan.request.keyword) {
        if fan.valid_responses().nth(1).is_some() {
            // Claimed by more than one dispatcher: never answer it from the cache.
            service.keywords.remove(keyword);
            for (name, _) in fan.valid_responses() {
                if let Some(record) = service.dispatchers.get_mut(name) {
                    record.keywords.remove(keyword);
                }
            }
            return;
        }
    }

    for (name, response) in fan.valid_responses() {
        let text = response.payload_text();
        match (fan.request.command, &fan.request.keyword) {
            (Command::Identify, Some(keyword)) => {
                service.keywords.insert(keyword.clone(), name.to_string());
                if let Some(record) = service.dispatchers.get_mut(name) {
                    record.keywords.insert(keyword.clone(), text);
                }
            }
            (Command::Enumerate, _) => {
                for keyword in text.split(':').filter(|k| !k.is_empty()) {
                    service
                        .keywords
                        .insert(keyword.to_uppercase(), name.to_string());
                }
            }
            (_, Some(keyword)) => {
                service.keywords.insert(keyword.clone(), name.to_string());
            }
            _ => {}
        }
    }
}

/// `UBE/parser` reply for frames that failed to decode.
fn parse_error(identity: Option<Vec<u8>>, id: MessageId, error: &ProtocolError) -> Option<Message> {
    let Some(identity) = identity else {
        warn!(error = %error, "Unparseable message without identity dropped");
        return None;
    };
    warn!(error = %error, "Unparseable message");

    let mut reply = Message::new(Direction::UBE, Command::Parser)
        .with_payload(Payload::text(error.to_string()))
        .with_route(vec![identity]);
    reply.id = id;
    Some(reply)
}
