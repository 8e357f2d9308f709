//! Service-wide fan queries.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use crate::protocol::{Message, Payload};

/// A client query sent to every dispatcher of a service.
#[derive(Debug, Clone)]
pub struct FanMessage {
    /// The original request, carrying the client's route.
    pub request: Message,
    pub pending: HashSet<String>,
    pub responses: BTreeMap<String, Message>,
    pub deadline: Instant,
    expected: usize,
}

impl FanMessage {
    pub fn new(
        request: Message,
        dispatchers: impl IntoIterator<Item = String>,
        deadline: Instant,
    ) -> Self {
        let pending: HashSet<String> = dispatchers.into_iter().collect();
        Self {
            request,
            expected: pending.len(),
            pending,
            responses: BTreeMap::new(),
            deadline,
        }
    }

    /// Record a dispatcher's answer. Unexpected answers are ignored.
    pub fn record(&mut self, dispatcher: &str, response: Message) -> bool {
        if !self.pending.remove(dispatcher) {
            return false;
        }
        self.responses.insert(dispatcher.to_string(), response);
        true
    }

    /// Stop waiting on a dispatcher that went away.
    pub fn forget(&mut self, dispatcher: &str) {
        self.pending.remove(dispatcher);
    }

    pub fn is_complete(&self, now: Instant) -> bool {
        self.pending.is_empty() || now >= self.deadline
    }

    /// Successful answers with a real payload, in dispatcher-name order.
    pub fn valid_responses(&self) -> impl Iterator<Item = (&str, &Message)> {
        self.responses
            .iter()
            .filter(|(_, m)| !m.direction.is_error() && m.payload.is_data())
            .map(|(name, m)| (name.as_str(), m))
    }

    /// Consolidated reply for the client.
    pub fn resolve(&self, service: &str) -> Message {
        if self.expected == 0 {
            return self
                .request
                .error(format!("no dispatchers available for service '{service}'"));
        }

        let valid: Vec<(&str, &Message)> = self.valid_responses().collect();
        match valid.as_slice() {
            [(name, response)] => {
                let mut reply = self.request.reply(response.payload.clone());
                reply.dispatcher = Some((*name).to_string());
                reply
            }
            [] => {
                if let Some(error) = self.responses.values().find(|m| m.direction.is_error()) {
                    return self.request.error(error.payload_text());
                }
                if self.responses.is_empty() {
                    return self.request.error("no response from service");
                }
                self.request.reply(Payload::Blank)
            }
            many => {
                let mut joined = Vec::new();
                for (i, (_, response)) in many.iter().enumerate() {
                    if i > 0 {
                        joined.push(b':');
                    }
                    if let Payload::Data(bytes) = &response.payload {
                        joined.extend_from_slice(bytes);
                    }
                }
                self.request.reply(Payload::Data(joined))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, Direction};
    use std::time::Duration;

    fn fan(dispatchers: &[&str]) -> FanMessage {
        let request = Message::new(Direction::CSQ, Command::Identify)
            .with_service("svc")
            .with_keyword("kw")
            .with_route(vec![b"client".to_vec()]);
        FanMessage::new(
            request,
            dispatchers.iter().map(|d| d.to_string()),
            Instant::now() + Duration::from_secs(4),
        )
    }

    fn answer(fan: &FanMessage, payload: Payload) -> Message {
        let mut m = fan.request.clone();
        m.direction = Direction::SDQ.reply();
        m.payload = payload;
        m
    }

    fn error(fan: &FanMessage, text: &str) -> Message {
        let mut m = fan.request.clone();
        m.direction = Direction::SDQ.error();
        m.payload = Payload::text(text);
        m
    }

    #[test]
    fn test_zero_dispatchers_is_error_naming_service() {
        let fan = fan(&[]);
        assert!(fan.is_complete(Instant::now()));

        let reply = fan.resolve("svc");
        assert_eq!(reply.direction, Direction::CSE);
        assert!(reply.payload_text().contains("svc"));
        assert_eq!(reply.id, fan.request.id);
        assert_eq!(reply.route, vec![b"client".to_vec()]);
    }

    #[test]
    fn test_single_answer_annotated() {
        let mut fan = fan(&["a", "b"]);
        let ok = answer(&fan, Payload::text("boolean"));
        let blank = answer(&fan, Payload::Blank);
        fan.record("a", ok);
        assert!(!fan.is_complete(Instant::now()));
        fan.record("b", blank);
        assert!(fan.is_complete(Instant::now()));

        let reply = fan.resolve("svc");
        assert_eq!(reply.direction, Direction::CSP);
        assert_eq!(reply.payload_text(), "boolean");
        assert_eq!(reply.dispatcher.as_deref(), Some("a"));
    }

    #[test]
    fn test_success_wins_over_error() {
        let mut fan = fan(&["a", "b"]);
        let bad = error(&fan, "boom");
        let ok = answer(&fan, Payload::text("integer"));
        fan.record("a", bad);
        fan.record("b", ok);

        let reply = fan.resolve("svc");
        assert_eq!(reply.direction, Direction::CSP);
        assert_eq!(reply.payload_text(), "integer");
    }

    #[test]
    fn test_multiple_answers_joined() {
        let mut fan = fan(&["b", "a"]);
        let first = answer(&fan, Payload::text("X:Y"));
        let second = answer(&fan, Payload::text("Z"));
        fan.record("b", first);
        fan.record("a", second);

        let reply = fan.resolve("svc");
        assert_eq!(reply.payload_text(), "Z:X:Y");
        assert!(reply.dispatcher.is_none());
    }

    #[test]
    fn test_all_blank_and_only_errors() {
        let mut blank = fan(&["a"]);
        let response = answer(&blank, Payload::Blank);
        blank.record("a", response);
        let reply = blank.resolve("svc");
        assert_eq!(reply.direction, Direction::CSP);
        assert_eq!(reply.payload, Payload::Blank);

        let mut failed = fan(&["a"]);
        let response = error(&failed, "nope");
        failed.record("a", response);
        let reply = failed.resolve("svc");
        assert_eq!(reply.direction, Direction::CSE);
        assert_eq!(reply.payload_text(), "nope");
    }

    #[test]
    fn test_deadline_without_answers() {
        let fan = fan(&["a"]);
        assert!(fan.is_complete(fan.deadline));
        let reply = fan.resolve("svc");
        assert_eq!(reply.payload_text(), "no response from service");
    }

    #[test]
    fn test_unexpected_answer_ignored() {
        let mut fan = fan(&["a"]);
        let response = answer(&fan, Payload::text("x"));
        assert!(!fan.record("zzz", response));
        assert!(fan.responses.is_empty());
    }
}
