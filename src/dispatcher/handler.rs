//! Request handlers run by workers.
//!
//! Every request produces exactly one reply; failures become error replies
//! carrying the error text.

use tracing::debug;

use crate::protocol::{
    salvage_id, timestamp, Command, Direction, Message, Payload, ProtocolError,
};

use super::ServiceShared;

/// Answer one request.
pub(crate) fn handle(service: &ServiceShared, request: &Message) -> Message {
    debug!(
        command = %request.command,
        keyword = request.keyword.as_deref().unwrap_or("-"),
        id = %request.id,
        "Handling request"
    );

    match request.command {
        Command::Modify => with_keyword(service, request, |keyword| {
            let value = request.payload.as_text().unwrap_or_default();
            keyword
                .modify(&value)
                .map(|stored| request.reply(stored))
                .unwrap_or_else(|e| request.error(e.to_string()))
        }),
        Command::Update => with_keyword(service, request, |keyword| match keyword.update() {
            Ok(Some(value)) => request.reply(value),
            Ok(None) => request.reply(Payload::Blank),
            Err(e) => request.error(e.to_string()),
        }),
        Command::Identify => {
            let tag = request
                .keyword
                .as_deref()
                .and_then(|name| service.keyword(name))
                .map(|keyword| keyword.keyword_type().tag());
            match tag {
                Some(tag) => request.reply(tag),
                None => request.reply(Payload::Blank),
            }
        }
        Command::Enumerate => request.reply(service.keyword_names().join(":")),
        Command::Units => with_keyword(service, request, |keyword| {
            match serde_json::to_string(&keyword.units()) {
                Ok(json) => request.reply(json),
                Err(e) => request.error(e.to_string()),
            }
        }),
        Command::Broadcast => with_keyword(service, request, |keyword| {
            keyword.broadcast(request.payload.clone());
            request.reply(request.payload.clone())
        }),
        Command::Heartbeat => request.reply(timestamp()),
        other => request.error(format!("unsupported command '{other}'")),
    }
}

fn with_keyword<F>(service: &ServiceShared, request: &Message, f: F) -> Message
where
    F: FnOnce(&super::Keyword) -> Message,
{
    let Some(name) = request.keyword.as_deref() else {
        return request.error("keyword is required");
    };
    match service.keyword(name) {
        Some(keyword) => f(&keyword),
        None => request.error(format!(
            "keyword {name} not found in service '{}'",
            service.name
        )),
    }
}

/// Error reply for frames that failed to decode.
pub(crate) fn parser_error(frames: &[Vec<u8>], error: &ProtocolError) -> Message {
    // Answer in the error form of the sender's direction when it is legible.
    let direction = frames
        .len()
        .checked_sub(4)
        .and_then(|i| std::str::from_utf8(&frames[i]).ok())
        .and_then(|code| code.parse::<Direction>().ok())
        .map(Direction::error)
        .unwrap_or(Direction::DBE);

    let mut reply = Message::new(direction, Command::Parser).with_payload(error.to_string());
    reply.id = salvage_id(frames);
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{KeywordOptions, MemoryHooks};
    use crate::keyword::{Enumerators, KeywordType};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn service() -> (Arc<ServiceShared>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ServiceShared::new("testsvc", "disp", tx));
        shared.insert_keyword(
            "MYBOOLEAN",
            KeywordType::Boolean,
            KeywordOptions::default(),
            Arc::new(MemoryHooks),
        );
        shared.insert_keyword(
            "CENTROID",
            KeywordType::Enumerated(
                Enumerators::new([
                    (0, "COG".to_string()),
                    (1, "QUAD".to_string()),
                    (2, "BINQUAD".to_string()),
                ])
                .unwrap(),
            ),
            KeywordOptions::default(),
            Arc::new(MemoryHooks),
        );
        shared.insert_keyword(
            "TEMP",
            KeywordType::Double,
            KeywordOptions {
                units: Some("degC".to_string()),
                ..Default::default()
            },
            Arc::new(MemoryHooks),
        );
        (shared, rx)
    }

    fn request(command: Command, keyword: &str, payload: Payload) -> Message {
        Message::new(Direction::CDQ, command)
            .with_service("testsvc")
            .with_dispatcher("disp")
            .with_keyword(keyword)
            .with_payload(payload)
    }

    #[test]
    fn test_modify_then_update() {
        let (service, mut broadcasts) = service();

        let reply = handle(&service, &request(Command::Modify, "mYbOoLeAn", "yes".into()));
        assert_eq!(reply.direction, Direction::CDP);
        assert_eq!(reply.payload_text(), "1");
        assert_eq!(broadcasts.try_recv().unwrap().payload_text(), "1");

        let reply = handle(&service, &request(Command::Update, "MYBOOLEAN", Payload::Blank));
        assert_eq!(reply.payload_text(), "1");
    }

    #[test]
    fn test_update_unset_is_blank() {
        let (service, _rx) = service();
        let reply = handle(&service, &request(Command::Update, "TEMP", Payload::Blank));
        assert_eq!(reply.direction, Direction::CDP);
        assert_eq!(reply.payload, Payload::Blank);
    }

    #[test]
    fn test_invalid_value_is_error_reply() {
        let (service, _rx) = service();
        let reply = handle(&service, &request(Command::Modify, "CENTROID", "FOUR".into()));
        assert_eq!(reply.direction, Direction::CDE);
        assert!(reply.payload_text().contains("FOUR"));
    }

    #[test]
    fn test_identify_and_enumerate() {
        let (service, _rx) = service();

        let mut fan = request(Command::Identify, "CENTROID", Payload::Blank);
        fan.direction = Direction::SDQ;
        let reply = handle(&service, &fan);
        assert_eq!(reply.direction.code(), "SDP");
        assert_eq!(reply.payload_text(), "enumerated(0=COG,1=QUAD,2=BINQUAD)");

        let reply = handle(&service, &request(Command::Identify, "NOPE", Payload::Blank));
        assert_eq!(reply.payload, Payload::Blank);

        let reply = handle(&service, &request(Command::Enumerate, "", Payload::Blank));
        assert_eq!(reply.payload_text(), "CENTROID:MYBOOLEAN:TEMP");
    }

    #[test]
    fn test_units() {
        let (service, _rx) = service();
        let reply = handle(&service, &request(Command::Units, "TEMP", Payload::Blank));
        assert_eq!(reply.payload_text(), "\"degC\"");

        let reply = handle(&service, &request(Command::Units, "MYBOOLEAN", Payload::Blank));
        assert_eq!(reply.payload_text(), "null");
    }

    #[test]
    fn test_broadcast_publishes() {
        let (service, mut broadcasts) = service();
        let reply = handle(&service, &request(Command::Broadcast, "TEMP", "12.5".into()));
        assert_eq!(reply.direction, Direction::CDP);

        let message = broadcasts.try_recv().unwrap();
        assert_eq!(message.direction, Direction::CDB);
        assert_eq!(message.keyword.as_deref(), Some("TEMP"));
        assert_eq!(message.payload_text(), "12.5");
    }

    #[test]
    fn test_heartbeat_and_unknown_keyword() {
        let (service, _rx) = service();
        let mut beacon = Message::new(Direction::BDQ, Command::Heartbeat).with_service("testsvc");
        beacon.dispatcher = Some("disp".to_string());
        let reply = handle(&service, &beacon);
        assert_eq!(reply.direction.code(), "BDP");
        assert!(reply.payload_text().parse::<f64>().is_ok());

        let reply = handle(&service, &request(Command::Update, "MISSING", Payload::Blank));
        assert_eq!(reply.direction, Direction::CDE);
        assert!(reply.payload_text().contains("MISSING"));
    }

    #[test]
    fn test_parser_error_reply() {
        let message = request(Command::Update, "TEMP", Payload::Blank);
        let mut frames = message.to_frames();
        frames[4] = b"bogus".to_vec();
        let error = Message::from_frames(frames.clone()).unwrap_err();

        let reply = parser_error(&frames, &error);
        assert_eq!(reply.direction, Direction::CDE);
        assert_eq!(reply.command, Command::Parser);
        assert_eq!(reply.id, message.id);
    }
}
