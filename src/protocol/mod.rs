//! Wire protocol.
//!
//! Every message is a ZeroMQ multipart with zero or more routing-identity
//! frames followed by exactly seven fields:
//!
//! ```text
//! [identity...] service | dispatcher | keyword | direction | command | payload | identifier
//! ```
//!
//! The first five fields are UTF-8 text or the one-byte `BLANK` sentinel.
//! The payload may additionally be the `FAIL` sentinel. The identifier is a
//! 16-byte correlation id copied onto every reply.

mod direction;

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

pub use direction::{Direction, Kind, Role};

/// Sentinel for an empty field.
pub const BLANK: u8 = 0x01;
/// Sentinel for a failed payload.
pub const FAIL: u8 = 0x02;
/// Number of fields after the routing prefix.
pub const FIELD_COUNT: usize = 7;
/// Size of a message identifier in bytes.
pub const ID_LEN: usize = 16;

/// Errors raised while decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("expected at least 7 frames, got {0}")]
    FrameCount(usize),

    #[error("invalid direction code '{0}'")]
    Direction(String),

    #[error("unknown command '{0}'")]
    Command(String),

    #[error("{0} field is not valid UTF-8")]
    Encoding(&'static str),

    #[error("identifier must be 16 bytes, got {0}")]
    Identifier(usize),
}

// ============================================================================
// Commands
// ============================================================================

/// Request verbs understood by brokers and dispatchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Modify,
    Update,
    Identify,
    Enumerate,
    Units,
    Broadcast,
    Heartbeat,
    Welcome,
    Ready,
    Lookup,
    Locate,
    Check,
    /// Only used on error replies for input that could not be parsed.
    Parser,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Modify => "modify",
            Command::Update => "update",
            Command::Identify => "identify",
            Command::Enumerate => "enumerate",
            Command::Units => "units",
            Command::Broadcast => "broadcast",
            Command::Heartbeat => "heartbeat",
            Command::Welcome => "welcome",
            Command::Ready => "ready",
            Command::Lookup => "lookup",
            Command::Locate => "locate",
            Command::Check => "check",
            Command::Parser => "parser",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "modify" => Command::Modify,
            "update" => Command::Update,
            "identify" => Command::Identify,
            "enumerate" => Command::Enumerate,
            "units" => Command::Units,
            "broadcast" => Command::Broadcast,
            "heartbeat" => Command::Heartbeat,
            "welcome" => Command::Welcome,
            "ready" => Command::Ready,
            "lookup" => Command::Lookup,
            "locate" => Command::Locate,
            "check" => Command::Check,
            "parser" => Command::Parser,
            other => return Err(ProtocolError::Command(other.to_string())),
        })
    }
}

// ============================================================================
// Payload and identifier
// ============================================================================

/// Message payload with its two in-band sentinels.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Payload {
    #[default]
    Blank,
    Fail,
    Data(Vec<u8>),
}

impl Payload {
    pub fn text(value: impl Into<String>) -> Self {
        Payload::Data(value.into().into_bytes())
    }

    /// Payload as text, `None` for the sentinels.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Payload::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    /// True for a real (non-sentinel) payload.
    pub fn is_data(&self) -> bool {
        matches!(self, Payload::Data(_))
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            Payload::Blank => vec![BLANK],
            Payload::Fail => vec![FAIL],
            Payload::Data(bytes) => bytes.clone(),
        }
    }

    fn decode(frame: Vec<u8>) -> Self {
        match frame.as_slice() {
            [BLANK] => Payload::Blank,
            [FAIL] => Payload::Fail,
            _ => Payload::Data(frame),
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::text(value)
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Data(value.into_bytes())
    }
}

/// 16-byte correlation identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId([u8; ID_LEN]);

impl MessageId {
    /// Fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let array: [u8; ID_LEN] = bytes
            .try_into()
            .map_err(|_| ProtocolError::Identifier(bytes.len()))?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self([0; ID_LEN])
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(self.0))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// ============================================================================
// Message
// ============================================================================

/// Canonical form of a service name.
pub fn canonical_service(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Canonical form of a keyword name.
pub fn canonical_keyword(name: &str) -> String {
    name.trim().to_uppercase()
}

/// Current wall-clock time as seconds since the epoch, three decimals.
pub fn timestamp() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    format!("{:.3}", millis as f64 / 1000.0)
}

/// A decoded message.
///
/// Messages are treated as values: replies are derived by copying the
/// request and swapping direction and payload, never by mutating in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Routing-identity frames prepended by ROUTER sockets.
    pub route: Vec<Vec<u8>>,
    pub service: Option<String>,
    pub dispatcher: Option<String>,
    pub keyword: Option<String>,
    pub direction: Direction,
    pub command: Command,
    pub payload: Payload,
    pub id: MessageId,
}

impl Message {
    /// A new message with a fresh identifier and blank fields.
    pub fn new(direction: Direction, command: Command) -> Self {
        Self {
            route: Vec::new(),
            service: None,
            dispatcher: None,
            keyword: None,
            direction,
            command,
            payload: Payload::Blank,
            id: MessageId::generate(),
        }
    }

    pub fn with_service(mut self, service: &str) -> Self {
        self.service = Some(canonical_service(service));
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: impl Into<String>) -> Self {
        self.dispatcher = Some(dispatcher.into());
        self
    }

    pub fn with_keyword(mut self, keyword: &str) -> Self {
        self.keyword = Some(canonical_keyword(keyword));
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_route(mut self, route: Vec<Vec<u8>>) -> Self {
        self.route = route;
        self
    }

    /// Success reply carrying `payload`.
    pub fn reply(&self, payload: impl Into<Payload>) -> Self {
        Self {
            direction: self.direction.reply(),
            payload: payload.into(),
            ..self.clone()
        }
    }

    /// Error reply whose payload is `reason`.
    pub fn error(&self, reason: impl Into<String>) -> Self {
        Self {
            direction: self.direction.error(),
            payload: Payload::text(reason),
            ..self.clone()
        }
    }

    /// Payload text, empty for the sentinels.
    pub fn payload_text(&self) -> String {
        self.payload.as_text().unwrap_or_default()
    }

    /// Encode to frames, routing prefix included.
    pub fn to_frames(&self) -> Vec<Vec<u8>> {
        let mut frames = Vec::with_capacity(self.route.len() + FIELD_COUNT);
        frames.extend(self.route.iter().cloned());
        frames.push(encode_field(self.service.as_deref()));
        frames.push(encode_field(self.dispatcher.as_deref()));
        frames.push(encode_field(self.keyword.as_deref()));
        frames.push(self.direction.code().into_bytes());
        frames.push(self.command.as_str().as_bytes().to_vec());
        frames.push(self.payload.encode());
        frames.push(self.id.as_bytes().to_vec());
        frames
    }

    /// Decode frames; everything before the last seven is routing prefix.
    pub fn from_frames(mut frames: Vec<Vec<u8>>) -> Result<Self, ProtocolError> {
        if frames.len() < FIELD_COUNT {
            return Err(ProtocolError::FrameCount(frames.len()));
        }

        let fields = frames.split_off(frames.len() - FIELD_COUNT);
        let mut fields = fields.into_iter();
        let mut next = || fields.next().unwrap_or_default();

        let service = decode_field(next(), "service")?.map(|s| canonical_service(&s));
        let dispatcher = decode_field(next(), "dispatcher")?;
        let keyword = decode_field(next(), "keyword")?.map(|k| canonical_keyword(&k));
        let direction: Direction = text(next(), "direction")?.parse()?;
        let command: Command = text(next(), "command")?.parse()?;
        let payload = Payload::decode(next());
        let id = MessageId::from_bytes(&next())?;

        Ok(Self {
            route: frames,
            service,
            dispatcher,
            keyword,
            direction,
            command,
            payload,
            id,
        })
    }
}

fn encode_field(value: Option<&str>) -> Vec<u8> {
    match value {
        Some(text) if !text.is_empty() => text.as_bytes().to_vec(),
        _ => vec![BLANK],
    }
}

fn decode_field(frame: Vec<u8>, name: &'static str) -> Result<Option<String>, ProtocolError> {
    if frame.is_empty() || frame == [BLANK] {
        return Ok(None);
    }
    text(frame, name).map(Some)
}

fn text(frame: Vec<u8>, name: &'static str) -> Result<String, ProtocolError> {
    String::from_utf8(frame).map_err(|_| ProtocolError::Encoding(name))
}

/// Best-effort identifier recovery from frames that failed to parse, so the
/// sender can still correlate the error reply.
pub fn salvage_id(frames: &[Vec<u8>]) -> MessageId {
    frames
        .last()
        .and_then(|frame| MessageId::from_bytes(frame).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message::new(Direction::CDQ, Command::Modify)
            .with_service("TestSvc")
            .with_dispatcher("disp1")
            .with_keyword("myBoolean")
            .with_payload("yes")
    }

    #[test]
    fn test_frames_round_trip_with_route() {
        let msg = sample().with_route(vec![b"ident".to_vec()]);
        let frames = msg.to_frames();
        assert_eq!(frames.len(), 1 + FIELD_COUNT);

        let decoded = Message::from_frames(frames).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.route, vec![b"ident".to_vec()]);
    }

    #[test]
    fn test_names_are_canonicalized() {
        let msg = sample();
        assert_eq!(msg.service.as_deref(), Some("testsvc"));
        assert_eq!(msg.keyword.as_deref(), Some("MYBOOLEAN"));
        // Dispatcher names are case-sensitive.
        assert_eq!(msg.dispatcher.as_deref(), Some("disp1"));
    }

    #[test]
    fn test_blank_fields_encode_as_sentinel() {
        let msg = Message::new(Direction::UBQ, Command::Check);
        let frames = msg.to_frames();
        assert_eq!(frames[0], vec![BLANK]);
        assert_eq!(frames[1], vec![BLANK]);
        assert_eq!(frames[2], vec![BLANK]);
        assert_eq!(frames[5], vec![BLANK]);

        let decoded = Message::from_frames(frames).unwrap();
        assert!(decoded.service.is_none());
        assert_eq!(decoded.payload, Payload::Blank);
    }

    #[test]
    fn test_fail_payload_is_distinct() {
        let msg = sample().with_payload(Payload::Fail);
        let decoded = Message::from_frames(msg.to_frames()).unwrap();
        assert_eq!(decoded.payload, Payload::Fail);
        assert_eq!(decoded.payload.as_text(), None);
    }

    #[test]
    fn test_reply_preserves_identifier() {
        let msg = sample();
        let reply = msg.reply("1");
        assert_eq!(reply.id, msg.id);
        assert_eq!(reply.direction, Direction::CDP);
        assert_eq!(reply.payload_text(), "1");

        let error = msg.error("bad value");
        assert_eq!(error.id, msg.id);
        assert_eq!(error.direction, Direction::CDE);
        assert_eq!(error.command, Command::Modify);
    }

    #[test]
    fn test_short_message_rejected() {
        let frames = vec![b"a".to_vec(); 6];
        assert_eq!(
            Message::from_frames(frames),
            Err(ProtocolError::FrameCount(6))
        );
    }

    #[test]
    fn test_bad_direction_rejected() {
        let mut frames = sample().to_frames();
        frames[3] = b"XXQ".to_vec();
        assert!(matches!(
            Message::from_frames(frames),
            Err(ProtocolError::Direction(_))
        ));
    }

    #[test]
    fn test_bad_identifier_rejected() {
        let mut frames = sample().to_frames();
        frames[6] = vec![0; 4];
        assert_eq!(
            Message::from_frames(frames),
            Err(ProtocolError::Identifier(4))
        );
    }

    #[test]
    fn test_timestamp_format() {
        let stamp = timestamp();
        let (_, fraction) = stamp.split_once('.').unwrap();
        assert_eq!(fraction.len(), 3);
        assert!(stamp.parse::<f64>().unwrap() > 1.0e9);
    }

    #[test]
    fn test_salvage_id() {
        let msg = sample();
        let mut frames = msg.to_frames();
        frames[3] = b"???".to_vec();
        assert_eq!(salvage_id(&frames), msg.id);
        assert_eq!(salvage_id(&[b"x".to_vec()]), MessageId::default());
    }
}
