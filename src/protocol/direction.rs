//! Three-letter direction codes.
//!
//! A direction encodes who originated an exchange, who answers it, and what
//! kind of frame this is: `CDQ` is a client query answered by a dispatcher,
//! `CDP` its reply, `CDE` its error form.

use std::fmt;
use std::str::FromStr;

use super::ProtocolError;

/// Participant in an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Dispatcher,
    /// Every dispatcher of a service at once (fan queries).
    Service,
    Broker,
    Unidentified,
}

impl Role {
    fn code(self) -> char {
        match self {
            Role::Client => 'C',
            Role::Dispatcher => 'D',
            Role::Service => 'S',
            Role::Broker => 'B',
            Role::Unidentified => 'U',
        }
    }
}

/// Frame kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Query,
    Reply,
    Error,
    Broadcast,
}

impl Kind {
    fn code(self) -> char {
        match self {
            Kind::Query => 'Q',
            Kind::Reply => 'P',
            Kind::Error => 'E',
            Kind::Broadcast => 'B',
        }
    }
}

/// A validated direction code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Direction {
    pub origin: Role,
    pub responder: Role,
    pub kind: Kind,
}

/// Every code the fabric accepts on the wire.
const LEGAL: &[&str] = &[
    "UBQ", "UBP", "UBE", //
    "DBQ", "DBP", "DBE", //
    "BDQ", "BDP", "BDE", //
    "CBQ", "CBP", "CBE", //
    "CDQ", "CDP", "CDE", //
    "CSQ", "CSP", "CSE", //
    "SDQ", "SDP", "SDE", //
    "CDB",
];

impl Direction {
    pub const UBQ: Direction = Direction::new(Role::Unidentified, Role::Broker, Kind::Query);
    pub const UBE: Direction = Direction::new(Role::Unidentified, Role::Broker, Kind::Error);
    pub const DBQ: Direction = Direction::new(Role::Dispatcher, Role::Broker, Kind::Query);
    pub const DBE: Direction = Direction::new(Role::Dispatcher, Role::Broker, Kind::Error);
    pub const BDQ: Direction = Direction::new(Role::Broker, Role::Dispatcher, Kind::Query);
    pub const CBQ: Direction = Direction::new(Role::Client, Role::Broker, Kind::Query);
    pub const CDQ: Direction = Direction::new(Role::Client, Role::Dispatcher, Kind::Query);
    pub const CDP: Direction = Direction::new(Role::Client, Role::Dispatcher, Kind::Reply);
    pub const CDE: Direction = Direction::new(Role::Client, Role::Dispatcher, Kind::Error);
    pub const CDB: Direction = Direction::new(Role::Client, Role::Dispatcher, Kind::Broadcast);
    pub const CSQ: Direction = Direction::new(Role::Client, Role::Service, Kind::Query);
    pub const CSP: Direction = Direction::new(Role::Client, Role::Service, Kind::Reply);
    pub const CSE: Direction = Direction::new(Role::Client, Role::Service, Kind::Error);
    pub const SDQ: Direction = Direction::new(Role::Service, Role::Dispatcher, Kind::Query);

    pub const fn new(origin: Role, responder: Role, kind: Kind) -> Self {
        Self {
            origin,
            responder,
            kind,
        }
    }

    /// The reply form of this direction (same origin and responder).
    pub fn reply(self) -> Self {
        Self {
            kind: Kind::Reply,
            ..self
        }
    }

    /// The error form of this direction.
    pub fn error(self) -> Self {
        Self {
            kind: Kind::Error,
            ..self
        }
    }

    pub fn is_query(self) -> bool {
        self.kind == Kind::Query
    }

    pub fn is_error(self) -> bool {
        self.kind == Kind::Error
    }

    pub fn code(self) -> String {
        [self.origin.code(), self.responder.code(), self.kind.code()]
            .iter()
            .collect()
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

impl FromStr for Direction {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !LEGAL.contains(&s) {
            return Err(ProtocolError::Direction(s.to_string()));
        }

        let role = |c: u8| match c {
            b'C' => Role::Client,
            b'D' => Role::Dispatcher,
            b'S' => Role::Service,
            b'B' => Role::Broker,
            _ => Role::Unidentified,
        };
        let kind = match s.as_bytes()[2] {
            b'Q' => Kind::Query,
            b'P' => Kind::Reply,
            b'E' => Kind::Error,
            _ => Kind::Broadcast,
        };

        let bytes = s.as_bytes();
        Ok(Self::new(role(bytes[0]), role(bytes[1]), kind))
    }
}
