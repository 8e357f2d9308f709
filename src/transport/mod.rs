//! ZeroMQ transport plumbing.
//!
//! Socket construction and `Message` ↔ `Multipart` conversion. Every socket
//! is created with zero linger so that dropping a socket with unsent frames
//! (for example a request to a broker that never came up) cannot block
//! context teardown.

use std::collections::VecDeque;

use tmq::{Context, Multipart};

pub use tmq::dealer::Dealer;
pub use tmq::publish::Publish;
pub use tmq::router::Router;
pub use tmq::subscribe::Subscribe;

use crate::protocol::{Message, ProtocolError};

/// Socket send high-water mark.
const SEND_HWM: i32 = 10_000;

// ============================================================================
// Framing
// ============================================================================

/// Encode a message, routing prefix included.
pub fn encode(message: &Message) -> Multipart {
    let frames: VecDeque<tmq::Message> = message
        .to_frames()
        .into_iter()
        .map(tmq::Message::from)
        .collect();
    Multipart(frames)
}

/// Raw frames of a received multipart.
pub fn frames(multipart: &Multipart) -> Vec<Vec<u8>> {
    multipart.iter().map(|frame| frame.to_vec()).collect()
}

pub fn decode(multipart: &Multipart) -> Result<Message, ProtocolError> {
    Message::from_frames(frames(multipart))
}

// ============================================================================
// Sockets
// ============================================================================

pub fn connect_dealer(context: &Context, endpoint: &str) -> tmq::Result<Dealer> {
    tmq::dealer(context)
        .set_linger(0)
        .set_sndhwm(SEND_HWM)
        .connect(endpoint)
}

pub fn bind_router(context: &Context, endpoint: &str) -> tmq::Result<Router> {
    tmq::router(context)
        .set_linger(0)
        .set_sndhwm(SEND_HWM)
        .bind(endpoint)
}

pub fn bind_publisher(context: &Context, endpoint: &str) -> tmq::Result<Publish> {
    tmq::publish(context)
        .set_linger(0)
        .set_sndhwm(SEND_HWM)
        .bind(endpoint)
}

pub fn connect_publisher(context: &Context, endpoint: &str) -> tmq::Result<Publish> {
    tmq::publish(context)
        .set_linger(0)
        .set_sndhwm(SEND_HWM)
        .connect(endpoint)
}

/// SUB bound at `endpoint`, accepting every topic.
pub fn bind_relay(context: &Context, endpoint: &str) -> tmq::Result<Subscribe> {
    tmq::subscribe(context)
        .set_linger(0)
        .bind(endpoint)?
        .subscribe(b"")
}

/// SUB connected to `endpoint`, filtered on `topic`.
pub fn connect_subscriber(
    context: &Context,
    endpoint: &str,
    topic: &[u8],
) -> tmq::Result<Subscribe> {
    tmq::subscribe(context)
        .set_linger(0)
        .connect(endpoint)?
        .subscribe(topic)
}

// ============================================================================
// Endpoints
// ============================================================================

/// Replace a wildcard host (`*` or `0.0.0.0`) in `endpoint` with the host of
/// `reference`, so a bound endpoint reported by the broker can be connected.
pub fn resolve_endpoint(endpoint: &str, reference: &str) -> String {
    let Some((scheme, rest)) = endpoint.split_once("://") else {
        return endpoint.to_string();
    };
    let Some((host, port)) = rest.rsplit_once(':') else {
        return endpoint.to_string();
    };
    if host != "*" && host != "0.0.0.0" {
        return endpoint.to_string();
    }

    let reference_host = reference
        .split_once("://")
        .and_then(|(_, rest)| rest.rsplit_once(':'))
        .map(|(host, _)| host)
        .filter(|host| *host != "*" && *host != "0.0.0.0")
        .unwrap_or("127.0.0.1");

    format!("{scheme}://{reference_host}:{port}")
}
