//! mktl - keyword/value messaging fabric for instrument control.
//!
//! A *service* is a named set of typed *keywords*. *Dispatchers* own
//! keywords and answer requests for them; *clients* read, write, and
//! monitor them; a single *broker* routes requests and relays broadcasts.
//!
//! ```text
//! client  --request-->  broker  --request-->  dispatcher worker
//! client  <--reply---   broker  <--reply----  dispatcher worker
//! dispatcher --publish--> broker(SUB->PUB) --> subscribing clients
//! ```

pub mod backend;
pub mod broker;
pub mod catalog;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod keyword;
pub mod logging;
pub mod protocol;
pub mod transport;

pub use error::{Error, Result};
