//! End-to-end tests: broker, dispatcher, and client over ipc sockets.

mod common;

#[path = "fabric/keywords_test.rs"]
mod keywords_test;

#[path = "fabric/monitor_test.rs"]
mod monitor_test;

#[path = "fabric/failure_test.rs"]
mod failure_test;
