//! Broker absence and dispatcher expiry.

use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tmq::Context;

use mktl::client::ClientService;
use mktl::dispatcher::KeywordOptions;
use mktl::keyword::KeywordType;
use mktl::protocol::{timestamp, Command, Direction, Message};
use mktl::transport::{self, Dealer};
use mktl::Error;

use crate::common::{ipc_config, Fabric, SERVICE};

#[tokio::test]
async fn test_client_without_broker() {
    let (_dir, mut config) = ipc_config();
    config.core.timeout = 0.5;
    config.zmq.error_on_join_timeout = true;

    let started = Instant::now();
    let err = ClientService::connect(SERVICE, &config).await.unwrap_err();
    assert!(started.elapsed() < config.request_timeout() + config.join_timeout());

    match &err {
        Error::Locate { service, .. } => assert_eq!(service, SERVICE),
        other => panic!("expected locate error, got {other:?}"),
    }
    assert!(err.to_string().contains(SERVICE));
}

#[tokio::test]
async fn test_shutdown_within_join_timeout() {
    let fabric = Fabric::start_with(|config| config.zmq.error_on_join_timeout = true).await;
    let mut dispatcher = fabric
        .dispatcher("d1", |service| {
            service.add_keyword_with("MODE", KeywordType::String, KeywordOptions::default(), None);
            Ok(())
        })
        .await;
    let mut client = fabric.client().await;

    let keyword = client.keyword("MODE").await.unwrap();
    assert_eq!(keyword.write("on", None).await.unwrap(), "on");
    keyword.monitor(true, true, None).await.unwrap();

    let limit = fabric.config.join_timeout();
    let started = Instant::now();
    client.shutdown().await.unwrap();
    assert!(started.elapsed() < limit);

    let started = Instant::now();
    dispatcher.shutdown().await.unwrap();
    assert!(started.elapsed() < limit);

    fabric.stop().await;
}

async fn receive(socket: &mut Dealer) -> Message {
    let multipart = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("Timed out waiting for broker")
        .expect("Socket closed")
        .expect("Receive failed");
    transport::decode(&multipart).expect("Unparseable message")
}

async fn register(socket: &mut Dealer, command: Command, expected: &str) {
    let request = Message::new(Direction::DBQ, command)
        .with_service(SERVICE)
        .with_dispatcher("fake");
    socket.send(transport::encode(&request)).await.unwrap();
    loop {
        let reply = receive(socket).await;
        if reply.id == request.id {
            assert_eq!(reply.payload_text(), expected);
            return;
        }
    }
}

/// Registers, answers `identify` and heartbeats, then goes silent on the
/// first `modify`.
async fn doomed_dispatcher(endpoint: String) {
    let context = Context::new();
    let mut socket = transport::connect_dealer(&context, &endpoint).unwrap();
    register(&mut socket, Command::Welcome, "confirmed").await;
    register(&mut socket, Command::Ready, "ready").await;

    loop {
        let request = receive(&mut socket).await;
        match request.command {
            Command::Identify => {
                let reply = request.reply("string");
                socket.send(transport::encode(&reply)).await.unwrap();
            }
            Command::Heartbeat => {
                let reply = request.reply(timestamp());
                socket.send(transport::encode(&reply)).await.unwrap();
            }
            Command::Modify => return,
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_dispatcher_expiry_fails_outstanding_request() {
    let fabric = Fabric::start_with(|config| config.zmq.timeout = 0.2).await;
    let fake = tokio::spawn(doomed_dispatcher(fabric.config.zmq.broker.clone()));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut client = ClientService::connect(SERVICE, &fabric.config).await.unwrap();
    let keyword = client.keyword("TARGET").await.unwrap();
    assert_eq!(keyword.dispatcher(), Some("fake"));

    let sequence = keyword.write_async("x", None).unwrap();
    tokio::time::timeout(Duration::from_secs(5), fake)
        .await
        .unwrap()
        .unwrap();

    let started = Instant::now();
    let err = sequence.wait(Some(Duration::from_secs(5))).await.unwrap_err();
    match err {
        Error::Dispatcher(message) => assert_eq!(message, "Dispatcher Timed Out"),
        other => panic!("expected dispatcher error, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(2));

    assert!(!client.locate().await.unwrap());

    client.shutdown().await.unwrap();
    fabric.stop().await;
}
