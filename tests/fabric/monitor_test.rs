//! Broadcast delivery to monitored keywords.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use mktl::client::{ClientKeyword, Item, ItemKey};
use mktl::dispatcher::KeywordOptions;
use mktl::keyword::{CallbackHandle, KeywordType};

use crate::common::{Fabric, SETTLE};

fn state_options() -> KeywordOptions {
    KeywordOptions {
        initial: Some("idle".to_string()),
        ..Default::default()
    }
}

fn recorder() -> (Arc<Mutex<Vec<String>>>, CallbackHandle<ClientKeyword>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handle = CallbackHandle::function(move |keyword: &ClientKeyword| {
        sink.lock().push(keyword.ascii().unwrap_or_default());
        Ok(())
    });
    (seen, handle)
}

#[tokio::test]
async fn test_monitor_callbacks_in_order() {
    let fabric = Fabric::start().await;
    let mut dispatcher = fabric
        .dispatcher("d1", |service| {
            service.add_keyword_with("STATE", KeywordType::String, state_options(), None);
            Ok(())
        })
        .await;
    let mut client = fabric.client().await;

    let keyword = client.keyword("STATE").await.unwrap();
    let (seen, handle) = recorder();
    keyword.callback(handle, false, false);
    keyword.monitor(true, true, None).await.unwrap();
    assert_eq!(keyword.ascii().as_deref(), Some("idle"));
    tokio::time::sleep(SETTLE).await;

    let authoritative = dispatcher.keyword("STATE").unwrap();
    for value in ["slewing", "tracking", "parked", "parked"] {
        authoritative.modify(value).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(*seen.lock(), vec!["slewing", "tracking", "parked"]);
    assert_eq!(
        keyword.item(ItemKey::Ascii).await.unwrap(),
        Item::Text("parked".to_string())
    );
    assert_eq!(keyword.item(ItemKey::Broadcasts).await.unwrap(), Item::Count(3));

    client.shutdown().await.unwrap();
    dispatcher.shutdown().await.unwrap();
    fabric.stop().await;
}

#[tokio::test]
async fn test_unmonitored_keyword_gets_no_callbacks() {
    let fabric = Fabric::start().await;
    let mut dispatcher = fabric
        .dispatcher("d1", |service| {
            service.add_keyword_with("STATE", KeywordType::String, state_options(), None);
            Ok(())
        })
        .await;
    let mut client = fabric.client().await;

    let keyword = client.keyword("STATE").await.unwrap();
    let (seen, handle) = recorder();
    keyword.callback(handle, false, false);
    keyword.monitor(true, false, None).await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let authoritative = dispatcher.keyword("STATE").unwrap();
    authoritative.modify("one").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    keyword.monitor(false, false, None).await.unwrap();
    authoritative.modify("two").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(*seen.lock(), vec!["one"]);
    assert_eq!(keyword.value().as_deref(), Some("one"));

    client.shutdown().await.unwrap();
    dispatcher.shutdown().await.unwrap();
    fabric.stop().await;
}

#[tokio::test]
async fn test_client_write_reaches_monitor() {
    let fabric = Fabric::start().await;
    let mut dispatcher = fabric
        .dispatcher("d1", |service| {
            service.add_keyword_with("STATE", KeywordType::String, state_options(), None);
            Ok(())
        })
        .await;
    let mut writer = fabric.client().await;
    let mut watcher = fabric.client().await;

    let watched = watcher.keyword("STATE").await.unwrap();
    let (seen, handle) = recorder();
    watched.callback(handle, false, false);
    watched.monitor(true, true, None).await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let written = writer.keyword("STATE").await.unwrap();
    let sequence = written.write_async("open", None).unwrap();
    assert_eq!(written.wait(sequence, None).await.unwrap(), "open");
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(*seen.lock(), vec!["open"]);

    writer.shutdown().await.unwrap();
    watcher.shutdown().await.unwrap();
    dispatcher.shutdown().await.unwrap();
    fabric.stop().await;
}

#[tokio::test]
async fn test_monitor_prime_without_value() {
    let fabric = Fabric::start().await;
    let mut dispatcher = fabric
        .dispatcher("d1", |service| {
            service.add_keyword_with("EMPTY", KeywordType::String, KeywordOptions::default(), None);
            Ok(())
        })
        .await;
    let mut client = fabric.client().await;

    let keyword = client.keyword("EMPTY").await.unwrap();
    keyword.monitor(true, true, None).await.unwrap();
    assert!(keyword.monitored());
    assert!(!keyword.populated());
    assert_eq!(keyword.value(), None);
    tokio::time::sleep(SETTLE).await;

    dispatcher.keyword("EMPTY").unwrap().modify("first").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(keyword.populated());
    assert_eq!(keyword.ascii().as_deref(), Some("first"));

    client.shutdown().await.unwrap();
    dispatcher.shutdown().await.unwrap();
    fabric.stop().await;
}
