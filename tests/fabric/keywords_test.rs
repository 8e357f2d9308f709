//! Typed keyword round trips through the full fabric.

use std::sync::Arc;

use mktl::catalog::MemoryCatalog;
use mktl::dispatcher::{DispatcherConfig, DispatcherService, KeywordOptions};
use mktl::keyword::{Enumerators, KeywordType, Value};
use mktl::Error;

use crate::common::{Fabric, SERVICE};

fn centroid() -> KeywordType {
    KeywordType::Enumerated(
        Enumerators::new([
            (0, "COG".to_string()),
            (1, "QUAD".to_string()),
            (2, "BINQUAD".to_string()),
        ])
        .unwrap(),
    )
}

#[tokio::test]
async fn test_boolean_round_trip() {
    let fabric = Fabric::start().await;
    let mut dispatcher = fabric
        .dispatcher("d1", |service| {
            service.add_keyword_with("MYBOOLEAN", KeywordType::Boolean, KeywordOptions::default(), None);
            Ok(())
        })
        .await;
    let mut client = fabric.client().await;

    let keyword = client.keyword("myboolean").await.unwrap();
    assert_eq!(keyword.keyword_type(), &KeywordType::Boolean);
    assert_eq!(keyword.dispatcher(), Some("d1"));

    assert_eq!(keyword.write("yes", None).await.unwrap(), "1");
    assert_eq!(keyword.read(None).await.unwrap(), "1");
    assert_eq!(keyword.read_binary(None).await.unwrap(), Value::Bool(true));
    assert_eq!(dispatcher.keyword("MYBOOLEAN").unwrap().value().as_deref(), Some("1"));

    client.shutdown().await.unwrap();
    dispatcher.shutdown().await.unwrap();
    fabric.stop().await;
}

#[tokio::test]
async fn test_integer_overflow_rejected() {
    let fabric = Fabric::start().await;
    let mut dispatcher = fabric
        .dispatcher("d1", |service| {
            service.add_keyword_with("COUNT", KeywordType::Integer, KeywordOptions::default(), None);
            Ok(())
        })
        .await;
    let mut client = fabric.client().await;

    let keyword = client.keyword("COUNT").await.unwrap();
    let err = keyword.write("2147483648", None).await.unwrap_err();
    match err {
        Error::Dispatcher(message) => assert!(message.contains("integer range"), "{message}"),
        other => panic!("expected dispatcher error, got {other:?}"),
    }

    assert_eq!(keyword.write(2147483647_i64, None).await.unwrap(), "2147483647");

    client.shutdown().await.unwrap();
    dispatcher.shutdown().await.unwrap();
    fabric.stop().await;
}

#[tokio::test]
async fn test_enumerated_by_name_and_ordinal() {
    let fabric = Fabric::start().await;
    let mut dispatcher = fabric
        .dispatcher("d1", |service| {
            service.add_keyword_with("CENTROID", centroid(), KeywordOptions::default(), None);
            Ok(())
        })
        .await;
    let mut client = fabric.client().await;

    let keyword = client.keyword("CENTROID").await.unwrap();
    assert_eq!(keyword.keyword_type(), &centroid());

    keyword.write("QUAD", None).await.unwrap();
    assert_eq!(
        keyword.read_both(None).await.unwrap(),
        (Value::Int(1), "QUAD".to_string())
    );

    keyword.write(2_i64, None).await.unwrap();
    assert_eq!(keyword.read(None).await.unwrap(), "BINQUAD");
    assert_eq!(keyword.read_binary(None).await.unwrap(), Value::Int(2));

    assert!(matches!(
        keyword.write("FOUR", None).await,
        Err(Error::Dispatcher(_))
    ));

    client.shutdown().await.unwrap();
    dispatcher.shutdown().await.unwrap();
    fabric.stop().await;
}

#[tokio::test]
async fn test_service_queries() {
    let fabric = Fabric::start().await;
    let mut first = fabric
        .dispatcher("d1", |service| {
            service.add_keyword_with("TEMP", KeywordType::Double, KeywordOptions {
                units: Some("degC".to_string()),
                ..Default::default()
            }, None);
            Ok(())
        })
        .await;
    let mut second = fabric
        .dispatcher("d2", |service| {
            service.add_keyword_with("MODE", KeywordType::String, KeywordOptions::default(), None);
            Ok(())
        })
        .await;
    let mut client = fabric.client().await;

    assert!(client.locate().await.unwrap());

    let mut names = client.enumerate().await.unwrap();
    names.sort();
    assert_eq!(names, vec!["MODE".to_string(), "TEMP".to_string()]);

    // Each keyword routes to its own dispatcher.
    let temp = client.keyword("TEMP").await.unwrap();
    let mode = client.keyword("MODE").await.unwrap();
    assert_eq!(temp.dispatcher(), Some("d1"));
    assert_eq!(mode.dispatcher(), Some("d2"));

    assert_eq!(temp.write(21_i64, None).await.unwrap(), "21.0");
    assert_eq!(mode.write("track", None).await.unwrap(), "track");
    assert_eq!(temp.units().await.unwrap().as_deref(), Some("degC"));
    assert_eq!(mode.units().await.unwrap(), None);

    assert!(matches!(
        client.keyword("NOSUCH").await,
        Err(Error::KeyNotFound(_))
    ));

    client.shutdown().await.unwrap();
    first.shutdown().await.unwrap();
    second.shutdown().await.unwrap();
    fabric.stop().await;
}

const CATALOG: &str = r#"
testsvc:
  - name: MODE
    type: string
    initial: idle
  - name: TEMP
    type: double
    units: degC
    period: 60.0
  - name: FILTER
    type: string
    dispatcher: wheel
"#;

#[tokio::test]
async fn test_catalog_populated_dispatcher() {
    let fabric = Fabric::start().await;
    let catalog = MemoryCatalog::from_yaml(CATALOG).unwrap();
    let mut dispatcher = DispatcherService::start(
        DispatcherConfig::new(SERVICE, Some("d1"), &fabric.config),
        Some(Arc::new(catalog)),
        |service| service.populate_from_catalog().map(|_| ()),
    )
    .await
    .unwrap();

    assert_eq!(dispatcher.keyword_names(), vec!["MODE", "TEMP"]);
    assert_eq!(dispatcher.keyword("MODE").unwrap().value().as_deref(), Some("idle"));
    assert_eq!(dispatcher.scheduler().period_count(), 1);

    let mut client = fabric.client().await;
    let mode = client.keyword("mode").await.unwrap();
    assert_eq!(mode.read(None).await.unwrap(), "idle");
    let temp = client.keyword("TEMP").await.unwrap();
    assert_eq!(temp.units().await.unwrap().as_deref(), Some("degC"));
    assert!(matches!(
        client.keyword("FILTER").await,
        Err(Error::KeyNotFound(_))
    ));

    client.shutdown().await.unwrap();
    dispatcher.shutdown().await.unwrap();
    fabric.stop().await;
}
