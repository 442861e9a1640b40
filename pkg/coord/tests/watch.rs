mod common;

use pkg_coord::RegisterOptions;
use pkg_types::service::ServiceEventType;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_watch_delivers_every_change_in_order() {
    let store = common::store().await;
    let process = common::process(&store).await;
    let cancel = CancellationToken::new();
    let mut events = process.watch_service(&cancel, "search").await.unwrap();

    let ops: Vec<(bool, &str)> = vec![
        (true, "s-0"),
        (true, "s-1"),
        (true, "s-2"),
        (false, "s-1"),
        (true, "s-3"),
        (false, "s-0"),
    ];
    for (register, id) in &ops {
        if *register {
            process
                .register(&cancel, "search", id, "h:1", RegisterOptions::default())
                .await
                .unwrap();
        } else {
            process.deregister(&cancel, "search", id).await.unwrap();
        }
    }

    let mut seen = Vec::new();
    for _ in 0..ops.len() {
        let event = events.recv().await.unwrap();
        seen.push((event.event_type, event.instance.id));
    }
    let expected: Vec<(ServiceEventType, String)> = ops
        .iter()
        .map(|(register, id)| {
            let kind = if *register {
                ServiceEventType::Add
            } else {
                ServiceEventType::Delete
            };
            (kind, id.to_string())
        })
        .collect();
    assert_eq!(seen, expected);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_update_service_is_seen_as_delete_then_add() {
    let store = common::store().await;
    let process = common::process(&store).await;
    let cancel = CancellationToken::new();
    process
        .register(&cancel, "search", "s-0", "h:1", RegisterOptions::default())
        .await
        .unwrap();
    let mut events = process.watch_service(&cancel, "search").await.unwrap();

    process
        .update_service(&cancel, "search", "s-0", "h:2", RegisterOptions::default())
        .await
        .unwrap();
    let delete = events.recv().await.unwrap();
    let add = events.recv().await.unwrap();
    assert_eq!(delete.event_type, ServiceEventType::Delete);
    assert_eq!(add.event_type, ServiceEventType::Add);
    assert_eq!(add.instance.address, "h:2");
}

#[tokio::test]
async fn test_plain_watch_closes_on_store_outage() {
    let store = common::store().await;
    let process = common::process(&store).await;
    let mut events = process
        .watch_service(&CancellationToken::new(), "search")
        .await
        .unwrap();
    store.set_available(false);
    assert!(events.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_resilient_watch_resyncs_after_outage() {
    let store = common::store().await;
    let process = common::process(&store).await;
    let cancel = CancellationToken::new();
    process
        .register(
            &cancel,
            "search",
            "s-0",
            "h:1",
            RegisterOptions::default().with_ttl(60),
        )
        .await
        .unwrap();

    let watch_cancel = CancellationToken::new();
    let mut events = process
        .resilient_watch(watch_cancel.clone(), "search")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    store.set_available(false);
    tokio::time::sleep(Duration::from_millis(500)).await;
    store.set_available(true);

    let event = events.recv().await.unwrap();
    assert_eq!(event.event_type, ServiceEventType::Add);
    assert_eq!(event.instance.id, "s-0");

    process
        .register(&cancel, "search", "s-1", "h:2", RegisterOptions::default())
        .await
        .unwrap();
    let event = events.recv().await.unwrap();
    assert_eq!(event.instance.id, "s-1");

    watch_cancel.cancel();
    assert!(events.recv().await.is_none());
}
