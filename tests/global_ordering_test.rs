mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{append_kinds, event, eventually, fast_config, RecordingStore};
use eventide::{
    spawn_dispatcher, DispatcherConfig, EventLog, EventStore, GlobalSeq, MemoryStore, StreamId,
};

#[tokio::test]
async fn concurrent_writes_are_dispatched_in_order_without_gaps() {
    let log = EventLog::with_store(Arc::new(MemoryStore::new()), fast_config())
        .await
        .unwrap();
    let mut live = log.subscribe_live().await.unwrap();

    let mut tasks = Vec::new();
    for task in 0..8 {
        let log = log.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..25 {
                let stream = StreamId::new(format!("order-{}", (task + i) % 5));
                log.write_stream(&stream, vec![event("Placed")]).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let dispatcher = log.dispatcher().clone();
    eventually(Duration::from_secs(5), Duration::from_millis(5), || {
        (dispatcher.position().as_raw() == 200).then_some(())
    })
    .await;

    let mut expected = GlobalSeq::FIRST;
    while expected.as_raw() <= 200 {
        let published = tokio::time::timeout(Duration::from_secs(5), live.next())
            .await
            .expect("dispatcher stalled")
            .expect("subscription closed")
            .expect("subscription lagged");
        assert_eq!(published.global_seq, expected);
        expected = expected.next();
    }
    assert!(live.try_next().is_none());

    log.shutdown().await.unwrap();
}

#[tokio::test]
async fn gaps_are_recovered_from_the_store_in_bounded_reads() {
    let recording = Arc::new(RecordingStore::new(Arc::new(MemoryStore::new())));
    let store: Arc<dyn EventStore> = recording.clone();
    let dispatcher = spawn_dispatcher(
        store.clone(),
        DispatcherConfig {
            recovery_delay: Duration::from_millis(20),
            ..DispatcherConfig::default()
        },
    );

    // Subscribing first pins the cursor at zero before anything is written
    let mut sub = dispatcher.subscribe().await.unwrap();
    assert_eq!(sub.position(), GlobalSeq::ZERO);

    let kinds = vec!["Tick"; 22];
    let recorded = append_kinds(store.as_ref(), &StreamId::new("clock"), &kinds).await;
    let notified = [1, 4, 5, 9, 20, 22]
        .iter()
        .map(|g| recorded[*g as usize - 1].clone())
        .collect();
    dispatcher.notify(notified).await.unwrap();

    let mut seen = Vec::new();
    while seen.len() < 22 {
        let event = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("recovery stalled")
            .expect("subscription closed")
            .expect("subscription lagged");
        seen.push(event.global_seq.as_raw());
    }
    assert_eq!(seen, (1..=22).collect::<Vec<i64>>());
    assert_eq!(recording.reads(), vec![(2, 2), (6, 3), (10, 10), (21, 1)]);

    dispatcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn stale_and_repeated_notifications_are_ignored() {
    let store: Arc<dyn EventStore> = Arc::new(MemoryStore::new());
    let dispatcher = spawn_dispatcher(store.clone(), DispatcherConfig::default());
    let mut sub = dispatcher.subscribe().await.unwrap();

    let recorded = append_kinds(store.as_ref(), &StreamId::new("s"), &["A", "B"]).await;
    dispatcher.notify(recorded.clone()).await.unwrap();
    dispatcher.notify(recorded.clone()).await.unwrap();
    dispatcher.wait_for(GlobalSeq::from_raw(2)).await.unwrap();
    // The mailbox is FIFO: once this subscribe is answered the repeats were handled
    dispatcher.subscribe().await.unwrap();
    assert_eq!(dispatcher.position().as_raw(), 2);

    assert_eq!(sub.next().await.unwrap().unwrap().global_seq.as_raw(), 1);
    assert_eq!(sub.next().await.unwrap().unwrap().global_seq.as_raw(), 2);
    assert!(sub.try_next().is_none());

    dispatcher.shutdown().await.unwrap();
}
