mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{event, writer_config_with_flush_delay, FaultyStore};
use eventide::store::collect_events;
use eventide::{
    spawn_buffered_writer, spawn_dispatcher, DispatcherConfig, Error, EventId, EventStore, GlobalSeq,
    MemoryStore, ReadCount, StreamId,
};

#[tokio::test]
async fn one_bad_request_fails_alone_within_a_batch() {
    let memory: Arc<dyn EventStore> = Arc::new(MemoryStore::new());
    let store: Arc<dyn EventStore> = Arc::new(FaultyStore::new(memory.clone(), "Poison"));
    // A long delay puts all 100 requests into the same batch
    let writer = spawn_buffered_writer(store, None, writer_config_with_flush_delay(Duration::from_millis(200)));

    let mut tasks = Vec::new();
    for i in 0..100 {
        let writer = writer.clone();
        tasks.push(tokio::spawn(async move {
            let kind = if (1..=4).contains(&i) { "Poison" } else { "Ok" };
            let stream = StreamId::new(format!("req-{i}"));
            (i, writer.write_stream(&stream, vec![event(kind)]).await)
        }));
    }

    let mut failed = Vec::new();
    let mut succeeded = 0;
    for task in tasks {
        let (i, result) = task.await.unwrap();
        match result {
            Ok(recorded) => {
                assert_eq!(recorded.len(), 1);
                assert_eq!(recorded[0].stream_id.as_str(), format!("req-{i}"));
                succeeded += 1;
            }
            Err(Error::Storage(_)) => failed.push(i),
            Err(e) => panic!("request {i} failed unexpectedly: {e}"),
        }
    }
    failed.sort_unstable();

    assert_eq!(failed, vec![1, 2, 3, 4]);
    assert_eq!(succeeded, 96);

    let persisted = collect_events(memory.as_ref(), GlobalSeq::FIRST, ReadCount::Unlimited)
        .await
        .unwrap();
    assert_eq!(persisted.len(), 96);
    assert!(persisted.iter().all(|e| &*e.event_type == "Ok"));
}

#[tokio::test]
async fn duplicate_request_reports_duplicate_and_others_commit() {
    let store: Arc<dyn EventStore> = Arc::new(MemoryStore::new());
    let dispatcher = spawn_dispatcher(store.clone(), DispatcherConfig::default());
    let writer = spawn_buffered_writer(
        store.clone(),
        Some(dispatcher.clone()),
        writer_config_with_flush_delay(Duration::from_millis(50)),
    );

    let id = EventId::new();
    let stream = StreamId::new("s");
    writer.write_stream(&stream, vec![event("A").with_id(id)]).await.unwrap();

    let again = {
        let writer = writer.clone();
        let stream = stream.clone();
        tokio::spawn(async move { writer.write_stream(&stream, vec![event("A").with_id(id)]).await })
    };
    let fresh = {
        let writer = writer.clone();
        let stream = stream.clone();
        tokio::spawn(async move { writer.write_stream(&stream, vec![event("B")]).await })
    };

    assert!(again.await.unwrap().unwrap_err().is_duplicate());
    let fresh = fresh.await.unwrap().unwrap();
    assert_eq!(fresh[0].global_seq.as_raw(), 2);

    // Only committed events reach the dispatcher
    dispatcher.wait_for(GlobalSeq::from_raw(2)).await.unwrap();
    assert_eq!(dispatcher.position().as_raw(), 2);

    writer.shutdown().await.unwrap();
    dispatcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_flushes_buffered_requests() {
    let store: Arc<dyn EventStore> = Arc::new(MemoryStore::new());
    let writer = spawn_buffered_writer(
        store.clone(),
        None,
        writer_config_with_flush_delay(Duration::from_secs(60)),
    );

    let pending = {
        let writer = writer.clone();
        tokio::spawn(async move { writer.write_stream(&StreamId::new("s"), vec![event("A")]).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    writer.shutdown().await.unwrap();

    assert_eq!(pending.await.unwrap().unwrap()[0].global_seq, GlobalSeq::FIRST);
    assert!(matches!(
        writer.write_stream(&StreamId::new("s"), vec![event("B")]).await,
        Err(Error::Closed(_))
    ));
}
