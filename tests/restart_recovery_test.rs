mod common;

use std::time::Duration;

use common::{create_temp_db_file, event, fast_config, open_sqlite_log};
use eventide::{
    EventLog, EventStore, ExpectedSequence, GlobalSeq, Predicate, ProjectionMessage, ProjectionSeq,
    ProjectionStreamQuery, ReadCount, SqliteConfig, StreamId, StreamSeq,
};

fn placed_query() -> ProjectionStreamQuery {
    ProjectionStreamQuery::new([Predicate::event_type("Placed")]).unwrap()
}

#[tokio::test]
async fn restart_recovers_positions_and_sequences() {
    let (_dir, path) = create_temp_db_file("restart.db");
    let stream = StreamId::new("order-1");

    {
        let log = open_sqlite_log(&path).await;
        log.append(&stream, ExpectedSequence::None, vec![event("Placed"), event("Paid")])
            .await
            .unwrap();
        log.write_stream(&StreamId::new("order-2"), vec![event("Placed")])
            .await
            .unwrap();
        log.shutdown().await.unwrap();
    }

    let log = open_sqlite_log(&path).await;
    log.dispatcher().wait_for(GlobalSeq::from_raw(3)).await.unwrap();
    assert_eq!(log.dispatcher().position(), GlobalSeq::from_raw(3));
    assert_eq!(log.stream_sequence(&stream).await.unwrap(), StreamSeq::from_raw(2));

    let err = log
        .append(&stream, ExpectedSequence::Exact(StreamSeq::FIRST), vec![event("Shipped")])
        .await
        .unwrap_err();
    assert!(err.is_unexpected_sequence());

    let recorded = log
        .append(&stream, ExpectedSequence::Exact(StreamSeq::from_raw(2)), vec![event("Shipped")])
        .await
        .unwrap();
    assert_eq!(recorded[0].global_seq.as_raw(), 4);
    assert_eq!(recorded[0].stream_seq.as_raw(), 3);

    let all = log.read(GlobalSeq::FIRST, ReadCount::Unlimited).await.unwrap();
    let types: Vec<&str> = all.iter().map(|e| &*e.event_type).collect();
    assert_eq!(types, vec!["Placed", "Paid", "Placed", "Shipped"]);

    log.shutdown().await.unwrap();
}

#[tokio::test]
async fn projection_numbering_survives_restart_and_replays_index_then_log() {
    let (_dir, path) = create_temp_db_file("projection.db");
    let stream = StreamId::new("orders");

    {
        let log = open_sqlite_log(&path).await;
        for kind in ["Placed", "Paid", "Placed", "Placed"] {
            log.write_stream(&stream, vec![event(kind)]).await.unwrap();
        }
        log.dispatcher().wait_for(GlobalSeq::from_raw(4)).await.unwrap();

        let handle = log.projection(placed_query()).unwrap();
        assert_eq!(handle.status().await.unwrap().projection_seq.as_raw(), 3);
        log.shutdown().await.unwrap();
    }

    // Index writes stay buffered this time, so replay has to finish from the log
    let mut config = fast_config();
    config.projection.index_flush_delay = Duration::from_secs(60);
    let log = EventLog::open_with_config(&path, SqliteConfig::default(), config)
        .await
        .unwrap();
    for kind in ["Shipped", "Placed"] {
        log.write_stream(&stream, vec![event(kind)]).await.unwrap();
    }
    log.dispatcher().wait_for(GlobalSeq::from_raw(6)).await.unwrap();

    let handle = log.projection(placed_query()).unwrap();
    let status = handle.status().await.unwrap();
    assert_eq!(status.projection_seq.as_raw(), 4);
    assert_eq!(status.checkpoint.as_raw(), 6);

    let mut sub = handle.subscribe(ProjectionSeq::NONE).await.unwrap();
    let mut replayed = Vec::new();
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("replay stalled")
            .expect("subscription closed");
        match message {
            ProjectionMessage::Event { projection_seq, event } => {
                replayed.push((projection_seq.as_raw(), event.global_seq.as_raw()))
            }
            ProjectionMessage::ReplayFinished { projection_seq } => {
                assert_eq!(projection_seq.as_raw(), 4);
                break;
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
    assert_eq!(replayed, vec![(1, 1), (2, 3), (3, 4), (4, 6)]);

    // Shutdown flushes the buffered entry
    log.shutdown().await.unwrap();
    let store = common::open_sqlite_store(&path);
    let tip = store
        .read_highest_projection_entry(placed_query().id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tip.projection_seq.as_raw(), 4);
    assert_eq!(tip.global_seq.as_raw(), 6);
}
