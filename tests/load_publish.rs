mod common;

use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use common::{load, reach, RecordingPublisher, PATIENCE};
use taskhub::worker::{Completion, LoadPublishWorker};
use tokio_util::sync::CancellationToken;

const HOUR: Duration = Duration::from_secs(3600);

fn spawn(publisher: RecordingPublisher) -> (Arc<RecordingPublisher>, LoadPublishWorker) {
    let publisher = Arc::new(publisher);
    let worker = LoadPublishWorker::spawn(publisher.clone(), HOUR, &CancellationToken::new());
    (publisher, worker)
}

#[tokio::test]
async fn later_reports_replace_earlier_ones() {
    let (publisher, worker) = spawn(RecordingPublisher::default());
    worker.submit(0, load(0)).unwrap();
    reach(&publisher.calls, 1).await;

    // the worker now pauses for an hour
    worker.submit(1, load(1)).unwrap();
    worker.submit(2, load(5)).unwrap();
    worker.submit(1, load(3)).unwrap();
    let flushed = tokio::time::timeout(PATIENCE, worker.flush()).await.unwrap();
    assert_eq!(flushed, Completion::Processed);

    let published = publisher.published.lock().unwrap().clone();
    assert_eq!(published.len(), 2);
    assert_eq!(published[1].len(), 2);
    assert_eq!(published[1][&1], load(3));
    assert_eq!(published[1][&2], load(5));
    worker.stop().await;
}

#[tokio::test]
async fn the_pause_holds_reports_until_a_flush() {
    let (publisher, worker) = spawn(RecordingPublisher::default());
    worker.submit(0, load(1)).unwrap();
    reach(&publisher.calls, 1).await;

    worker.submit(0, load(2)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(publisher.published.lock().unwrap().len(), 1);

    tokio::time::timeout(PATIENCE, worker.flush()).await.unwrap();
    let published = publisher.published.lock().unwrap().clone();
    assert_eq!(published.len(), 2);
    assert_eq!(published[1][&0], load(2));
    worker.stop().await;
}

#[tokio::test]
async fn flushing_with_nothing_new_returns_at_once() {
    let (publisher, worker) = spawn(RecordingPublisher::default());
    let flushed = tokio::time::timeout(PATIENCE, worker.flush()).await.unwrap();
    assert_eq!(flushed, Completion::Processed);
    assert_eq!(*publisher.calls.borrow(), 0);
    worker.stop().await;
}

#[tokio::test]
async fn publish_failures_are_absorbed() {
    let publisher = RecordingPublisher::default();
    publisher.failures.store(1, Ordering::SeqCst);
    let (publisher, worker) = spawn(publisher);

    worker.submit(3, load(9)).unwrap();
    tokio::time::timeout(PATIENCE, worker.flush()).await.unwrap();
    assert!(publisher.published.lock().unwrap().is_empty());

    worker.submit(3, load(10)).unwrap();
    tokio::time::timeout(PATIENCE, worker.flush()).await.unwrap();
    let published = publisher.published.lock().unwrap().clone();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0][&3], load(10));
    worker.stop().await;
}

#[tokio::test]
async fn stopping_cancels_a_slow_publish() {
    let (publisher, worker) = spawn(RecordingPublisher {
        delay: Some(HOUR),
        ..Default::default()
    });
    worker.submit(0, load(1)).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(PATIENCE, worker.stop()).await.unwrap();
    assert!(publisher.published.lock().unwrap().is_empty());
    assert!(worker.submit(0, load(2)).is_err());
}
