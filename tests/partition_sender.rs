mod common;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use common::{detached_partition, RecordingEffects, PATIENCE};
use taskhub::{
    config::TransportConfig,
    event::{PartitionEvent, PartitionEventKind, UpdateEvent},
    reassembly::ReassemblyState,
    transport::{Destination, PartitionSender, Transport},
    wire::FrameCodec,
    worker::Completion,
    Error,
};
use tokio_util::sync::CancellationToken;

const MAX_MESSAGE_SIZE: usize = 1024;

type FailWhen = Box<dyn Fn(&[PartitionEvent]) -> bool + Send + Sync>;

struct Sent {
    len: usize,
    events: Vec<PartitionEvent>,
    delivered: bool,
}

/// Decodes every frame it is handed and refuses the ones `fail_when` picks.
struct RecordingTransport {
    codec: FrameCodec,
    fail_when: FailWhen,
    sent: Mutex<Vec<Sent>>,
}

impl RecordingTransport {
    fn new(fail_when: FailWhen) -> Arc<Self> {
        Arc::new(Self {
            codec: FrameCodec::new(usize::MAX),
            fail_when,
            sent: Mutex::new(Vec::new()),
        })
    }

    fn ids(&self, delivered_only: bool) -> Vec<Vec<String>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|sent| sent.delivered || !delivered_only)
            .map(|sent| sent.events.iter().map(|e| e.id.to_string()).collect())
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, destination: Destination, frame: Vec<u8>) -> Result<(), Error> {
        let events = self.codec.decode_partition_batch(&frame)?;
        let delivered = !(self.fail_when)(&events);
        self.sent.lock().unwrap().push(Sent {
            len: frame.len(),
            events,
            delivered,
        });
        if delivered {
            Ok(())
        } else {
            Err(Error::UnknownDestination(destination))
        }
    }
}

fn config() -> Arc<TransportConfig> {
    let config = TransportConfig::builder()
        .partition_count(1)
        .max_message_size(MAX_MESSAGE_SIZE)
        .compress_threshold(usize::MAX)
        .fragment_timeout(Duration::from_secs(60))
        .build();
    config.validate().unwrap();
    Arc::new(config)
}

fn update(id: &str, size: usize) -> PartitionEvent {
    PartitionEvent::update(
        id,
        0,
        UpdateEvent {
            instance_id: Some(format!("instance-{}", id)),
            payload: (0..size).map(|i| (i % 241) as u8).collect(),
        },
    )
}

async fn send_all(
    transport: Arc<RecordingTransport>,
    events: Vec<PartitionEvent>,
) -> Arc<RecordingTransport> {
    let shutdown = CancellationToken::new();
    let sender = PartitionSender::spawn(0, config(), transport.clone(), &shutdown);
    for event in events {
        sender.submit(event).unwrap();
    }
    let completion = tokio::time::timeout(PATIENCE, sender.wait_for_completion())
        .await
        .unwrap();
    assert_eq!(completion, Completion::Processed);
    sender.stop().await;
    transport
}

#[tokio::test]
async fn frames_never_exceed_the_message_size() {
    let long_id = "x".repeat(300);
    let mut events = vec![update(&long_id, 5000)];
    // walks across the size at which events stop fitting a frame
    for size in (0..1200).step_by(7) {
        events.push(update(&format!("E{}", size), size));
    }
    let mut expected: Vec<String> = events.iter().map(|e| e.id.to_string()).collect();

    let transport = send_all(RecordingTransport::new(Box::new(|_| false)), events).await;
    let sent = std::mem::take(&mut *transport.sent.lock().unwrap());
    for frame in &sent {
        assert!(
            frame.len <= MAX_MESSAGE_SIZE,
            "frame of {} bytes carrying {}",
            frame.len,
            frame.events[0].id
        );
    }

    let partition = detached_partition(0);
    let mut effects = RecordingEffects::new(&partition);
    let mut reassembly = ReassemblyState::new();
    let mut received = Vec::new();
    for event in sent.into_iter().flat_map(|frame| frame.events) {
        match event.kind {
            PartitionEventKind::Fragment(_) => {
                reassembly.process(event, &mut effects).unwrap();
            }
            _ => received.push(event.id.to_string()),
        }
    }
    assert_eq!(reassembly.pending(), 0);
    let long = effects
        .updates
        .iter()
        .find(|e| e.id.as_str() == long_id)
        .expect("long event reassembled");
    assert_eq!(long.kind, update(&long_id, 5000).kind);
    received.extend(effects.updates.iter().map(|e| e.id.to_string()));

    received.sort();
    expected.sort();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn a_failed_frame_loses_only_its_own_events() {
    let refuse = |events: &[PartitionEvent]| {
        events
            .iter()
            .any(|e| e.id.as_str() == "E1" || e.id.as_str() == "BIGF1")
    };
    // each 700-byte update needs a frame of its own
    let events = vec![
        update("E0", 700),
        update("E1", 700),
        update("BIG", 3000),
        update("E2", 700),
    ];
    let transport = send_all(RecordingTransport::new(Box::new(refuse)), events).await;

    assert_eq!(
        transport.ids(false),
        vec![
            vec!["E0".to_string()],
            vec!["E1".to_string()],
            vec!["BIGF0".to_string()],
            vec!["BIGF1".to_string()],
            vec!["E2".to_string()],
        ]
    );
    assert_eq!(
        transport.ids(true),
        vec![
            vec!["E0".to_string()],
            vec!["BIGF0".to_string()],
            vec!["E2".to_string()],
        ]
    );
}

/// Never answers, like a partition that never commits.
struct StalledTransport;

#[async_trait]
impl Transport for StalledTransport {
    async fn send(&self, _destination: Destination, _frame: Vec<u8>) -> Result<(), Error> {
        std::future::pending::<Result<(), Error>>().await
    }
}

#[tokio::test]
async fn stopping_abandons_a_frame_in_flight() {
    let shutdown = CancellationToken::new();
    let sender = PartitionSender::spawn(0, config(), Arc::new(StalledTransport), &shutdown);
    sender.submit(update("E0", 10)).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(PATIENCE, sender.stop()).await.unwrap();
    assert!(sender.submit(update("E1", 10)).is_err());
}
