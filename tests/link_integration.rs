//! End-to-end protocol tests against a loopback transport
//!
//! These drive the full stack — connection lifecycle, readiness
//! handshake, heartbeats, reliable delivery, chunking, and bulk
//! transfer reassembly — with virtual time, injecting peripheral
//! traffic through a scripted transport double.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{advance, sleep, timeout, Duration};

use glasslink_core::protocol::{frame, msg, Inbound, TYPE_PHOTO};
use glasslink_core::transfer::CompletedTransfer;
use glasslink_core::{
    ConnectionManager, ConnectionState, LinkConfig, LinkError, LinkEvent, Message, Result,
    Transport, TransferSink,
};

/// Scripted in-memory transport
struct LoopbackTransport {
    inbound_tx: StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    written: StdMutex<Vec<Vec<u8>>>,
    connect_attempts: AtomicU32,
    /// Number of connect attempts to fail before succeeding
    fail_connects: AtomicU32,
}

impl LoopbackTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inbound_tx: StdMutex::new(None),
            written: StdMutex::new(Vec::new()),
            connect_attempts: AtomicU32::new(0),
            fail_connects: AtomicU32::new(0),
        })
    }

    fn failing(attempts: u32) -> Arc<Self> {
        let transport = Self::new();
        transport.fail_connects.store(attempts, Ordering::SeqCst);
        transport
    }

    /// Deliver raw bytes as a peripheral notification
    fn inject(&self, bytes: Vec<u8>) {
        let guard = self.inbound_tx.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(bytes);
        }
    }

    /// Deliver a control message the way the peripheral would send it
    fn inject_message(&self, message: &Message) {
        self.inject(frame::encode_command(message, false).unwrap());
    }

    /// Simulate a radio-level disconnect
    fn drop_link(&self) {
        self.inbound_tx.lock().unwrap().take();
    }

    /// Decode every frame written so far back into control messages
    fn written_control(&self) -> Vec<Message> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .filter_map(|bytes| match frame::classify(bytes) {
                Ok(Inbound::Control(message)) => Some(message),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(LinkError::transport("simulated connect failure"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn disconnect(&self) {
        self.inbound_tx.lock().unwrap().take();
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        self.written.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn request_mtu(&self, preferred: u16) -> Result<u16> {
        Ok(preferred)
    }

    async fn enable_notifications(&self) -> Result<()> {
        Ok(())
    }
}

struct CollectingSink {
    completed: Mutex<Vec<CompletedTransfer>>,
}

impl CollectingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            completed: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TransferSink for CollectingSink {
    async fn on_transfer_complete(&self, transfer: CompletedTransfer) {
        self.completed.lock().await.push(transfer);
    }
}

/// Wait (in virtual time) for an event matching the predicate
async fn wait_event<F>(
    events: &mut mpsc::UnboundedReceiver<LinkEvent>,
    mut predicate: F,
) -> LinkEvent
where
    F: FnMut(&LinkEvent) -> bool,
{
    timeout(Duration::from_secs(600), async {
        loop {
            match events.recv().await {
                Some(event) if predicate(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("expected event was not emitted")
}

/// Wait until at least `min_count` control messages of the given type
/// have been written to the radio
async fn wait_written(
    transport: &Arc<LoopbackTransport>,
    message_type: &str,
    min_count: usize,
) -> Vec<Message> {
    timeout(Duration::from_secs(600), async {
        loop {
            let matching: Vec<Message> = transport
                .written_control()
                .into_iter()
                .filter(|m| m.is_type(message_type))
                .collect();
            if matching.len() >= min_count {
                return matching;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("expected written message was not observed")
}

/// Bring a freshly started manager to the `Connected` state with a
/// peripheral reporting ACK-capable firmware.
///
/// Waits for a probe written *after* the call, so it also works for a
/// session established by reconnection.
async fn connect_and_ready(
    transport: &Arc<LoopbackTransport>,
    events: &mut mpsc::UnboundedReceiver<LinkEvent>,
) {
    let baseline = transport
        .written_control()
        .iter()
        .filter(|m| m.is_type(msg::HOST_READY))
        .count();
    wait_written(transport, msg::HOST_READY, baseline + 1).await;
    transport.inject_message(&Message::new(
        msg::PERIPHERAL_READY,
        json!({ "timestamp": 1 }),
    ));
    wait_event(events, |e| e.is_peripheral_ready()).await;

    // Answer the post-ready version probe; build 5 enables ACK tracking.
    wait_written(transport, msg::VERSION_REQUEST, 1).await;
    transport.inject_message(&Message::new(
        msg::VERSION_INFO,
        json!({ "app_version": "1.4.0", "build_number": 5 }),
    ));
    wait_event(events, |e| {
        matches!(e, LinkEvent::Message(m) if m.is_type(msg::VERSION_INFO))
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn lifecycle_reaches_connected_state() {
    let transport = LoopbackTransport::new();
    let mut manager = ConnectionManager::new(transport.clone(), LinkConfig::default());
    let mut events = manager.take_events().unwrap();
    manager.start().unwrap();

    // The state machine walks the full path.
    for expected in [
        ConnectionState::Connecting,
        ConnectionState::LinkEstablished,
        ConnectionState::AwaitingPeripheralReady,
    ] {
        let event = wait_event(&mut events, |e| e.new_state().is_some()).await;
        assert_eq!(event.new_state(), Some(expected));
    }

    connect_and_ready(&transport, &mut events).await;
    assert_eq!(manager.state(), ConnectionState::Connected);

    manager.close().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn readiness_probe_repeats_until_ready() {
    let transport = LoopbackTransport::new();
    let mut manager = ConnectionManager::new(transport.clone(), LinkConfig::default());
    let mut events = manager.take_events().unwrap();
    manager.start().unwrap();

    // Probes repeat on their own while the SOC boots.
    wait_written(&transport, msg::HOST_READY, 3).await;

    transport.inject_message(&Message::new(msg::PERIPHERAL_READY, json!({})));
    wait_event(&mut events, |e| e.is_peripheral_ready()).await;

    let probes_at_ready = transport
        .written_control()
        .iter()
        .filter(|m| m.is_type(msg::HOST_READY))
        .count();

    // The probe loop stops the instant readiness is observed.
    advance(Duration::from_secs(60)).await;
    sleep(Duration::from_millis(50)).await;
    let probes_later = transport
        .written_control()
        .iter()
        .filter(|m| m.is_type(msg::HOST_READY))
        .count();
    assert_eq!(probes_at_ready, probes_later);

    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeats_flow_with_periodic_battery_refresh() {
    let transport = LoopbackTransport::new();
    let mut manager = ConnectionManager::new(transport.clone(), LinkConfig::default());
    let mut events = manager.take_events().unwrap();
    manager.start().unwrap();
    connect_and_ready(&transport, &mut events).await;

    // One battery request went out right after readiness.
    let initial_battery = wait_written(&transport, msg::BATTERY_REQUEST, 1).await.len();

    wait_written(&transport, msg::PING, 10).await;
    // The 10th heartbeat amortizes a battery refresh.
    let battery_requests = wait_written(&transport, msg::BATTERY_REQUEST, initial_battery + 1)
        .await
        .len();
    assert!(battery_requests > initial_battery);

    // A pong surfaces as an event.
    transport.inject_message(&Message::new(msg::PONG, json!({})));
    wait_event(&mut events, |e| matches!(e, LinkEvent::HeartbeatAck)).await;

    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn reliable_message_retries_then_reports_failure() {
    let transport = LoopbackTransport::new();
    let mut manager = ConnectionManager::new(transport.clone(), LinkConfig::default());
    let mut events = manager.take_events().unwrap();
    manager.start().unwrap();
    connect_and_ready(&transport, &mut events).await;

    manager
        .send_reliable(Message::new("display_text", json!({ "text": "hello" })))
        .unwrap();

    let failed = wait_event(&mut events, |e| {
        matches!(e, LinkEvent::DeliveryFailed { .. })
    })
    .await;

    let copies: Vec<Message> = transport
        .written_control()
        .into_iter()
        .filter(|m| m.is_type("display_text"))
        .collect();
    // Initial transmission plus three retries, all carrying the id that
    // was reported as failed.
    assert_eq!(copies.len(), 4);
    let LinkEvent::DeliveryFailed { message_id } = failed else {
        unreachable!()
    };
    assert!(copies.iter().all(|m| m.message_id() == Some(message_id)));

    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn ack_stops_retries() {
    let transport = LoopbackTransport::new();
    let mut manager = ConnectionManager::new(transport.clone(), LinkConfig::default());
    let mut events = manager.take_events().unwrap();
    manager.start().unwrap();
    connect_and_ready(&transport, &mut events).await;

    manager
        .send_reliable(Message::new("display_text", json!({ "text": "hi" })))
        .unwrap();

    let written = wait_written(&transport, "display_text", 1).await;
    let message_id = written[0].message_id().expect("reliable message is stamped");

    transport.inject_message(&Message::new(
        msg::ACK,
        json!({ "mId": message_id, "timestamp": 2 }),
    ));

    // No retries and no failure after the ACK lands.
    let failure = timeout(
        Duration::from_secs(60),
        wait_event(&mut events, |e| matches!(e, LinkEvent::DeliveryFailed { .. })),
    )
    .await;
    assert!(failure.is_err());

    let copies = transport
        .written_control()
        .into_iter()
        .filter(|m| m.is_type("display_text"))
        .count();
    assert_eq!(copies, 1);

    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn oversized_message_is_chunked_and_reassemblable() {
    let transport = LoopbackTransport::new();
    let mut manager = ConnectionManager::new(transport.clone(), LinkConfig::default());
    let mut events = manager.take_events().unwrap();
    manager.start().unwrap();
    connect_and_ready(&transport, &mut events).await;

    let text = "x".repeat(1200);
    manager
        .send_reliable(Message::new("caption", json!({ "text": text })))
        .unwrap();

    let fragments = wait_written(&transport, msg::CHUNK, 1).await;
    let total = fragments[0].get_u64("total").unwrap() as usize;
    assert!(total > 1);
    let mut fragments = wait_written(&transport, msg::CHUNK, total).await;
    fragments.truncate(total);

    let chunk_id = fragments[0].get_str("chunkId").unwrap().to_string();
    fragments.sort_by_key(|f| f.get_u64("chunk").unwrap());
    let mut payload = String::new();
    for (i, fragment) in fragments.iter().enumerate() {
        assert_eq!(fragment.get_str("chunkId"), Some(chunk_id.as_str()));
        assert_eq!(fragment.get_u64("chunk"), Some(i as u64));
        assert_eq!(fragment.get_u64("total"), Some(total as u64));
        // Only the final fragment carries the message id.
        assert_eq!(fragment.message_id().is_some(), i == total - 1);
        payload.push_str(fragment.get_str("data").unwrap());
    }

    // The concatenated fragment data is the original logical message.
    let reassembled = Message::from_json(&payload).unwrap();
    assert!(reassembled.is_type("caption"));
    assert_eq!(reassembled.get_str("text").unwrap().len(), 1200);
    assert_eq!(reassembled.message_id(), fragments[total - 1].message_id());

    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn inbound_chunked_message_is_reassembled() {
    let transport = LoopbackTransport::new();
    let mut manager = ConnectionManager::new(transport.clone(), LinkConfig::default());
    let mut events = manager.take_events().unwrap();
    manager.start().unwrap();
    connect_and_ready(&transport, &mut events).await;

    let inner = Message::new("sensor_batch", json!({ "samples": "s".repeat(700) }));
    let payload = inner.to_json();
    let fragments =
        glasslink_core::protocol::chunk::split(&payload, None, 42).unwrap();
    assert!(fragments.len() > 1);

    // Deliver out of order; the final logical message pops out once.
    let mut order: Vec<usize> = (0..fragments.len()).collect();
    order.rotate_left(1);
    for &i in &order {
        transport.inject_message(&fragments[i]);
    }

    let event = wait_event(&mut events, |e| {
        matches!(e, LinkEvent::Message(m) if m.is_type("sensor_batch"))
    })
    .await;
    let LinkEvent::Message(received) = event else {
        unreachable!()
    };
    assert_eq!(received.get_str("samples").unwrap().len(), 700);

    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn photo_transfer_reassembles_and_confirms() {
    let transport = LoopbackTransport::new();
    let mut manager = ConnectionManager::new(transport.clone(), LinkConfig::default());
    let sink = CollectingSink::new();
    manager.set_transfer_sink(sink.clone());
    let mut events = manager.take_events().unwrap();
    manager.start().unwrap();
    connect_and_ready(&transport, &mut events).await;

    transport.inject_message(&Message::new(
        msg::PHOTO_READY,
        json!({ "bleImgId": "img9", "requestId": "req-5", "compressionDurationMs": 120 }),
    ));

    // 1000 bytes arrive as 400/400/200, out of order.
    let chunks: [(u16, usize); 3] = [(2, 200), (0, 400), (1, 400)];
    for (index, len) in chunks {
        let data = vec![index as u8; len];
        transport.inject(
            frame::pack_transfer_packet(&data, index, 1000, "img9.avif", 0, TYPE_PHOTO)
                .unwrap(),
        );
    }

    let confirmation = wait_written(&transport, msg::PHOTO_TRANSFER_COMPLETE, 1).await;
    assert_eq!(confirmation[0].get_str("requestId"), Some("req-5"));
    assert_eq!(confirmation[0].get_str("bleImgId"), Some("img9"));

    let completed = sink.completed.lock().await;
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].request_id.as_deref(), Some("req-5"));
    assert_eq!(completed[0].data.len(), 1000);
    assert!(completed[0].data[..400].iter().all(|&b| b == 0));
    assert!(completed[0].data[800..].iter().all(|&b| b == 2));

    drop(completed);
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn transfer_gap_requests_retransmission() {
    let transport = LoopbackTransport::new();
    let mut manager = ConnectionManager::new(transport.clone(), LinkConfig::default());
    let sink = CollectingSink::new();
    manager.set_transfer_sink(sink.clone());
    let mut events = manager.take_events().unwrap();
    manager.start().unwrap();
    connect_and_ready(&transport, &mut events).await;

    // Packet 1 is lost; the final packet arrives anyway.
    for (index, len) in [(0u16, 400usize), (2, 200)] {
        let data = vec![index as u8; len];
        transport.inject(
            frame::pack_transfer_packet(&data, index, 1000, "log.bin", 0, TYPE_PHOTO).unwrap(),
        );
    }

    let requests = wait_written(&transport, msg::REQUEST_MISSING_PACKETS, 1).await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].get_str("fileName"), Some("log.bin"));
    assert_eq!(requests[0].get("missingPackets").unwrap(), &json!([1]));
    assert!(sink.completed.lock().await.is_empty());

    // The peripheral resends; the gap fills and the transfer completes.
    transport.inject(
        frame::pack_transfer_packet(&vec![1u8; 400], 1, 1000, "log.bin", 0, TYPE_PHOTO)
            .unwrap(),
    );
    wait_written(&transport, msg::TRANSFER_COMPLETE, 1).await;
    assert_eq!(sink.completed.lock().await.len(), 1);

    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn audio_packets_reach_the_decode_sink() {
    struct AudioCollector {
        payloads: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl glasslink_core::AudioSink for AudioCollector {
        async fn on_audio(&self, payload: &[u8]) {
            self.payloads.lock().await.push(payload.to_vec());
        }
    }

    let transport = LoopbackTransport::new();
    let mut manager = ConnectionManager::new(transport.clone(), LinkConfig::default());
    let collector = Arc::new(AudioCollector {
        payloads: Mutex::new(Vec::new()),
    });
    manager.set_audio_decode_sink(collector.clone());
    let mut events = manager.take_events().unwrap();
    manager.start().unwrap();
    connect_and_ready(&transport, &mut events).await;

    transport.inject(vec![0xA0, 0, 1, 2, 3]);
    transport.inject(vec![0xA0, 1, 4, 5, 6]);
    // A gap: logged, never dropped.
    transport.inject(vec![0xA0, 5, 7, 8, 9]);

    timeout(Duration::from_secs(60), async {
        loop {
            if collector.payloads.lock().await.len() == 3 {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("audio packets not forwarded");

    let payloads = collector.payloads.lock().await;
    assert_eq!(payloads[0], vec![1, 2, 3]);
    assert_eq!(payloads[2], vec![7, 8, 9]);

    drop(payloads);
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn reconnection_backs_off_exponentially_then_gives_up() {
    let transport = LoopbackTransport::failing(u32::MAX);
    let mut manager = ConnectionManager::new(transport.clone(), LinkConfig::default());
    let mut events = manager.take_events().unwrap();
    manager.start().unwrap();

    let mut delays = Vec::new();
    loop {
        let event = wait_event(&mut events, |e| {
            matches!(
                e,
                LinkEvent::Reconnecting { .. } | LinkEvent::ConnectionFailed
            )
        })
        .await;
        match event {
            LinkEvent::Reconnecting { delay, .. } => delays.push(delay.as_millis() as u64),
            LinkEvent::ConnectionFailed => break,
            _ => unreachable!(),
        }
    }

    assert_eq!(
        delays,
        vec![1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000, 30000, 30000]
    );
    // Initial attempt plus one per backoff delay, then permanent stop.
    assert_eq!(transport.connect_attempts.load(Ordering::SeqCst), 11);
}

#[tokio::test(start_paused = true)]
async fn link_loss_reconnects_and_recovers() {
    let transport = LoopbackTransport::new();
    let mut manager = ConnectionManager::new(transport.clone(), LinkConfig::default());
    let mut events = manager.take_events().unwrap();
    manager.start().unwrap();
    connect_and_ready(&transport, &mut events).await;

    transport.drop_link();

    let event = wait_event(&mut events, |e| {
        matches!(e, LinkEvent::Reconnecting { .. })
    })
    .await;
    let LinkEvent::Reconnecting { attempt, delay } = event else {
        unreachable!()
    };
    // A session that had fully connected restarts the backoff curve.
    assert_eq!(attempt, 1);
    assert_eq!(delay, Duration::from_secs(1));

    // The fresh session re-runs the readiness handshake.
    connect_and_ready(&transport, &mut events).await;
    assert_eq!(manager.state(), ConnectionState::Connected);

    manager.close().await;
}
