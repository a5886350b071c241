//! Connection manager
//!
//! The single owner of all protocol state. A driver task runs the
//! lifecycle state machine, consumes inbound radio bytes, dispatches
//! classified traffic to the delivery tracker / chunk assembler /
//! transfer manager / audio sequencer, and services outbound send
//! requests from the host.
//!
//! ## Lifecycle
//!
//! ```text
//! start() -> Connecting -> LinkEstablished -> AwaitingPeripheralReady
//!     -> Connected (heartbeats)
//! ```
//!
//! While awaiting readiness the driver transmits a host-ready probe
//! every few seconds: the peripheral's SOC boots asynchronously and no
//! fixed boot latency can be assumed. Radio loss from any state tears
//! down the session (cancelling every timer, purging every map) and
//! schedules a reconnection attempt with exponential backoff; after the
//! attempt bound the manager reports permanent disconnection instead of
//! retrying forever.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::audio::{AudioSequencer, AudioSink};
use crate::config::LinkConfig;
use crate::connection::send_queue::SendQueue;
use crate::connection::{ConnectionState, LinkEvent, Transport};
use crate::error::{LinkError, Result};
use crate::protocol::chunk::{self, ChunkAssembler, ChunkInfo};
use crate::protocol::{frame, msg, Inbound, Message};
use crate::reliability::ids::{self, MessageIdGenerator};
use crate::reliability::DeliveryTracker;
use crate::transfer::{TransferManager, TransferSink};

/// Requests from the host handle to the driver task
enum Command {
    Send {
        message: Message,
        reliable: bool,
        wake: bool,
    },
    Close,
}

/// Why a session ended
enum SessionEnd {
    /// Explicit teardown; never reconnect
    Closed,
    /// Radio-level loss; reconnect with backoff
    LinkLost {
        /// Whether the session had reached `Connected` (resets the
        /// backoff attempt counter)
        was_ready: bool,
    },
}

/// Parts handed to the driver task on start
struct DriverParts {
    command_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
}

/// Handle to one logical connection
///
/// Construct once per connection attempt, register sinks, then
/// [`start`](ConnectionManager::start). [`close`](ConnectionManager::close)
/// is the single place that cancels timers, clears tracking maps, and
/// releases the transport.
pub struct ConnectionManager {
    config: LinkConfig,
    transport: Arc<dyn Transport>,
    transfer_sink: Option<Arc<dyn TransferSink>>,
    audio_decode_sink: Option<Arc<dyn AudioSink>>,
    audio_playback_sink: Option<Arc<dyn AudioSink>>,
    playback_enabled: bool,
    command_tx: mpsc::UnboundedSender<Command>,
    events_rx: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    state_rx: watch::Receiver<ConnectionState>,
    parts: Option<DriverParts>,
    driver: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Create a manager for one logical connection
    pub fn new(transport: Arc<dyn Transport>, config: LinkConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        Self {
            config,
            transport,
            transfer_sink: None,
            audio_decode_sink: None,
            audio_playback_sink: None,
            playback_enabled: false,
            command_tx,
            events_rx: Some(events_rx),
            events_tx,
            state_rx,
            parts: Some(DriverParts {
                command_rx,
                state_tx,
            }),
            driver: None,
        }
    }

    /// Register the completed-transfer sink. Call before [`start`](Self::start).
    pub fn set_transfer_sink(&mut self, sink: Arc<dyn TransferSink>) {
        self.transfer_sink = Some(sink);
    }

    /// Register the audio decode sink. Call before [`start`](Self::start).
    pub fn set_audio_decode_sink(&mut self, sink: Arc<dyn AudioSink>) {
        self.audio_decode_sink = Some(sink);
    }

    /// Register the local playback sink. Call before [`start`](Self::start).
    pub fn set_audio_playback_sink(&mut self, sink: Arc<dyn AudioSink>) {
        self.audio_playback_sink = Some(sink);
    }

    /// Toggle local audio playback. Call before [`start`](Self::start).
    pub fn set_playback_enabled(&mut self, enabled: bool) {
        self.playback_enabled = enabled;
    }

    /// Take the event stream; yields `None` after the first call
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.events_rx.take()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Spawn the driver task and begin connecting
    pub fn start(&mut self) -> Result<()> {
        let parts = self
            .parts
            .take()
            .ok_or_else(|| LinkError::connection("connection manager already started"))?;

        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let mut transfers =
            TransferManager::new(internal_tx, self.config.session_idle_timeout);
        if let Some(sink) = &self.transfer_sink {
            transfers.set_sink(sink.clone());
        }

        let mut audio = AudioSequencer::new();
        if let Some(sink) = &self.audio_decode_sink {
            audio.set_decode_sink(sink.clone());
        }
        if let Some(sink) = &self.audio_playback_sink {
            audio.set_playback_sink(sink.clone());
        }
        audio.set_playback_enabled(self.playback_enabled);

        let driver = Driver {
            config: self.config.clone(),
            transport: self.transport.clone(),
            command_rx: parts.command_rx,
            internal_rx,
            events: self.events_tx.clone(),
            state: parts.state_tx,
            ids: MessageIdGenerator::new(),
            assembler: ChunkAssembler::with_limits(
                chunk::MAX_CHUNK_SETS,
                self.config.session_idle_timeout,
            ),
            transfers,
            audio,
            peripheral_build: 0,
        };

        self.driver = Some(tokio::spawn(driver.run()));
        Ok(())
    }

    /// Queue a fire-and-forget message
    pub fn send(&self, message: Message) -> Result<()> {
        self.command(Command::Send {
            message,
            reliable: false,
            wake: false,
        })
    }

    /// Queue a message with acknowledgment tracking and bounded retry.
    ///
    /// Tracking only engages once the link is `Connected` and the
    /// peripheral firmware reports acknowledgment support; otherwise the
    /// message silently degrades to fire-and-forget.
    pub fn send_reliable(&self, message: Message) -> Result<()> {
        self.command(Command::Send {
            message,
            reliable: true,
            wake: false,
        })
    }

    /// Queue a reliable message that also sets the peripheral's
    /// low-power wake flag
    pub fn send_waking(&self, message: Message) -> Result<()> {
        self.command(Command::Send {
            message,
            reliable: true,
            wake: true,
        })
    }

    /// Tear down the connection: cancel every timer, purge all tracking
    /// state, release the transport. The manager cannot be restarted.
    pub async fn close(&mut self) {
        let _ = self.command_tx.send(Command::Close);
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
    }

    fn command(&self, command: Command) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| LinkError::connection("connection driver is not running"))
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(driver) = &self.driver {
            driver.abort();
        }
    }
}

/// The driver task: exclusive owner of all protocol state
struct Driver {
    config: LinkConfig,
    transport: Arc<dyn Transport>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    /// Control messages produced by protocol components (transfer
    /// confirmations, retransmit requests)
    internal_rx: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<LinkEvent>,
    state: watch::Sender<ConnectionState>,
    ids: MessageIdGenerator,
    assembler: ChunkAssembler,
    transfers: TransferManager,
    audio: AudioSequencer,
    /// Build number reported by the peripheral; gates ACK tracking
    peripheral_build: i64,
}

impl Driver {
    async fn run(mut self) {
        info!("Connection driver started");
        let mut attempt: u32 = 0;

        loop {
            match self.run_session().await {
                SessionEnd::Closed => break,
                SessionEnd::LinkLost { was_ready } => {
                    if was_ready {
                        attempt = 0;
                    }
                    if attempt >= self.config.max_reconnect_attempts {
                        warn!(
                            "Giving up after {} reconnection attempts",
                            self.config.max_reconnect_attempts
                        );
                        self.emit(LinkEvent::ConnectionFailed);
                        break;
                    }
                    let delay = self.config.reconnect_delay(attempt);
                    attempt += 1;
                    info!(
                        "Reconnecting in {:?} (attempt {}/{})",
                        delay, attempt, self.config.max_reconnect_attempts
                    );
                    self.emit(LinkEvent::Reconnecting { attempt, delay });
                    if self.wait_or_close(delay).await {
                        break;
                    }
                }
            }
        }

        info!("Connection driver stopped");
    }

    /// One connect-to-teardown cycle
    async fn run_session(&mut self) -> SessionEnd {
        self.set_state(ConnectionState::Connecting);

        let mut inbound = match self.connect_phase().await {
            Ok(Some(rx)) => rx,
            Ok(None) => {
                self.set_state(ConnectionState::Disconnected);
                return SessionEnd::Closed;
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                return SessionEnd::LinkLost { was_ready: false };
            }
        };

        self.set_state(ConnectionState::LinkEstablished);

        match self.transport.request_mtu(self.config.preferred_mtu).await {
            Ok(mtu) => {
                info!("Negotiated MTU: {} bytes", mtu);
                if mtu < 64 {
                    warn!("MTU of {} may be too small for streamed audio packets", mtu);
                }
            }
            Err(e) => {
                // The default MTU still carries protocol traffic, just
                // inefficiently.
                warn!("MTU negotiation failed, continuing with default: {}", e);
            }
        }

        if let Err(e) = self.transport.enable_notifications().await {
            error!("Failed to enable notifications: {}", e);
            self.transport.disconnect().await;
            self.set_state(ConnectionState::Disconnected);
            return SessionEnd::LinkLost { was_ready: false };
        }

        // Per-session moving parts; torn down together at session end.
        let send_queue = SendQueue::start(
            self.transport.clone(),
            self.config.min_send_interval,
            self.config.write_failure_backoff,
        );
        let tracker = DeliveryTracker::new(
            send_queue.sender(),
            self.events.clone(),
            self.config.max_retry_attempts,
        );

        self.set_state(ConnectionState::AwaitingPeripheralReady);

        let mut probe_timer = interval(self.config.readiness_probe_interval);
        probe_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat_timer = interval(self.config.heartbeat_interval);
        heartbeat_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep_timer = interval(self.config.sweep_interval);
        sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut heartbeat_count: u32 = 0;
        let mut was_ready = false;

        loop {
            tokio::select! {
                biased;

                command = self.command_rx.recv() => {
                    match command {
                        None | Some(Command::Close) => {
                            info!("Closing connection");
                            self.teardown(&send_queue, &tracker).await;
                            self.transport.disconnect().await;
                            self.set_state(ConnectionState::Disconnected);
                            return SessionEnd::Closed;
                        }
                        Some(Command::Send { message, reliable, wake }) => {
                            self.dispatch_send(message, reliable, wake, &send_queue, &tracker)
                                .await;
                        }
                    }
                }

                Some(message) = self.internal_rx.recv() => {
                    self.dispatch_send(message, true, false, &send_queue, &tracker).await;
                }

                received = inbound.recv() => {
                    match received {
                        None => {
                            warn!("Radio link lost");
                            self.teardown(&send_queue, &tracker).await;
                            self.set_state(ConnectionState::Disconnected);
                            return SessionEnd::LinkLost { was_ready };
                        }
                        Some(bytes) => {
                            let newly_ready = self
                                .handle_inbound(&bytes, &send_queue, &tracker)
                                .await;
                            if newly_ready {
                                was_ready = true;
                                heartbeat_count = 0;
                                heartbeat_timer.reset();
                            }
                        }
                    }
                }

                _ = probe_timer.tick() => {
                    if *self.state.borrow() == ConnectionState::AwaitingPeripheralReady {
                        debug!("Probing peripheral readiness");
                        let probe = Message::new(
                            msg::HOST_READY,
                            json!({ "timestamp": ids::unix_millis() }),
                        );
                        self.dispatch_send(probe, false, true, &send_queue, &tracker).await;
                    }
                }

                _ = heartbeat_timer.tick() => {
                    if self.state.borrow().is_connected() {
                        heartbeat_count += 1;
                        debug!("Sending heartbeat #{}", heartbeat_count);
                        let ping = Message::new(msg::PING, json!({}));
                        self.dispatch_send(ping, false, false, &send_queue, &tracker).await;

                        // Low-value polling is amortized onto the
                        // heartbeat cadence.
                        if heartbeat_count % self.config.battery_every_n_heartbeats == 0 {
                            let request = Message::new(msg::BATTERY_REQUEST, json!({}));
                            self.dispatch_send(request, false, false, &send_queue, &tracker)
                                .await;
                        }
                    }
                }

                _ = sweep_timer.tick() => {
                    self.assembler.evict_idle();
                    self.transfers.evict_idle();
                }
            }
        }
    }

    /// Radio connect with a hard timeout, staying responsive to close
    /// requests. `Ok(None)` means the manager was closed mid-attempt.
    async fn connect_phase(&mut self) -> Result<Option<mpsc::UnboundedReceiver<Vec<u8>>>> {
        info!(
            "Connecting to peripheral (timeout {:?})",
            self.config.connect_timeout
        );
        let connect = timeout(self.config.connect_timeout, self.transport.connect());
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(Ok(rx)) => Ok(Some(rx)),
                        Ok(Err(e)) => {
                            warn!("Radio connect failed: {}", e);
                            Err(e)
                        }
                        Err(_) => {
                            warn!(
                                "Radio connect timed out after {:?}",
                                self.config.connect_timeout
                            );
                            Err(LinkError::Timeout)
                        }
                    };
                }
                command = self.command_rx.recv() => {
                    match command {
                        None | Some(Command::Close) => {
                            self.transport.disconnect().await;
                            return Ok(None);
                        }
                        Some(Command::Send { message, .. }) => {
                            warn!(
                                "Dropping '{}' sent while the link is down",
                                message.message_type()
                            );
                        }
                    }
                }
            }
        }
    }

    /// Encode, chunk if oversized, queue, and optionally track a message
    async fn dispatch_send(
        &mut self,
        mut message: Message,
        reliable: bool,
        wake: bool,
        send_queue: &SendQueue,
        tracker: &DeliveryTracker,
    ) {
        // ACK tracking needs a connected link and firmware that answers
        // with acknowledgments; everything else is fire-and-forget.
        let track = reliable
            && self.state.borrow().is_connected()
            && self.peripheral_build >= self.config.min_ack_build;
        let message_id = if track {
            let id = self.ids.next();
            message.set_message_id(id);
            Some(id)
        } else {
            None
        };

        let wrapped = match frame::encode_command(&message, wake) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode '{}': {}", message.message_type(), e);
                return;
            }
        };

        if !chunk::needs_chunking(wrapped.len()) {
            if let Some(id) = message_id {
                tracker
                    .track(id, vec![wrapped.clone()], self.config.ack_timeout)
                    .await;
            }
            send_queue.enqueue(wrapped);
            return;
        }

        let payload = message.to_json();
        let fragments = match chunk::split(&payload, message_id, ids::unix_millis()) {
            Ok(fragments) => fragments,
            Err(e) => {
                error!("Failed to chunk '{}': {}", message.message_type(), e);
                return;
            }
        };

        let mut frames = Vec::with_capacity(fragments.len());
        for (i, fragment) in fragments.iter().enumerate() {
            // Waking the peripheral once is enough.
            match frame::encode_command(fragment, wake && i == 0) {
                Ok(bytes) => frames.push(bytes),
                Err(e) => {
                    error!("Failed to encode fragment {}: {}", i, e);
                    return;
                }
            }
        }

        debug!(
            "Sending '{}' ({} bytes wrapped) as {} fragments",
            message.message_type(),
            wrapped.len(),
            frames.len()
        );

        if let Some(id) = message_id {
            let ack_timeout = self.config.ack_timeout_for(wrapped.len());
            tracker.track(id, frames.clone(), ack_timeout).await;
        }

        for (i, frame_bytes) in frames.into_iter().enumerate() {
            if i > 0 {
                // Deliberate pacing between fragments on top of the
                // queue's per-write rate limit.
                sleep(self.config.chunk_pacing).await;
            }
            send_queue.enqueue(frame_bytes);
        }
    }

    /// Classify one inbound buffer and route it. Returns true when the
    /// peripheral just became ready.
    async fn handle_inbound(
        &mut self,
        bytes: &[u8],
        send_queue: &SendQueue,
        tracker: &DeliveryTracker,
    ) -> bool {
        match frame::classify(bytes) {
            Err(e) => {
                warn!("Discarding {} inbound bytes: {}", bytes.len(), e);
                false
            }
            Ok(Inbound::Unrecognized) => {
                debug!("Ignoring unrecognized {} byte buffer", bytes.len());
                false
            }
            Ok(Inbound::Audio(packet)) => {
                self.audio.ingest(packet).await;
                false
            }
            Ok(Inbound::Bulk(packet)) => {
                self.transfers.ingest(packet).await;
                false
            }
            Ok(Inbound::Control(message)) => {
                self.handle_control(message, send_queue, tracker).await
            }
        }
    }

    /// Consume a control message; chunk fragments loop back through
    /// reassembly until a full logical message emerges.
    async fn handle_control(
        &mut self,
        message: Message,
        send_queue: &SendQueue,
        tracker: &DeliveryTracker,
    ) -> bool {
        let mut current = Some(message);
        let mut newly_ready = false;

        while let Some(message) = current.take() {
            if message.is_type(msg::CHUNK) {
                match ChunkInfo::from_message(&message) {
                    Ok(Some(info)) => {
                        if let Some(payload) = self.assembler.add(info) {
                            match Message::from_json(&payload) {
                                Ok(inner) => current = Some(inner),
                                Err(e) => {
                                    warn!("Reassembled payload is not a message: {}", e)
                                }
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Dropping malformed chunk: {}", e),
                }
                continue;
            }
            newly_ready |= self.consume_control(message, send_queue, tracker).await;
        }

        newly_ready
    }

    async fn consume_control(
        &mut self,
        message: Message,
        send_queue: &SendQueue,
        tracker: &DeliveryTracker,
    ) -> bool {
        // Peripheral messages stamped with an id expect an acknowledgment.
        if !message.is_type(msg::ACK) {
            if let Some(id) = message.message_id() {
                let ack = Message::new(
                    msg::ACK,
                    json!({ "mId": id, "timestamp": ids::unix_millis() }),
                );
                self.dispatch_send(ack, false, false, send_queue, tracker).await;
            }
        }

        let message_type = message.message_type().to_string();
        match message_type.as_str() {
            msg::ACK => {
                match message.get_u64("mId") {
                    Some(id) => tracker.acknowledge(id).await,
                    None => warn!("ACK without a message id"),
                }
                false
            }

            msg::PERIPHERAL_READY => {
                if *self.state.borrow() == ConnectionState::AwaitingPeripheralReady {
                    info!("Peripheral SOC is booted and ready");
                    self.set_state(ConnectionState::Connected);
                    self.emit(LinkEvent::PeripheralReady);

                    // SOC-dependent initialization: learn the firmware
                    // capabilities and refresh status.
                    let version = Message::new(msg::VERSION_REQUEST, json!({}));
                    self.dispatch_send(version, false, false, send_queue, tracker).await;
                    let battery = Message::new(msg::BATTERY_REQUEST, json!({}));
                    self.dispatch_send(battery, false, false, send_queue, tracker).await;
                    true
                } else {
                    debug!(
                        "Readiness message in state {}, ignoring",
                        *self.state.borrow()
                    );
                    false
                }
            }

            msg::VERSION_INFO => {
                // The build number gates acknowledgment support.
                let build = message
                    .get_i64("build_number")
                    .or_else(|| message.get_str("build_number").and_then(|s| s.parse().ok()))
                    .unwrap_or(0);
                info!("Peripheral build number: {}", build);
                self.peripheral_build = build;
                self.emit(LinkEvent::Message(message));
                false
            }

            msg::PONG => {
                debug!("Heartbeat answered");
                self.emit(LinkEvent::HeartbeatAck);
                false
            }

            msg::BATTERY_STATUS => {
                let level = message.get_i64("level").unwrap_or(-1);
                let charging = message
                    .get("charging")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                debug!("Battery: {}%, charging: {}", level, charging);
                self.emit(LinkEvent::BatteryStatus { level, charging });
                false
            }

            msg::PHOTO_READY => {
                let transfer_id = message.get_str("bleImgId").unwrap_or_default().to_string();
                let request_id = message.get_str("requestId").unwrap_or_default().to_string();
                if transfer_id.is_empty() {
                    warn!("Photo announcement without an image id");
                } else {
                    // A declared size makes this a full announcement;
                    // re-announcing an id restarts its session.
                    if let Some(size) = message.get_u64("fileSize") {
                        self.transfers.announce(&transfer_id, &transfer_id, size as u32);
                    }
                    self.transfers.register_photo_request(transfer_id, request_id);
                }
                false
            }

            msg::TRANSFER_TIMEOUT | msg::TRANSFER_FAILED => {
                if let Some(file_name) = message.get_str("fileName") {
                    let transfer_id = file_name
                        .rfind('.')
                        .filter(|&dot| dot > 0)
                        .map(|dot| &file_name[..dot])
                        .unwrap_or(file_name)
                        .to_string();
                    self.transfers.abort(&transfer_id, &message_type);
                } else {
                    warn!("{} notice without a file name", message_type);
                }
                false
            }

            // MCU-native heartbeat and battery voltage reports carry
            // charge state in their B body.
            "sr_hrt" | "sr_batv" if message.is_native() => {
                if let Some(body) = message.get("B") {
                    let level = body.get("pt").and_then(serde_json::Value::as_i64);
                    let charging = body
                        .get("charg")
                        .and_then(serde_json::Value::as_i64)
                        .map(|c| c == 1)
                        .or_else(|| {
                            body.get("vt")
                                .and_then(serde_json::Value::as_i64)
                                .map(|vt| vt > 4000)
                        });
                    if let Some(level) = level {
                        self.emit(LinkEvent::BatteryStatus {
                            level,
                            charging: charging.unwrap_or(false),
                        });
                        return false;
                    }
                }
                self.emit(LinkEvent::Message(message));
                false
            }

            // Everything else belongs to business logic.
            _ => {
                self.emit(LinkEvent::Message(message));
                false
            }
        }
    }

    /// The single teardown path: cancel timers, purge tracking state
    async fn teardown(&mut self, send_queue: &SendQueue, tracker: &DeliveryTracker) {
        tracker.purge().await;
        send_queue.shutdown();
        self.assembler.clear();
        self.transfers.clear();
        self.audio.reset();
    }

    /// Sleep out a backoff delay; returns true if a close arrived
    async fn wait_or_close(&mut self, delay: std::time::Duration) -> bool {
        let backoff = sleep(delay);
        tokio::pin!(backoff);

        loop {
            tokio::select! {
                _ = &mut backoff => return false,
                command = self.command_rx.recv() => {
                    match command {
                        None | Some(Command::Close) => {
                            self.set_state(ConnectionState::Disconnected);
                            return true;
                        }
                        Some(Command::Send { message, .. }) => {
                            warn!(
                                "Dropping '{}' sent while the link is down",
                                message.message_type()
                            );
                        }
                    }
                }
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let current = *self.state.borrow();
        if current == next {
            return;
        }
        if !current.can_transition(next) {
            warn!("Rejecting invalid state transition {} -> {}", current, next);
            return;
        }
        info!("Connection state: {} -> {}", current, next);
        let _ = self.state.send(next);
        self.emit(LinkEvent::StateChanged {
            from: current,
            to: next,
        });
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }
}
