//! In-process simulated transport — the reference Connector implementation.
//!
//! Drives a fully in-memory controller through the same frame codec the
//! physical transports use, so queue semantics, framing, retry, and signal
//! behavior can be exercised without hardware. Time-consuming operations are
//! compressed; fault injection knobs reproduce the failure modes of flaky
//! platform stacks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::Notify;

use lantern_core::clock::SharedClock;
use lantern_core::config::LanternConfig;
use lantern_core::wire::{
    decode_frame, decode_hop_request, encode_frame, encode_hop_response, FrameHeader,
    FRAME_CLOCK, FRAME_REQUEST, FRAME_SYNC, HEADER_SIZE, HOP_RESPONSE,
};

use crate::connector::{
    any_match, Connector, ConnectorError, ConnectorKind, ConnectorSignal, ConnectorState,
    Criteria, DeviceInfo, OtaStatus, SignalGuard, SignalSink,
};
use crate::framing::{self, FrameChannel};

// ── The simulated device ──────────────────────────────────────────────────────

/// The remote side of the link: an in-memory controller.
///
/// Reassembles incoming chunks by byte count (chunk boundaries mean nothing),
/// verifies frames, and answers clock and request frames the way firmware
/// does. Tests hold a handle to inspect what physically arrived.
pub struct SimDevice {
    info: DeviceInfo,
    /// The device's own logical clock.
    clock: SharedClock,
    /// Complete verified frames, in arrival order.
    frames: Mutex<Vec<(FrameHeader, Bytes)>>,
    /// Chunk reassembly buffer.
    rx_buf: Mutex<BytesMut>,
    /// In-band responses awaiting a read.
    responses: Mutex<VecDeque<Bytes>>,
    response_ready: Notify,
    /// Peer controllers reachable behind this device, for hop routing.
    peers: Mutex<Vec<u32>>,
    /// Fault injection: the next N chunk writes fail at the transport.
    fail_chunk_writes: AtomicU32,
    /// Fault injection: swallow responses instead of sending them.
    drop_responses: AtomicBool,
}

impl SimDevice {
    pub fn new(info: DeviceInfo) -> Arc<Self> {
        Arc::new(Self {
            info,
            clock: SharedClock::new(),
            frames: Mutex::new(Vec::new()),
            rx_buf: Mutex::new(BytesMut::new()),
            responses: Mutex::new(VecDeque::new()),
            response_ready: Notify::new(),
            peers: Mutex::new(Vec::new()),
            fail_chunk_writes: AtomicU32::new(0),
            drop_responses: AtomicBool::new(false),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(DeviceInfo {
            address: 0x0101,
            name: "sim-controller".into(),
            product_code: 1,
            rssi: -55,
        })
    }

    pub fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    /// The device's logical clock — tests set this to model a remote timeline.
    pub fn clock(&self) -> SharedClock {
        self.clock.clone()
    }

    /// Every complete verified frame the device has received.
    pub fn frames_received(&self) -> Vec<(FrameHeader, Bytes)> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of physical frames received — one per merged write.
    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Fail the next `n` chunk writes at the transport level.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_chunk_writes.store(n, Ordering::SeqCst);
    }

    /// Swallow responses so requests run into their timeout.
    pub fn set_drop_responses(&self, drop: bool) {
        self.drop_responses.store(drop, Ordering::SeqCst);
    }

    /// Register a peer controller reachable behind this device.
    pub fn add_peer(&self, address: u32) {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        if !peers.contains(&address) {
            peers.push(address);
        }
    }

    pub fn remove_peer(&self, address: u32) {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|a| *a != address);
    }

    fn routes_to(&self, address: u32) -> bool {
        address == self.info.address
            || self
                .peers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&address)
    }

    /// Feed one chunk. Returns notification frames the device wants pushed
    /// back over the link (hop-request responses).
    fn ingest_chunk(&self, chunk: &[u8]) -> Result<Vec<Bytes>, ConnectorError> {
        if self.fail_chunk_writes.load(Ordering::SeqCst) > 0 {
            self.fail_chunk_writes.fetch_sub(1, Ordering::SeqCst);
            return Err(ConnectorError::WriteFailed);
        }

        let mut notifications = Vec::new();
        let mut buf = self.rx_buf.lock().unwrap_or_else(|e| e.into_inner());
        buf.put_slice(chunk);

        loop {
            match decode_frame(&buf) {
                Ok(Some((header, payload))) => {
                    let consumed = HEADER_SIZE + payload.len();
                    let _ = buf.split_to(consumed);
                    if let Some(reply) = self.handle_frame(header, payload) {
                        notifications.push(reply);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // Firmware discards the garbled tail; the sender sees a
                    // failed write and retries.
                    tracing::debug!(error = %e, "sim device discarding corrupt frame");
                    buf.clear();
                    return Err(ConnectorError::WriteFailed);
                }
            }
        }
        Ok(notifications)
    }

    /// Returns an unsolicited notification frame to push, if any.
    fn handle_frame(&self, header: FrameHeader, payload: Bytes) -> Option<Bytes> {
        let frame_type = { header.frame_type };
        let expects_response = { header.receive_timeout_ms } > 0;
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((header, payload.clone()));

        match frame_type {
            FRAME_CLOCK => {
                if payload.len() >= 8 {
                    let millis = i64::from_le_bytes(payload[..8].try_into().ok()?);
                    self.clock.set_millis(millis);
                    None
                } else {
                    self.respond(Bytes::copy_from_slice(&self.clock.millis().to_le_bytes()));
                    None
                }
            }
            FRAME_REQUEST => {
                if expects_response {
                    // In-band echo, the sim firmware's request handler.
                    self.respond(payload);
                    None
                } else {
                    self.route_hop_message(&payload)
                }
            }
            FRAME_SYNC => {
                if let Ok(record) = lantern_core::wire::SyncRecord::read(&payload) {
                    self.clock.apply_sync(&record);
                }
                None
            }
            _ => None,
        }
    }

    /// Firmware-side hop routing. Every address on the path must be this
    /// device or a registered peer; the final hop answers (the sim echoes).
    /// Responses passing through are recorded but not re-routed.
    fn route_hop_message(&self, body: &Bytes) -> Option<Bytes> {
        if body.first() == Some(&HOP_RESPONSE) {
            return None;
        }
        let (ticket, path, payload) = decode_hop_request(body)?;
        if path.is_empty() {
            return self.hop_reply(ticket, 1, &[]);
        }
        for address in &path {
            if !self.routes_to(*address) {
                tracing::debug!(
                    address = format_args!("0x{address:04x}"),
                    "sim device cannot route hop"
                );
                return self.hop_reply(ticket, 2, &[]);
            }
        }
        self.hop_reply(ticket, 0, &payload)
    }

    fn hop_reply(&self, ticket: u32, code: u8, payload: &[u8]) -> Option<Bytes> {
        let body = encode_hop_response(ticket, code, payload);
        encode_frame(FRAME_REQUEST, 0, &body).ok().map(BytesMut::freeze)
    }

    fn respond(&self, payload: Bytes) {
        if self.drop_responses.load(Ordering::SeqCst) {
            return;
        }
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(payload);
        self.response_ready.notify_one();
    }

    async fn next_response(&self) -> Bytes {
        loop {
            if let Some(response) = self
                .responses
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
            {
                return response;
            }
            self.response_ready.notified().await;
        }
    }
}

// ── Channel binding ───────────────────────────────────────────────────────────

struct SimChannel {
    device: Arc<SimDevice>,
    signals: SignalSink,
    chunk_size: usize,
}

#[async_trait]
impl FrameChannel for SimChannel {
    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    async fn write_chunk(&self, chunk: &[u8]) -> Result<(), ConnectorError> {
        let notifications = self.device.ingest_chunk(chunk)?;
        for frame in notifications {
            let _ = self.signals.send(ConnectorSignal::Notify(frame));
        }
        Ok(())
    }

    async fn read_response(&self) -> Result<Bytes, ConnectorError> {
        Ok(self.device.next_response().await)
    }
}

// ── The connector ─────────────────────────────────────────────────────────────

/// Reference transport backend: the full Connector contract against a
/// [`SimDevice`].
pub struct SimConnector {
    device: Arc<SimDevice>,
    config: LanternConfig,
    signals: SignalSink,
    guard: SignalGuard,
    channel: SimChannel,
    state: Mutex<ConnectorState>,
    selected: Mutex<Option<DeviceInfo>>,
    /// One write at a time; overlap is a runtime bug surfaced as WriteFailed.
    writing: AtomicBool,
    canceled: AtomicBool,
    cancel_notify: Notify,
    /// Fault injection: make `select` wait for the full caller timeout, as a
    /// selection dialog awaiting a user would.
    hold_selection: AtomicBool,
}

impl SimConnector {
    pub fn new(device: Arc<SimDevice>, config: LanternConfig, signals: SignalSink) -> Self {
        let channel = SimChannel {
            device: device.clone(),
            signals: signals.clone(),
            chunk_size: config.link.chunk_size,
        };
        Self {
            device,
            config,
            signals,
            guard: SignalGuard::new(),
            channel,
            state: Mutex::new(ConnectorState::Unselected),
            selected: Mutex::new(None),
            writing: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            hold_selection: AtomicBool::new(false),
        }
    }

    pub fn set_hold_selection(&self, hold: bool) {
        self.hold_selection.store(hold, Ordering::SeqCst);
    }

    pub fn device(&self) -> Arc<SimDevice> {
        self.device.clone()
    }

    /// Replay a platform "connected" event. Flaky stacks deliver these in
    /// storms; the signal guard must collapse them.
    pub fn simulate_platform_connect_event(&self) {
        self.guard.emit_connected(&self.signals);
    }

    pub fn simulate_platform_disconnect_event(&self) {
        self.guard.emit_disconnected(&self.signals);
    }

    /// Push a raw notification frame from the device to the runtime, as a
    /// BLE characteristic notification would arrive.
    pub fn push_notification(&self, frame: Bytes) {
        let _ = self.signals.send(ConnectorSignal::Notify(frame));
    }

    /// A peer joins the controller network behind the device: it becomes
    /// routable and the membership change is signaled.
    pub fn simulate_peer_join(&self, address: u32) {
        self.device.add_peer(address);
        let _ = self.signals.send(ConnectorSignal::PeerConnected(address));
    }

    pub fn simulate_peer_leave(&self, address: u32) {
        self.device.remove_peer(address);
        let _ = self.signals.send(ConnectorSignal::PeerDisconnected(address));
    }

    fn set_state(&self, state: ConnectorState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn state(&self) -> ConnectorState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_connected(&self) -> Result<(), ConnectorError> {
        if self.state() == ConnectorState::Connected {
            Ok(())
        } else {
            Err(ConnectorError::DeviceDisconnected)
        }
    }

    /// Serialize the physical write path. Returns a guard that releases on drop.
    fn begin_write(&self) -> Result<WriteGuard<'_>, ConnectorError> {
        if self
            .writing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ConnectorError::WriteFailed);
        }
        Ok(WriteGuard { flag: &self.writing })
    }

    /// Simulation stand-in for a user-facing wait; cancellable.
    ///
    /// A cancel that lands before the wait starts still takes effect — the
    /// flag covers the gap between `cancel()` and the next poll.
    async fn cancellable_delay(&self, duration: Duration) -> Result<(), ConnectorError> {
        if self.canceled.swap(false, Ordering::SeqCst) {
            return Err(ConnectorError::UserCanceledSelection);
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancel_notify.notified() => {
                self.canceled.store(false, Ordering::SeqCst);
                Err(ConnectorError::UserCanceledSelection)
            }
        }
    }

    async fn force_disconnect(&self) {
        self.set_state(ConnectorState::Disconnecting);
        self.set_state(ConnectorState::Selected);
        self.guard.emit_disconnected(&self.signals);
    }
}

struct WriteGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// The simulation compresses real-world waits down to this.
const SIM_LATENCY: Duration = Duration::from_millis(5);

#[async_trait]
impl Connector for SimConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Simulated
    }

    async fn select(
        &self,
        criteria: &[Criteria],
        timeout: Duration,
    ) -> Result<Option<DeviceInfo>, ConnectorError> {
        let wait = if self.hold_selection.load(Ordering::SeqCst) {
            timeout
        } else {
            SIM_LATENCY
        };
        self.cancellable_delay(wait).await?;
        if any_match(criteria, &self.device.info) {
            let info = self.device.info();
            *self.selected.lock().unwrap_or_else(|e| e.into_inner()) = Some(info.clone());
            self.set_state(ConnectorState::Selected);
            Ok(Some(info))
        } else {
            Err(ConnectorError::SelectionFailed)
        }
    }

    async fn auto_select(
        &self,
        criteria: &[Criteria],
        scan_timeout: Duration,
        timeout: Duration,
    ) -> Result<Option<DeviceInfo>, ConnectorError> {
        let found = self.scan(criteria, scan_timeout).await?;
        match found.into_iter().next() {
            Some(info) => {
                let matched = vec![Criteria {
                    address: Some(info.address),
                    ..Default::default()
                }];
                self.select(&matched, timeout).await
            }
            None => Err(ConnectorError::SelectionFailed),
        }
    }

    async fn selected(&self) -> Option<DeviceInfo> {
        self.selected.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn unselect(&self) -> Result<(), ConnectorError> {
        if self.state() == ConnectorState::Connected {
            self.disconnect().await?;
        }
        *self.selected.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.set_state(ConnectorState::Unselected);
        Ok(())
    }

    async fn scan(
        &self,
        criteria: &[Criteria],
        duration: Duration,
    ) -> Result<Vec<DeviceInfo>, ConnectorError> {
        // Cancel during a scan yields the partial results, not an error.
        let _ = self
            .cancellable_delay(duration.min(Duration::from_millis(20)))
            .await;
        if any_match(criteria, &self.device.info) {
            Ok(vec![self.device.info()])
        } else {
            Ok(Vec::new())
        }
    }

    async fn connect(&self, timeout: Duration) -> Result<DeviceInfo, ConnectorError> {
        let info = self
            .selected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(ConnectorError::DeviceNotSelected)?;

        self.set_state(ConnectorState::Connecting);
        if tokio::time::timeout(timeout, tokio::time::sleep(SIM_LATENCY))
            .await
            .is_err()
        {
            self.set_state(ConnectorState::Selected);
            return Err(ConnectorError::ConnectionTimeout);
        }
        self.set_state(ConnectorState::Connected);
        self.guard.emit_connected(&self.signals);
        tracing::debug!(address = format_args!("0x{:04x}", info.address), "sim connected");
        Ok(info)
    }

    async fn connected(&self) -> Option<DeviceInfo> {
        if self.state() == ConnectorState::Connected {
            self.selected.lock().unwrap_or_else(|e| e.into_inner()).clone()
        } else {
            None
        }
    }

    async fn disconnect(&self) -> Result<(), ConnectorError> {
        if self.state() != ConnectorState::Connected {
            return Ok(());
        }
        self.set_state(ConnectorState::Disconnecting);
        tokio::time::sleep(SIM_LATENCY).await;
        self.set_state(ConnectorState::Selected);
        self.guard.emit_disconnected(&self.signals);
        Ok(())
    }

    async fn deliver(&self, payload: &[u8], timeout: Duration) -> Result<(), ConnectorError> {
        self.ensure_connected()?;
        let _guard = self.begin_write()?;
        framing::deliver_frame(
            &self.channel,
            lantern_core::wire::FRAME_EXECUTE,
            0,
            payload,
            timeout,
            &self.config.link,
        )
        .await
    }

    async fn transmit(&self, payload: &[u8], timeout: Duration) -> Result<(), ConnectorError> {
        self.ensure_connected()?;
        let _guard = self.begin_write()?;
        framing::transmit_frame(
            &self.channel,
            lantern_core::wire::FRAME_EXECUTE,
            payload,
            timeout,
            &self.config.link,
        )
        .await
    }

    async fn request(
        &self,
        payload: &[u8],
        read_response: bool,
        timeout: Duration,
    ) -> Result<Bytes, ConnectorError> {
        self.ensure_connected()?;
        let result = {
            let _guard = self.begin_write()?;
            if read_response {
                framing::request_frame(
                    &self.channel,
                    FRAME_REQUEST,
                    payload,
                    timeout,
                    &self.config.link,
                )
                .await
            } else {
                framing::deliver_frame(
                    &self.channel,
                    FRAME_REQUEST,
                    0,
                    payload,
                    timeout,
                    &self.config.link,
                )
                .await
                .map(|()| Bytes::new())
            }
        };
        if matches!(result, Err(ConnectorError::ResponseTimeout)) {
            // A missed response leaves the half-duplex channel ambiguous.
            self.force_disconnect().await;
        }
        result
    }

    async fn read_clock(&self) -> Result<i64, ConnectorError> {
        self.ensure_connected()?;
        let _guard = self.begin_write()?;
        let response = framing::request_frame(
            &self.channel,
            FRAME_CLOCK,
            &[],
            self.config.timeouts.clock(),
            &self.config.link,
        )
        .await
        .map_err(|_| ConnectorError::ClockReadFailed)?;
        let bytes: [u8; 8] = response
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .ok_or(ConnectorError::ClockReadFailed)?;
        Ok(i64::from_le_bytes(bytes))
    }

    async fn write_clock(&self, millis: i64) -> Result<(), ConnectorError> {
        self.ensure_connected()?;
        let _guard = self.begin_write()?;
        framing::deliver_frame(
            &self.channel,
            FRAME_CLOCK,
            0,
            &millis.to_le_bytes(),
            self.config.timeouts.clock(),
            &self.config.link,
        )
        .await
        .map_err(|_| ConnectorError::ClockWriteFailed)
    }

    async fn update_firmware(&self, firmware: &[u8]) -> Result<(), ConnectorError> {
        self.ensure_connected()?;
        let _guard = self.begin_write()?;
        let _ = self.signals.send(ConnectorSignal::OtaStatus(OtaStatus::Begin));

        let total = firmware.len();
        let mut written = 0usize;
        for block in firmware.chunks(self.config.link.chunk_size) {
            let result = framing::deliver_frame(
                &self.channel,
                lantern_core::wire::FRAME_OTA,
                0,
                block,
                self.config.timeouts.firmware(),
                &self.config.link,
            )
            .await;
            if result.is_err() {
                let _ = self.signals.send(ConnectorSignal::OtaStatus(OtaStatus::Fail));
                return Err(ConnectorError::UpdateFailed);
            }
            written += block.len();
            let _ = self
                .signals
                .send(ConnectorSignal::OtaProgress { written, total });
        }

        let _ = self.signals.send(ConnectorSignal::OtaStatus(OtaStatus::Success));
        tracing::info!(bytes = total, "sim firmware update complete");
        Ok(())
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_waiters();
    }

    async fn destroy(&self) {
        let _ = self.unselect().await;
    }
}
