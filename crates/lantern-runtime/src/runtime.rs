//! The command queue and its drain loop.
//!
//! Every network-facing operation enqueues a typed command and awaits its
//! result slot. A single drain task per runtime walks the queue in FIFO order
//! against the one active connector, so the transport never sees overlapping
//! writes. The drain task exists only while the queue is non-empty; the first
//! enqueue after it goes idle spawns a fresh one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use lantern_core::wire::{
    decode_frame, decode_hop_request, decode_hop_response, encode_hop_request,
    encode_hop_response, FRAME_CLOCK, FRAME_EXECUTE, FRAME_REQUEST, FRAME_SYNC,
};
use lantern_core::{LanternConfig, SharedClock, SyncRecord};
use lantern_link::{
    Connector, ConnectorKind, ConnectorSignal, Criteria, DeviceInfo, SignalSink,
};

use crate::command::{Command, CommandKind, CommandOutcome, CommandResult, RuntimeError};
use crate::correlator::{Correlator, CorrelatorError, HopDescriptor};
use crate::engine::{Connection, ControllerEngine};
use crate::events::{EventBus, RuntimeEvent};

/// Builds a transport backend on demand. Swaps happen lazily, at drain time.
pub type ConnectorFactory = Arc<
    dyn Fn(ConnectorKind, LanternConfig, SignalSink) -> Result<Arc<dyn Connector>, RuntimeError>
        + Send
        + Sync,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainState {
    Idle,
    Draining,
}

struct QueueState {
    queue: VecDeque<Command>,
    drain: DrainState,
}

struct Shared {
    /// Self-handle for spawning the drain task from enqueue.
    me: Weak<Shared>,
    config: LanternConfig,
    clock: SharedClock,
    events: EventBus,
    correlator: Correlator,
    engine: Arc<dyn ControllerEngine>,
    factory: ConnectorFactory,
    signals: SignalSink,
    queue: Mutex<QueueState>,
    desired_kind: Mutex<Option<ConnectorKind>>,
    active: Mutex<Option<Arc<dyn Connector>>>,
    last_tngl_fingerprint: AtomicU32,
}

/// Handle to one controller link. Cloneable; all clones share the queue,
/// the connector and the event bus.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<Shared>,
}

impl Runtime {
    /// Must be called from within a tokio runtime; spawns the signal pump.
    pub fn new(
        config: LanternConfig,
        engine: Arc<dyn ControllerEngine>,
        factory: ConnectorFactory,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            config,
            clock: SharedClock::new(),
            events: EventBus::default(),
            correlator: Correlator::new(),
            engine,
            factory,
            signals: signal_tx,
            queue: Mutex::new(QueueState {
                queue: VecDeque::new(),
                drain: DrainState::Idle,
            }),
            desired_kind: Mutex::new(None),
            active: Mutex::new(None),
            last_tngl_fingerprint: AtomicU32::new(0),
        });
        tokio::spawn(signal_pump(signal_rx, Arc::downgrade(&shared)));
        Self { shared }
    }

    // ── Connector assignment ──────────────────────────────────────────────────

    /// Pick which backend future commands run against. The actual swap
    /// (disconnect, destroy, construct) happens when the next command drains.
    pub fn set_connector(&self, kind: Option<ConnectorKind>) {
        *lock(&self.shared.desired_kind) = kind;
    }

    pub fn connector_kind(&self) -> Option<ConnectorKind> {
        *lock(&self.shared.desired_kind)
    }

    // ── Queue-backed operations ───────────────────────────────────────────────

    pub async fn select(
        &self,
        criteria: Vec<Criteria>,
        timeout: Option<Duration>,
    ) -> Result<Option<DeviceInfo>, RuntimeError> {
        match self.run(CommandKind::Select { criteria, timeout }).await? {
            CommandOutcome::Device(device) => Ok(device),
            _ => Ok(None),
        }
    }

    pub async fn auto_select(
        &self,
        criteria: Vec<Criteria>,
        scan_timeout: Option<Duration>,
        timeout: Option<Duration>,
    ) -> Result<Option<DeviceInfo>, RuntimeError> {
        let kind = CommandKind::AutoSelect {
            criteria,
            scan_timeout,
            timeout,
        };
        match self.run(kind).await? {
            CommandOutcome::Device(device) => Ok(device),
            _ => Ok(None),
        }
    }

    pub async fn unselect(&self) -> Result<(), RuntimeError> {
        self.run(CommandKind::Unselect).await.map(|_| ())
    }

    pub async fn connect(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<DeviceInfo>, RuntimeError> {
        match self.run(CommandKind::Connect { timeout }).await? {
            CommandOutcome::Device(device) => Ok(device),
            _ => Ok(None),
        }
    }

    pub async fn disconnect(&self) -> Result<(), RuntimeError> {
        self.run(CommandKind::Disconnect).await.map(|_| ())
    }

    /// Queue controller byte-code for guaranteed delivery. Commands with the
    /// same label collapse: a queued, not-yet-drained execute is displaced by
    /// a newer one carrying the same label.
    pub async fn execute(
        &self,
        payload: Bytes,
        label: Option<String>,
    ) -> Result<(), RuntimeError> {
        self.run(CommandKind::Execute { payload, label }).await.map(|_| ())
    }

    pub async fn request(
        &self,
        payload: Bytes,
        read_response: bool,
        timeout: Option<Duration>,
    ) -> Result<Bytes, RuntimeError> {
        let kind = CommandKind::Request {
            payload,
            read_response,
            timeout,
        };
        match self.run(kind).await? {
            CommandOutcome::Payload(bytes) => Ok(bytes),
            _ => Ok(Bytes::new()),
        }
    }

    pub async fn deliver(
        &self,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> Result<(), RuntimeError> {
        self.run(CommandKind::Deliver { payload, timeout }).await.map(|_| ())
    }

    pub async fn transmit(
        &self,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> Result<(), RuntimeError> {
        self.run(CommandKind::Transmit { payload, timeout }).await.map(|_| ())
    }

    pub async fn read_clock(&self) -> Result<i64, RuntimeError> {
        match self.run(CommandKind::ReadClock).await? {
            CommandOutcome::Clock(millis) => Ok(millis),
            _ => Ok(0),
        }
    }

    pub async fn write_clock(&self, millis: i64) -> Result<(), RuntimeError> {
        self.run(CommandKind::WriteClock { millis }).await.map(|_| ())
    }

    pub async fn update_firmware(&self, firmware: Bytes) -> Result<(), RuntimeError> {
        self.run(CommandKind::FirmwareUpdate { firmware }).await.map(|_| ())
    }

    /// Disconnect and tear down the active connector, then fail fast until a
    /// new kind is assigned.
    pub async fn destroy_connector(&self) -> Result<(), RuntimeError> {
        self.run(CommandKind::DestroyConnector).await.map(|_| ())
    }

    // ── Direct (non-queued) operations ────────────────────────────────────────

    /// Advisory: unblocks in-flight scans and selections.
    pub fn cancel(&self) {
        if let Some(connector) = lock(&self.shared.active).clone() {
            connector.cancel();
        }
    }

    pub async fn connected(&self) -> Option<DeviceInfo> {
        let connector = lock(&self.shared.active).clone()?;
        connector.connected().await
    }

    pub async fn selected(&self) -> Option<DeviceInfo> {
        let connector = lock(&self.shared.active).clone()?;
        connector.selected().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.shared.events.subscribe()
    }

    pub fn clock(&self) -> SharedClock {
        self.shared.clock.clone()
    }

    pub fn config(&self) -> &LanternConfig {
        &self.shared.config
    }

    // ── Multi-hop requests ────────────────────────────────────────────────────

    /// Send a request along a connection path and await the correlated
    /// response notification. The full ordered hop list travels in the
    /// request body; intermediate controllers route on it.
    pub async fn remote_request(
        &self,
        path: &[HopDescriptor],
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> Result<Bytes, CorrelatorError> {
        let first = path.first().ok_or(CorrelatorError::InvalidPath)?;
        if path.len() > u8::MAX as usize {
            return Err(CorrelatorError::InvalidPath);
        }
        if self.connector_kind() != Some(first.connector_kind) {
            return Err(CorrelatorError::InitiationFailed(format!(
                "no {} connector assigned",
                first.connector_kind
            )));
        }
        let timeout = timeout.unwrap_or_else(|| self.shared.config.timeouts.request());
        let addresses: Vec<u32> = path.iter().map(|hop| hop.address).collect();

        let shared = self.shared.clone();
        self.shared
            .correlator
            .request(timeout, move |ticket| {
                let body = encode_hop_request(ticket, &addresses, &payload);
                let rx = shared.enqueue(CommandKind::Request {
                    payload: body,
                    read_response: false,
                    timeout: Some(timeout),
                });
                let correlator = shared.correlator.clone();
                tokio::spawn(async move {
                    match rx.await {
                        Ok(Ok(_)) => {}
                        _ => correlator.fail(ticket, CorrelatorError::SendFailed),
                    }
                });
                Ok(())
            })
            .await
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn run(&self, kind: CommandKind) -> CommandResult {
        self.shared
            .enqueue(kind)
            .await
            .unwrap_or(Err(RuntimeError::ShutDown))
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // Last handle going away strands any in-flight hop requests.
        if Arc::strong_count(&self.shared) == 1 {
            self.shared.correlator.cancel_all();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Enqueue and drain ─────────────────────────────────────────────────────────

impl Shared {
    fn enqueue(&self, kind: CommandKind) -> oneshot::Receiver<CommandResult> {
        let (cmd, rx) = Command::new(kind);
        let mut state = lock(&self.queue);

        // Label dedup: the newest execute wins, the displaced one resolves
        // as if it had been written and immediately overwritten.
        if let Some(label) = cmd.kind.label() {
            if let Some(pos) = state
                .queue
                .iter()
                .position(|queued| queued.kind.label() == Some(label))
            {
                if let Some(old) = state.queue.remove(pos) {
                    debug!(label, "execute displaced by newer command with same label");
                    old.finish(Ok(CommandOutcome::None));
                }
            }
        }

        // Exclusive kinds: at most one queued instance, the stale one loses.
        if cmd.kind.exclusive() {
            let name = cmd.kind.name();
            let mut kept = VecDeque::with_capacity(state.queue.len());
            for queued in state.queue.drain(..) {
                if queued.kind.name() == name {
                    queued.finish(Err(RuntimeError::Superseded));
                } else {
                    kept.push_back(queued);
                }
            }
            state.queue = kept;
        }

        state.queue.push_back(cmd);
        if state.drain == DrainState::Idle {
            if let Some(me) = self.me.upgrade() {
                state.drain = DrainState::Draining;
                tokio::spawn(drain(me));
            }
        }
        rx
    }

    /// Reject everything still queued. The drain task then finds an empty
    /// queue and parks.
    fn flush_queue(&self, error: RuntimeError) {
        let mut state = lock(&self.queue);
        for cmd in state.queue.drain(..) {
            cmd.finish(Err(error.clone()));
        }
    }

    /// Resolve the connector the next command runs against, applying any
    /// pending kind swap. Only the drain task calls this, so construction and
    /// teardown never race.
    async fn ensure_connector(&self) -> Result<Arc<dyn Connector>, RuntimeError> {
        let desired = *lock(&self.desired_kind);
        let current = lock(&self.active).clone();

        let Some(kind) = desired else {
            if let Some(old) = current {
                lock(&self.active).take();
                let _ = old.disconnect().await;
                old.destroy().await;
            }
            return Err(RuntimeError::ConnectorNotAssigned);
        };

        if let Some(connector) = current {
            if connector.kind() == kind {
                return Ok(connector);
            }
            info!(old = %connector.kind(), new = %kind, "swapping connector");
            lock(&self.active).take();
            let _ = connector.disconnect().await;
            connector.destroy().await;
        }

        let built = (self.factory)(kind, self.config.clone(), self.signals.clone())?;
        *lock(&self.active) = Some(built.clone());
        Ok(built)
    }

    async fn run_command(
        &self,
        connector: &Arc<dyn Connector>,
        kind: &CommandKind,
    ) -> CommandResult {
        let timeouts = &self.config.timeouts;
        match kind {
            CommandKind::Select { criteria, timeout } => {
                let device = connector
                    .select(criteria, timeout.unwrap_or_else(|| timeouts.select()))
                    .await?;
                Ok(CommandOutcome::Device(device))
            }
            CommandKind::AutoSelect {
                criteria,
                scan_timeout,
                timeout,
            } => {
                let device = connector
                    .auto_select(
                        criteria,
                        scan_timeout.unwrap_or_else(|| timeouts.scan()),
                        timeout.unwrap_or_else(|| timeouts.select()),
                    )
                    .await?;
                Ok(CommandOutcome::Device(device))
            }
            CommandKind::Unselect => {
                connector.unselect().await?;
                Ok(CommandOutcome::None)
            }
            CommandKind::Connect { timeout } => {
                let device = connector
                    .connect(timeout.unwrap_or_else(|| timeouts.connect()))
                    .await?;
                self.seed_clock(connector).await;
                Ok(CommandOutcome::Device(Some(device)))
            }
            CommandKind::Disconnect => {
                connector.disconnect().await?;
                Ok(CommandOutcome::None)
            }
            CommandKind::Execute { payload, .. } | CommandKind::Deliver { payload, .. } => {
                let timeout = match kind {
                    CommandKind::Deliver { timeout, .. } => *timeout,
                    _ => None,
                };
                connector
                    .deliver(payload, timeout.unwrap_or_else(|| timeouts.write()))
                    .await?;
                Ok(CommandOutcome::None)
            }
            CommandKind::Transmit { payload, timeout } => {
                connector
                    .transmit(payload, timeout.unwrap_or_else(|| timeouts.write()))
                    .await?;
                Ok(CommandOutcome::None)
            }
            CommandKind::Request {
                payload,
                read_response,
                timeout,
            } => {
                let response = connector
                    .request(
                        payload,
                        *read_response,
                        timeout.unwrap_or_else(|| timeouts.request()),
                    )
                    .await?;
                Ok(CommandOutcome::Payload(response))
            }
            CommandKind::ReadClock => {
                let millis = connector.read_clock().await?;
                Ok(CommandOutcome::Clock(millis))
            }
            CommandKind::WriteClock { millis } => {
                connector.write_clock(*millis).await?;
                self.clock.set_millis(*millis);
                Ok(CommandOutcome::None)
            }
            CommandKind::FirmwareUpdate { firmware } => {
                connector.update_firmware(firmware).await?;
                Ok(CommandOutcome::None)
            }
            // Handled in the drain loop before a connector is resolved.
            CommandKind::DestroyConnector => Ok(CommandOutcome::None),
        }
    }

    /// Best-effort clock handshake after connect. A controller that cannot
    /// report its clock still gets a usable link, just an unseeded timeline.
    async fn seed_clock(&self, connector: &Arc<dyn Connector>) {
        match connector.read_clock().await {
            Ok(millis) => {
                self.clock.set_millis(millis);
                debug!(millis, "seeded clock from controller");
            }
            Err(e) => {
                warn!(error = %e, "clock handshake failed, starting from zero");
                self.clock.set_millis(0);
            }
        }
    }

    async fn destroy_active(&self) {
        *lock(&self.desired_kind) = None;
        let old = lock(&self.active).take();
        if let Some(connector) = old {
            let _ = connector.disconnect().await;
            connector.destroy().await;
        }
        self.correlator.cancel_all();
    }
}

async fn drain(shared: Arc<Shared>) {
    loop {
        let (cmd, extra_done) = {
            let mut state = lock(&shared.queue);
            let Some(cmd) = state.queue.pop_front() else {
                state.drain = DrainState::Idle;
                return;
            };
            merge_executes(cmd, &mut state, shared.config.link.chunk_size)
        };

        if matches!(cmd.kind, CommandKind::DestroyConnector) {
            shared.destroy_active().await;
            cmd.finish(Ok(CommandOutcome::None));
            continue;
        }

        let connector = match shared.ensure_connector().await {
            Ok(connector) => connector,
            Err(error) => {
                debug!(command = cmd.kind.name(), "failing queue, no connector");
                cmd.finish(Err(error.clone()));
                for tx in extra_done {
                    let _ = tx.send(Err(error.clone()));
                }
                shared.flush_queue(error);
                continue;
            }
        };

        let result = shared.run_command(&connector, &cmd.kind).await;
        if let Err(e) = &result {
            debug!(command = cmd.kind.name(), error = %e, "command failed");
        }
        for tx in extra_done {
            let _ = tx.send(result.clone());
        }
        cmd.finish(result);
    }
}

/// Collapse a run of executes at the head of the queue into one physical
/// write, as long as the combined payload still fits one chunk. All merged
/// commands resolve together, at the earliest one's queue position.
fn merge_executes(
    mut cmd: Command,
    state: &mut QueueState,
    chunk_size: usize,
) -> (Command, Vec<oneshot::Sender<CommandResult>>) {
    let CommandKind::Execute { payload, .. } = &cmd.kind else {
        return (cmd, Vec::new());
    };

    let mut combined = BytesMut::from(&payload[..]);
    let mut extra_done = Vec::new();
    let mut merged = false;

    while matches!(
        state.queue.front().map(|next| &next.kind),
        Some(CommandKind::Execute { payload, .. })
            if combined.len() + payload.len() <= chunk_size
    ) {
        let Some(mut next) = state.queue.pop_front() else {
            break;
        };
        if let CommandKind::Execute { payload, .. } = &next.kind {
            combined.extend_from_slice(payload);
        }
        if let Some(tx) = next.take_done() {
            extra_done.push(tx);
        }
        merged = true;
    }

    if merged {
        debug!(
            merged = extra_done.len() + 1,
            bytes = combined.len(),
            "merged adjacent executes"
        );
        cmd.kind = CommandKind::Execute {
            payload: combined.freeze(),
            label: None,
        };
    }
    (cmd, extra_done)
}

// ── Signal pump ───────────────────────────────────────────────────────────────

/// Forwards connector signals to the event bus and routes notification
/// frames. Holds only a weak reference so dropping the last runtime handle
/// ends the pump.
async fn signal_pump(
    mut signals: mpsc::UnboundedReceiver<ConnectorSignal>,
    shared: Weak<Shared>,
) {
    while let Some(signal) = signals.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        shared.handle_signal(signal).await;
    }
}

/// Hop response code for a request the local engine failed to answer.
const HOP_ENGINE_FAILURE: u8 = 6;

impl Shared {
    async fn handle_signal(&self, signal: ConnectorSignal) {
        match signal {
            ConnectorSignal::Connected => self.events.emit(RuntimeEvent::Connected),
            ConnectorSignal::Disconnected => self.events.emit(RuntimeEvent::Disconnected),
            ConnectorSignal::PeerConnected(address) => {
                self.events.emit(RuntimeEvent::PeerConnected { address })
            }
            ConnectorSignal::PeerDisconnected(address) => {
                self.events.emit(RuntimeEvent::PeerDisconnected { address })
            }
            ConnectorSignal::OtaProgress { written, total } => {
                self.events.emit(RuntimeEvent::OtaProgress { written, total })
            }
            ConnectorSignal::OtaStatus(status) => {
                self.events.emit(RuntimeEvent::OtaStatus(status))
            }
            ConnectorSignal::Notify(bytes) => self.handle_notification(bytes).await,
        }
    }

    /// Identity of the directly connected controller, passed to the engine
    /// as the source of decoded notifications.
    async fn source_connection(&self) -> Option<Connection> {
        let connector = lock(&self.active).clone()?;
        let info = connector.connected().await?;
        Some(Connection {
            address: info.address,
            connector_kind: connector.kind(),
            rssi: info.rssi,
        })
    }

    async fn handle_notification(&self, bytes: Bytes) {
        let (header, payload) = match decode_frame(&bytes) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(len = bytes.len(), "short notification frame, dropping");
                return;
            }
            Err(e) => {
                debug!(error = %e, "corrupt notification frame, dropping");
                return;
            }
        };

        match { header.frame_type } {
            FRAME_SYNC => self.handle_sync(&payload).await,
            FRAME_EXECUTE => {
                let source = self.source_connection().await;
                if let Err(e) = self.engine.execute(payload.clone(), source).await {
                    warn!(error = %e, "engine rejected broadcast execute");
                }
                self.events.emit(RuntimeEvent::EventStateUpdates(payload));
            }
            FRAME_REQUEST => self.handle_hop_frame(payload).await,
            FRAME_CLOCK => {
                // Clock state travels in sync records; a bare clock frame
                // from a peer carries nothing we track.
            }
            other => debug!(
                frame_type = other,
                head = %hex::encode(&payload[..payload.len().min(16)]),
                "unhandled notification frame"
            ),
        }
    }

    /// A request frame notification is either a response to one of our
    /// tickets or a request a peer addressed to this instance; the first
    /// body byte says which.
    async fn handle_hop_frame(&self, payload: Bytes) {
        if let Some((ticket, code, body)) = decode_hop_response(&payload) {
            if !self.correlator.resolve(ticket, code, body) {
                debug!(ticket, "response for unknown ticket, dropping");
            }
            return;
        }

        let Some((ticket, _path, body)) = decode_hop_request(&payload) else {
            debug!("malformed hop frame, dropping");
            return;
        };

        let source = self.source_connection().await;
        let reply = match self.engine.request(body, source).await {
            Ok(bytes) => encode_hop_response(ticket, 0, &bytes),
            Err(e) => {
                warn!(ticket, error = %e, "engine failed inbound request");
                encode_hop_response(ticket, HOP_ENGINE_FAILURE, &[])
            }
        };

        let rx = self.enqueue(CommandKind::Request {
            payload: reply,
            read_response: false,
            timeout: None,
        });
        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(_)) => {}
                _ => debug!(ticket, "failed to deliver hop reply"),
            }
        });
    }

    async fn handle_sync(&self, payload: &Bytes) {
        let record = match SyncRecord::read(payload) {
            Ok(record) => record,
            Err(e) => {
                debug!(error = %e, "malformed sync record, dropping");
                return;
            }
        };

        let corrected = self.clock.apply_sync(&record);
        if corrected {
            debug!("clock corrected from sync record");
        }
        let source = self.source_connection().await;
        if let Err(e) = self.engine.synchronize(record, source).await {
            warn!(error = %e, "engine synchronize failed");
        }

        let clock_timestamp = { record.clock_timestamp } as i64;
        self.events.emit(RuntimeEvent::TimelineUpdate { clock_timestamp });

        let fingerprint = { record.tngl_fingerprint };
        let previous = self
            .last_tngl_fingerprint
            .swap(fingerprint, Ordering::SeqCst);
        if previous != fingerprint {
            self.events.emit(RuntimeEvent::TnglUpdate { fingerprint });
        }
    }
}
