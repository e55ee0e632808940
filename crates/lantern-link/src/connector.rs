//! The Connector contract — the capability set every transport backend
//! implements.
//!
//! A connector owns one physical link (BLE, serial, or the in-process
//! simulation) and is driven by exactly one runtime at a time. All queuing
//! happens in the runtime; a connector rejects overlapping writes instead of
//! buffering them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// ── Backend kinds ─────────────────────────────────────────────────────────────

/// Closed set of known transport backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectorKind {
    Ble,
    Serial,
    Simulated,
}

impl std::fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectorKind::Ble => write!(f, "ble"),
            ConnectorKind::Serial => write!(f, "serial"),
            ConnectorKind::Simulated => write!(f, "simulated"),
        }
    }
}

// ── Selection types ───────────────────────────────────────────────────────────

/// Filter for device selection and scanning. Empty criteria match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criteria {
    pub name: Option<String>,
    pub address: Option<u32>,
    pub product_code: Option<u16>,
}

impl Criteria {
    pub fn matches(&self, device: &DeviceInfo) -> bool {
        if let Some(name) = &self.name {
            if *name != device.name {
                return false;
            }
        }
        if let Some(address) = self.address {
            if address != device.address {
                return false;
            }
        }
        if let Some(code) = self.product_code {
            if code != device.product_code {
                return false;
            }
        }
        true
    }
}

/// Returns true if any criterion matches (an empty list matches anything).
pub fn any_match(criteria: &[Criteria], device: &DeviceInfo) -> bool {
    criteria.is_empty() || criteria.iter().any(|c| c.matches(device))
}

/// What a scan or selection yields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Network address of the controller.
    pub address: u32,
    pub name: String,
    pub product_code: u16,
    /// Signal strength at discovery time. 0 for wired transports.
    pub rssi: i32,
}

/// Connection lifecycle of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Unselected,
    Selected,
    Connecting,
    Connected,
    Disconnecting,
}

// ── Signals ───────────────────────────────────────────────────────────────────

/// Out-of-band notifications a connector pushes to its runtime.
#[derive(Debug, Clone)]
pub enum ConnectorSignal {
    Connected,
    Disconnected,
    /// A complete reassembled notification frame (header + payload bytes).
    Notify(Bytes),
    /// A peer joined the controller network behind the connected device.
    PeerConnected(u32),
    PeerDisconnected(u32),
    OtaProgress {
        written: usize,
        total: usize,
    },
    OtaStatus(OtaStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaStatus {
    Begin,
    Success,
    Fail,
}

/// Where connectors push their signals. Owned by the runtime.
pub type SignalSink = mpsc::UnboundedSender<ConnectorSignal>;

/// Guards against duplicate connected/disconnected emission.
///
/// Platform event storms (BLE stacks are notorious for this) must not leak
/// through: a connected signal fires only when the guard is down, a
/// disconnected signal only when it is up.
#[derive(Debug, Default)]
pub struct SignalGuard {
    connected: AtomicBool,
}

impl SignalGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `Connected` unless one is already outstanding. Returns whether
    /// the signal was actually sent.
    pub fn emit_connected(&self, sink: &SignalSink) -> bool {
        if !self.connected.swap(true, Ordering::SeqCst) {
            let _ = sink.send(ConnectorSignal::Connected);
            true
        } else {
            false
        }
    }

    /// Emit `Disconnected` if a `Connected` is outstanding.
    pub fn emit_disconnected(&self, sink: &SignalSink) -> bool {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = sink.send(ConnectorSignal::Disconnected);
            true
        } else {
            false
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Transport-level failures. Internal retries are exhausted before any of
/// these surface; once surfaced they propagate to the command unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    #[error("selection failed")]
    SelectionFailed,
    #[error("selection canceled")]
    UserCanceledSelection,
    #[error("no device selected")]
    DeviceNotSelected,
    #[error("connection failed")]
    ConnectionFailed,
    #[error("connection timed out")]
    ConnectionTimeout,
    #[error("device disconnected")]
    DeviceDisconnected,
    #[error("write failed")]
    WriteFailed,
    #[error("request failed")]
    RequestFailed,
    #[error("clock write failed")]
    ClockWriteFailed,
    #[error("clock read failed")]
    ClockReadFailed,
    #[error("response timed out")]
    ResponseTimeout,
    #[error("firmware update failed")]
    UpdateFailed,
}

// ── The contract ──────────────────────────────────────────────────────────────

/// Capability set of a transport backend.
///
/// Every operation resolves or rejects exactly once. `cancel` is synchronous
/// and advisory: it unblocks in-flight scans and selections with whatever
/// partial results exist but does not guarantee the physical layer stopped —
/// a late completion from below must be ignorable.
#[async_trait]
pub trait Connector: Send + Sync {
    fn kind(&self) -> ConnectorKind;

    /// Interactively pick a device matching the criteria.
    async fn select(
        &self,
        criteria: &[Criteria],
        timeout: Duration,
    ) -> Result<Option<DeviceInfo>, ConnectorError>;

    /// Scan, then select the best match without user interaction.
    async fn auto_select(
        &self,
        criteria: &[Criteria],
        scan_timeout: Duration,
        timeout: Duration,
    ) -> Result<Option<DeviceInfo>, ConnectorError>;

    async fn selected(&self) -> Option<DeviceInfo>;

    async fn unselect(&self) -> Result<(), ConnectorError>;

    async fn scan(
        &self,
        criteria: &[Criteria],
        duration: Duration,
    ) -> Result<Vec<DeviceInfo>, ConnectorError>;

    async fn connect(&self, timeout: Duration) -> Result<DeviceInfo, ConnectorError>;

    async fn connected(&self) -> Option<DeviceInfo>;

    async fn disconnect(&self) -> Result<(), ConnectorError>;

    /// Guaranteed-delivery write of controller byte-code.
    async fn deliver(&self, payload: &[u8], timeout: Duration) -> Result<(), ConnectorError>;

    /// Best-effort write. One attempt, no retry.
    async fn transmit(&self, payload: &[u8], timeout: Duration) -> Result<(), ConnectorError>;

    /// Write-then-read. With `read_response` false the write is confirmed but
    /// no response is awaited (the reply, if any, arrives as a notification).
    async fn request(
        &self,
        payload: &[u8],
        read_response: bool,
        timeout: Duration,
    ) -> Result<Bytes, ConnectorError>;

    /// Read the remote device's clock, in milliseconds.
    async fn read_clock(&self) -> Result<i64, ConnectorError>;

    async fn write_clock(&self, millis: i64) -> Result<(), ConnectorError>;

    async fn update_firmware(&self, firmware: &[u8]) -> Result<(), ConnectorError>;

    /// Abort in-flight scans/selections. Best-effort, returns immediately.
    fn cancel(&self);

    /// Tear down the physical link and release resources.
    async fn destroy(&self);
}
