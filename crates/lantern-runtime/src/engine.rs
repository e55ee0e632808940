//! Seam between the link runtime and the local controller interpreter.
//!
//! The runtime does not interpret byte-code itself. Whatever engine the
//! application embeds (native, wasm, a recording stub) plugs in here and
//! receives every frame the connected network shares with us.

use bytes::Bytes;

use lantern_core::SyncRecord;
use lantern_link::ConnectorKind;

/// Identity of the currently connected controller, surfaced to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub address: u32,
    pub connector_kind: ConnectorKind,
    pub rssi: i32,
}

/// Local interpreter for controller byte-code.
#[async_trait::async_trait]
pub trait ControllerEngine: Send + Sync {
    /// Apply an execute payload that a peer broadcast on the network.
    async fn execute(&self, payload: Bytes, source: Option<Connection>) -> anyhow::Result<()>;

    /// Answer a request addressed to this instance.
    async fn request(&self, payload: Bytes, source: Option<Connection>) -> anyhow::Result<Bytes>;

    /// A synchronization record arrived; refresh derived state.
    async fn synchronize(
        &self,
        record: SyncRecord,
        source: Option<Connection>,
    ) -> anyhow::Result<()>;

    /// Fingerprint of the byte-code currently loaded, if any.
    fn fingerprint(&self) -> Option<u32> {
        None
    }
}

/// Engine that ignores everything, for applications that only drive the link.
#[derive(Debug, Default)]
pub struct NullEngine;

#[async_trait::async_trait]
impl ControllerEngine for NullEngine {
    async fn execute(&self, _payload: Bytes, _source: Option<Connection>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn request(&self, _payload: Bytes, _source: Option<Connection>) -> anyhow::Result<Bytes> {
        Ok(Bytes::new())
    }

    async fn synchronize(
        &self,
        _record: SyncRecord,
        _source: Option<Connection>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
