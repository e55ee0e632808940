//! lantern-core — wire format, logical clock, and configuration.
//! All other Lantern crates depend on this one.

pub mod clock;
pub mod config;
pub mod wire;

pub use clock::{LogicalClock, SharedClock, DRIFT_TOLERANCE_MS};
pub use config::{LanternConfig, LinkConfig, TimeoutConfig};
pub use wire::{FrameHeader, SyncRecord, WireError};
