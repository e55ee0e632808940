//! lantern-link — transport backends and the contract they implement.
//!
//! A Connector owns one physical link to a controller (BLE, serial, or the
//! in-process simulation). The framing layer moves CRC-guarded frames over
//! chunked, lossy, half-duplex channels with bounded retries; the stream
//! decoder handles the serial port's interleaved text/binary protocol.

pub mod connector;
pub mod framing;
pub mod sim;
pub mod stream;

pub use connector::{
    any_match, Connector, ConnectorError, ConnectorKind, ConnectorSignal, ConnectorState,
    Criteria, DeviceInfo, OtaStatus, SignalGuard, SignalSink,
};
pub use framing::{FrameChannel, NotificationAssembler};
pub use sim::{SimConnector, SimDevice};
pub use stream::{ControlToken, StreamDecoder, StreamEvent};
