//! lantern-runtime — the command queue, drain loop and request correlation
//! that sit between an application and one controller link.
//!
//! Operations enqueue typed commands; a single drain task per runtime walks
//! them in FIFO order against the active connector. Notifications from the
//! link are decoded here and fanned out over the event bus.

pub mod command;
pub mod correlator;
pub mod engine;
pub mod events;
pub mod runtime;

pub use command::{CommandKind, CommandOutcome, CommandResult, RuntimeError};
pub use correlator::{Correlator, CorrelatorError, HopDescriptor, Ticket};
pub use engine::{Connection, ControllerEngine, NullEngine};
pub use events::{EventBus, RuntimeEvent};
pub use runtime::{ConnectorFactory, Runtime};
