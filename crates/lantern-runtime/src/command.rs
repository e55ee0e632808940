//! Typed commands — the unit of work the runtime drains against its
//! connector.
//!
//! A command is created on enqueue, owned by the runtime until drained, and
//! fulfilled exactly once. The caller keeps the receiving half of the result
//! channel and never blocks the enqueue itself.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

use lantern_link::{ConnectorError, Criteria, DeviceInfo};

/// What a fulfilled command yields.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    None,
    Device(Option<DeviceInfo>),
    Payload(Bytes),
    Clock(i64),
}

/// Failures surfaced to command futures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// No connector is assigned; the whole queue fails fast with this.
    #[error("no connector assigned")]
    ConnectorNotAssigned,

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// A queued exclusive command was displaced by a newer one of its kind.
    #[error("command superseded by a newer one")]
    Superseded,

    /// The runtime was torn down before the command could be drained.
    #[error("runtime shut down")]
    ShutDown,

    /// The connector backend could not be constructed.
    #[error("connector construction failed: {0}")]
    ConstructionFailed(String),
}

#[derive(Debug)]
pub enum CommandKind {
    Select {
        criteria: Vec<Criteria>,
        timeout: Option<Duration>,
    },
    AutoSelect {
        criteria: Vec<Criteria>,
        scan_timeout: Option<Duration>,
        timeout: Option<Duration>,
    },
    Unselect,
    Connect {
        timeout: Option<Duration>,
    },
    Disconnect,
    Execute {
        payload: Bytes,
        /// Dedup tag: a queued not-yet-drained execute with the same label is
        /// displaced by this one. Collisions are an intentional merge.
        label: Option<String>,
    },
    Request {
        payload: Bytes,
        read_response: bool,
        timeout: Option<Duration>,
    },
    /// Internal guaranteed-delivery send primitive.
    Deliver {
        payload: Bytes,
        timeout: Option<Duration>,
    },
    /// Internal best-effort send primitive.
    Transmit {
        payload: Bytes,
        timeout: Option<Duration>,
    },
    ReadClock,
    WriteClock {
        millis: i64,
    },
    FirmwareUpdate {
        firmware: Bytes,
    },
    DestroyConnector,
}

impl CommandKind {
    pub fn label(&self) -> Option<&str> {
        match self {
            CommandKind::Execute { label, .. } => label.as_deref(),
            _ => None,
        }
    }

    /// At most one command of an exclusive kind may be queued at a time.
    pub fn exclusive(&self) -> bool {
        matches!(
            self,
            CommandKind::FirmwareUpdate { .. } | CommandKind::DestroyConnector
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Select { .. } => "select",
            CommandKind::AutoSelect { .. } => "auto_select",
            CommandKind::Unselect => "unselect",
            CommandKind::Connect { .. } => "connect",
            CommandKind::Disconnect => "disconnect",
            CommandKind::Execute { .. } => "execute",
            CommandKind::Request { .. } => "request",
            CommandKind::Deliver { .. } => "deliver",
            CommandKind::Transmit { .. } => "transmit",
            CommandKind::ReadClock => "read_clock",
            CommandKind::WriteClock { .. } => "write_clock",
            CommandKind::FirmwareUpdate { .. } => "firmware_update",
            CommandKind::DestroyConnector => "destroy_connector",
        }
    }
}

pub type CommandResult = Result<CommandOutcome, RuntimeError>;

/// One queued operation plus its result slot.
#[derive(Debug)]
pub struct Command {
    pub kind: CommandKind,
    done: Option<oneshot::Sender<CommandResult>>,
}

impl Command {
    pub fn new(kind: CommandKind) -> (Self, oneshot::Receiver<CommandResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                kind,
                done: Some(tx),
            },
            rx,
        )
    }

    /// Fulfill the command. Subsequent calls are no-ops; the contract is
    /// exactly-once resolution.
    pub fn finish(mut self, result: CommandResult) {
        if let Some(tx) = self.done.take() {
            let _ = tx.send(result);
        }
    }

    /// Split off the result slot, e.g. when merging several executes into one
    /// physical write that fulfills them together.
    pub fn take_done(&mut self) -> Option<oneshot::Sender<CommandResult>> {
        self.done.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finish_resolves_the_receiver_once() {
        let (cmd, rx) = Command::new(CommandKind::Disconnect);
        cmd.finish(Ok(CommandOutcome::None));
        assert!(matches!(rx.await, Ok(Ok(CommandOutcome::None))));
    }

    #[tokio::test]
    async fn dropping_a_command_rejects_the_future() {
        let (cmd, rx) = Command::new(CommandKind::Disconnect);
        drop(cmd);
        assert!(rx.await.is_err());
    }

    #[test]
    fn exclusivity_covers_firmware_and_destroy() {
        assert!(CommandKind::DestroyConnector.exclusive());
        assert!(CommandKind::FirmwareUpdate {
            firmware: Bytes::new()
        }
        .exclusive());
        assert!(!CommandKind::Disconnect.exclusive());
    }
}
