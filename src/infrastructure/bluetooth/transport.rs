//! The seam between the link state machine and the radio backend.
//!
//! The state machine never touches radio handles: it consumes [`RadioEvent`]s
//! and emits [`RadioCommand`]s. The backend task owns the BLE stack objects,
//! executes commands and reports what the radio did. Tests substitute the
//! backend with the bare channel pair.

use tokio::sync::mpsc;

/// Instruction from the state machine to the radio backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCommand {
    StartScan,
    StopScan,
    /// Connect to the peripheral reported by the last matching scan result.
    Connect,
    DiscoverServices,
    RequestMtu(u16),
    /// Look up the fixed service/characteristic pair on the connected
    /// peripheral.
    LocatePublisher,
    /// Subscribe to the publisher characteristic, preferring indications
    /// over notifications when both are supported.
    EnableNotifications,
    DisableNotifications,
    /// Re-establish a previously connected, currently dropped link without
    /// re-scanning.
    Reconnect,
    /// Graceful link drop that keeps the peripheral handle around.
    Disconnect,
    /// Drop the peripheral handle for good.
    ReleaseLink,
}

/// Radio-stack callback, normalized. One variant per callback the BLE stack
/// can deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// A scan result whose advertised name is `name`.
    DeviceDiscovered { name: String },
    /// Physical connection established.
    Connected,
    /// A connect or negotiate step failed abnormally.
    ConnectFailed { reason: String },
    ServicesDiscovered,
    MtuChanged { mtu: u16 },
    PublisherLocated,
    /// The fixed service/characteristic pair is absent from the peripheral.
    PublisherMissing,
    NotificationsEnabled,
    /// The CCCD write was rejected.
    NotificationsRejected { reason: String },
    /// One characteristic-value update from the publisher.
    FrameReceived(Vec<u8>),
    /// The link dropped cleanly (peer- or user-initiated).
    Disconnected,
}

/// State-machine side of the transport: send commands, receive events.
#[derive(Debug)]
pub struct RadioHandle {
    pub commands: mpsc::UnboundedSender<RadioCommand>,
    pub events: mpsc::UnboundedReceiver<RadioEvent>,
}

impl RadioHandle {
    /// Forward a batch of commands to the backend. Send failures mean the
    /// backend is gone; the driver loop terminates on its own shortly after.
    pub fn dispatch(&self, commands: Vec<RadioCommand>) {
        for command in commands {
            let _ = self.commands.send(command);
        }
    }
}

/// Backend side of the transport: receive commands, report events.
#[derive(Debug)]
pub struct RadioEndpoint {
    pub commands: mpsc::UnboundedReceiver<RadioCommand>,
    pub events: mpsc::UnboundedSender<RadioEvent>,
}

impl RadioEndpoint {
    pub fn report(&self, event: RadioEvent) {
        let _ = self.events.send(event);
    }
}

/// Create a connected transport pair.
pub fn pair() -> (RadioHandle, RadioEndpoint) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (
        RadioHandle {
            commands: command_tx,
            events: event_rx,
        },
        RadioEndpoint {
            commands: command_rx,
            events: event_tx,
        },
    )
}
