//! Session controller façade.
//!
//! [`TelemetrySession`] owns the broadcast stream for its lifetime and is the
//! only surface collaborators touch: `start_receiving`, `reconnect`,
//! `disconnect`, `close_connection`, `shutdown` and `subscribe`. Control
//! requests are forwarded over a channel to the driver task, which serializes
//! every state-machine transition; radio handles never leave the backend
//! task.

use crate::domain::models::TelemetryEvent;
use crate::domain::settings::LinkSettings;
use crate::infrastructure::bluetooth::btleplug::RadioBackend;
use crate::infrastructure::bluetooth::machine::LinkStateMachine;
use crate::infrastructure::bluetooth::stream::TelemetryStream;
use crate::infrastructure::bluetooth::transport::{self, RadioHandle};
use anyhow::Result;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session driver is no longer running")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlRequest {
    StartReceiving,
    Reconnect,
    Disconnect,
    CloseConnection,
    Shutdown,
}

pub struct TelemetrySession {
    stream: TelemetryStream,
    control: mpsc::UnboundedSender<ControlRequest>,
}

impl TelemetrySession {
    /// Spawn a session backed by the platform BLE stack.
    ///
    /// The radio adapter must already be powered on and the process must
    /// already hold the platform's Bluetooth permission; the session does
    /// not request either.
    pub fn spawn(settings: LinkSettings) -> Result<Self> {
        let (handle, endpoint) = transport::pair();
        let backend = RadioBackend::new(&settings, endpoint)?;
        tokio::spawn(backend.run());
        Ok(Self::with_radio(settings, handle))
    }

    /// Spawn a session over an injected radio transport. This is how tests
    /// drive the pipeline without Bluetooth hardware.
    pub fn with_radio(settings: LinkSettings, radio: RadioHandle) -> Self {
        let stream = TelemetryStream::default();
        let machine = LinkStateMachine::new(settings, stream.clone());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_driver(machine, radio, control_rx));
        Self {
            stream,
            control: control_tx,
        }
    }

    /// Subscribe to the session's event stream. Events published before the
    /// subscription are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.stream.subscribe()
    }

    /// Begin scanning for the configured peripheral.
    pub fn start_receiving(&self) -> Result<(), SessionError> {
        self.send(ControlRequest::StartReceiving)
    }

    /// Resume a dropped link without re-scanning; no-op when no link
    /// descriptor survives.
    pub fn reconnect(&self) -> Result<(), SessionError> {
        self.send(ControlRequest::Reconnect)
    }

    /// Graceful link drop that keeps the link descriptor for `reconnect`.
    pub fn disconnect(&self) -> Result<(), SessionError> {
        self.send(ControlRequest::Disconnect)
    }

    /// Full teardown; safe to call from any state, any number of times.
    pub fn close_connection(&self) -> Result<(), SessionError> {
        self.send(ControlRequest::CloseConnection)
    }

    /// Tear the session down and stop the driver and backend tasks. The
    /// stream stays subscribable but nothing publishes to it afterwards.
    pub fn shutdown(&self) -> Result<(), SessionError> {
        self.send(ControlRequest::CloseConnection)?;
        self.send(ControlRequest::Shutdown)
    }

    fn send(&self, request: ControlRequest) -> Result<(), SessionError> {
        self.control
            .send(request)
            .map_err(|_| SessionError::Closed)
    }
}

/// Single task that serializes every machine transition: control requests
/// and radio callbacks are interleaved here, never handled concurrently.
async fn run_driver(
    mut machine: LinkStateMachine,
    mut radio: RadioHandle,
    mut control: mpsc::UnboundedReceiver<ControlRequest>,
) {
    loop {
        tokio::select! {
            request = control.recv() => {
                let request = match request {
                    Some(request) => request,
                    // Façade dropped: tear down whatever is active.
                    None => ControlRequest::Shutdown,
                };
                debug!(?request, "control request");
                let commands = match request {
                    ControlRequest::StartReceiving => machine.start_receiving(),
                    ControlRequest::Reconnect => machine.reconnect(),
                    ControlRequest::Disconnect => machine.disconnect(),
                    ControlRequest::CloseConnection => machine.close_connection(),
                    ControlRequest::Shutdown => {
                        radio.dispatch(machine.close_connection());
                        break;
                    }
                };
                radio.dispatch(commands);
            }
            event = radio.events.recv() => {
                match event {
                    Some(event) => {
                        let commands = machine.handle(event);
                        radio.dispatch(commands);
                    }
                    // Backend gone; nothing left to drive.
                    None => break,
                }
            }
        }
    }
}
