//! BLE link state machine.
//!
//! Drives one peripheral session end to end: scan, connect, service
//! discovery, MTU negotiation, publisher lookup, notification enablement,
//! streaming, and retry accounting. Each radio callback has one entry point
//! that validates the current phase before acting, so out-of-order or stale
//! callbacks from the BLE stack are ignored instead of corrupting the
//! session.
//!
//! The machine performs no radio I/O itself: entry points return
//! [`RadioCommand`]s for the backend to execute and publish
//! [`TelemetryEvent`]s into the session's broadcast stream.

use crate::domain::models::{ConnectionState, TelemetryEvent, TelemetryRecord};
use crate::domain::settings::LinkSettings;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::stream::TelemetryStream;
use crate::infrastructure::bluetooth::transport::{RadioCommand, RadioEvent};
use tracing::{debug, info, warn};

/// Internal pipeline phase. `ConnectionState` is the coarse projection of
/// this that consumers see on records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkPhase {
    Idle,
    Scanning,
    Connecting,
    ServiceDiscovery,
    MtuNegotiation,
    CharacteristicLookup,
    NotificationEnable,
    Streaming,
    /// Link dropped or was dropped; `reconnect()` may apply.
    Disconnected,
    /// Terminal: retry budget exhausted or profile mismatch. Only a fresh
    /// `start_receiving()` leaves this phase.
    Failed,
}

impl LinkPhase {
    fn is_negotiating(self) -> bool {
        matches!(
            self,
            LinkPhase::Connecting
                | LinkPhase::ServiceDiscovery
                | LinkPhase::MtuNegotiation
                | LinkPhase::CharacteristicLookup
                | LinkPhase::NotificationEnable
        )
    }
}

pub struct LinkStateMachine {
    settings: LinkSettings,
    stream: TelemetryStream,
    phase: LinkPhase,
    /// Consecutive abnormal connect/negotiate failures. Reset on reaching
    /// `Streaming` and on an explicit `start_receiving()`.
    failures: u32,
    /// The backend still holds a peripheral handle.
    has_link: bool,
    /// A graceful drop was requested via `disconnect()`; the next clean
    /// disconnect keeps the handle for `reconnect()`.
    expecting_disconnect: bool,
}

impl LinkStateMachine {
    pub fn new(settings: LinkSettings, stream: TelemetryStream) -> Self {
        Self {
            settings,
            stream,
            phase: LinkPhase::Idle,
            failures: 0,
            has_link: false,
            expecting_disconnect: false,
        }
    }

    pub(crate) fn phase(&self) -> LinkPhase {
        self.phase
    }

    /// Coarse link state as consumers see it.
    pub fn connection_state(&self) -> ConnectionState {
        match self.phase {
            LinkPhase::Idle => ConnectionState::Uninitialized,
            LinkPhase::Streaming => ConnectionState::Connected,
            LinkPhase::Disconnected | LinkPhase::Failed => ConnectionState::Disconnected,
            _ => ConnectionState::CurrentlyInitializing,
        }
    }

    fn publish(&self, event: TelemetryEvent) {
        self.stream.publish(event);
    }

    fn loading(&self, message: &str) {
        self.publish(TelemetryEvent::Loading(message.to_string()));
    }

    // ── Operations (driven by the session controller) ────────────────────

    /// Begin a fresh session: scan for the configured device name.
    pub fn start_receiving(&mut self) -> Vec<RadioCommand> {
        if self.phase.is_negotiating() || self.phase == LinkPhase::Streaming {
            warn!(phase = ?self.phase, "start_receiving ignored, session already active");
            return Vec::new();
        }
        if self.phase == LinkPhase::Scanning {
            return Vec::new();
        }
        self.failures = 0;
        self.begin_scan()
    }

    /// Resume a previously established, currently dropped link without
    /// re-scanning. No-op when no peripheral handle survives.
    pub fn reconnect(&mut self) -> Vec<RadioCommand> {
        if self.phase != LinkPhase::Disconnected || !self.has_link {
            debug!(phase = ?self.phase, has_link = self.has_link, "reconnect not applicable");
            return Vec::new();
        }
        info!("reconnecting to retained peripheral");
        self.phase = LinkPhase::Connecting;
        vec![RadioCommand::Reconnect]
    }

    /// Request a graceful link drop that keeps the peripheral handle for a
    /// later `reconnect()`.
    pub fn disconnect(&mut self) -> Vec<RadioCommand> {
        if !self.has_link {
            return Vec::new();
        }
        self.expecting_disconnect = true;
        vec![RadioCommand::Disconnect]
    }

    /// Full teardown, callable from any phase, any number of times. Stops an
    /// in-flight scan, disables an active subscription, releases the handle
    /// and leaves the machine ready for a fresh `start_receiving()`.
    pub fn close_connection(&mut self) -> Vec<RadioCommand> {
        let mut commands = Vec::new();
        if self.phase == LinkPhase::Scanning {
            commands.push(RadioCommand::StopScan);
        }
        if self.phase == LinkPhase::Streaming {
            commands.push(RadioCommand::DisableNotifications);
        }
        if self.has_link {
            commands.push(RadioCommand::ReleaseLink);
        }
        self.phase = LinkPhase::Idle;
        self.failures = 0;
        self.has_link = false;
        self.expecting_disconnect = false;
        commands
    }

    // ── Radio callbacks ──────────────────────────────────────────────────

    pub fn handle(&mut self, event: RadioEvent) -> Vec<RadioCommand> {
        match event {
            RadioEvent::DeviceDiscovered { name } => self.on_device_discovered(&name),
            RadioEvent::Connected => self.on_connected(),
            RadioEvent::ConnectFailed { reason } => self.on_connect_failed(&reason),
            RadioEvent::ServicesDiscovered => self.on_services_discovered(),
            RadioEvent::MtuChanged { mtu } => self.on_mtu_changed(mtu),
            RadioEvent::PublisherLocated => self.on_publisher_located(),
            RadioEvent::PublisherMissing => self.on_publisher_missing(),
            RadioEvent::NotificationsEnabled => self.on_notifications_enabled(),
            RadioEvent::NotificationsRejected { reason } => {
                self.on_notifications_rejected(&reason)
            }
            RadioEvent::FrameReceived(bytes) => self.on_frame(&bytes),
            RadioEvent::Disconnected => self.on_disconnected(),
        }
    }

    fn on_device_discovered(&mut self, name: &str) -> Vec<RadioCommand> {
        if self.phase != LinkPhase::Scanning {
            return Vec::new();
        }
        if name != self.settings.device_name {
            return Vec::new();
        }
        info!(name, "matching peripheral found");
        self.loading("Connecting to device...");
        self.phase = LinkPhase::Connecting;
        vec![RadioCommand::StopScan, RadioCommand::Connect]
    }

    fn on_connected(&mut self) -> Vec<RadioCommand> {
        if self.phase != LinkPhase::Connecting {
            return Vec::new();
        }
        self.has_link = true;
        self.loading("Discovering Services...");
        self.phase = LinkPhase::ServiceDiscovery;
        vec![RadioCommand::DiscoverServices]
    }

    fn on_services_discovered(&mut self) -> Vec<RadioCommand> {
        if self.phase != LinkPhase::ServiceDiscovery {
            return Vec::new();
        }
        self.loading("Adjusting MTU space...");
        self.phase = LinkPhase::MtuNegotiation;
        vec![RadioCommand::RequestMtu(self.settings.requested_mtu)]
    }

    fn on_mtu_changed(&mut self, mtu: u16) -> Vec<RadioCommand> {
        if self.phase != LinkPhase::MtuNegotiation {
            return Vec::new();
        }
        debug!(mtu, "MTU negotiated");
        self.phase = LinkPhase::CharacteristicLookup;
        vec![RadioCommand::LocatePublisher]
    }

    fn on_publisher_located(&mut self) -> Vec<RadioCommand> {
        if self.phase != LinkPhase::CharacteristicLookup {
            return Vec::new();
        }
        self.phase = LinkPhase::NotificationEnable;
        vec![RadioCommand::EnableNotifications]
    }

    /// The fixed service/characteristic pair is absent. Firmware/profile
    /// mismatch, not a radio fault: terminal, never retried.
    fn on_publisher_missing(&mut self) -> Vec<RadioCommand> {
        if self.phase != LinkPhase::CharacteristicLookup {
            return Vec::new();
        }
        self.publish(TelemetryEvent::Error("Could not find publisher".to_string()));
        self.phase = LinkPhase::Failed;
        Vec::new()
    }

    fn on_notifications_enabled(&mut self) -> Vec<RadioCommand> {
        if self.phase != LinkPhase::NotificationEnable {
            return Vec::new();
        }
        info!("characteristic stream active");
        self.phase = LinkPhase::Streaming;
        self.failures = 0;
        Vec::new()
    }

    /// CCCD write rejected: reported once, never retried, and never counted
    /// against the retry budget.
    fn on_notifications_rejected(&mut self, reason: &str) -> Vec<RadioCommand> {
        if self.phase != LinkPhase::NotificationEnable {
            return Vec::new();
        }
        warn!(reason, "subscription rejected by peripheral");
        self.publish(TelemetryEvent::Error(
            "Could not enable notifications".to_string(),
        ));
        self.phase = LinkPhase::Failed;
        Vec::new()
    }

    /// One characteristic update. A malformed frame is dropped: a single bad
    /// reading must not end the session.
    fn on_frame(&mut self, bytes: &[u8]) -> Vec<RadioCommand> {
        if self.phase != LinkPhase::Streaming {
            return Vec::new();
        }
        match protocol::decode_frame(bytes) {
            Ok(record) => self.publish(TelemetryEvent::Success(record)),
            Err(err) => debug!(%err, "dropping malformed telemetry frame"),
        }
        Vec::new()
    }

    /// Clean link drop. While streaming this publishes the zeroed
    /// disconnect sentinel; it never touches the retry counter.
    fn on_disconnected(&mut self) -> Vec<RadioCommand> {
        match self.phase {
            LinkPhase::Streaming => {
                info!("link closed while streaming");
                self.publish(TelemetryEvent::Success(TelemetryRecord::disconnected()));
                self.phase = LinkPhase::Disconnected;
                if self.expecting_disconnect {
                    // Requested via disconnect(): keep the handle so
                    // reconnect() can skip the scan.
                    self.expecting_disconnect = false;
                    Vec::new()
                } else {
                    self.has_link = false;
                    vec![RadioCommand::ReleaseLink]
                }
            }
            phase if phase.is_negotiating() => {
                debug!(?phase, "link dropped mid-negotiation");
                self.phase = LinkPhase::Disconnected;
                self.has_link = false;
                self.expecting_disconnect = false;
                vec![RadioCommand::ReleaseLink]
            }
            _ => Vec::new(),
        }
    }

    /// Abnormal connect/negotiate failure, including a scan that could not
    /// start: release the handle, count it, and either rescan or give up
    /// once the budget is spent.
    fn on_connect_failed(&mut self, reason: &str) -> Vec<RadioCommand> {
        if !self.phase.is_negotiating() && self.phase != LinkPhase::Scanning {
            return Vec::new();
        }
        warn!(reason, failures = self.failures + 1, "connection attempt failed");
        self.failures += 1;
        self.has_link = false;
        let mut commands = vec![RadioCommand::ReleaseLink];

        if self.failures <= self.settings.max_connection_attempts {
            self.loading(&format!(
                "Attempting to connect {}/{}",
                self.failures, self.settings.max_connection_attempts
            ));
            commands.extend(self.begin_scan());
        } else {
            self.publish(TelemetryEvent::Error(
                "Could not connect to ble device".to_string(),
            ));
            self.phase = LinkPhase::Failed;
        }
        commands
    }

    fn begin_scan(&mut self) -> Vec<RadioCommand> {
        self.loading("Scanning...");
        self.phase = LinkPhase::Scanning;
        vec![RadioCommand::StartScan]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;

    fn machine() -> (LinkStateMachine, broadcast::Receiver<TelemetryEvent>) {
        let stream = TelemetryStream::default();
        let rx = stream.subscribe();
        (LinkStateMachine::new(LinkSettings::default(), stream), rx)
    }

    fn drain(rx: &mut broadcast::Receiver<TelemetryEvent>) -> Vec<TelemetryEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn valid_frame() -> Vec<u8> {
        br#"{
            "Engine Coolant Temperature": 88.5,
            "Engine Oil Temperature": 95.0,
            "Intake Air Temperature": 31.0,
            "Fuel Temperature": 24.0,
            "Engine RPM": 2450,
            "Calculated Load Value": 42.7,
            "Boost Pressure": 1.35,
            "Mass Air Flow Rate": 18.9,
            "Throttle Position": 33.0,
            "Fuel Pressure": 3.8,
            "Fuel Consumption Rate": 7.2,
            "Accelerator Pedal Position": 35.5,
            "Brake Pedal Position": 0.0,
            "Vehicle Speed": 87.0
        }"#
        .to_vec()
    }

    /// Drive a fresh machine to `Streaming`.
    fn connect(m: &mut LinkStateMachine) {
        m.start_receiving();
        m.handle(RadioEvent::DeviceDiscovered {
            name: "OBD2".into(),
        });
        m.handle(RadioEvent::Connected);
        m.handle(RadioEvent::ServicesDiscovered);
        m.handle(RadioEvent::MtuChanged { mtu: 517 });
        m.handle(RadioEvent::PublisherLocated);
        m.handle(RadioEvent::NotificationsEnabled);
        assert_eq!(m.phase(), LinkPhase::Streaming);
    }

    #[test]
    fn pipeline_commands_follow_the_negotiation_order() {
        let (mut m, _rx) = machine();

        assert_eq!(m.start_receiving(), vec![RadioCommand::StartScan]);
        assert_eq!(
            m.handle(RadioEvent::DeviceDiscovered {
                name: "OBD2".into()
            }),
            vec![RadioCommand::StopScan, RadioCommand::Connect]
        );
        assert_eq!(
            m.handle(RadioEvent::Connected),
            vec![RadioCommand::DiscoverServices]
        );
        assert_eq!(
            m.handle(RadioEvent::ServicesDiscovered),
            vec![RadioCommand::RequestMtu(517)]
        );
        assert_eq!(
            m.handle(RadioEvent::MtuChanged { mtu: 247 }),
            vec![RadioCommand::LocatePublisher]
        );
        assert_eq!(
            m.handle(RadioEvent::PublisherLocated),
            vec![RadioCommand::EnableNotifications]
        );
        assert!(m.handle(RadioEvent::NotificationsEnabled).is_empty());
        assert_eq!(m.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn loading_events_arrive_in_pipeline_order() {
        let (mut m, mut rx) = machine();
        connect(&mut m);
        m.handle(RadioEvent::FrameReceived(valid_frame()));

        let events = drain(&mut rx);
        let expected_prefix = [
            TelemetryEvent::Loading("Scanning...".into()),
            TelemetryEvent::Loading("Connecting to device...".into()),
            TelemetryEvent::Loading("Discovering Services...".into()),
            TelemetryEvent::Loading("Adjusting MTU space...".into()),
        ];
        assert_eq!(&events[..4], &expected_prefix);
        assert!(matches!(events[4], TelemetryEvent::Success(_)));
        assert_eq!(events.len(), 5);
    }

    #[test]
    fn non_matching_device_names_are_ignored() {
        let (mut m, _rx) = machine();
        m.start_receiving();
        assert!(m
            .handle(RadioEvent::DeviceDiscovered {
                name: "OBD2-clone".into()
            })
            .is_empty());
        assert_eq!(m.phase(), LinkPhase::Scanning);
    }

    #[test]
    fn scan_results_outside_scanning_phase_are_ignored() {
        let (mut m, mut rx) = machine();
        connect(&mut m);
        drain(&mut rx);
        assert!(m
            .handle(RadioEvent::DeviceDiscovered {
                name: "OBD2".into()
            })
            .is_empty());
        assert_eq!(m.phase(), LinkPhase::Streaming);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn sixth_consecutive_failure_is_terminal() {
        let (mut m, mut rx) = machine();
        m.start_receiving();

        for attempt in 1..=5 {
            m.handle(RadioEvent::DeviceDiscovered {
                name: "OBD2".into(),
            });
            let commands = m.handle(RadioEvent::ConnectFailed {
                reason: "status 133".into(),
            });
            assert!(
                commands.contains(&RadioCommand::StartScan),
                "failure {attempt} should rescan"
            );
        }

        m.handle(RadioEvent::DeviceDiscovered {
            name: "OBD2".into(),
        });
        let commands = m.handle(RadioEvent::ConnectFailed {
            reason: "status 133".into(),
        });
        assert!(!commands.contains(&RadioCommand::StartScan));
        assert_eq!(m.phase(), LinkPhase::Failed);

        let events = drain(&mut rx);
        let errors: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, TelemetryEvent::Error(_)))
            .collect();
        assert_eq!(
            errors,
            vec![&TelemetryEvent::Error("Could not connect to ble device".into())]
        );
        let retries: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                TelemetryEvent::Loading(msg) if msg.starts_with("Attempting") => Some(msg.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            retries,
            vec![
                "Attempting to connect 1/5",
                "Attempting to connect 2/5",
                "Attempting to connect 3/5",
                "Attempting to connect 4/5",
                "Attempting to connect 5/5",
            ]
        );
    }

    #[test]
    fn streaming_resets_the_retry_budget() {
        let (mut m, mut rx) = machine();
        m.start_receiving();
        m.handle(RadioEvent::DeviceDiscovered {
            name: "OBD2".into(),
        });
        m.handle(RadioEvent::ConnectFailed {
            reason: "transient".into(),
        });
        assert_eq!(m.failures, 1);

        m.handle(RadioEvent::DeviceDiscovered {
            name: "OBD2".into(),
        });
        m.handle(RadioEvent::Connected);
        m.handle(RadioEvent::ServicesDiscovered);
        m.handle(RadioEvent::MtuChanged { mtu: 517 });
        m.handle(RadioEvent::PublisherLocated);
        m.handle(RadioEvent::NotificationsEnabled);
        assert_eq!(m.failures, 0);
        drain(&mut rx);
    }

    #[test]
    fn clean_disconnect_publishes_zeroed_sentinel_once() {
        let (mut m, mut rx) = machine();
        connect(&mut m);
        drain(&mut rx);

        m.handle(RadioEvent::Disconnected);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            TelemetryEvent::Success(record) => {
                assert_eq!(*record, TelemetryRecord::disconnected());
            }
            other => panic!("expected disconnect sentinel, got {other:?}"),
        }
        assert_eq!(m.failures, 0);
        assert_eq!(m.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn missing_publisher_is_terminal_without_retry() {
        let (mut m, mut rx) = machine();
        m.start_receiving();
        m.handle(RadioEvent::DeviceDiscovered {
            name: "OBD2".into(),
        });
        m.handle(RadioEvent::Connected);
        m.handle(RadioEvent::ServicesDiscovered);
        m.handle(RadioEvent::MtuChanged { mtu: 517 });
        let commands = m.handle(RadioEvent::PublisherMissing);

        assert!(commands.is_empty());
        assert_eq!(m.phase(), LinkPhase::Failed);
        assert_eq!(m.failures, 0);
        let events = drain(&mut rx);
        assert_eq!(
            events.last(),
            Some(&TelemetryEvent::Error("Could not find publisher".into()))
        );
    }

    #[test]
    fn rejected_subscription_is_terminal_and_uncounted() {
        let (mut m, mut rx) = machine();
        m.start_receiving();
        m.handle(RadioEvent::DeviceDiscovered {
            name: "OBD2".into(),
        });
        m.handle(RadioEvent::Connected);
        m.handle(RadioEvent::ServicesDiscovered);
        m.handle(RadioEvent::MtuChanged { mtu: 517 });
        m.handle(RadioEvent::PublisherLocated);
        m.handle(RadioEvent::NotificationsRejected {
            reason: "write not permitted".into(),
        });

        assert_eq!(m.phase(), LinkPhase::Failed);
        assert_eq!(m.failures, 0);
        let events = drain(&mut rx);
        assert_eq!(
            events.last(),
            Some(&TelemetryEvent::Error("Could not enable notifications".into()))
        );
    }

    #[test]
    fn malformed_frames_are_dropped_silently() {
        let (mut m, mut rx) = machine();
        connect(&mut m);
        drain(&mut rx);

        m.handle(RadioEvent::FrameReceived(b"{\"Engine RPM\": }".to_vec()));
        m.handle(RadioEvent::FrameReceived(valid_frame()));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TelemetryEvent::Success(_)));
        assert_eq!(m.phase(), LinkPhase::Streaming);
    }

    #[test]
    fn close_connection_is_idempotent_and_restartable() {
        let (mut m, _rx) = machine();
        connect(&mut m);

        let commands = m.close_connection();
        assert_eq!(
            commands,
            vec![RadioCommand::DisableNotifications, RadioCommand::ReleaseLink]
        );
        assert!(m.close_connection().is_empty());
        assert!(m.close_connection().is_empty());
        assert_eq!(m.phase(), LinkPhase::Idle);

        assert_eq!(m.start_receiving(), vec![RadioCommand::StartScan]);
    }

    #[test]
    fn close_connection_while_scanning_stops_the_scan() {
        let (mut m, _rx) = machine();
        m.start_receiving();
        assert_eq!(m.close_connection(), vec![RadioCommand::StopScan]);
    }

    #[test]
    fn reconnect_requires_a_retained_link() {
        let (mut m, mut rx) = machine();
        assert!(m.reconnect().is_empty());

        connect(&mut m);
        m.disconnect();
        m.handle(RadioEvent::Disconnected);
        drain(&mut rx);

        // disconnect() preserved the handle, so no scan is needed.
        assert_eq!(m.reconnect(), vec![RadioCommand::Reconnect]);
        assert_eq!(m.phase(), LinkPhase::Connecting);
        m.handle(RadioEvent::Connected);
        assert_eq!(m.phase(), LinkPhase::ServiceDiscovery);
    }

    #[test]
    fn peer_initiated_disconnect_releases_the_link() {
        let (mut m, _rx) = machine();
        connect(&mut m);
        let commands = m.handle(RadioEvent::Disconnected);
        assert_eq!(commands, vec![RadioCommand::ReleaseLink]);
        // Handle is gone: reconnect cannot apply.
        assert!(m.reconnect().is_empty());
    }

    #[test]
    fn terminal_failure_allows_a_fresh_start() {
        let (mut m, mut rx) = machine();
        m.start_receiving();
        for _ in 0..6 {
            m.handle(RadioEvent::DeviceDiscovered {
                name: "OBD2".into(),
            });
            m.handle(RadioEvent::ConnectFailed {
                reason: "down".into(),
            });
        }
        assert_eq!(m.phase(), LinkPhase::Failed);
        drain(&mut rx);

        assert_eq!(m.start_receiving(), vec![RadioCommand::StartScan]);
        assert_eq!(m.failures, 0);
    }
}
