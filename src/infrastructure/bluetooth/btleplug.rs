//! Radio backend on btleplug.
//!
//! One task owns every BLE stack object (manager, adapter, peripheral,
//! characteristic); none of them ever leaves this module. The task executes
//! [`RadioCommand`]s from the driver and normalizes btleplug central events
//! and notification streams into [`RadioEvent`]s.

use crate::domain::settings::LinkSettings;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{RadioCommand, RadioEndpoint, RadioEvent};
use anyhow::{anyhow, Context, Result};
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, ValueNotification,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

type CentralEventStream = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;
type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

pub struct RadioBackend {
    commands: mpsc::UnboundedReceiver<RadioCommand>,
    worker: RadioWorker,
}

impl RadioBackend {
    pub fn new(settings: &LinkSettings, endpoint: RadioEndpoint) -> Result<Self> {
        let service_uuid = settings
            .service_uuid
            .parse()
            .with_context(|| format!("invalid service UUID: {}", settings.service_uuid))?;
        let characteristic_uuid = settings.characteristic_uuid.parse().with_context(|| {
            format!(
                "invalid characteristic UUID: {}",
                settings.characteristic_uuid
            )
        })?;

        Ok(Self {
            commands: endpoint.commands,
            worker: RadioWorker {
                events: endpoint.events,
                device_name: settings.device_name.clone(),
                service_uuid,
                characteristic_uuid,
                connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
                discovery_timeout: Duration::from_secs(settings.discovery_timeout_secs),
                adapter: None,
                peripheral: None,
                publisher: None,
                scanning: false,
            },
        })
    }

    pub async fn run(self) {
        let RadioBackend {
            mut commands,
            mut worker,
        } = self;
        let mut central_events: Option<CentralEventStream> = None;
        let mut notifications: Option<NotificationStream> = None;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        worker
                            .execute(command, &mut central_events, &mut notifications)
                            .await;
                    }
                    // Driver gone: shut the radio down.
                    None => break,
                },
                event = next_item(&mut central_events) => match event {
                    Some(event) => worker.on_central_event(event, &mut notifications).await,
                    None => {
                        warn!("adapter event stream ended");
                        central_events = None;
                    }
                },
                notification = next_item(&mut notifications) => match notification {
                    Some(notification) => worker.on_notification(notification),
                    None => {
                        debug!("notification stream closed by the stack");
                        notifications = None;
                        worker.report(RadioEvent::Disconnected);
                    }
                },
            }
        }

        worker.release_link(&mut notifications).await;
    }
}

/// Await the next item of an optional stream; parks forever when there is
/// no stream so the surrounding `select!` ignores the branch.
async fn next_item<S>(stream: &mut Option<S>) -> Option<S::Item>
where
    S: Stream + Unpin,
{
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

struct RadioWorker {
    events: mpsc::UnboundedSender<RadioEvent>,
    device_name: String,
    service_uuid: uuid::Uuid,
    characteristic_uuid: uuid::Uuid,
    connect_timeout: Duration,
    discovery_timeout: Duration,
    adapter: Option<Adapter>,
    peripheral: Option<Peripheral>,
    publisher: Option<Characteristic>,
    scanning: bool,
}

impl RadioWorker {
    fn report(&self, event: RadioEvent) {
        let _ = self.events.send(event);
    }

    async fn execute(
        &mut self,
        command: RadioCommand,
        central_events: &mut Option<CentralEventStream>,
        notifications: &mut Option<NotificationStream>,
    ) {
        debug!(?command, "executing radio command");
        match command {
            RadioCommand::StartScan => self.start_scan(central_events).await,
            RadioCommand::StopScan => self.stop_scan().await,
            RadioCommand::Connect | RadioCommand::Reconnect => self.connect().await,
            RadioCommand::DiscoverServices => self.discover_services().await,
            RadioCommand::RequestMtu(mtu) => {
                // Host BLE stacks negotiate the ATT MTU themselves right
                // after connecting; there is no per-connection request API.
                info!(requested = mtu, "MTU negotiation delegated to the host stack");
                self.report(RadioEvent::MtuChanged { mtu });
            }
            RadioCommand::LocatePublisher => self.locate_publisher(),
            RadioCommand::EnableNotifications => self.enable_notifications(notifications).await,
            RadioCommand::DisableNotifications => self.disable_notifications().await,
            RadioCommand::Disconnect => self.disconnect().await,
            RadioCommand::ReleaseLink => self.release_link(notifications).await,
        }
    }

    async fn start_scan(&mut self, central_events: &mut Option<CentralEventStream>) {
        if self.adapter.is_none() {
            match init_adapter().await {
                Ok((adapter, events)) => {
                    *central_events = Some(events);
                    self.adapter = Some(adapter);
                }
                Err(err) => {
                    warn!(%err, "Bluetooth adapter unavailable");
                    self.report(RadioEvent::ConnectFailed {
                        reason: err.to_string(),
                    });
                    return;
                }
            }
        }

        let adapter = match &self.adapter {
            Some(adapter) => adapter,
            None => return,
        };
        match adapter.start_scan(ScanFilter::default()).await {
            Ok(()) => {
                info!(device = %self.device_name, "scanning for peripheral");
                self.scanning = true;
            }
            Err(err) => {
                warn!(%err, "failed to start scan");
                self.report(RadioEvent::ConnectFailed {
                    reason: err.to_string(),
                });
            }
        }
    }

    async fn stop_scan(&mut self) {
        self.scanning = false;
        if let Some(adapter) = &self.adapter {
            if let Err(err) = adapter.stop_scan().await {
                warn!(%err, "failed to stop scan");
            }
        }
    }

    async fn connect(&mut self) {
        let peripheral = match &self.peripheral {
            Some(peripheral) => peripheral.clone(),
            None => {
                self.report(RadioEvent::ConnectFailed {
                    reason: "no peripheral to connect to".into(),
                });
                return;
            }
        };

        // BlueZ's Connect call can block indefinitely when the device went
        // out of range; a hard timeout keeps the retry loop moving.
        match timeout(self.connect_timeout, peripheral.connect()).await {
            Ok(Ok(())) => self.report(RadioEvent::Connected),
            Ok(Err(err)) => self.report(RadioEvent::ConnectFailed {
                reason: err.to_string(),
            }),
            Err(_) => self.report(RadioEvent::ConnectFailed {
                reason: format!("connect timed out after {:?}", self.connect_timeout),
            }),
        }
    }

    async fn discover_services(&mut self) {
        let peripheral = match &self.peripheral {
            Some(peripheral) => peripheral.clone(),
            None => return,
        };

        // On BlueZ the connection is signalled before the remote GATT cache
        // is populated; discovering too early yields an empty service set.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        match timeout(self.discovery_timeout, peripheral.discover_services()).await {
            Ok(Ok(())) => {
                self.log_gatt_table(&peripheral);
                self.report(RadioEvent::ServicesDiscovered);
            }
            Ok(Err(err)) => self.report(RadioEvent::ConnectFailed {
                reason: err.to_string(),
            }),
            Err(_) => self.report(RadioEvent::ConnectFailed {
                reason: format!(
                    "service discovery timed out after {:?}",
                    self.discovery_timeout
                ),
            }),
        }
    }

    fn log_gatt_table(&self, peripheral: &Peripheral) {
        for service in peripheral.services() {
            debug!(service = %service.uuid, primary = service.primary, "discovered service");
            for characteristic in &service.characteristics {
                let has_cccd = characteristic
                    .descriptors
                    .iter()
                    .any(|d| d.uuid == protocol::CCCD_UUID);
                debug!(
                    characteristic = %characteristic.uuid,
                    properties = ?characteristic.properties,
                    has_cccd,
                    "discovered characteristic"
                );
            }
        }
    }

    fn locate_publisher(&mut self) {
        let peripheral = match &self.peripheral {
            Some(peripheral) => peripheral,
            None => {
                self.report(RadioEvent::PublisherMissing);
                return;
            }
        };

        let characteristic = peripheral
            .services()
            .into_iter()
            .find(|service| service.uuid == self.service_uuid)
            .and_then(|service| {
                service
                    .characteristics
                    .iter()
                    .find(|c| c.uuid == self.characteristic_uuid)
                    .cloned()
            });

        match characteristic {
            Some(c)
                if c.properties
                    .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE) =>
            {
                debug!(characteristic = %c.uuid, "publisher characteristic located");
                self.publisher = Some(c);
                self.report(RadioEvent::PublisherLocated);
            }
            Some(c) => {
                warn!(
                    characteristic = %c.uuid,
                    properties = ?c.properties,
                    "characteristic present but not subscribable"
                );
                self.report(RadioEvent::PublisherMissing);
            }
            None => self.report(RadioEvent::PublisherMissing),
        }
    }

    async fn enable_notifications(&mut self, notifications: &mut Option<NotificationStream>) {
        let (peripheral, publisher) = match (&self.peripheral, &self.publisher) {
            (Some(peripheral), Some(publisher)) => (peripheral.clone(), publisher.clone()),
            _ => {
                self.report(RadioEvent::NotificationsRejected {
                    reason: "no publisher characteristic".into(),
                });
                return;
            }
        };

        // Indications are preferred when the peripheral offers both; the
        // stack writes the matching CCCD value on subscribe.
        let mode = if publisher.properties.contains(CharPropFlags::INDICATE) {
            "indicate"
        } else {
            "notify"
        };
        info!(characteristic = %publisher.uuid, mode, "subscribing to publisher");

        if let Err(err) = peripheral.subscribe(&publisher).await {
            self.report(RadioEvent::NotificationsRejected {
                reason: err.to_string(),
            });
            return;
        }

        match peripheral.notifications().await {
            Ok(stream) => {
                *notifications = Some(stream);
                self.report(RadioEvent::NotificationsEnabled);
            }
            Err(err) => self.report(RadioEvent::NotificationsRejected {
                reason: err.to_string(),
            }),
        }
    }

    async fn disable_notifications(&mut self) {
        if let (Some(peripheral), Some(publisher)) = (&self.peripheral, &self.publisher) {
            if let Err(err) = peripheral.unsubscribe(publisher).await {
                debug!(%err, "unsubscribe failed during teardown");
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(peripheral) = &self.peripheral {
            if let Err(err) = peripheral.disconnect().await {
                warn!(%err, "graceful disconnect failed");
            }
        }
    }

    async fn release_link(&mut self, notifications: &mut Option<NotificationStream>) {
        *notifications = None;
        self.publisher = None;
        if let Some(peripheral) = self.peripheral.take() {
            if peripheral.is_connected().await.unwrap_or(false) {
                if let Err(err) = peripheral.disconnect().await {
                    debug!(%err, "disconnect during release failed");
                }
            }
            debug!("peripheral handle released");
        }
    }

    async fn on_central_event(
        &mut self,
        event: CentralEvent,
        notifications: &mut Option<NotificationStream>,
    ) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if self.scanning {
                    self.inspect_advertisement(id).await;
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let ours = self
                    .peripheral
                    .as_ref()
                    .map(|p| p.id() == id)
                    .unwrap_or(false);
                if ours {
                    info!("peripheral disconnected");
                    *notifications = None;
                    self.report(RadioEvent::Disconnected);
                }
            }
            _ => {}
        }
    }

    /// Resolve a scan result and report it when the advertised name matches
    /// the configured device name exactly.
    async fn inspect_advertisement(&mut self, id: PeripheralId) {
        let adapter = match &self.adapter {
            Some(adapter) => adapter,
            None => return,
        };
        let peripheral = match adapter.peripheral(&id).await {
            Ok(peripheral) => peripheral,
            Err(err) => {
                debug!(%err, "scan result vanished before lookup");
                return;
            }
        };
        let name = match peripheral.properties().await {
            Ok(Some(props)) => props.local_name,
            _ => None,
        };
        if let Some(name) = name {
            if name == self.device_name {
                self.peripheral = Some(peripheral);
                self.report(RadioEvent::DeviceDiscovered { name });
            }
        }
    }

    fn on_notification(&mut self, notification: ValueNotification) {
        // Updates from anything but the publisher are ignored.
        if notification.uuid == self.characteristic_uuid {
            self.report(RadioEvent::FrameReceived(notification.value));
        }
    }
}

async fn init_adapter() -> Result<(Adapter, CentralEventStream)> {
    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no Bluetooth adapter found"))?;
    let events = adapter.events().await?;
    Ok((adapter, events))
}
