//! btleplug-backed [`Radio`].
//!
//! Scan results are keyed by the platform peripheral identifier, which is
//! also the address accepted by [`Radio::resolve_peer`]. Link operations
//! spawn their work on the current Tokio runtime and report back through the
//! session's [`EventSink`].

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::radio::{
    AdvertisementStream, CharacteristicInfo, EventSink, GattStatus, LinkEvent, PeerAddress, Radio,
    RawAdvertisement, ScanEvent, SessionToken, WriteMode,
};
use crate::ble::uuids::CCCD_UUID;
use crate::error::{Error, Result};

/// RSSI reported when the platform omits one.
const UNKNOWN_RSSI: i16 = -127;

struct PlatformSession {
    peripheral: Peripheral,
    sink: EventSink,
    tasks: Vec<JoinHandle<()>>,
}

/// Map an adapter's refusal to scan onto the crate's error taxonomy.
///
/// A missing, disabled or otherwise unusable adapter reports as
/// [`Error::RadioUnavailable`]; a platform permission refusal as
/// [`Error::PermissionDenied`].
fn scan_start_error(err: btleplug::Error) -> Error {
    match err {
        btleplug::Error::PermissionDenied => Error::PermissionDenied,
        other => {
            warn!("Adapter refused to scan: {}", other);
            Error::RadioUnavailable
        }
    }
}

impl PlatformSession {
    fn abort(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// The system Bluetooth adapter.
pub struct PlatformRadio {
    adapter: Adapter,
    /// Peripherals seen while scanning, by address.
    known: Arc<RwLock<HashMap<String, Peripheral>>>,
    /// Open link sessions.
    sessions: Arc<Mutex<HashMap<SessionToken, PlatformSession>>>,
}

impl PlatformRadio {
    /// Open the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::RadioUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::RadioUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Use a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            known: Arc::new(RwLock::new(HashMap::new())),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn runtime() -> Result<Handle> {
        Handle::try_current().map_err(|e| Error::Internal(format!("no async runtime: {}", e)))
    }

    /// Spawn work bound to a session; it is aborted when the session closes.
    fn spawn_for<F>(&self, session: SessionToken, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = Self::runtime()?.spawn(task);
        match self.sessions.lock().get_mut(&session) {
            Some(entry) => {
                entry.tasks.retain(|task| !task.is_finished());
                entry.tasks.push(handle);
                Ok(())
            }
            None => {
                handle.abort();
                Err(Error::SessionNotFound {
                    session: session.get(),
                })
            }
        }
    }

    fn session(&self, session: SessionToken) -> Result<(Peripheral, EventSink)> {
        self.sessions
            .lock()
            .get(&session)
            .map(|entry| (entry.peripheral.clone(), entry.sink.clone()))
            .ok_or(Error::SessionNotFound {
                session: session.get(),
            })
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        info: &CharacteristicInfo,
    ) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == info.uuid && c.service_uuid == info.service_uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: info.uuid.to_string(),
            })
    }

    /// Turn an adapter event into an advertisement, remembering the peripheral.
    async fn process_event(
        adapter: &Adapter,
        known: &RwLock<HashMap<String, Peripheral>>,
        event: CentralEvent,
    ) -> Option<ScanEvent> {
        let id = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
            CentralEvent::ManufacturerDataAdvertisement { id, .. }
            | CentralEvent::ServiceDataAdvertisement { id, .. }
            | CentralEvent::ServicesAdvertisement { id, .. } => id,
            other => {
                trace!("Ignoring adapter event during scan: {:?}", other);
                return None;
            }
        };

        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return None,
        };

        let address = id.to_string();
        known.write().insert(address.clone(), peripheral);

        Some(ScanEvent::Advertisement(RawAdvertisement {
            address,
            name: properties.local_name,
            rssi: properties.rssi.unwrap_or(UNKNOWN_RSSI),
        }))
    }

    /// Emit `Disconnected` once the adapter reports the peripheral gone.
    async fn watch_disconnect(adapter: Adapter, id: PeripheralId, sink: EventSink) {
        let mut events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to get adapter events: {}", e);
                return;
            }
        };

        while let Some(event) = events.next().await {
            if let CentralEvent::DeviceDisconnected(gone) = event {
                if gone == id {
                    debug!("Peripheral {:?} disconnected", id);
                    sink.emit(LinkEvent::Disconnected);
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl Radio for PlatformRadio {
    async fn start_scan(&self, services: &[Uuid]) -> Result<AdvertisementStream> {
        if let Ok(CentralState::PoweredOff) = self.adapter.adapter_state().await {
            warn!("Bluetooth adapter is powered off");
            return Err(Error::RadioUnavailable);
        }

        // Subscribe first so no advertisement slips past.
        let events = self.adapter.events().await.map_err(scan_start_error)?;

        self.adapter
            .start_scan(ScanFilter {
                services: services.to_vec(),
            })
            .await
            .map_err(scan_start_error)?;

        info!("BLE scan started");

        let adapter = self.adapter.clone();
        let known = self.known.clone();
        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let known = known.clone();
            async move { Self::process_event(&adapter, &known, event).await }
        });

        Ok(stream.boxed())
    }

    fn stop_scan(&self) {
        let adapter = self.adapter.clone();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = adapter.stop_scan().await {
                        warn!("Failed to stop scan: {}", e);
                    } else {
                        info!("BLE scan stopped");
                    }
                });
            }
            Err(_) => warn!("No async runtime, scan left running"),
        }
    }

    async fn resolve_peer(&self, address: &str) -> Result<PeerAddress> {
        if self.known.read().contains_key(address) {
            return Ok(PeerAddress::new(address));
        }

        let peripherals = self.adapter.peripherals().await?;
        let found = peripherals
            .into_iter()
            .find(|p| p.id().to_string() == address);

        match found {
            Some(peripheral) => {
                self.known.write().insert(address.to_string(), peripheral);
                Ok(PeerAddress::new(address))
            }
            None => Err(Error::PeerResolutionFailed {
                address: address.to_string(),
            }),
        }
    }

    fn open_link(&self, peer: &PeerAddress, sink: EventSink) -> Result<()> {
        let peripheral = self
            .known
            .read()
            .get(peer.as_str())
            .cloned()
            .ok_or_else(|| Error::PeerResolutionFailed {
                address: peer.to_string(),
            })?;
        let runtime = Self::runtime()?;
        let session = sink.session();

        let watcher = runtime.spawn(Self::watch_disconnect(
            self.adapter.clone(),
            peripheral.id(),
            sink.clone(),
        ));

        let connect_sink = sink.clone();
        let connect_peripheral = peripheral.clone();
        let connector = runtime.spawn(async move {
            match connect_peripheral.connect().await {
                Ok(()) => {
                    connect_sink.emit(LinkEvent::Connected);
                }
                Err(e) => {
                    warn!("Connect failed for session {}: {}", session, e);
                    connect_sink.emit(LinkEvent::Disconnected);
                }
            }
        });

        debug!("Opening session {} to {}", session, peer);
        self.sessions.lock().insert(
            session,
            PlatformSession {
                peripheral,
                sink,
                tasks: vec![watcher, connector],
            },
        );

        Ok(())
    }

    fn close_link(&self, session: SessionToken) {
        let Some(mut entry) = self.sessions.lock().remove(&session) else {
            return;
        };
        entry.abort();

        let peripheral = entry.peripheral;
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = peripheral.disconnect().await {
                        debug!("Disconnect of session {} failed: {}", session, e);
                    }
                });
            }
            Err(_) => warn!("No async runtime, session {} not disconnected", session),
        }
        debug!("Closed session {}", session);
    }

    fn discover_services(&self, session: SessionToken) -> Result<()> {
        let (peripheral, sink) = self.session(session)?;

        self.spawn_for(session, async move {
            let result = match peripheral.discover_services().await {
                Ok(()) => {
                    let characteristics: Vec<_> = peripheral
                        .characteristics()
                        .into_iter()
                        .map(|c| CharacteristicInfo::new(c.service_uuid, c.uuid, c.properties))
                        .collect();
                    debug!("Discovered {} characteristics", characteristics.len());
                    Ok(characteristics)
                }
                Err(e) => {
                    warn!("Service discovery failed: {}", e);
                    Err(GattStatus::FAILURE)
                }
            };
            sink.emit(LinkEvent::ServicesDiscovered(result));
        })
    }

    fn enable_notifications(
        &self,
        session: SessionToken,
        characteristic: &CharacteristicInfo,
    ) -> Result<()> {
        let (peripheral, sink) = self.session(session)?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;

        self.spawn_for(session, async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to open notification stream: {}", e);
                    sink.emit(LinkEvent::DescriptorWritten {
                        uuid: CCCD_UUID,
                        status: GattStatus::FAILURE,
                    });
                    return;
                }
            };

            let status = match peripheral.subscribe(&target).await {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => {
                    debug!("Failed to subscribe to {}: {:?}", target.uuid, e);
                    GattStatus::FAILURE
                }
            };
            if !sink.emit(LinkEvent::DescriptorWritten {
                uuid: CCCD_UUID,
                status,
            }) || !status.is_success()
            {
                return;
            }

            while let Some(notification) = notifications.next().await {
                trace!(
                    "Notification from {}: {} bytes",
                    notification.uuid,
                    notification.value.len()
                );
                let delivered = sink.emit(LinkEvent::CharacteristicChanged {
                    uuid: notification.uuid,
                    value: Bytes::from(notification.value),
                });
                if !delivered {
                    break;
                }
            }

            debug!("Notification listener for session {} stopped", session);
        })
    }

    fn write_characteristic(
        &self,
        session: SessionToken,
        characteristic: &CharacteristicInfo,
        value: Bytes,
        mode: WriteMode,
    ) -> Result<()> {
        let (peripheral, sink) = self.session(session)?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;

        self.spawn_for(session, async move {
            let status = match peripheral.write(&target, &value[..], mode.into()).await {
                Ok(()) => {
                    trace!("Wrote {} bytes to characteristic {}", value.len(), target.uuid);
                    GattStatus::SUCCESS
                }
                Err(e) => {
                    warn!("Write to {} failed: {}", target.uuid, e);
                    GattStatus::FAILURE
                }
            };

            // Unacknowledged writes only report failures.
            if mode == WriteMode::Acknowledged || !status.is_success() {
                sink.emit(LinkEvent::CharacteristicWritten {
                    uuid: target.uuid,
                    status,
                });
            }
        })
    }
}

impl Drop for PlatformRadio {
    fn drop(&mut self) {
        let runtime = Handle::try_current().ok();
        for (session, mut entry) in self.sessions.lock().drain() {
            entry.abort();

            let peripheral = entry.peripheral;
            match &runtime {
                Some(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = peripheral.disconnect().await {
                            debug!("Disconnect of session {} failed: {}", session, e);
                        }
                    });
                }
                None => warn!("No async runtime, session {} not disconnected", session),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_start_errors_map_to_unavailable() {
        assert!(matches!(
            scan_start_error(btleplug::Error::NotSupported("adapter disabled".to_string())),
            Error::RadioUnavailable
        ));
        assert!(matches!(
            scan_start_error(btleplug::Error::RuntimeError("powered off".to_string())),
            Error::RadioUnavailable
        ));
        assert!(matches!(
            scan_start_error(btleplug::Error::DeviceNotFound),
            Error::RadioUnavailable
        ));
    }

    #[test]
    fn test_scan_permission_refusal_is_kept() {
        assert!(matches!(
            scan_start_error(btleplug::Error::PermissionDenied),
            Error::PermissionDenied
        ));
    }
}
