//! In-process radio simulator.
//!
//! Implements [`Radio`] without hardware. Every call is recorded so tests can
//! assert on what the core asked the radio to do. Events can be injected by
//! hand ([`SimulatedRadio::emit`], [`SimulatedRadio::advertise`]), or an
//! attached [`SimPeripheral`] answers link operations automatically.

use async_trait::async_trait;
use btleplug::api::CharPropFlags;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::radio::{
    AdvertisementStream, CharacteristicInfo, EventSink, GattStatus, LinkEvent, PeerAddress, Radio,
    RawAdvertisement, ScanEvent, SessionToken, WriteMode,
};
use crate::ble::uuids::*;
use crate::error::{Error, Result};

/// A call the core made on the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    /// `start_scan`.
    StartScan {
        /// Service filter.
        services: Vec<Uuid>,
    },
    /// `stop_scan`.
    StopScan,
    /// `open_link`.
    OpenLink {
        /// Peer the link was opened to.
        peer: PeerAddress,
        /// Session token of the new link.
        session: SessionToken,
    },
    /// `close_link`.
    CloseLink {
        /// Session that was closed.
        session: SessionToken,
    },
    /// `discover_services`.
    DiscoverServices {
        /// Session.
        session: SessionToken,
    },
    /// `enable_notifications`.
    EnableNotifications {
        /// Session.
        session: SessionToken,
        /// Characteristic UUID.
        uuid: Uuid,
    },
    /// `write_characteristic`.
    Write {
        /// Session.
        session: SessionToken,
        /// Characteristic UUID.
        uuid: Uuid,
        /// Written value.
        value: Bytes,
        /// Write mode.
        mode: WriteMode,
    },
}

/// A simulated peripheral that answers link operations on its own.
#[derive(Debug, Clone)]
pub struct SimPeripheral {
    /// Address the peripheral answers to.
    pub address: String,
    /// Advertised name.
    pub name: Option<String>,
    /// Characteristics reported by service discovery.
    pub characteristics: Vec<CharacteristicInfo>,
    /// Status returned for the notification-enable descriptor write.
    pub descriptor_status: GattStatus,
}

impl SimPeripheral {
    /// A RootTap button with both characteristics present.
    pub fn roottap(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: Some(DEFAULT_TARGET_NAME.to_string()),
            characteristics: roottap_characteristics(),
            descriptor_status: GattStatus::SUCCESS,
        }
    }
}

/// The characteristics a RootTap button exposes.
pub fn roottap_characteristics() -> Vec<CharacteristicInfo> {
    vec![
        CharacteristicInfo::new(
            PRESENCE_SERVICE_UUID,
            BUTTON_CHARACTERISTIC_UUID,
            CharPropFlags::READ | CharPropFlags::NOTIFY,
        ),
        CharacteristicInfo::new(
            PRESENCE_SERVICE_UUID,
            CONFIRM_CHARACTERISTIC_UUID,
            CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE,
        ),
    ]
}

#[derive(Default)]
struct SimState {
    available: bool,
    refuse_open: bool,
    refuse_writes: bool,
    scan_tx: Option<mpsc::UnboundedSender<ScanEvent>>,
    resolvable: HashSet<String>,
    sinks: HashMap<SessionToken, EventSink>,
    retired: HashMap<SessionToken, EventSink>,
    calls: Vec<RadioCall>,
    peripheral: Option<SimPeripheral>,
}

/// In-process [`Radio`] implementation.
pub struct SimulatedRadio {
    state: Mutex<SimState>,
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRadio {
    /// Create an available radio with no peers.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                available: true,
                ..Default::default()
            }),
        }
    }

    /// Create a radio with an auto-responding peripheral attached.
    pub fn with_peripheral(peripheral: SimPeripheral) -> Self {
        let radio = Self::new();
        radio.attach(peripheral);
        radio
    }

    /// Attach an auto-responding peripheral. Its address becomes resolvable.
    pub fn attach(&self, peripheral: SimPeripheral) {
        let mut state = self.state.lock();
        state.resolvable.insert(peripheral.address.clone());
        state.peripheral = Some(peripheral);
    }

    /// Make an address resolvable without attaching a peripheral.
    pub fn add_known_peer(&self, address: impl Into<String>) {
        self.state.lock().resolvable.insert(address.into());
    }

    /// Switch the radio on or off.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Make `open_link` refuse synchronously.
    pub fn set_refuse_open(&self, refuse: bool) {
        self.state.lock().refuse_open = refuse;
    }

    /// Make `write_characteristic` refuse synchronously.
    pub fn set_refuse_writes(&self, refuse: bool) {
        self.state.lock().refuse_writes = refuse;
    }

    /// Deliver an advertisement to the active scan. Returns `false` if no scan is running.
    pub fn advertise(&self, address: &str, name: Option<&str>, rssi: i16) -> bool {
        self.scan_event(ScanEvent::Advertisement(RawAdvertisement {
            address: address.to_string(),
            name: name.map(str::to_string),
            rssi,
        }))
    }

    /// Report a platform scan failure to the active scan.
    pub fn fail_scan(&self, code: i32) -> bool {
        self.scan_event(ScanEvent::Failed(code))
    }

    fn scan_event(&self, event: ScanEvent) -> bool {
        let state = self.state.lock();
        match &state.scan_tx {
            Some(tx) => tx.unbounded_send(event).is_ok(),
            None => false,
        }
    }

    /// Inject an event for a session, open or closed.
    ///
    /// Closed sessions keep their sink, which is how tests produce stale events.
    pub fn emit(&self, session: SessionToken, event: LinkEvent) -> bool {
        let sink = {
            let state = self.state.lock();
            state
                .sinks
                .get(&session)
                .or_else(|| state.retired.get(&session))
                .cloned()
        };
        match sink {
            Some(sink) => sink.emit(event),
            None => false,
        }
    }

    /// Simulate the peripheral asserting its input on the newest open session.
    pub fn press(&self) -> bool {
        match self.latest_session() {
            Some(session) => self.emit(
                session,
                LinkEvent::CharacteristicChanged {
                    uuid: BUTTON_CHARACTERISTIC_UUID,
                    value: Bytes::from_static(&[0x01]),
                },
            ),
            None => false,
        }
    }

    /// Simulate the peripheral dropping the newest open session.
    pub fn drop_link(&self) -> bool {
        match self.latest_session() {
            Some(session) => self.emit(session, LinkEvent::Disconnected),
            None => false,
        }
    }

    /// Every call recorded so far.
    pub fn calls(&self) -> Vec<RadioCall> {
        self.state.lock().calls.clone()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Number of `stop_scan` calls.
    pub fn stop_scan_count(&self) -> usize {
        self.count(|call| matches!(call, RadioCall::StopScan))
    }

    /// Number of `open_link` calls.
    pub fn open_count(&self) -> usize {
        self.count(|call| matches!(call, RadioCall::OpenLink { .. }))
    }

    /// Values written so far.
    pub fn writes(&self) -> Vec<Bytes> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                RadioCall::Write { value, .. } => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    fn count(&self, predicate: impl Fn(&RadioCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| predicate(c)).count()
    }

    /// Sessions currently open.
    pub fn open_sessions(&self) -> Vec<SessionToken> {
        let mut sessions: Vec<_> = self.state.lock().sinks.keys().copied().collect();
        sessions.sort();
        sessions
    }

    /// The newest open session.
    pub fn latest_session(&self) -> Option<SessionToken> {
        self.open_sessions().last().copied()
    }

    /// Check if a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.state.lock().scan_tx.is_some()
    }

    fn require_session(state: &SimState, session: SessionToken) -> Result<EventSink> {
        state
            .sinks
            .get(&session)
            .cloned()
            .ok_or(Error::SessionNotFound {
                session: session.get(),
            })
    }
}

#[async_trait]
impl Radio for SimulatedRadio {
    async fn start_scan(&self, services: &[Uuid]) -> Result<AdvertisementStream> {
        let mut state = self.state.lock();
        state.calls.push(RadioCall::StartScan {
            services: services.to_vec(),
        });
        if !state.available {
            return Err(Error::RadioUnavailable);
        }

        let (tx, rx) = mpsc::unbounded();
        if let Some(peripheral) = &state.peripheral {
            let _ = tx.unbounded_send(ScanEvent::Advertisement(RawAdvertisement {
                address: peripheral.address.clone(),
                name: peripheral.name.clone(),
                rssi: -55,
            }));
        }
        state.scan_tx = Some(tx);
        debug!("Simulated scan started");
        Ok(rx.boxed())
    }

    fn stop_scan(&self) {
        let mut state = self.state.lock();
        state.calls.push(RadioCall::StopScan);
        state.scan_tx = None;
        debug!("Simulated scan stopped");
    }

    async fn resolve_peer(&self, address: &str) -> Result<PeerAddress> {
        if self.state.lock().resolvable.contains(address) {
            Ok(PeerAddress::new(address))
        } else {
            Err(Error::PeerResolutionFailed {
                address: address.to_string(),
            })
        }
    }

    fn open_link(&self, peer: &PeerAddress, sink: EventSink) -> Result<()> {
        let mut state = self.state.lock();
        let session = sink.session();
        state.calls.push(RadioCall::OpenLink {
            peer: peer.clone(),
            session,
        });
        if !state.available {
            return Err(Error::RadioUnavailable);
        }
        if state.refuse_open {
            return Err(Error::ConnectionFailed {
                reason: "simulated refusal".to_string(),
            });
        }

        let auto = state
            .peripheral
            .as_ref()
            .map(|p| p.address == peer.as_str())
            .unwrap_or(false);
        state.sinks.insert(session, sink.clone());
        drop(state);

        trace!("Simulated link {} opened to {}", session, peer);
        if auto {
            sink.emit(LinkEvent::Connected);
        }
        Ok(())
    }

    fn close_link(&self, session: SessionToken) {
        let mut state = self.state.lock();
        state.calls.push(RadioCall::CloseLink { session });
        if let Some(sink) = state.sinks.remove(&session) {
            state.retired.insert(session, sink);
            trace!("Simulated link {} closed", session);
        }
    }

    fn discover_services(&self, session: SessionToken) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(RadioCall::DiscoverServices { session });
        let sink = Self::require_session(&state, session)?;
        let characteristics = state.peripheral.as_ref().map(|p| p.characteristics.clone());
        drop(state);

        if let Some(characteristics) = characteristics {
            sink.emit(LinkEvent::ServicesDiscovered(Ok(characteristics)));
        }
        Ok(())
    }

    fn enable_notifications(
        &self,
        session: SessionToken,
        characteristic: &CharacteristicInfo,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(RadioCall::EnableNotifications {
            session,
            uuid: characteristic.uuid,
        });
        let sink = Self::require_session(&state, session)?;
        let status = state.peripheral.as_ref().map(|p| p.descriptor_status);
        drop(state);

        if let Some(status) = status {
            sink.emit(LinkEvent::DescriptorWritten {
                uuid: CCCD_UUID,
                status,
            });
        }
        Ok(())
    }

    fn write_characteristic(
        &self,
        session: SessionToken,
        characteristic: &CharacteristicInfo,
        value: Bytes,
        mode: WriteMode,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(RadioCall::Write {
            session,
            uuid: characteristic.uuid,
            value,
            mode,
        });
        let sink = Self::require_session(&state, session)?;
        if state.refuse_writes {
            return Err(Error::Internal("simulated write refusal".to_string()));
        }
        let auto = state.peripheral.is_some();
        drop(state);

        if auto && mode == WriteMode::Acknowledged {
            sink.emit(LinkEvent::CharacteristicWritten {
                uuid: characteristic.uuid,
                status: GattStatus::SUCCESS,
            });
        }
        Ok(())
    }
}
