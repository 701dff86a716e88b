//! BLE connection management.
//!
//! [`LinkStateMachine`] owns the link to one target peer: it opens a session,
//! discovers services, resolves the button and confirm characteristics, arms
//! notifications and then runs the presence protocol. Unexpected drops are
//! answered with a fresh session according to the [`ReconnectPolicy`].
//!
//! Every transport event carries the [`SessionToken`] of the session that
//! produced it. Events from any other session, or arriving while no target
//! is set, are stale: they are discarded and their session is released.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::radio::{
    CharacteristicInfo, EventSink, GattStatus, LinkEvent, LinkInput, PeerAddress, Radio,
    SessionToken,
};
use crate::ble::uuids::*;
use crate::error::{Error, ErrorSlot, Result};
use crate::protocol::{ProtocolHandler, ProtocolStats};

/// Connection state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No link, and no link wanted.
    #[default]
    Disconnected,
    /// A session is being opened or re-opened.
    Connecting,
    /// The transport reports the link as up.
    Connected,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// The target at the time of the transition, if any.
    pub address: Option<PeerAddress>,
    /// The new connection state.
    pub state: ConnectionState,
}

/// What to do when the service or characteristics cannot be resolved, or
/// notifications cannot be armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResolutionFailurePolicy {
    /// Tear the session down and reconnect through the reconnect policy.
    #[default]
    Retry,
    /// Tear the session down, clear the target and stay disconnected.
    Fail,
}

/// Reconnect attempt cap and backoff curve.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReconnectPolicy {
    /// Maximum consecutive reconnect attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Upper bound for the delay.
    pub max_delay: Duration,
    /// Factor applied to the delay after each attempt.
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Reconnect immediately, forever.
    pub fn immediate() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Never reconnect; a drop ends the link.
    pub fn never() -> Self {
        Self {
            max_attempts: Some(0),
            ..Self::immediate()
        }
    }

    /// Cap the number of consecutive attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the backoff curve.
    pub fn with_backoff(mut self, initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        self.initial_delay = initial_delay;
        self.max_delay = max_delay;
        self.multiplier = multiplier;
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based), or `None` once the cap is reached.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt > max {
                return None;
            }
        }

        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64().max(self.initial_delay.as_secs_f64()));
        Some(Duration::from_secs_f64(capped))
    }
}

/// Link configuration, supplied at construction.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinkConfig {
    /// Service holding both characteristics.
    pub service_uuid: Uuid,
    /// Characteristic the peripheral notifies on.
    pub notify_uuid: Uuid,
    /// Characteristic the host acknowledges on.
    pub write_uuid: Uuid,
    /// Reconnect behavior after unexpected drops.
    pub reconnect: ReconnectPolicy,
    /// Behavior when endpoints cannot be resolved or armed.
    pub on_resolution_failure: ResolutionFailurePolicy,
    /// How long a session may stay `Connecting` before it counts as dropped.
    pub connect_timeout: Option<Duration>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service_uuid: PRESENCE_SERVICE_UUID,
            notify_uuid: BUTTON_CHARACTERISTIC_UUID,
            write_uuid: CONFIRM_CHARACTERISTIC_UUID,
            reconnect: ReconnectPolicy::default(),
            on_resolution_failure: ResolutionFailurePolicy::default(),
            connect_timeout: Some(Duration::from_secs(15)),
        }
    }
}

impl LinkConfig {
    /// Set the reconnect policy.
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the resolution failure policy.
    pub fn with_resolution_failure(mut self, policy: ResolutionFailurePolicy) -> Self {
        self.on_resolution_failure = policy;
        self
    }

    /// Set or clear the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Use different service and characteristic UUIDs.
    pub fn with_endpoints(mut self, service: Uuid, notify: Uuid, write: Uuid) -> Self {
        self.service_uuid = service;
        self.notify_uuid = notify;
        self.write_uuid = write;
        self
    }
}

/// The characteristics the protocol runs on, valid for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoints {
    /// Characteristic the peripheral notifies on.
    pub notify: CharacteristicInfo,
    /// Characteristic the host writes acknowledges to.
    pub write: CharacteristicInfo,
}

impl ResolvedEndpoints {
    /// Pick both endpoints out of a discovery result.
    pub fn resolve(characteristics: &[CharacteristicInfo], config: &LinkConfig) -> Result<Self> {
        if !characteristics
            .iter()
            .any(|c| c.service_uuid == config.service_uuid)
        {
            return Err(Error::ResolutionFailed {
                what: format!("service {}", config.service_uuid),
            });
        }

        let find = |uuid: Uuid| {
            characteristics
                .iter()
                .find(|c| c.service_uuid == config.service_uuid && c.uuid == uuid)
                .cloned()
        };

        match (find(config.notify_uuid), find(config.write_uuid)) {
            (Some(notify), Some(write)) => Ok(Self { notify, write }),
            (notify, write) => {
                let mut missing = Vec::new();
                if notify.is_none() {
                    missing.push(format!("notify characteristic {}", config.notify_uuid));
                }
                if write.is_none() {
                    missing.push(format!("write characteristic {}", config.write_uuid));
                }
                Err(Error::ResolutionFailed {
                    what: missing.join(", "),
                })
            }
        }
    }
}

/// The state machine proper. All inputs are applied under one lock.
pub(crate) struct LinkCore {
    radio: Arc<dyn Radio>,
    config: LinkConfig,
    input_tx: mpsc::UnboundedSender<LinkInput>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    last_error: ErrorSlot,
    state: ConnectionState,
    target: Option<PeerAddress>,
    session: Option<SessionToken>,
    pending_reconnect: Option<SessionToken>,
    last_token: SessionToken,
    endpoints: Option<ResolvedEndpoints>,
    notify_ready: bool,
    reconnect_attempts: u32,
    protocol: ProtocolHandler,
}

impl LinkCore {
    pub(crate) fn new(
        radio: Arc<dyn Radio>,
        config: LinkConfig,
        input_tx: mpsc::UnboundedSender<LinkInput>,
        event_tx: broadcast::Sender<ConnectionEvent>,
        last_error: ErrorSlot,
    ) -> Self {
        Self {
            radio,
            config,
            input_tx,
            event_tx,
            last_error,
            state: ConnectionState::Disconnected,
            target: None,
            session: None,
            pending_reconnect: None,
            last_token: SessionToken::new(0),
            endpoints: None,
            notify_ready: false,
            reconnect_attempts: 0,
            protocol: ProtocolHandler::new(),
        }
    }

    pub(crate) fn connect(&mut self, peer: PeerAddress) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            debug!("Rejecting connect to {}: link is {}", peer, self.state);
            return Err(Error::ConnectionFailed {
                reason: format!("link busy ({})", self.state),
            });
        }

        info!("Connecting to {}", peer);

        self.target = Some(peer.clone());
        self.reconnect_attempts = 0;
        self.protocol.reset_stats();
        *self.last_error.write() = None;
        self.set_state(ConnectionState::Connecting);

        let token = self.mint_token();
        if let Err(e) = self.open_session(&peer, token) {
            error!("Failed to open link to {}: {}", peer, e);
            self.target = None;
            self.set_state(ConnectionState::Disconnected);
            self.record_error(&e);
            return Err(e);
        }

        Ok(())
    }

    pub(crate) fn disconnect(&mut self) {
        let target = self.target.take();
        self.pending_reconnect = None;
        self.reconnect_attempts = 0;
        self.release_session();
        self.set_state(ConnectionState::Disconnected);

        if let Some(target) = target {
            info!("Disconnected from {} by request", target);
        }
    }

    pub(crate) fn handle_input(&mut self, input: LinkInput) {
        match input {
            LinkInput::Transport { session, event } => self.handle_transport(session, event),
            LinkInput::ConnectTimeout { session } => {
                if self.is_current(session) && self.state == ConnectionState::Connecting {
                    warn!("Connect attempt {} timed out", session);
                    self.handle_drop();
                } else {
                    trace!("Ignoring expired connect timer for {}", session);
                }
            }
            LinkInput::ReconnectDue { session } => {
                if self.pending_reconnect != Some(session) || self.target.is_none() {
                    trace!("Ignoring cancelled reconnect {}", session);
                    return;
                }
                self.pending_reconnect = None;
                self.open_reconnect_session(session);
            }
        }
    }

    fn is_current(&self, session: SessionToken) -> bool {
        self.target.is_some() && self.session == Some(session)
    }

    fn handle_transport(&mut self, session: SessionToken, event: LinkEvent) {
        if !self.is_current(session) {
            debug!("Discarding stale {:?} from session {}", event, session);
            self.radio.close_link(session);
            return;
        }

        match event {
            LinkEvent::Connected => self.on_connected(session),
            LinkEvent::Disconnected => {
                info!("Session {} dropped by transport", session);
                self.handle_drop();
            }
            LinkEvent::ServicesDiscovered(Ok(characteristics)) => {
                self.on_services_discovered(session, &characteristics)
            }
            LinkEvent::ServicesDiscovered(Err(status)) => {
                self.handle_resolution_failure(Error::ResolutionFailed {
                    what: format!("service discovery status {}", status),
                });
            }
            LinkEvent::DescriptorWritten { uuid, status } => {
                self.on_descriptor_written(session, uuid, status)
            }
            LinkEvent::CharacteristicChanged { uuid, value } => {
                self.on_characteristic_changed(session, uuid, &value)
            }
            LinkEvent::CharacteristicWritten { uuid, status } => {
                debug!("Write to {} completed with status {}", uuid, status);
                if let Err(e) = self.protocol.record_write_result(status) {
                    self.record_error(&e);
                }
            }
        }
    }

    fn on_connected(&mut self, session: SessionToken) {
        if self.state != ConnectionState::Connecting {
            debug!("Duplicate connected event for {}", session);
            return;
        }

        info!("Session {} connected, discovering services", session);
        self.set_state(ConnectionState::Connected);

        if let Err(e) = self.radio.discover_services(session) {
            warn!("Failed to start service discovery: {}", e);
            self.handle_drop();
        }
    }

    fn on_services_discovered(
        &mut self,
        session: SessionToken,
        characteristics: &[CharacteristicInfo],
    ) {
        if self.state != ConnectionState::Connected || self.endpoints.is_some() {
            debug!("Unexpected service discovery result for {}", session);
            return;
        }

        let endpoints = match ResolvedEndpoints::resolve(characteristics, &self.config) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                self.handle_resolution_failure(e);
                return;
            }
        };

        debug!(
            "Resolved notify {} and write {} on session {}",
            endpoints.notify.uuid, endpoints.write.uuid, session
        );

        let notify = endpoints.notify.clone();
        self.endpoints = Some(endpoints);

        if let Err(e) = self.radio.enable_notifications(session, &notify) {
            self.handle_resolution_failure(e);
        }
    }

    fn on_descriptor_written(&mut self, session: SessionToken, uuid: Uuid, status: GattStatus) {
        if self.endpoints.is_none() {
            debug!("Descriptor write {} before endpoints resolved, ignoring", uuid);
            return;
        }

        self.notify_ready = status.is_success();
        if self.notify_ready {
            info!("Notifications armed on session {}", session);
            self.reconnect_attempts = 0;
        } else {
            self.handle_resolution_failure(Error::DescriptorWriteFailed { status: status.0 });
        }
    }

    fn on_characteristic_changed(&mut self, session: SessionToken, uuid: Uuid, value: &[u8]) {
        let Some(endpoints) = &self.endpoints else {
            trace!("Notification before endpoints resolved, ignoring");
            return;
        };
        if uuid != endpoints.notify.uuid {
            trace!("Notification from unexpected characteristic {}", uuid);
            return;
        }

        let write = endpoints.write.clone();
        let Some(ack) = self
            .protocol
            .on_notification(self.notify_ready, value, write.properties)
        else {
            return;
        };

        match self
            .radio
            .write_characteristic(session, &write, ack.value, ack.mode)
        {
            Ok(()) => self.protocol.record_acknowledge_sent(),
            Err(e) => {
                warn!("Failed to send acknowledge: {}", e);
                self.record_error(&e);
            }
        }
    }

    /// The transport lost the session, or the attempt timed out.
    fn handle_drop(&mut self) {
        self.release_session();
        self.schedule_reconnect();
    }

    fn handle_resolution_failure(&mut self, err: Error) {
        warn!("Link setup failed: {}", err);
        self.record_error(&err);

        match self.config.on_resolution_failure {
            ResolutionFailurePolicy::Retry => self.handle_drop(),
            ResolutionFailurePolicy::Fail => self.give_up(err),
        }
    }

    fn schedule_reconnect(&mut self) {
        let Some(target) = self.target.clone() else {
            self.set_state(ConnectionState::Disconnected);
            return;
        };

        self.reconnect_attempts += 1;
        let attempt = self.reconnect_attempts;

        let Some(delay) = self.config.reconnect.delay_for(attempt) else {
            self.give_up(Error::ReconnectExhausted {
                attempts: attempt - 1,
            });
            return;
        };

        self.set_state(ConnectionState::Connecting);
        let token = self.mint_token();

        if delay.is_zero() {
            info!("Reconnecting to {} (attempt {})", target, attempt);
            self.open_reconnect_session(token);
        } else {
            info!(
                "Reconnecting to {} in {:?} (attempt {})",
                target, delay, attempt
            );
            self.pending_reconnect = Some(token);
            self.schedule(delay, LinkInput::ReconnectDue { session: token });
        }
    }

    fn open_reconnect_session(&mut self, token: SessionToken) {
        let Some(target) = self.target.clone() else {
            return;
        };

        if let Err(e) = self.open_session(&target, token) {
            error!("Failed to reopen link to {}: {}", target, e);
            self.give_up(e);
        }
    }

    fn open_session(&mut self, peer: &PeerAddress, token: SessionToken) -> Result<()> {
        debug_assert!(self.session.is_none(), "previous session must be released first");

        let sink = EventSink::new(token, self.input_tx.clone());
        self.radio.open_link(peer, sink)?;
        self.session = Some(token);
        debug!("Opened session {} to {}", token, peer);

        if let Some(timeout) = self.config.connect_timeout {
            self.schedule(timeout, LinkInput::ConnectTimeout { session: token });
        }

        Ok(())
    }

    /// Give up on the target after a terminal failure.
    fn give_up(&mut self, err: Error) {
        error!("Giving up on link: {}", err);
        self.target = None;
        self.pending_reconnect = None;
        self.reconnect_attempts = 0;
        self.release_session();
        self.set_state(ConnectionState::Disconnected);
        self.record_error(&err);
    }

    /// Close the current session and forget everything bound to it.
    fn release_session(&mut self) {
        if let Some(session) = self.session.take() {
            self.radio.close_link(session);
            debug!("Released session {}", session);
        }
        self.endpoints = None;
        self.notify_ready = false;
    }

    fn mint_token(&mut self) -> SessionToken {
        self.last_token = self.last_token.next();
        self.last_token
    }

    fn schedule(&self, delay: Duration, input: LinkInput) {
        let tx = self.input_tx.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(input);
                });
            }
            Err(_) => warn!("No async runtime, dropping timer {:?}", input),
        }
    }

    fn record_error(&self, err: &Error) {
        *self.last_error.write() = Some(err.to_string());
    }

    fn set_state(&mut self, new_state: ConnectionState) {
        let old_state = std::mem::replace(&mut self.state, new_state);

        if old_state != new_state {
            debug!("Connection state changed: {} -> {}", old_state, new_state);

            let _ = self.event_tx.send(ConnectionEvent {
                address: self.target.clone(),
                state: new_state,
            });
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }
}

/// Owns the link to at most one peer.
///
/// Commands return immediately; their effect is observed through
/// [`LinkStateMachine::state`] and [`LinkStateMachine::subscribe`].
pub struct LinkStateMachine {
    core: Arc<Mutex<LinkCore>>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    last_error: ErrorSlot,
    pump_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LinkStateMachine {
    /// Create a state machine driving `radio`.
    ///
    /// Must be called from within a Tokio runtime: transport events are
    /// drained by a background task.
    pub fn new(radio: Arc<dyn Radio>, config: LinkConfig) -> Self {
        Self::with_error_slot(radio, config, Arc::new(RwLock::new(None)))
    }

    pub(crate) fn with_error_slot(
        radio: Arc<dyn Radio>,
        config: LinkConfig,
        last_error: ErrorSlot,
    ) -> Self {
        let (input_tx, mut input_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(32);

        let core = Arc::new(Mutex::new(LinkCore::new(
            radio,
            config,
            input_tx,
            event_tx.clone(),
            last_error.clone(),
        )));

        let pump_core = core.clone();
        let handle = tokio::spawn(async move {
            debug!("Link event pump started");
            while let Some(input) = input_rx.recv().await {
                pump_core.lock().handle_input(input);
            }
            debug!("Link event pump stopped");
        });

        Self {
            core,
            event_tx,
            last_error,
            pump_handle: Mutex::new(Some(handle)),
        }
    }

    /// Start connecting to `peer`. Rejected unless the link is `Disconnected`.
    pub fn connect(&self, peer: PeerAddress) -> Result<()> {
        self.core.lock().connect(peer)
    }

    /// Drop the link and the target. Always accepted, idempotent.
    pub fn disconnect(&self) {
        self.core.lock().disconnect();
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.core.lock().state()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// The peer the link is trying to reach or is connected to.
    pub fn target(&self) -> Option<PeerAddress> {
        self.core.lock().target.clone()
    }

    /// The session currently open, if any.
    pub fn current_session(&self) -> Option<SessionToken> {
        self.core.lock().session
    }

    /// Check if notifications are armed on the current session.
    pub fn is_notify_ready(&self) -> bool {
        self.core.lock().notify_ready
    }

    /// Endpoints resolved on the current session.
    pub fn endpoints(&self) -> Option<ResolvedEndpoints> {
        self.core.lock().endpoints.clone()
    }

    /// Protocol counters for the current target.
    pub fn protocol_stats(&self) -> ProtocolStats {
        self.core.lock().protocol.stats()
    }

    /// The latest error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Disconnect and stop processing transport events.
    pub async fn shutdown(&self) {
        self.disconnect();

        let handle = self.pump_handle.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for LinkStateMachine {
    fn drop(&mut self) {
        // Release the radio session even without an explicit shutdown.
        self.core.lock().disconnect();

        if let Some(handle) = self.pump_handle.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::{roottap_characteristics, RadioCall, SimulatedRadio};
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    struct Harness {
        radio: Arc<SimulatedRadio>,
        core: LinkCore,
        rx: mpsc::UnboundedReceiver<LinkInput>,
        events: broadcast::Receiver<ConnectionEvent>,
    }

    impl Harness {
        fn new(config: LinkConfig) -> Self {
            let radio = Arc::new(SimulatedRadio::new());
            radio.add_known_peer("X");
            let (tx, rx) = mpsc::unbounded_channel();
            let (event_tx, events) = broadcast::channel(64);
            let core = LinkCore::new(
                radio.clone(),
                config,
                tx,
                event_tx,
                Arc::new(RwLock::new(None)),
            );
            Self {
                radio,
                core,
                rx,
                events,
            }
        }

        fn immediate() -> Self {
            Self::new(
                LinkConfig::default()
                    .with_reconnect(ReconnectPolicy::immediate())
                    .with_connect_timeout(None),
            )
        }

        /// Drain queued inputs into the state machine.
        fn pump(&mut self) {
            while let Ok(input) = self.rx.try_recv() {
                self.core.handle_input(input);
            }
        }

        fn emit(&mut self, session: SessionToken, event: LinkEvent) {
            assert!(self.radio.emit(session, event));
            self.pump();
        }

        fn session(&self) -> SessionToken {
            self.core.session.expect("open session")
        }

        /// Walk the current session up to armed notifications.
        fn arm(&mut self) -> SessionToken {
            let session = self.session();
            self.emit(session, LinkEvent::Connected);
            self.emit(
                session,
                LinkEvent::ServicesDiscovered(Ok(roottap_characteristics())),
            );
            self.emit(
                session,
                LinkEvent::DescriptorWritten {
                    uuid: CCCD_UUID,
                    status: GattStatus::SUCCESS,
                },
            );
            session
        }

        fn states(&mut self) -> Vec<ConnectionState> {
            let mut states = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                states.push(event.state);
            }
            states
        }
    }

    fn press() -> LinkEvent {
        LinkEvent::CharacteristicChanged {
            uuid: BUTTON_CHARACTERISTIC_UUID,
            value: Bytes::from_static(&[0x01]),
        }
    }

    #[test]
    fn test_connection_state() {
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());

        assert!(ConnectionState::Connecting.is_transitioning());
        assert!(!ConnectionState::Connected.is_transitioning());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Connected), "Connected");
        assert_eq!(format!("{}", ConnectionState::Disconnected), "Disconnected");
    }

    #[test]
    fn test_reconnect_policy_backoff() {
        let policy = ReconnectPolicy::default().with_max_attempts(5);
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(250)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(5), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_for(6), None);

        let capped = ReconnectPolicy::default();
        assert_eq!(capped.delay_for(30), Some(Duration::from_secs(5)));

        assert_eq!(ReconnectPolicy::immediate().delay_for(1000), Some(Duration::ZERO));
        assert_eq!(ReconnectPolicy::never().delay_for(1), None);
    }

    #[test]
    fn test_resolve_endpoints() {
        let config = LinkConfig::default();
        let endpoints = ResolvedEndpoints::resolve(&roottap_characteristics(), &config).unwrap();
        assert_eq!(endpoints.notify.uuid, BUTTON_CHARACTERISTIC_UUID);
        assert_eq!(endpoints.write.uuid, CONFIRM_CHARACTERISTIC_UUID);

        let only_notify: Vec<_> = roottap_characteristics()
            .into_iter()
            .filter(|c| c.uuid == BUTTON_CHARACTERISTIC_UUID)
            .collect();
        let err = ResolvedEndpoints::resolve(&only_notify, &config).unwrap_err();
        assert!(err.to_string().contains("write characteristic"));

        let err = ResolvedEndpoints::resolve(&[], &config).unwrap_err();
        assert!(err.to_string().contains("service"));
    }

    #[test]
    fn test_connect_lifecycle_scenario() {
        let mut h = Harness::immediate();

        h.core.connect(PeerAddress::new("X")).unwrap();
        assert_eq!(h.core.state(), ConnectionState::Connecting);
        let first = h.session();

        h.emit(first, LinkEvent::Connected);
        assert_eq!(h.core.state(), ConnectionState::Connected);
        assert!(h
            .radio
            .calls()
            .contains(&RadioCall::DiscoverServices { session: first }));

        h.emit(
            first,
            LinkEvent::ServicesDiscovered(Ok(roottap_characteristics())),
        );
        assert!(h.radio.calls().contains(&RadioCall::EnableNotifications {
            session: first,
            uuid: BUTTON_CHARACTERISTIC_UUID,
        }));
        assert!(!h.core.notify_ready);

        h.emit(
            first,
            LinkEvent::DescriptorWritten {
                uuid: CCCD_UUID,
                status: GattStatus::SUCCESS,
            },
        );
        assert!(h.core.notify_ready);

        // Unexpected drop: fresh session, old one released first.
        h.emit(first, LinkEvent::Disconnected);
        assert_eq!(h.core.state(), ConnectionState::Connecting);
        let second = h.session();
        assert_ne!(first, second);
        assert_eq!(h.radio.open_sessions(), vec![second]);
        assert!(!h.core.notify_ready);
        assert!(h.core.endpoints.is_none());

        let calls = h.radio.calls();
        let closed = calls
            .iter()
            .position(|c| *c == RadioCall::CloseLink { session: first })
            .unwrap();
        let reopened = calls
            .iter()
            .position(|c| matches!(c, RadioCall::OpenLink { session, .. } if *session == second))
            .unwrap();
        assert!(closed < reopened);

        h.emit(second, LinkEvent::Connected);
        assert_eq!(h.core.state(), ConnectionState::Connected);

        assert_eq!(
            h.states(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ]
        );
    }

    #[test]
    fn test_connect_rejected_unless_disconnected() {
        let mut h = Harness::immediate();
        h.core.connect(PeerAddress::new("X")).unwrap();

        assert!(matches!(
            h.core.connect(PeerAddress::new("Y")),
            Err(Error::ConnectionFailed { .. })
        ));
        assert_eq!(h.core.target, Some(PeerAddress::new("X")));

        h.arm();
        assert!(h.core.connect(PeerAddress::new("Y")).is_err());
        assert_eq!(h.radio.open_count(), 1);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut h = Harness::immediate();
        h.core.disconnect();
        assert_eq!(h.core.state(), ConnectionState::Disconnected);
        assert!(h.radio.calls().is_empty());

        h.core.connect(PeerAddress::new("X")).unwrap();
        let session = h.arm();
        h.core.disconnect();
        h.core.disconnect();

        assert_eq!(h.core.state(), ConnectionState::Disconnected);
        assert!(h.core.target.is_none());
        assert!(h.radio.open_sessions().is_empty());
        let closes = h
            .radio
            .calls()
            .iter()
            .filter(|c| **c == RadioCall::CloseLink { session })
            .count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn test_late_connected_after_disconnect_is_discarded() {
        let mut h = Harness::immediate();
        h.core.connect(PeerAddress::new("X")).unwrap();
        let session = h.session();

        h.core.disconnect();
        assert_eq!(h.core.state(), ConnectionState::Disconnected);
        h.radio.clear_calls();
        let _ = h.states();

        h.emit(session, LinkEvent::Connected);

        assert_eq!(h.core.state(), ConnectionState::Disconnected);
        assert!(h.states().is_empty());
        assert_eq!(h.radio.calls(), vec![RadioCall::CloseLink { session }]);
    }

    #[test]
    fn test_stale_events_from_superseded_session() {
        let mut h = Harness::immediate();
        h.core.connect(PeerAddress::new("X")).unwrap();
        let first = h.arm();

        h.emit(first, LinkEvent::Disconnected);
        let second = h.session();
        h.radio.clear_calls();

        // Late traffic from the first session changes nothing.
        h.emit(first, LinkEvent::Connected);
        h.emit(first, press());
        h.emit(first, LinkEvent::Disconnected);

        assert_eq!(h.core.state(), ConnectionState::Connecting);
        assert_eq!(h.session(), second);
        assert!(h
            .radio
            .calls()
            .iter()
            .all(|c| *c == RadioCall::CloseLink { session: first }));
    }

    #[test]
    fn test_acknowledge_only_when_armed() {
        let mut h = Harness::immediate();
        h.core.connect(PeerAddress::new("X")).unwrap();
        let session = h.session();

        h.emit(session, LinkEvent::Connected);
        h.emit(
            session,
            LinkEvent::ServicesDiscovered(Ok(roottap_characteristics())),
        );
        h.emit(session, press());
        assert!(h.radio.writes().is_empty());

        h.emit(
            session,
            LinkEvent::DescriptorWritten {
                uuid: CCCD_UUID,
                status: GattStatus::SUCCESS,
            },
        );
        h.emit(session, press());

        assert_eq!(h.radio.writes(), vec![Bytes::from_static(&[0x01])]);
        assert!(h.radio.calls().contains(&RadioCall::Write {
            session,
            uuid: CONFIRM_CHARACTERISTIC_UUID,
            value: Bytes::from_static(&[0x01]),
            mode: crate::ble::radio::WriteMode::WithoutResponse,
        }));
        assert_eq!(h.core.protocol.stats().acknowledged, 1);
    }

    #[test]
    fn test_notifications_from_other_characteristics_are_ignored() {
        let mut h = Harness::immediate();
        h.core.connect(PeerAddress::new("X")).unwrap();
        let session = h.arm();

        h.emit(
            session,
            LinkEvent::CharacteristicChanged {
                uuid: CONFIRM_CHARACTERISTIC_UUID,
                value: Bytes::from_static(&[0x01]),
            },
        );
        assert!(h.radio.writes().is_empty());
    }

    #[test]
    fn test_write_failure_is_recorded_not_retried() {
        let mut h = Harness::immediate();
        h.core.connect(PeerAddress::new("X")).unwrap();
        let session = h.arm();

        h.emit(session, press());
        h.emit(
            session,
            LinkEvent::CharacteristicWritten {
                uuid: CONFIRM_CHARACTERISTIC_UUID,
                status: GattStatus(0x03),
            },
        );

        assert_eq!(h.radio.writes().len(), 1);
        assert_eq!(h.core.state(), ConnectionState::Connected);
        assert!(h
            .core
            .last_error
            .read()
            .as_deref()
            .unwrap()
            .contains("write failed"));
    }

    #[test]
    fn test_refused_acknowledge_is_not_counted() {
        let mut h = Harness::immediate();
        h.core.connect(PeerAddress::new("X")).unwrap();
        let session = h.arm();

        h.radio.set_refuse_writes(true);
        h.emit(session, press());

        let stats = h.core.protocol.stats();
        assert_eq!(stats.asserted, 1);
        assert_eq!(stats.acknowledged, 0);
        assert_eq!(h.core.state(), ConnectionState::Connected);
        assert!(h.core.last_error.read().is_some());

        h.radio.set_refuse_writes(false);
        h.emit(session, press());
        assert_eq!(h.core.protocol.stats().acknowledged, 1);
    }

    #[test]
    fn test_resolution_failure_retry_policy() {
        let mut h = Harness::immediate();
        h.core.connect(PeerAddress::new("X")).unwrap();
        let first = h.session();

        h.emit(first, LinkEvent::Connected);
        h.emit(first, LinkEvent::ServicesDiscovered(Ok(Vec::new())));

        assert_eq!(h.core.state(), ConnectionState::Connecting);
        assert_ne!(h.session(), first);
        assert_eq!(h.core.target, Some(PeerAddress::new("X")));
        assert!(h.core.last_error.read().is_some());
    }

    #[test]
    fn test_resolution_failure_fail_policy() {
        let mut h = Harness::new(
            LinkConfig::default()
                .with_reconnect(ReconnectPolicy::immediate())
                .with_resolution_failure(ResolutionFailurePolicy::Fail)
                .with_connect_timeout(None),
        );
        h.core.connect(PeerAddress::new("X")).unwrap();
        let session = h.session();

        h.emit(session, LinkEvent::Connected);
        h.emit(session, LinkEvent::ServicesDiscovered(Err(GattStatus(0x81))));

        assert_eq!(h.core.state(), ConnectionState::Disconnected);
        assert!(h.core.target.is_none());
        assert!(h.radio.open_sessions().is_empty());
        assert_eq!(h.radio.open_count(), 1);
    }

    #[test]
    fn test_descriptor_failure_escalates() {
        let mut h = Harness::new(
            LinkConfig::default()
                .with_reconnect(ReconnectPolicy::immediate())
                .with_resolution_failure(ResolutionFailurePolicy::Fail)
                .with_connect_timeout(None),
        );
        h.core.connect(PeerAddress::new("X")).unwrap();
        let session = h.session();

        h.emit(session, LinkEvent::Connected);
        h.emit(
            session,
            LinkEvent::ServicesDiscovered(Ok(roottap_characteristics())),
        );
        h.emit(
            session,
            LinkEvent::DescriptorWritten {
                uuid: CCCD_UUID,
                status: GattStatus(0x05),
            },
        );

        assert_eq!(h.core.state(), ConnectionState::Disconnected);
        assert!(!h.core.notify_ready);
        assert!(h
            .core
            .last_error
            .read()
            .as_deref()
            .unwrap()
            .contains("Notification enable failed"));
    }

    #[test]
    fn test_reconnect_cap_gives_up() {
        let mut h = Harness::new(
            LinkConfig::default()
                .with_reconnect(ReconnectPolicy::immediate().with_max_attempts(2))
                .with_connect_timeout(None),
        );
        h.core.connect(PeerAddress::new("X")).unwrap();

        for _ in 0..2 {
            let session = h.session();
            h.emit(session, LinkEvent::Disconnected);
            assert_eq!(h.core.state(), ConnectionState::Connecting);
        }

        let session = h.session();
        h.emit(session, LinkEvent::Disconnected);

        assert_eq!(h.core.state(), ConnectionState::Disconnected);
        assert!(h.core.target.is_none());
        assert_eq!(h.radio.open_count(), 3);
        assert_eq!(
            h.core.last_error.read().as_deref(),
            Some("Gave up reconnecting after 2 attempts")
        );
    }

    #[test]
    fn test_armed_session_resets_attempt_counter() {
        let mut h = Harness::new(
            LinkConfig::default()
                .with_reconnect(ReconnectPolicy::immediate().with_max_attempts(1))
                .with_connect_timeout(None),
        );
        h.core.connect(PeerAddress::new("X")).unwrap();

        for _ in 0..3 {
            let session = h.arm();
            h.emit(session, LinkEvent::Disconnected);
            assert_eq!(h.core.state(), ConnectionState::Connecting);
        }
    }

    #[test]
    fn test_connect_timeout_counts_as_drop() {
        let mut h = Harness::immediate();
        h.core.connect(PeerAddress::new("X")).unwrap();
        let first = h.session();

        h.core
            .handle_input(LinkInput::ConnectTimeout { session: first });
        assert_eq!(h.core.state(), ConnectionState::Connecting);
        assert_ne!(h.session(), first);

        // A timer for a connected session is ignored.
        let second = h.session();
        h.emit(second, LinkEvent::Connected);
        h.core
            .handle_input(LinkInput::ConnectTimeout { session: second });
        assert_eq!(h.core.state(), ConnectionState::Connected);
        assert_eq!(h.session(), second);
    }

    #[test]
    fn test_refused_open_fails_connect() {
        let mut h = Harness::immediate();
        h.radio.set_refuse_open(true);

        assert!(h.core.connect(PeerAddress::new("X")).is_err());
        assert_eq!(h.core.state(), ConnectionState::Disconnected);
        assert!(h.core.target.is_none());
        assert!(h.core.last_error.read().is_some());
    }

    #[tokio::test]
    async fn test_delayed_reconnect_is_cancelled_by_disconnect() {
        let mut h = Harness::new(
            LinkConfig::default()
                .with_reconnect(ReconnectPolicy::default().with_backoff(
                    Duration::from_millis(10),
                    Duration::from_millis(10),
                    1.0,
                ))
                .with_connect_timeout(None),
        );
        h.core.connect(PeerAddress::new("X")).unwrap();
        let first = h.session();
        h.emit(first, LinkEvent::Disconnected);

        assert_eq!(h.core.state(), ConnectionState::Connecting);
        assert!(h.core.session.is_none());
        assert!(h.radio.open_sessions().is_empty());

        h.core.disconnect();

        let due = h.rx.recv().await.unwrap();
        assert!(matches!(due, LinkInput::ReconnectDue { .. }));
        h.core.handle_input(due);

        assert_eq!(h.core.state(), ConnectionState::Disconnected);
        assert_eq!(h.radio.open_count(), 1);
    }

    #[tokio::test]
    async fn test_delayed_reconnect_opens_session() {
        let mut h = Harness::new(
            LinkConfig::default()
                .with_reconnect(ReconnectPolicy::default().with_backoff(
                    Duration::from_millis(10),
                    Duration::from_millis(10),
                    1.0,
                ))
                .with_connect_timeout(None),
        );
        h.core.connect(PeerAddress::new("X")).unwrap();
        let first = h.session();
        h.emit(first, LinkEvent::Disconnected);

        let due = h.rx.recv().await.unwrap();
        h.core.handle_input(due);

        assert_eq!(h.radio.open_count(), 2);
        assert_eq!(h.radio.open_sessions().len(), 1);
        assert_ne!(h.session(), first);
    }

    #[tokio::test]
    async fn test_state_machine_with_auto_peripheral() {
        use crate::ble::simulated::SimPeripheral;

        let radio = Arc::new(SimulatedRadio::with_peripheral(SimPeripheral::roottap("X")));
        let link = LinkStateMachine::new(
            radio.clone(),
            LinkConfig::default().with_reconnect(ReconnectPolicy::immediate()),
        );
        let mut events = link.subscribe();

        link.connect(PeerAddress::new("X")).unwrap();
        assert_eq!(events.recv().await.unwrap().state, ConnectionState::Connecting);
        assert_eq!(events.recv().await.unwrap().state, ConnectionState::Connected);

        while !link.is_notify_ready() {
            tokio::task::yield_now().await;
        }

        assert!(radio.press());
        while link.protocol_stats().acknowledged == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(radio.writes(), vec![Bytes::from_static(&[0x01])]);

        link.shutdown().await;
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert!(radio.open_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_dropping_machine_releases_session() {
        use crate::ble::simulated::SimPeripheral;

        let radio = Arc::new(SimulatedRadio::with_peripheral(SimPeripheral::roottap("X")));
        let link = LinkStateMachine::new(radio.clone(), LinkConfig::default());

        link.connect(PeerAddress::new("X")).unwrap();
        while !link.is_notify_ready() {
            tokio::task::yield_now().await;
        }
        let session = link.current_session().unwrap();
        assert_eq!(radio.open_sessions(), vec![session]);

        drop(link);

        assert!(radio.open_sessions().is_empty());
        assert!(radio.calls().contains(&RadioCall::CloseLink { session }));
    }

    #[derive(Debug, Clone)]
    enum Step {
        Connect,
        Disconnect,
        Event(u64, u8),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Connect),
            Just(Step::Disconnect),
            (1u64..6, 0u8..5).prop_map(|(s, e)| Step::Event(s, e)),
        ]
    }

    fn event(kind: u8) -> LinkEvent {
        match kind {
            0 => LinkEvent::Connected,
            1 => LinkEvent::Disconnected,
            2 => LinkEvent::ServicesDiscovered(Ok(roottap_characteristics())),
            3 => LinkEvent::DescriptorWritten {
                uuid: CCCD_UUID,
                status: GattStatus::SUCCESS,
            },
            _ => press(),
        }
    }

    proptest! {
        #[test]
        fn prop_at_most_one_session_and_stale_events_are_inert(steps in prop::collection::vec(step(), 1..40)) {
            let mut h = Harness::immediate();

            for step in steps {
                match step {
                    Step::Connect => { let _ = h.core.connect(PeerAddress::new("X")); }
                    Step::Disconnect => h.core.disconnect(),
                    Step::Event(raw, kind) => {
                        let session = SessionToken::new(raw);
                        let current = h.core.session;
                        let before = (h.core.state(), current, h.radio.open_count(), h.radio.writes().len());

                        if !h.radio.emit(session, event(kind)) {
                            continue;
                        }
                        h.pump();

                        if current != Some(session) {
                            let after = (h.core.state(), h.core.session, h.radio.open_count(), h.radio.writes().len());
                            prop_assert_eq!(before, after);
                        }
                    }
                }

                prop_assert!(h.radio.open_sessions().len() <= 1);
                prop_assert_eq!(h.core.target.is_none(), h.core.state() == ConnectionState::Disconnected);
            }
        }
    }
}
