//! The radio capability driven by the scan session and the link state machine.
//!
//! Everything the core needs from a BLE stack goes through [`Radio`]. Scan
//! results are delivered as a stream; link operations are fire-and-forget
//! and their outcomes come back as [`LinkEvent`]s through an [`EventSink`]
//! bound to one [`SessionToken`].

use async_trait::async_trait;
use btleplug::api::{CharPropFlags, WriteType};
use bytes::Bytes;
use futures::stream::BoxStream;
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;

/// Stable identifier of a peer as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeerAddress(String);

impl PeerAddress {
    /// Create a peer address from its platform string.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// The platform string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for PeerAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// Identity of one connect attempt. Minted fresh for every attempt, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionToken(u64);

impl SessionToken {
    /// Wrap a raw token value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw token value.
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// The token that follows this one.
    pub(crate) fn next(&self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// GATT operation status as reported by the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GattStatus(pub u8);

impl GattStatus {
    /// Operation completed successfully.
    pub const SUCCESS: GattStatus = GattStatus(0x00);
    /// Generic failure, used when the backend has no finer-grained code.
    pub const FAILURE: GattStatus = GattStatus(0x85);

    /// Check if the status reports success.
    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// A single advertisement sighting as delivered by the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAdvertisement {
    /// Platform address of the advertiser.
    pub address: String,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: i16,
}

/// Item of the radio's advertisement stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// A peer was seen.
    Advertisement(RawAdvertisement),
    /// The platform scanner failed; no more advertisements will follow.
    Failed(i32),
}

/// Stream of scan events for one scan.
pub type AdvertisementStream = BoxStream<'static, ScanEvent>;

/// How a characteristic write is acknowledged by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WriteMode {
    /// The peer confirms the write (ATT Write Request).
    Acknowledged,
    /// Fire-and-forget (ATT Write Command).
    WithoutResponse,
}

impl From<WriteMode> for WriteType {
    fn from(mode: WriteMode) -> Self {
        match mode {
            WriteMode::Acknowledged => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        }
    }
}

/// A characteristic found during service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    /// Service the characteristic belongs to.
    pub service_uuid: Uuid,
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Advertised properties.
    pub properties: CharPropFlags,
}

impl CharacteristicInfo {
    /// Create a characteristic description.
    pub fn new(service_uuid: Uuid, uuid: Uuid, properties: CharPropFlags) -> Self {
        Self {
            service_uuid,
            uuid,
            properties,
        }
    }
}

/// Event produced by the radio for one link session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link is up.
    Connected,
    /// The link went down, or the connect attempt failed.
    Disconnected,
    /// Service discovery finished.
    ServicesDiscovered(std::result::Result<Vec<CharacteristicInfo>, GattStatus>),
    /// A subscribed characteristic pushed a value.
    CharacteristicChanged {
        /// Characteristic UUID.
        uuid: Uuid,
        /// Pushed value.
        value: Bytes,
    },
    /// The notification-enable descriptor write completed.
    DescriptorWritten {
        /// Descriptor UUID.
        uuid: Uuid,
        /// Outcome.
        status: GattStatus,
    },
    /// A characteristic write completed.
    CharacteristicWritten {
        /// Characteristic UUID.
        uuid: Uuid,
        /// Outcome.
        status: GattStatus,
    },
}

/// Input of the link state machine's serialized queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkInput {
    Transport {
        session: SessionToken,
        event: LinkEvent,
    },
    ConnectTimeout {
        session: SessionToken,
    },
    ReconnectDue {
        session: SessionToken,
    },
}

/// Delivery handle the radio uses to report events for one session.
///
/// Every event sent through the sink is tagged with the sink's session token,
/// so the state machine can tell current events from stale ones.
#[derive(Debug, Clone)]
pub struct EventSink {
    session: SessionToken,
    tx: mpsc::UnboundedSender<LinkInput>,
}

impl EventSink {
    pub(crate) fn new(session: SessionToken, tx: mpsc::UnboundedSender<LinkInput>) -> Self {
        Self { session, tx }
    }

    /// The session this sink reports for.
    pub fn session(&self) -> SessionToken {
        self.session
    }

    /// Report an event. Returns `false` once the state machine is gone.
    pub fn emit(&self, event: LinkEvent) -> bool {
        self.tx
            .send(LinkInput::Transport {
                session: self.session,
                event,
            })
            .is_ok()
    }
}

/// The platform BLE capability.
///
/// Link operations only schedule work; their results arrive later through
/// the session's [`EventSink`]. An `Err` from a link operation means the work
/// could not even be scheduled.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Radio: Send + Sync {
    /// Start scanning, optionally restricted to peers advertising `services`.
    ///
    /// Returns [`crate::Error::RadioUnavailable`] if the radio is off, absent,
    /// disabled, or refuses to scan for a backend-specific reason. Backends
    /// report a platform permission refusal as [`crate::Error::PermissionDenied`].
    async fn start_scan(&self, services: &[Uuid]) -> Result<AdvertisementStream>;

    /// Stop scanning and release the scan registration.
    fn stop_scan(&self);

    /// Turn a caller-supplied address into a connectable peer.
    async fn resolve_peer(&self, address: &str) -> Result<PeerAddress>;

    /// Open a new link session to `peer`, reporting through `sink`.
    fn open_link(&self, peer: &PeerAddress, sink: EventSink) -> Result<()>;

    /// Close a link session and release its handle. Unknown sessions are ignored.
    fn close_link(&self, session: SessionToken);

    /// Request service discovery on a session.
    fn discover_services(&self, session: SessionToken) -> Result<()>;

    /// Enable notifications on `characteristic` by writing its CCCD.
    fn enable_notifications(
        &self,
        session: SessionToken,
        characteristic: &CharacteristicInfo,
    ) -> Result<()>;

    /// Write `value` to `characteristic`.
    fn write_characteristic(
        &self,
        session: SessionToken,
        characteristic: &CharacteristicInfo,
        value: Bytes,
        mode: WriteMode,
    ) -> Result<()>;
}
