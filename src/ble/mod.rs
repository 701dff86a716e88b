//! BLE communication module.
//!
//! This module provides the radio abstraction and the scan and link
//! machinery built on it for talking to RootTap presence buttons.

pub mod connection;
pub mod platform;
pub mod radio;
pub mod scanner;
pub mod simulated;
pub mod uuids;

pub use connection::{
    ConnectionEvent, ConnectionState, LinkConfig, LinkStateMachine, ReconnectPolicy,
    ResolutionFailurePolicy, ResolvedEndpoints,
};
pub use platform::PlatformRadio;
pub use radio::{
    AdvertisementStream, CharacteristicInfo, EventSink, GattStatus, LinkEvent, PeerAddress, Radio,
    RawAdvertisement, ScanEvent, SessionToken, WriteMode,
};
pub use scanner::{DiscoveredPeer, PeerStream, PeerTable, ScanFilter, ScanSession};
pub use simulated::{SimPeripheral, SimulatedRadio};
pub use uuids::*;
