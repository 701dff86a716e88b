//! Error types for the roottap-link crate.

use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    RadioUnavailable,

    /// The platform scanner reported a failure while scanning.
    #[error("Scan failed: {code}")]
    ScanFailed {
        /// Platform-specific failure code.
        code: i32,
    },

    /// A scan is already running on this scan session.
    #[error("Scan already in progress")]
    ScanInProgress,

    /// The radio permission has not been granted.
    #[error("Bluetooth permission not granted")]
    PermissionDenied,

    /// The radio permission was revoked while the radio was in use.
    #[error("Bluetooth permission revoked")]
    PermissionRevoked,

    /// The address could not be turned into a connectable peer.
    #[error("Peer could not be resolved: {address}")]
    PeerResolutionFailed {
        /// The address that was supplied.
        address: String,
    },

    /// Failed to establish a connection to the peer.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The expected service or characteristics were not found after discovery.
    #[error("Endpoint resolution failed: {what}")]
    ResolutionFailed {
        /// What was missing.
        what: String,
    },

    /// Enabling notifications on the notify characteristic failed.
    #[error("Notification enable failed with status {status}")]
    DescriptorWriteFailed {
        /// GATT status reported by the radio.
        status: u8,
    },

    /// Writing the acknowledge value failed.
    #[error("Characteristic write failed with status {status}")]
    WriteFailed {
        /// GATT status reported by the radio.
        status: u8,
    },

    /// The reconnect policy gave up on the current target.
    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted {
        /// Number of reconnect attempts made.
        attempts: u32,
    },

    /// Scanning is refused while a link is wanted or up.
    #[error("Link active, disconnect before scanning")]
    LinkActive,

    /// Operation requires a connection but the link is not connected.
    #[error("Peer not connected")]
    NotConnected,

    /// The radio has no open session for the given token.
    #[error("Unknown link session: {session}")]
    SessionNotFound {
        /// The session token that was looked up.
        session: u64,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Latest error message, shared between the link and its owner.
pub(crate) type ErrorSlot = Arc<RwLock<Option<String>>>;
