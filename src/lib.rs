// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # roottap-link
//!
//! A cross-platform Rust library for linking with RootTap presence buttons
//! via Bluetooth Low Energy.
//!
//! A RootTap button advertises as `roottap-up`. Once linked, it notifies
//! `[0x01]` when pressed and expects the host to acknowledge with `[0x01]`.
//!
//! ## Features
//!
//! - **Discovery**: Filterable, cancellable scan streams with a deduplicated peer table
//! - **Link Management**: Connect, service resolution, notification arming
//! - **Reconnection**: Configurable attempt cap and backoff after unexpected drops
//! - **Stale Event Filtering**: Events from abandoned sessions never touch the link
//! - **Simulated Radio**: Drive the whole stack in tests without hardware
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use roottap_link::{
//!     LinkConfig, PermissionGate, PlatformRadio, Result, ScanFilter, SessionOrchestrator,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let radio = Arc::new(PlatformRadio::new().await?);
//!     let session = SessionOrchestrator::new(
//!         radio,
//!         PermissionGate::granted_gate(),
//!         LinkConfig::default(),
//!     );
//!
//!     // Scan for buttons
//!     session.start_scan(ScanFilter::roottap()).await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     // Link with the strongest one
//!     if let Some(peer) = session.peers_by_signal().first() {
//!         println!("Linking with {} ({} dBm)", peer.address, peer.rssi);
//!         session.connect(peer.address.as_str()).await?;
//!     }
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!     println!("Presses acknowledged: {}", session.protocol_stats().acknowledged);
//!
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data and config types

// Public modules
pub mod ble;
pub mod error;
pub mod permissions;
pub mod protocol;
pub mod session;

// Re-exports for convenience
pub use error::{Error, Result};
pub use permissions::{required_permissions, PermissionGate, PermissionModel, RadioPermission};
pub use session::SessionOrchestrator;

// Re-export commonly used types from submodules
pub use ble::connection::{
    ConnectionEvent, ConnectionState, LinkConfig, LinkStateMachine, ReconnectPolicy,
    ResolutionFailurePolicy,
};
pub use ble::platform::PlatformRadio;
pub use ble::radio::{PeerAddress, Radio, SessionToken};
pub use ble::scanner::{DiscoveredPeer, PeerTable, ScanFilter, ScanSession};
pub use ble::simulated::{SimPeripheral, SimulatedRadio};
pub use protocol::{ProtocolHandler, ProtocolStats};
