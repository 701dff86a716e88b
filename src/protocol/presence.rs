//! Presence request/acknowledge handling.
//!
//! Message format:
//! - Peripheral → host (notification on the button characteristic):
//!   byte 0 == [`ASSERTED_MARKER`] means "input asserted". Trailing bytes are ignored.
//! - Host → peripheral (write to the confirm characteristic): [`ACKNOWLEDGE_PAYLOAD`].

use btleplug::api::CharPropFlags;
use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::ble::radio::{GattStatus, WriteMode};
use crate::error::{Error, Result};

/// First byte of a notification reporting an asserted input.
pub const ASSERTED_MARKER: u8 = 0x01;

/// Value written back to acknowledge an asserted input.
pub const ACKNOWLEDGE_PAYLOAD: [u8; 1] = [0x01];

/// An acknowledge write the link should issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledge {
    /// Bytes to write.
    pub value: Bytes,
    /// Write mode chosen from the characteristic's properties.
    pub mode: WriteMode,
}

/// Counters for one link's protocol traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProtocolStats {
    /// Asserted notifications accepted.
    pub asserted: u64,
    /// Acknowledge writes handed to the radio.
    pub acknowledged: u64,
    /// Notifications dropped (not ready, empty, or unknown marker).
    pub ignored: u64,
    /// Acknowledge writes the peer or radio reported as failed.
    pub write_failures: u64,
}

/// Interprets notification payloads and produces the matching acknowledge.
///
/// Write failures are reported back to the caller but never retried here.
#[derive(Debug, Clone)]
pub struct ProtocolHandler {
    asserted_marker: u8,
    acknowledge: Bytes,
    stats: ProtocolStats,
}

impl Default for ProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolHandler {
    /// Create a handler using the RootTap markers.
    pub fn new() -> Self {
        Self::with_markers(ASSERTED_MARKER, Bytes::from_static(&ACKNOWLEDGE_PAYLOAD))
    }

    /// Create a handler with custom markers.
    pub fn with_markers(asserted_marker: u8, acknowledge: Bytes) -> Self {
        Self {
            asserted_marker,
            acknowledge,
            stats: ProtocolStats::default(),
        }
    }

    /// Pick the write mode for a characteristic.
    ///
    /// Write Without Response is preferred when the characteristic supports it.
    pub fn write_mode_for(properties: CharPropFlags) -> WriteMode {
        if properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
            WriteMode::WithoutResponse
        } else {
            WriteMode::Acknowledged
        }
    }

    /// Handle a notification payload.
    ///
    /// `ready` is the link's notification readiness; payloads received while
    /// it is false are dropped, not buffered.
    pub fn on_notification(
        &mut self,
        ready: bool,
        payload: &[u8],
        write_properties: CharPropFlags,
    ) -> Option<Acknowledge> {
        if !ready {
            trace!("Dropping notification, notifications not armed");
            self.stats.ignored += 1;
            return None;
        }

        match payload.first() {
            Some(&marker) if marker == self.asserted_marker => {
                debug!("Input asserted, acknowledging");
                self.stats.asserted += 1;
                Some(Acknowledge {
                    value: self.acknowledge.clone(),
                    mode: Self::write_mode_for(write_properties),
                })
            }
            Some(marker) => {
                trace!("Ignoring notification with marker {:#04x}", marker);
                self.stats.ignored += 1;
                None
            }
            None => {
                trace!("Ignoring empty notification");
                self.stats.ignored += 1;
                None
            }
        }
    }

    /// Record that an acknowledge write was accepted by the radio.
    pub fn record_acknowledge_sent(&mut self) {
        self.stats.acknowledged += 1;
    }

    /// Record the outcome of an acknowledge write.
    pub fn record_write_result(&mut self, status: GattStatus) -> Result<()> {
        if status.is_success() {
            return Ok(());
        }

        self.stats.write_failures += 1;
        warn!("Acknowledge write failed with status {}", status);
        Err(Error::WriteFailed { status: status.0 })
    }

    /// Current counters.
    pub fn stats(&self) -> ProtocolStats {
        self.stats
    }

    /// Reset counters, used when a new link target is chosen.
    pub fn reset_stats(&mut self) {
        self.stats = ProtocolStats::default();
    }
}
