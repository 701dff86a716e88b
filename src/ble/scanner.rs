//! BLE scanning functionality.
//!
//! [`ScanSession`] turns the radio's advertisement stream into a filtered,
//! cancellable stream of [`DiscoveredPeer`] records. The stream does not
//! deduplicate; consumers keep a [`PeerTable`] keyed by address.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FusedStream, Stream, StreamExt};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::radio::{AdvertisementStream, PeerAddress, Radio, RawAdvertisement, ScanEvent};
use crate::ble::uuids::DEFAULT_TARGET_NAME;
use crate::error::{Error, Result};
use crate::permissions::PermissionGate;

/// What to look for while scanning.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanFilter {
    /// Only report peers advertising exactly this name.
    pub name: Option<String>,
    /// Only report peers advertising one of these services (applied by the radio).
    pub services: Vec<Uuid>,
}

impl ScanFilter {
    /// A filter that lets everything through.
    pub fn any() -> Self {
        Self::default()
    }

    /// A filter on the advertised name.
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            services: Vec::new(),
        }
    }

    /// The filter for RootTap buttons.
    pub fn roottap() -> Self {
        Self::by_name(DEFAULT_TARGET_NAME)
    }

    /// Add a service UUID to the radio-side filter.
    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.services.push(uuid);
        self
    }

    /// Check if a peer passes the name filter.
    pub fn matches(&self, peer: &DiscoveredPeer) -> bool {
        match &self.name {
            Some(wanted) => peer.name.as_deref() == Some(wanted.as_str()),
            None => true,
        }
    }
}

/// A peer seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredPeer {
    /// Advertised name, if any.
    pub name: Option<String>,
    /// Stable platform address. This is the peer's identity.
    pub address: PeerAddress,
    /// Signal strength in dBm.
    pub rssi: i16,
    /// When this sighting was made.
    pub last_seen: DateTime<Utc>,
}

impl From<RawAdvertisement> for DiscoveredPeer {
    fn from(raw: RawAdvertisement) -> Self {
        Self {
            name: raw.name,
            address: PeerAddress::new(raw.address),
            rssi: raw.rssi,
            last_seen: Utc::now(),
        }
    }
}

/// Deduplicated view of discovered peers. Last sighting wins.
#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    peers: HashMap<PeerAddress, DiscoveredPeer>,
}

impl PeerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting. Returns `true` if the address was not known yet.
    pub fn insert(&mut self, peer: DiscoveredPeer) -> bool {
        self.peers.insert(peer.address.clone(), peer).is_none()
    }

    /// Look up a peer.
    pub fn get(&self, address: &PeerAddress) -> Option<&DiscoveredPeer> {
        self.peers.get(address)
    }

    /// Copy of all peers keyed by address.
    pub fn snapshot(&self) -> HashMap<PeerAddress, DiscoveredPeer> {
        self.peers.clone()
    }

    /// Peers sorted by signal strength (strongest first).
    pub fn sorted_by_signal(&self) -> Vec<DiscoveredPeer> {
        let mut peers: Vec<_> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.address.cmp(&b.address)));
        peers
    }

    /// Forget all peers.
    pub fn clear(&mut self) {
        self.peers.clear();
    }

    /// Number of distinct peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Check if no peer is known.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Starts scans on a radio, one at a time.
pub struct ScanSession {
    radio: Arc<dyn Radio>,
    gate: PermissionGate,
    active: Arc<AtomicBool>,
}

impl ScanSession {
    /// Create a scan session on a radio.
    pub fn new(radio: Arc<dyn Radio>, gate: PermissionGate) -> Self {
        Self {
            radio,
            gate,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if a scan stream is alive.
    pub fn is_scanning(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Start a scan.
    ///
    /// # Errors
    ///
    /// - [`Error::PermissionDenied`] if the permission gate is closed.
    /// - [`Error::ScanInProgress`] if a stream from this session is still alive.
    /// - [`Error::RadioUnavailable`] if the radio is off or absent.
    pub async fn begin(&self, filter: ScanFilter) -> Result<PeerStream> {
        if !self.gate.granted() {
            return Err(Error::PermissionDenied);
        }

        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Scan already running, rejecting start request");
            return Err(Error::ScanInProgress);
        }

        // Owns the active flag from here on; dropping it releases the flag.
        let mut guard = ScanGuard {
            radio: self.radio.clone(),
            active: self.active.clone(),
            radio_scanning: false,
            released: false,
        };

        info!(
            "Starting BLE scan (name: {:?}, services: {:?})",
            filter.name, filter.services
        );

        let events = match self.radio.start_scan(&filter.services).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Failed to start scan: {}", e);
                return Err(e);
            }
        };
        guard.radio_scanning = true;

        let mut gate_rx = self.gate.subscribe();
        let revocation = async move { gate_rx.wait_for(|granted| !*granted).await.is_ok() }.boxed();

        Ok(PeerStream {
            events,
            revocation: Some(revocation),
            filter,
            guard,
            finished: false,
        })
    }
}

/// Stops the radio scan and releases the session's active flag, once.
struct ScanGuard {
    radio: Arc<dyn Radio>,
    active: Arc<AtomicBool>,
    radio_scanning: bool,
    released: bool,
}

impl ScanGuard {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if self.radio_scanning {
            self.radio_scanning = false;
            self.radio.stop_scan();
            debug!("Radio scan stopped");
        }
        self.active.store(false, Ordering::SeqCst);
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Stream of discovered peers for one scan.
///
/// Ends without an error when cancelled or dropped. Yields exactly one error
/// and then ends on scan failure or permission revocation. The radio scan is
/// stopped exactly once in every case.
pub struct PeerStream {
    events: AdvertisementStream,
    revocation: Option<BoxFuture<'static, bool>>,
    filter: ScanFilter,
    guard: ScanGuard,
    finished: bool,
}

impl PeerStream {
    /// Stop the scan. The stream ends; no error is reported.
    pub fn cancel(&mut self) {
        if !self.finished {
            debug!("Scan cancelled by consumer");
        }
        self.finish();
    }

    /// The filter this scan runs with.
    pub fn filter(&self) -> &ScanFilter {
        &self.filter
    }

    fn finish(&mut self) {
        self.finished = true;
        self.revocation = None;
        self.guard.release();
    }
}

impl Stream for PeerStream {
    type Item = Result<DiscoveredPeer>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        if this.finished {
            return Poll::Ready(None);
        }

        if let Some(revocation) = this.revocation.as_mut() {
            if let Poll::Ready(revoked) = revocation.as_mut().poll(cx) {
                this.revocation = None;
                if revoked {
                    warn!("Radio permission revoked, stopping scan");
                    this.finish();
                    return Poll::Ready(Some(Err(Error::PermissionRevoked)));
                }
            }
        }

        loop {
            match this.events.poll_next_unpin(cx) {
                Poll::Ready(Some(ScanEvent::Advertisement(raw))) => {
                    let peer = DiscoveredPeer::from(raw);
                    if !this.filter.matches(&peer) {
                        trace!("Filtered out {} ({:?})", peer.address, peer.name);
                        continue;
                    }
                    trace!("Discovered {} rssi={}", peer.address, peer.rssi);
                    return Poll::Ready(Some(Ok(peer)));
                }
                Poll::Ready(Some(ScanEvent::Failed(code))) => {
                    warn!("Scan failed with code {}", code);
                    this.finish();
                    return Poll::Ready(Some(Err(Error::ScanFailed { code })));
                }
                Poll::Ready(None) => {
                    debug!("Advertisement stream ended");
                    this.finish();
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl FusedStream for PeerStream {
    fn is_terminated(&self) -> bool {
        self.finished
    }
}
