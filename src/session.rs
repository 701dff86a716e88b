//! Session orchestration.
//!
//! [`SessionOrchestrator`] is the surface a presentation layer talks to. It
//! runs scans into a deduplicated peer table, hands the chosen peer to the
//! [`LinkStateMachine`] and keeps the latest error message around for display.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ble::connection::{ConnectionEvent, ConnectionState, LinkConfig, LinkStateMachine};
use crate::ble::radio::{PeerAddress, Radio};
use crate::ble::scanner::{DiscoveredPeer, PeerTable, ScanFilter, ScanSession};
use crate::error::{Error, ErrorSlot, Result};
use crate::permissions::PermissionGate;
use crate::protocol::ProtocolStats;

/// Scan, pick, connect.
pub struct SessionOrchestrator {
    radio: Arc<dyn Radio>,
    gate: PermissionGate,
    scanner: ScanSession,
    link: LinkStateMachine,
    /// Peers seen by the current scan, by address.
    peers: Arc<RwLock<PeerTable>>,
    /// Channel for peer sightings.
    peer_tx: broadcast::Sender<DiscoveredPeer>,
    last_error: ErrorSlot,
    /// Task draining the active scan.
    scan_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SessionOrchestrator {
    /// Create an orchestrator driving `radio`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(radio: Arc<dyn Radio>, gate: PermissionGate, config: LinkConfig) -> Self {
        let last_error: ErrorSlot = Arc::new(RwLock::new(None));
        let link = LinkStateMachine::with_error_slot(radio.clone(), config, last_error.clone());
        let (peer_tx, _) = broadcast::channel(100);

        Self {
            scanner: ScanSession::new(radio.clone(), gate.clone()),
            radio,
            gate,
            link,
            peers: Arc::new(RwLock::new(PeerTable::new())),
            peer_tx,
            last_error,
            scan_handle: Mutex::new(None),
        }
    }

    /// The permission gate shared with the scanner.
    pub fn permissions(&self) -> &PermissionGate {
        &self.gate
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.link.subscribe()
    }

    /// Subscribe to peer sightings.
    pub fn subscribe_peers(&self) -> broadcast::Receiver<DiscoveredPeer> {
        self.peer_tx.subscribe()
    }

    /// The peer currently targeted by the link.
    pub fn target(&self) -> Option<PeerAddress> {
        self.link.target()
    }

    /// Check if the acknowledge protocol is live.
    pub fn is_notify_ready(&self) -> bool {
        self.link.is_notify_ready()
    }

    /// Protocol counters for the current target.
    pub fn protocol_stats(&self) -> ProtocolStats {
        self.link.protocol_stats()
    }

    /// One record per peer, latest sighting, keyed by address.
    pub fn peers(&self) -> HashMap<PeerAddress, DiscoveredPeer> {
        self.peers.read().snapshot()
    }

    /// Peers, strongest signal first.
    pub fn peers_by_signal(&self) -> Vec<DiscoveredPeer> {
        self.peers.read().sorted_by_signal()
    }

    /// Look up one peer.
    pub fn peer(&self, address: &PeerAddress) -> Option<DiscoveredPeer> {
        self.peers.read().get(address).cloned()
    }

    /// The latest error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Check if a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    fn record_error(&self, err: &Error) {
        *self.last_error.write() = Some(err.to_string());
    }

    /// Start a fresh scan, replacing any running one.
    ///
    /// Clears the peer table and the last error. Refused unless the link is
    /// `Disconnected`.
    pub async fn start_scan(&self, filter: ScanFilter) -> Result<()> {
        if self.link.state() != ConnectionState::Disconnected {
            debug!("Refusing scan while link is {}", self.link.state());
            return Err(Error::LinkActive);
        }

        self.stop_scan().await;
        self.peers.write().clear();
        *self.last_error.write() = None;

        let mut stream = match self.scanner.begin(filter).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to start scan: {}", e);
                self.record_error(&e);
                return Err(e);
            }
        };

        let peers = self.peers.clone();
        let peer_tx = self.peer_tx.clone();
        let last_error = self.last_error.clone();

        let handle = tokio::spawn(async move {
            use futures::StreamExt;

            while let Some(item) = stream.next().await {
                match item {
                    Ok(peer) => {
                        if peers.write().insert(peer.clone()) {
                            info!("Discovered {} ({:?})", peer.address, peer.name);
                        }
                        let _ = peer_tx.send(peer);
                    }
                    Err(e) => {
                        warn!("Scan ended: {}", e);
                        *last_error.write() = Some(e.to_string());
                    }
                }
            }
            debug!("Scan task finished");
        });

        *self.scan_handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop the running scan, if any. The peer table is kept.
    pub async fn stop_scan(&self) {
        let handle = self.scan_handle.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            debug!("Scan stopped");
        }
    }

    /// Connect to a peer by address.
    ///
    /// Resolves the address, stops any running scan and hands the peer to
    /// the link. Returns once the link starts connecting. Refused with
    /// [`Error::PermissionDenied`] until the radio permission is granted.
    pub async fn connect(&self, address: &str) -> Result<()> {
        if !self.gate.granted() {
            let err = Error::PermissionDenied;
            warn!("Refusing to connect to {}: {}", address, err);
            self.record_error(&err);
            return Err(err);
        }

        let peer = match self.radio.resolve_peer(address).await {
            Ok(peer) => peer,
            Err(e) => {
                warn!("Failed to resolve {}: {}", address, e);
                self.record_error(&e);
                return Err(e);
            }
        };

        self.stop_scan().await;

        self.link.connect(peer).map_err(|e| {
            self.record_error(&e);
            e
        })
    }

    /// Drop the link and forget discovered peers.
    pub fn disconnect(&self) {
        self.link.disconnect();
        self.peers.write().clear();
    }

    /// Stop scanning, disconnect and stop the link's event processing.
    pub async fn shutdown(&self) {
        info!("Shutting down session");
        self.stop_scan().await;
        self.peers.write().clear();
        self.link.shutdown().await;
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        if let Some(handle) = self.scan_handle.lock().take() {
            handle.abort();
        }
    }
}
