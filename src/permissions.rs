//! Radio permission gate.
//!
//! The scan session and the link state machine must not touch the radio
//! before permission is granted, and an active scan stops when it is revoked.
//! Acquiring the permission is the host application's job; it reports the
//! outcome through [`PermissionGate::set`].

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// A platform permission the host application has to obtain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RadioPermission {
    /// Permission to scan for peripherals.
    Scan,
    /// Permission to connect to peripherals.
    Connect,
    /// Location access, required for scanning on older platforms.
    FineLocation,
}

/// How the platform splits radio permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PermissionModel {
    /// Dedicated scan and connect permissions.
    #[default]
    ScanConnect,
    /// Scanning piggybacks on location access.
    Legacy,
}

/// The permissions to request before the gate can be granted.
pub fn required_permissions(model: PermissionModel) -> &'static [RadioPermission] {
    match model {
        PermissionModel::ScanConnect => &[RadioPermission::Scan, RadioPermission::Connect],
        PermissionModel::Legacy => &[RadioPermission::FineLocation],
    }
}

/// Shared "may use radio" flag.
///
/// Cloning the gate yields another handle to the same flag.
#[derive(Debug, Clone)]
pub struct PermissionGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for PermissionGate {
    fn default() -> Self {
        Self::new(false)
    }
}

impl PermissionGate {
    /// Create a gate in the given state.
    pub fn new(granted: bool) -> Self {
        let (tx, _) = watch::channel(granted);
        Self { tx: Arc::new(tx) }
    }

    /// Create a gate that is already granted.
    pub fn granted_gate() -> Self {
        Self::new(true)
    }

    /// Check if the radio may be used.
    pub fn granted(&self) -> bool {
        *self.tx.borrow()
    }

    /// Mark the permission as granted.
    pub fn grant(&self) {
        self.set(true);
    }

    /// Mark the permission as revoked.
    pub fn revoke(&self) {
        self.set(false);
    }

    /// Report the outcome of a permission request.
    pub fn set(&self, granted: bool) {
        let previous = self.tx.send_replace(granted);
        if previous != granted {
            if granted {
                info!("Radio permission granted");
            } else {
                warn!("Radio permission revoked");
            }
        }
    }

    /// Watch the flag.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_permissions() {
        assert_eq!(
            required_permissions(PermissionModel::ScanConnect),
            &[RadioPermission::Scan, RadioPermission::Connect]
        );
        assert_eq!(
            required_permissions(PermissionModel::Legacy),
            &[RadioPermission::FineLocation]
        );
    }

    #[test]
    fn test_gate_defaults_to_denied() {
        assert!(!PermissionGate::default().granted());
        assert!(PermissionGate::granted_gate().granted());
    }

    #[test]
    fn test_clones_share_state() {
        let gate = PermissionGate::default();
        let other = gate.clone();
        gate.grant();
        assert!(other.granted());
        other.revoke();
        assert!(!gate.granted());
    }

    #[tokio::test]
    async fn test_subscribers_see_revocation() {
        let gate = PermissionGate::granted_gate();
        let mut rx = gate.subscribe();

        gate.revoke();
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }
}
