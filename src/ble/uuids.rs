//! BLE Service and Characteristic UUIDs.
//!
//! Contains the identifiers used to talk to a RootTap presence button.

use uuid::Uuid;

// RootTap "up" service (custom 128-bit)
/// RootTap presence service UUID.
pub const PRESENCE_SERVICE_UUID: Uuid = Uuid::from_u128(0xd173119b_a021_2f9e_6a4b_778c6f2e1c5a);
/// Confirm characteristic UUID (Write, Write Without Response). The host acknowledges here.
pub const CONFIRM_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xd273119b_a021_2f9e_6a4b_778c6f2e1c5a);
/// Button characteristic UUID (Notify). The peripheral asserts input events here.
pub const BUTTON_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xd373119b_a021_2f9e_6a4b_778c6f2e1c5a);

// Standard descriptors
/// Client Characteristic Configuration Descriptor, written to enable notifications.
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// Advertised local name of a RootTap button.
pub const DEFAULT_TARGET_NAME: &str = "roottap-up";

/// Check if a service UUID is the RootTap presence service.
pub fn is_presence_service(uuid: &Uuid) -> bool {
    *uuid == PRESENCE_SERVICE_UUID
}
