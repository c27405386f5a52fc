//! Bluetooth UUIDs for the band.
//!
//! The band exposes a single vendor service with one write characteristic
//! for commands and one notify characteristic for telemetry frames.

use uuid::{Uuid, uuid};

/// Vendor service carrying the command and telemetry characteristics.
pub const BAND_SERVICE: Uuid = uuid!("0000fff0-0000-1000-8000-00805f9b34fb");

/// Characteristic commands are written to.
pub const WRITE_CHARACTERISTIC: Uuid = uuid!("0000fff6-0000-1000-8000-00805f9b34fb");

/// Characteristic telemetry frames are notified on.
pub const NOTIFY_CHARACTERISTIC: Uuid = uuid!("0000fff7-0000-1000-8000-00805f9b34fb");

/// Client Characteristic Configuration descriptor, written to enable notifications.
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid = uuid!("00002902-0000-1000-8000-00805f9b34fb");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_service_uuid() {
        assert_eq!(
            BAND_SERVICE.to_string(),
            "0000fff0-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_characteristic_uuids_share_base() {
        for (uuid, short) in [
            (WRITE_CHARACTERISTIC, "fff6"),
            (NOTIFY_CHARACTERISTIC, "fff7"),
            (CLIENT_CHARACTERISTIC_CONFIG, "2902"),
        ] {
            let text = uuid.to_string();
            assert_eq!(&text[4..8], short);
            assert!(text.ends_with("-0000-1000-8000-00805f9b34fb"));
        }
    }

    #[test]
    fn test_write_and_notify_differ() {
        assert_ne!(WRITE_CHARACTERISTIC, NOTIFY_CHARACTERISTIC);
    }
}
