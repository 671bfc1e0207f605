//! Bluetooth service class UUIDs for the headset profiles.
//!
//! Classic Bluetooth service classes are 16-bit values expanded onto the
//! Bluetooth base UUID `0000xxxx-0000-1000-8000-00805f9b34fb`.

use uuid::{Uuid, uuid};

/// The Bluetooth base UUID.
pub const BASE_UUID: Uuid = uuid!("00000000-0000-1000-8000-00805f9b34fb");

// --- Remote (headset side) service classes ---

/// Headset Profile, headset role (0x1108).
pub const HEADSET: Uuid = uuid!("00001108-0000-1000-8000-00805f9b34fb");

/// Hands-Free Profile, hands-free unit role (0x111E).
pub const HANDSFREE: Uuid = uuid!("0000111e-0000-1000-8000-00805f9b34fb");

// --- Local (gateway side) service classes ---

/// Headset Profile, audio gateway role (0x1112).
pub const HEADSET_AUDIO_GATEWAY: Uuid = uuid!("00001112-0000-1000-8000-00805f9b34fb");

/// Hands-Free Profile, audio gateway role (0x111F).
pub const HANDSFREE_AUDIO_GATEWAY: Uuid = uuid!("0000111f-0000-1000-8000-00805f9b34fb");

const BASE_TAIL: [u8; 8] = [0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34, 0xfb];

/// Expand a 16-bit service class onto the base UUID.
#[must_use]
pub const fn from_u16(short: u16) -> Uuid {
    Uuid::from_fields(short as u32, 0x0000, 0x1000, &BASE_TAIL)
}

/// The 16-bit alias of `uuid`, if it lies on the base UUID.
#[must_use]
pub fn to_u16(uuid: &Uuid) -> Option<u16> {
    let (d1, d2, d3, d4) = uuid.as_fields();
    if d2 != 0 || d3 != 0x1000 || d4 != &BASE_TAIL {
        return None;
    }
    u16::try_from(d1).ok()
}
