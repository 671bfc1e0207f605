//! Core types shared by the headset gateway crates.

use core::fmt;
use core::ops::{BitOr, BitOrAssign};
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ParseError, ParseResult};

/// Highest volume level accepted for speaker and microphone gain.
pub const MAX_GAIN: u8 = 15;

/// A 48-bit Bluetooth device address.
///
/// Addresses are written most significant octet first, as six
/// colon-separated hex pairs (`00:11:22:AA:BB:CC`).
///
/// # Examples
///
/// ```
/// use headset_types::DeviceAddress;
///
/// let addr: DeviceAddress = "00:11:22:aa:bb:cc".parse().unwrap();
/// assert_eq!(addr.to_string(), "00:11:22:AA:BB:CC");
/// assert_eq!(addr.octets(), [0x00, 0x11, 0x22, 0xAA, 0xBB, 0xCC]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    /// The all-zero wildcard address (`BDADDR_ANY`).
    pub const ANY: DeviceAddress = DeviceAddress([0; 6]);

    /// Create an address from its octets, most significant first.
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// The address octets, most significant first.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for DeviceAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> ParseResult<Self> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');

        for octet in &mut octets {
            let part = parts
                .next()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| ParseError::InvalidAddress(s.to_string()))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| ParseError::InvalidAddress(s.to_string()))?;
        }

        if parts.next().is_some() {
            return Err(ParseError::InvalidAddress(s.to_string()));
        }

        Ok(Self(octets))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

#[cfg(feature = "serde")]
impl Serialize for DeviceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for DeviceAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Lifecycle state of a headset session.
///
/// States are ordered: a session "is connected" when its state compares
/// greater than or equal to [`HeadsetState::Connected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum HeadsetState {
    /// No control channel.
    #[default]
    Disconnected,
    /// Discovery, control connect or service level negotiation under way.
    ConnectInProgress,
    /// Control channel open and negotiated.
    Connected,
    /// Audio channel connect under way.
    PlayInProgress,
    /// Audio channel open.
    Playing,
}

impl HeadsetState {
    /// Whether the control channel is fully established.
    #[must_use]
    pub fn is_connected(self) -> bool {
        self >= HeadsetState::Connected
    }

    /// Short machine-readable name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HeadsetState::Disconnected => "disconnected",
            HeadsetState::ConnectInProgress => "connect_in_progress",
            HeadsetState::Connected => "connected",
            HeadsetState::PlayInProgress => "play_in_progress",
            HeadsetState::Playing => "playing",
        }
    }
}

impl fmt::Display for HeadsetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeadsetState::Disconnected => write!(f, "Disconnected"),
            HeadsetState::ConnectInProgress => write!(f, "Connect in progress"),
            HeadsetState::Connected => write!(f, "Connected"),
            HeadsetState::PlayInProgress => write!(f, "Play in progress"),
            HeadsetState::Playing => write!(f, "Playing"),
        }
    }
}

/// Which volume a gain value applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum GainKind {
    Speaker,
    Microphone,
}

impl GainKind {
    /// The letter used on the wire (`+VGS` / `+VGM`).
    #[must_use]
    pub fn code(self) -> char {
        match self {
            GainKind::Speaker => 'S',
            GainKind::Microphone => 'M',
        }
    }

    /// Map a wire letter back to a gain kind.
    #[must_use]
    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'S' => Some(GainKind::Speaker),
            'M' => Some(GainKind::Microphone),
            _ => None,
        }
    }
}

impl fmt::Display for GainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GainKind::Speaker => write!(f, "speaker"),
            GainKind::Microphone => write!(f, "microphone"),
        }
    }
}

impl FromStr for GainKind {
    type Err = ParseError;

    fn from_str(s: &str) -> ParseResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "speaker" => Ok(GainKind::Speaker),
            "microphone" | "mic" => Ok(GainKind::Microphone),
            _ => Err(ParseError::InvalidValue(format!("unknown gain kind '{s}'"))),
        }
    }
}

/// How SCO audio is routed by the adapter.
///
/// With HCI routing the audio samples travel over the host controller
/// interface and the gateway refuses explicit play requests; with PCM
/// routing audio goes to a hardware PCM bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ScoRouting {
    #[default]
    Hci,
    Pcm,
}

impl FromStr for ScoRouting {
    type Err = ParseError;

    fn from_str(s: &str) -> ParseResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "HCI" => Ok(ScoRouting::Hci),
            "PCM" => Ok(ScoRouting::Pcm),
            _ => Err(ParseError::InvalidValue(format!("invalid SCO routing '{s}'"))),
        }
    }
}

impl fmt::Display for ScoRouting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScoRouting::Hci => write!(f, "HCI"),
            ScoRouting::Pcm => write!(f, "PCM"),
        }
    }
}

/// Locks held on a session by local audio consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LockMask(u8);

impl LockMask {
    pub const NONE: LockMask = LockMask(0);
    pub const READ: LockMask = LockMask(1 << 0);
    pub const WRITE: LockMask = LockMask(1 << 1);

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether any of the bits in `other` are held.
    #[must_use]
    pub const fn intersects(self, other: LockMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: LockMask) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: LockMask) {
        self.0 &= !other.0;
    }
}

impl BitOr for LockMask {
    type Output = LockMask;

    fn bitor(self, rhs: LockMask) -> LockMask {
        LockMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for LockMask {
    fn bitor_assign(&mut self, rhs: LockMask) {
        self.insert(rhs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- DeviceAddress tests ---

    #[test]
    fn test_device_address_parse_and_display() {
        let addr: DeviceAddress = "0a:1B:2c:3D:4e:5F".parse().unwrap();
        assert_eq!(addr.octets(), [0x0A, 0x1B, 0x2C, 0x3D, 0x4E, 0x5F]);
        assert_eq!(addr.to_string(), "0A:1B:2C:3D:4E:5F");
    }

    #[test]
    fn test_device_address_rejects_malformed() {
        for bad in [
            "",
            "00:11:22:33:44",
            "00:11:22:33:44:55:66",
            "00-11-22-33-44-55",
            "0:11:22:33:44:55",
            "zz:11:22:33:44:55",
        ] {
            let err = bad.parse::<DeviceAddress>().unwrap_err();
            assert!(matches!(err, ParseError::InvalidAddress(_)), "{bad}");
        }
    }

    #[test]
    fn test_device_address_any_is_zero() {
        assert_eq!(DeviceAddress::ANY.to_string(), "00:00:00:00:00:00");
        assert_eq!(DeviceAddress::default(), DeviceAddress::ANY);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_device_address_serializes_as_string() {
        let addr = DeviceAddress::new([0, 1, 2, 3, 4, 5]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"00:01:02:03:04:05\"");
        let back: DeviceAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
        assert!(serde_json::from_str::<DeviceAddress>("\"nope\"").is_err());
    }

    // --- HeadsetState tests ---

    #[test]
    fn test_headset_state_ordering() {
        use HeadsetState::*;
        assert!(Disconnected < ConnectInProgress);
        assert!(ConnectInProgress < Connected);
        assert!(Connected < PlayInProgress);
        assert!(PlayInProgress < Playing);
        assert!(!ConnectInProgress.is_connected());
        assert!(Connected.is_connected());
        assert!(Playing.is_connected());
    }

    #[test]
    fn test_headset_state_display() {
        assert_eq!(HeadsetState::ConnectInProgress.to_string(), "Connect in progress");
        assert_eq!(HeadsetState::Playing.as_str(), "playing");
    }

    // --- GainKind / ScoRouting tests ---

    #[test]
    fn test_gain_kind_codes() {
        assert_eq!(GainKind::Speaker.code(), 'S');
        assert_eq!(GainKind::from_code('M'), Some(GainKind::Microphone));
        assert_eq!(GainKind::from_code('X'), None);
        assert_eq!("mic".parse::<GainKind>().unwrap(), GainKind::Microphone);
    }

    #[test]
    fn test_sco_routing_parse() {
        assert_eq!("pcm".parse::<ScoRouting>().unwrap(), ScoRouting::Pcm);
        assert_eq!("HCI".parse::<ScoRouting>().unwrap(), ScoRouting::Hci);
        assert!("usb".parse::<ScoRouting>().is_err());
        assert_eq!(ScoRouting::default(), ScoRouting::Hci);
    }

    // --- LockMask tests ---

    #[test]
    fn test_lock_mask_insert_remove() {
        let mut mask = LockMask::NONE;
        assert!(mask.is_empty());
        mask |= LockMask::READ;
        mask.insert(LockMask::WRITE);
        assert_eq!(mask.bits(), 0b11);
        mask.remove(LockMask::READ);
        assert!(!mask.intersects(LockMask::READ));
        assert!(mask.intersects(LockMask::READ | LockMask::WRITE));
        mask.remove(LockMask::WRITE);
        assert!(mask.is_empty());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Parsing arbitrary text as an address may fail but never panics.
        #[test]
        fn parse_address_never_panics(s in "\\PC*") {
            let _ = s.parse::<DeviceAddress>();
        }

        /// Lowercase input is accepted and displayed uppercase.
        #[test]
        fn address_case_is_normalized(octets: [u8; 6]) {
            let addr = DeviceAddress::new(octets);
            let lower = addr.to_string().to_lowercase();
            let parsed: DeviceAddress = lower.parse().unwrap();
            prop_assert_eq!(parsed.octets(), octets);
            prop_assert_eq!(parsed.to_string(), lower.to_uppercase());
        }
    }
}
