//! Hands-Free Profile supported-features bitmasks.
//!
//! Both sides of an HFP connection advertise their capabilities with
//! `AT+BRSF` / `+BRSF`. The bit assignments differ between the audio
//! gateway and the hands-free unit, so each side has its own type.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

macro_rules! feature_set {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $(#[$fmeta:meta])* const $flag:ident = $bit:expr, $label:literal; )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        #[cfg_attr(feature = "serde", serde(transparent))]
        pub struct $name(u32);

        impl $name {
            $( $(#[$fmeta])* pub const $flag: $name = $name($bit); )*

            const NAMES: &'static [($name, &'static str)] = &[ $( ($name::$flag, $label), )* ];

            #[must_use]
            pub const fn from_bits(bits: u32) -> Self {
                Self(bits)
            }

            #[must_use]
            pub const fn bits(self) -> u32 {
                self.0
            }

            #[must_use]
            pub const fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            /// Human-readable names of every known feature that is set.
            #[must_use]
            pub fn names(self) -> Vec<&'static str> {
                Self::NAMES
                    .iter()
                    .filter(|(flag, _)| self.contains(*flag))
                    .map(|(_, label)| *label)
                    .collect()
            }
        }

        impl core::ops::BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)?;
                let names = self.names();
                if !names.is_empty() {
                    write!(f, " ({})", names.join(", "))?;
                }
                Ok(())
            }
        }
    };
}

feature_set! {
    /// Features advertised by this audio gateway in `+BRSF`.
    pub struct AgFeatures {
        const THREE_WAY_CALLING = 1 << 0, "three-way calling";
        const EC_NR = 1 << 1, "EC and/or NR function";
        const VOICE_RECOGNITION = 1 << 2, "voice recognition";
        const INBAND_RINGTONE = 1 << 3, "in-band ring tone";
        const ATTACH_NUMBER_TO_VOICETAG = 1 << 4, "attach a number to a voice tag";
        const REJECT_A_CALL = 1 << 5, "ability to reject a call";
        const ENHANCED_CALL_STATUS = 1 << 6, "enhanced call status";
        const ENHANCED_CALL_CONTROL = 1 << 7, "enhanced call control";
        const EXTENDED_ERROR_RESULT_CODES = 1 << 8, "extended error result codes";
    }
}

feature_set! {
    /// Features reported by the remote hands-free unit in `AT+BRSF`.
    pub struct HfFeatures {
        const EC_NR = 1 << 0, "EC and/or NR function";
        const CALL_WAITING_AND_3WAY = 1 << 1, "call waiting and three-way calling";
        const CLI_PRESENTATION = 1 << 2, "CLI presentation capability";
        const VOICE_RECOGNITION = 1 << 3, "voice recognition activation";
        const REMOTE_VOLUME_CONTROL = 1 << 4, "remote volume control";
        const ENHANCED_CALL_STATUS = 1 << 5, "enhanced call status";
        const ENHANCED_CALL_CONTROL = 1 << 6, "enhanced call control";
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ag_feature_names() {
        let features = AgFeatures::THREE_WAY_CALLING | AgFeatures::REJECT_A_CALL;
        assert_eq!(features.bits(), 0x21);
        assert_eq!(
            features.names(),
            vec!["three-way calling", "ability to reject a call"]
        );
        assert!(features.contains(AgFeatures::THREE_WAY_CALLING));
        assert!(!features.contains(AgFeatures::EC_NR));
    }

    #[test]
    fn test_hf_features_from_brsf_value() {
        // A typical headset reports 20 = CLI presentation + remote volume control.
        let features = HfFeatures::from_bits(20);
        assert!(features.contains(HfFeatures::CLI_PRESENTATION));
        assert!(features.contains(HfFeatures::REMOTE_VOLUME_CONTROL));
        assert_eq!(features.names().len(), 2);
    }

    #[test]
    fn test_feature_display() {
        assert_eq!(AgFeatures::default().to_string(), "0x0");
        assert_eq!(
            AgFeatures::EC_NR.to_string(),
            "0x2 (EC and/or NR function)"
        );
    }

    #[test]
    fn test_unknown_bits_are_kept() {
        let features = HfFeatures::from_bits(0x8000_0001);
        assert_eq!(features.bits(), 0x8000_0001);
        assert_eq!(features.names(), vec!["EC and/or NR function"]);
    }
}
