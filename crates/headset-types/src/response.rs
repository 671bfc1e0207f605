//! Result codes and unsolicited responses sent by the audio gateway.
//!
//! Every response travels as `\r\n<body>\r\n`.

use core::fmt;

use crate::features::AgFeatures;
use crate::types::GainKind;

/// Number format for an international number (leading `+`).
pub const NUMBER_INTERNATIONAL: u8 = 145;

/// Number format for a number of unknown or national format.
pub const NUMBER_UNKNOWN: u8 = 129;

/// Call hold and multiparty options offered in `+CHLD`.
pub const CALL_HOLD_OPTIONS: &str = "(0,1,1x,2,2x,3,4)";

/// The `<type>` field for a phone number, per 3GPP TS 27.007.
///
/// ```
/// use headset_types::response::number_type;
///
/// assert_eq!(number_type("+15551234"), 145);
/// assert_eq!(number_type("5551234"), 129);
/// ```
#[must_use]
pub fn number_type(number: &str) -> u8 {
    if number.starts_with('+') {
        NUMBER_INTERNATIONAL
    } else {
        NUMBER_UNKNOWN
    }
}

/// A line sent to the hands-free unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Error,
    Ring,
    /// `+BRSF=<features>`
    SupportedFeatures(AgFeatures),
    /// `+CIND:` with a preformatted body from [`IndicatorTable`](crate::IndicatorTable).
    Indicators(String),
    /// `+CIEV:<index>,<value>`; `index` is zero-based and sent one-based.
    IndicatorEvent { index: usize, value: i32 },
    /// `+CLIP:"<number>",<type>`
    CallerId { number: String, number_type: u8 },
    /// `+CHLD:(...)`
    CallHoldOptions,
    /// `+BTRH:<value>`
    ResponseAndHold(u8),
    /// `+VGS=<value>` / `+VGM=<value>`
    Gain { kind: GainKind, value: u8 },
    /// `+CNUM: ,"<number>",<type>,,4`
    SubscriberNumber { number: String, number_type: u8 },
}

impl Response {
    /// Caller id presentation for `number`, with its type derived from the format.
    pub fn caller_id(number: impl Into<String>) -> Self {
        let number = number.into();
        let number_type = number_type(&number);
        Response::CallerId {
            number,
            number_type,
        }
    }

    /// The framed line as written to the control channel.
    ///
    /// ```
    /// use headset_types::Response;
    ///
    /// assert_eq!(Response::Ok.encode(), "\r\nOK\r\n");
    /// assert_eq!(Response::IndicatorEvent { index: 1, value: 1 }.encode(), "\r\n+CIEV:2,1\r\n");
    /// ```
    #[must_use]
    pub fn encode(&self) -> String {
        format!("\r\n{self}\r\n")
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok => write!(f, "OK"),
            Response::Error => write!(f, "ERROR"),
            Response::Ring => write!(f, "RING"),
            Response::SupportedFeatures(features) => write!(f, "+BRSF={}", features.bits()),
            Response::Indicators(body) => write!(f, "{body}"),
            Response::IndicatorEvent { index, value } => write!(f, "+CIEV:{},{}", index + 1, value),
            Response::CallerId {
                number,
                number_type,
            } => write!(f, "+CLIP:\"{number}\",{number_type}"),
            Response::CallHoldOptions => write!(f, "+CHLD:{CALL_HOLD_OPTIONS}"),
            Response::ResponseAndHold(value) => write!(f, "+BTRH:{value}"),
            Response::Gain { kind, value } => write!(f, "+VG{}={}", kind.code(), value),
            Response::SubscriberNumber {
                number,
                number_type,
            } => write!(f, "+CNUM: ,\"{number}\",{number_type},,4"),
        }
    }
}
