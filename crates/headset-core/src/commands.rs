//! AT command table and argument parsing.
//!
//! Commands are matched by case-sensitive prefix against [`COMMAND_TABLE`].
//! The first entry that matches wins, so table order is significant.

use headset_types::{GainKind, HfFeatures};

use crate::error::{Error, Result};

/// Identifies a command handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Answer,
    Dial,
    Gain,
    SupportedFeatures,
    Indicators,
    EventReporting,
    CallHold,
    HangUp,
    KeyPress,
    CallerId,
    ResponseAndHold,
    Redial,
    Dtmf,
    SubscriberNumber,
}

/// Ordered prefix table.
pub const COMMAND_TABLE: &[(&str, CommandKind)] = &[
    ("ATA", CommandKind::Answer),
    ("ATD", CommandKind::Dial),
    ("AT+VG", CommandKind::Gain),
    ("AT+BRSF", CommandKind::SupportedFeatures),
    ("AT+CIND", CommandKind::Indicators),
    ("AT+CMER", CommandKind::EventReporting),
    ("AT+CHLD", CommandKind::CallHold),
    ("AT+CHUP", CommandKind::HangUp),
    ("AT+CKPD", CommandKind::KeyPress),
    ("AT+CLIP", CommandKind::CallerId),
    ("AT+BTRH", CommandKind::ResponseAndHold),
    ("AT+BLDN", CommandKind::Redial),
    ("AT+VTS", CommandKind::Dtmf),
    ("AT+CNUM", CommandKind::SubscriberNumber),
];

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtCommand {
    /// `ATA`
    Answer,
    /// `ATD<number>`; a trailing `;` (voice call) is stripped.
    Dial(String),
    /// `AT+VGS=<n>` / `AT+VGM=<n>`; the value is range-checked by the handler.
    Gain { kind: GainKind, value: u32 },
    /// `AT+BRSF=<features>`
    SupportedFeatures(HfFeatures),
    /// `AT+CIND=?`
    IndicatorRanges,
    /// `AT+CIND?`
    IndicatorValues,
    /// `AT+CMER=<mode>,<keyp>,<disp>,<ind>[,<bfr>]`
    EventReporting { mode: i32, indicators: i32 },
    /// `AT+CHLD=?` (and any other `AT+CHLD` form)
    CallHold,
    /// `AT+CHUP`
    HangUp,
    /// `AT+CKPD=<key>`, the headset button.
    KeyPress,
    /// `AT+CLIP=<0|1>`
    CallerId(bool),
    /// `AT+BTRH?`
    ResponseAndHoldQuery,
    /// `AT+BTRH=<n>`
    ResponseAndHold(i32),
    /// `AT+BLDN`
    Redial,
    /// `AT+VTS=<tone>`
    Dtmf(char),
    /// `AT+CNUM`
    SubscriberNumber,
}

/// Find the handler for `line` by prefix.
pub fn lookup(line: &str) -> Option<(&'static str, CommandKind)> {
    COMMAND_TABLE
        .iter()
        .find(|(prefix, _)| line.starts_with(prefix))
        .copied()
}

impl AtCommand {
    /// Parse one command line (without its CR terminator).
    pub fn parse(line: &str) -> Result<Self> {
        let (prefix, kind) =
            lookup(line).ok_or_else(|| Error::UnrecognizedCommand(line.to_string()))?;
        let bytes = line.as_bytes();

        let command = match kind {
            CommandKind::Answer => AtCommand::Answer,
            CommandKind::Dial => {
                let number = line[3..].trim_end_matches(';');
                if number.is_empty() {
                    return Err(Error::malformed(prefix, "missing number"));
                }
                AtCommand::Dial(number.to_string())
            }
            CommandKind::Gain => {
                if line.len() < 8 {
                    return Err(Error::malformed(prefix, "too short"));
                }
                let kind = GainKind::from_code(char::from(bytes[5]))
                    .ok_or_else(|| Error::malformed(prefix, "unknown gain type"))?;
                if bytes[6] != b'=' {
                    return Err(Error::malformed(prefix, "expected '='"));
                }
                let value = parse_number(prefix, arg(prefix, line, 7)?)?;
                AtCommand::Gain { kind, value }
            }
            CommandKind::SupportedFeatures => {
                if line.len() < 9 {
                    return Err(Error::malformed(prefix, "too short"));
                }
                AtCommand::SupportedFeatures(HfFeatures::from_bits(parse_number(
                    prefix,
                    arg(prefix, line, 8)?,
                )?))
            }
            CommandKind::Indicators => {
                if line.len() < 8 {
                    return Err(Error::malformed(prefix, "too short"));
                }
                if bytes[7] == b'=' {
                    AtCommand::IndicatorRanges
                } else {
                    AtCommand::IndicatorValues
                }
            }
            CommandKind::EventReporting => {
                if line.len() < 13 {
                    return Err(Error::malformed(prefix, "too short"));
                }
                let tokens: Vec<&str> = arg(prefix, line, 8)?.splitn(5, ',').collect();
                if tokens.len() < 4 {
                    return Err(Error::malformed(prefix, "expected at least four fields"));
                }
                let mode = parse_signed(prefix, tokens[0])?;
                let indicators = parse_signed(prefix, tokens[3])?;
                AtCommand::EventReporting { mode, indicators }
            }
            CommandKind::CallHold => AtCommand::CallHold,
            CommandKind::HangUp => AtCommand::HangUp,
            CommandKind::KeyPress => AtCommand::KeyPress,
            CommandKind::CallerId => {
                if line.len() < 9 {
                    return Err(Error::malformed(prefix, "too short"));
                }
                AtCommand::CallerId(bytes[8] == b'1')
            }
            CommandKind::ResponseAndHold => {
                if line.len() < 8 {
                    return Err(Error::malformed(prefix, "too short"));
                }
                if bytes[7] == b'=' {
                    AtCommand::ResponseAndHold(parse_signed(prefix, arg(prefix, line, 8)?)?)
                } else {
                    AtCommand::ResponseAndHoldQuery
                }
            }
            CommandKind::Redial => AtCommand::Redial,
            CommandKind::Dtmf => {
                if line.len() < 8 {
                    return Err(Error::malformed(prefix, "too short"));
                }
                let tone = char::from(bytes[7]);
                if !is_dtmf(tone) {
                    return Err(Error::malformed(prefix, format!("invalid tone '{tone}'")));
                }
                AtCommand::Dtmf(tone)
            }
            CommandKind::SubscriberNumber => AtCommand::SubscriberNumber,
        };

        Ok(command)
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            AtCommand::Answer => CommandKind::Answer,
            AtCommand::Dial(_) => CommandKind::Dial,
            AtCommand::Gain { .. } => CommandKind::Gain,
            AtCommand::SupportedFeatures(_) => CommandKind::SupportedFeatures,
            AtCommand::IndicatorRanges | AtCommand::IndicatorValues => CommandKind::Indicators,
            AtCommand::EventReporting { .. } => CommandKind::EventReporting,
            AtCommand::CallHold => CommandKind::CallHold,
            AtCommand::HangUp => CommandKind::HangUp,
            AtCommand::KeyPress => CommandKind::KeyPress,
            AtCommand::CallerId(_) => CommandKind::CallerId,
            AtCommand::ResponseAndHoldQuery | AtCommand::ResponseAndHold(_) => {
                CommandKind::ResponseAndHold
            }
            AtCommand::Redial => CommandKind::Redial,
            AtCommand::Dtmf(_) => CommandKind::Dtmf,
            AtCommand::SubscriberNumber => CommandKind::SubscriberNumber,
        }
    }
}

/// The argument text starting at byte `start`.
fn arg<'a>(command: &'static str, line: &'a str, start: usize) -> Result<&'a str> {
    line.get(start..)
        .ok_or_else(|| Error::malformed(command, "invalid argument encoding"))
}

fn is_dtmf(tone: char) -> bool {
    tone.is_ascii_digit() || matches!(tone, '*' | '#' | 'A'..='D')
}

fn parse_number(command: &'static str, s: &str) -> Result<u32> {
    s.trim()
        .parse()
        .map_err(|_| Error::malformed(command, format!("'{s}' is not a number")))
}

fn parse_signed(command: &'static str, s: &str) -> Result<i32> {
    s.trim()
        .parse()
        .map_err(|_| Error::malformed(command, format!("'{s}' is not a number")))
}
