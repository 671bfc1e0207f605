//! Telephony status indicators reported through `+CIND` and `+CIEV`.
//!
//! The indicator table is supplied by the telephony backend. Indexes are
//! zero-based in this API; the wire protocol numbers indicators from one.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};

/// One named indicator with its allowed range and current value.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Indicator {
    /// Indicator name as reported in `+CIND=?` (e.g. `"call"`).
    pub name: String,
    /// Allowed values in `+CIND` syntax: `"0,1"`, `"0-5"` or a mix.
    pub range: String,
    /// Current value.
    pub value: i32,
}

impl Indicator {
    pub fn new(name: impl Into<String>, range: impl Into<String>, value: i32) -> Self {
        Self {
            name: name.into(),
            range: range.into(),
            value,
        }
    }

    /// Whether `value` is permitted by this indicator's range.
    ///
    /// An unparsable range accepts nothing.
    ///
    /// ```
    /// use headset_types::Indicator;
    ///
    /// let callsetup = Indicator::new("callsetup", "0-3", 0);
    /// assert!(callsetup.accepts(2));
    /// assert!(!callsetup.accepts(4));
    /// ```
    #[must_use]
    pub fn accepts(&self, value: i32) -> bool {
        self.range.split(',').any(|item| {
            let item = item.trim();
            match item.split_once('-') {
                Some((lo, hi)) => match (lo.trim().parse::<i32>(), hi.trim().parse::<i32>()) {
                    (Ok(lo), Ok(hi)) => (lo..=hi).contains(&value),
                    _ => false,
                },
                None => item.parse::<i32>() == Ok(value),
            }
        })
    }
}

/// The ordered indicator table advertised to the hands-free unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct IndicatorTable {
    indicators: Vec<Indicator>,
}

impl IndicatorTable {
    pub fn new(indicators: Vec<Indicator>) -> Self {
        Self { indicators }
    }

    /// The indicator set of a basic mobile phone: service, call, call setup,
    /// held call, signal strength, roaming and battery charge.
    pub fn standard() -> Self {
        Self::new(vec![
            Indicator::new("service", "0,1", 1),
            Indicator::new("call", "0,1", 0),
            Indicator::new("callsetup", "0-3", 0),
            Indicator::new("callheld", "0-2", 0),
            Indicator::new("signal", "0-5", 5),
            Indicator::new("roam", "0,1", 0),
            Indicator::new("battchg", "0-5", 5),
        ])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.indicators.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indicators.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Indicator> {
        self.indicators.get(index)
    }

    /// Zero-based index of the indicator called `name`.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.indicators.iter().position(|i| i.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Indicator> {
        self.indicators.iter()
    }

    /// Update the value at `index`, validating it against the range.
    pub fn set(&mut self, index: usize, value: i32) -> ParseResult<()> {
        let len = self.indicators.len();
        let indicator = self
            .indicators
            .get_mut(index)
            .ok_or(ParseError::IndicatorIndex { index, len })?;

        if !indicator.accepts(value) {
            return Err(ParseError::IndicatorValue {
                name: indicator.name.clone(),
                value,
                range: indicator.range.clone(),
            });
        }

        indicator.value = value;
        Ok(())
    }

    /// Body of the `+CIND=?` response.
    ///
    /// ```
    /// use headset_types::{Indicator, IndicatorTable};
    ///
    /// let table = IndicatorTable::new(vec![
    ///     Indicator::new("service", "0,1", 1),
    ///     Indicator::new("callsetup", "0-3", 0),
    /// ]);
    /// assert_eq!(table.ranges(), r#"+CIND:("service",(0,1)),("callsetup",(0-3))"#);
    /// ```
    #[must_use]
    pub fn ranges(&self) -> String {
        let items: Vec<String> = self
            .indicators
            .iter()
            .map(|i| format!("(\"{}\",({}))", i.name, i.range))
            .collect();
        format!("+CIND:{}", items.join(","))
    }

    /// Body of the `+CIND?` response.
    #[must_use]
    pub fn values(&self) -> String {
        let items: Vec<String> = self.indicators.iter().map(|i| i.value.to_string()).collect();
        format!("+CIND:{}", items.join(","))
    }
}
