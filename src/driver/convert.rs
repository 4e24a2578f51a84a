//! Transformation of numeric readings before they are published.

use super::entity::{Tag, TagRange};

/// What a range check made of a reading.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeOutcome {
    /// Value published under the tag id. `None` publishes nothing for the tag.
    pub value: Option<f64>,
    /// Rejected reading, published under `{tag}__invalid`.
    pub raw: Option<f64>,
    /// Why the reading was rejected, published under `{tag}__invalid__type`.
    pub invalid_type: Option<String>,
    /// Whether `value` becomes the previous value of the next check.
    pub save: bool,
}

impl RangeOutcome {
    /// The reading is fine as it is.
    pub fn keep(value: f64) -> Self {
        Self {
            value: Some(value),
            raw: None,
            invalid_type: None,
            save: true,
        }
    }
}

/// Scaling and range policy applied to numeric readings.
pub trait Converter: Send + Sync + 'static {
    /// Scales a raw reading according to its tag.
    fn value(&self, tag: &Tag, raw: f64) -> f64;

    /// Checks `value` against `range`. `previous` is the last value kept for the same
    /// device tag.
    fn range(&self, range: &TagRange, previous: Option<f64>, value: f64) -> RangeOutcome;
}

/// Rounds to the tag's decimal places and holds the previous value when a reading
/// leaves its range.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConverter;

impl Converter for DefaultConverter {
    fn value(&self, tag: &Tag, raw: f64) -> f64 {
        match tag.fixed {
            Some(places) => {
                let factor = 10_f64.powi(places.min(15) as i32);
                (raw * factor).round() / factor
            }
            None => raw,
        }
    }

    fn range(&self, range: &TagRange, previous: Option<f64>, value: f64) -> RangeOutcome {
        let below = range.min_value.is_some_and(|min| value < min);
        let above = range.max_value.is_some_and(|max| value > max);
        if !below && !above {
            return RangeOutcome::keep(value);
        }
        RangeOutcome {
            value: previous,
            raw: Some(value),
            invalid_type: Some("range".to_string()),
            save: false,
        }
    }
}
