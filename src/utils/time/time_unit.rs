use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Unit of a `(value, unit)` duration pair in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Nanos,
    Micros,
    #[default]
    Millis,
    Second,
    Minute,
    Hour,
}

impl TimeUnit {
    #[inline]
    pub const fn to_nanos(&self, value: u64) -> u128 {
        value as u128
            * match self {
                TimeUnit::Nanos => 1,
                TimeUnit::Micros => 1_000,
                TimeUnit::Millis => 1_000_000,
                TimeUnit::Second => 1_000_000_000,
                TimeUnit::Minute => 60 * 1_000_000_000,
                TimeUnit::Hour => 3_600 * 1_000_000_000,
            }
    }

    /// Saturates at `Duration::MAX`.
    pub fn duration(&self, value: u64) -> Duration {
        let nanos = self.to_nanos(value);
        let secs = nanos / 1_000_000_000;
        match u64::try_from(secs) {
            Ok(secs) => Duration::new(secs, (nanos % 1_000_000_000) as u32),
            Err(_) => Duration::MAX,
        }
    }

    /// Converts `value` from this unit to `target_unit`, truncating.
    #[inline]
    pub const fn convert(&self, value: u64, target_unit: TimeUnit) -> u64 {
        (self.to_nanos(value) / target_unit.to_nanos(1)) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_between_units() {
        assert_eq!(TimeUnit::Second.convert(2, TimeUnit::Millis), 2_000);
        assert_eq!(TimeUnit::Micros.convert(1_999, TimeUnit::Millis), 1);
        assert_eq!(TimeUnit::Hour.duration(1), Duration::from_secs(3_600));
        assert_eq!(TimeUnit::Micros.duration(1_500), Duration::from_micros(1_500));
    }
}
