use std::fmt::{Display, Formatter};
use std::ops::{Add, Sub};

/// An absolute or relative time: whole seconds plus a fractional part in `[0.0, 1.0)`.
///
/// Packet headers carry timestamps as 64 bit tick counts of the device clock, so conversion
///  always goes through the current tick rate (see [TimeSpec::from_ticks] / [TimeSpec::to_ticks]).
#[derive(Copy, Clone, Debug, Default, PartialEq, PartialOrd)]
pub struct TimeSpec {
    pub full_secs: i64,
    pub frac_secs: f64,
}

impl TimeSpec {
    pub const ZERO: TimeSpec = TimeSpec { full_secs: 0, frac_secs: 0.0 };

    /// create a normalized time spec - the fractional part may be out of range or negative
    pub fn new(full_secs: i64, frac_secs: f64) -> TimeSpec {
        let whole = frac_secs.floor();
        TimeSpec {
            full_secs: full_secs + whole as i64,
            frac_secs: frac_secs - whole,
        }
    }

    pub fn from_secs_f64(secs: f64) -> TimeSpec {
        TimeSpec::new(0, secs)
    }

    pub fn from_ticks(ticks: u64, tick_rate: f64) -> TimeSpec {
        if let Some(rate) = Self::integral_rate(tick_rate) {
            TimeSpec {
                full_secs: (ticks / rate) as i64,
                frac_secs: (ticks % rate) as f64 / tick_rate,
            }
        }
        else {
            TimeSpec::from_secs_f64(ticks as f64 / tick_rate)
        }
    }

    /// Convert to device clock ticks, rounding the fractional part to the nearest tick. Negative
    ///  times saturate at zero since the device clock can not represent them.
    pub fn to_ticks(&self, tick_rate: f64) -> u64 {
        if self.full_secs < 0 {
            return 0;
        }
        let frac_ticks = (self.frac_secs * tick_rate).round() as u64;
        match Self::integral_rate(tick_rate) {
            Some(rate) => (self.full_secs as u64) * rate + frac_ticks,
            None => (self.full_secs as f64 * tick_rate).round() as u64 + frac_ticks,
        }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.full_secs as f64 + self.frac_secs
    }

    fn integral_rate(tick_rate: f64) -> Option<u64> {
        if tick_rate >= 1.0 && tick_rate.fract() == 0.0 && tick_rate < u64::MAX as f64 {
            Some(tick_rate as u64)
        }
        else {
            None
        }
    }
}

impl Add for TimeSpec {
    type Output = TimeSpec;

    fn add(self, rhs: TimeSpec) -> TimeSpec {
        TimeSpec::new(self.full_secs + rhs.full_secs, self.frac_secs + rhs.frac_secs)
    }
}

impl Sub for TimeSpec {
    type Output = TimeSpec;

    fn sub(self, rhs: TimeSpec) -> TimeSpec {
        TimeSpec::new(self.full_secs - rhs.full_secs, self.frac_secs - rhs.frac_secs)
    }
}

impl Display for TimeSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.9}s", self.as_secs_f64())
    }
}
