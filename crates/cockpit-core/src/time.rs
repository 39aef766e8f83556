//! Exact schedule time.
//!
//! All schedule arithmetic uses [`TimeMs`], a count of picoseconds stored in
//! an `i64` and presented as milliseconds. Addition, subtraction and integer
//! scaling are exact, so near-simultaneous triggers keep their order no matter
//! how many offsets are accumulated while a table is built.
//!
//! Values enter the type from integers, from decimal strings, or from `f64`
//! only when the float sits exactly on the picosecond grid. Anything else is
//! rejected with [`CockpitError::InexactTime`].

use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};
use std::str::FromStr;
use std::time::Duration;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CockpitError;

const PS_PER_MS: i64 = 1_000_000_000;
const FRACTION_DIGITS: usize = 9;

/// Milliseconds with picosecond resolution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeMs(i64);

impl TimeMs {
    pub const ZERO: TimeMs = TimeMs(0);
    /// Smallest representable step.
    pub const PICOSECOND: TimeMs = TimeMs(1);

    pub const fn from_ms(ms: i64) -> Self {
        Self(ms * PS_PER_MS)
    }

    pub const fn from_us(us: i64) -> Self {
        Self(us * 1_000_000)
    }

    pub const fn from_ns(ns: i64) -> Self {
        Self(ns * 1_000)
    }

    pub const fn from_ps(ps: i64) -> Self {
        Self(ps)
    }

    pub const fn as_ps(self) -> i64 {
        self.0
    }

    /// Accept a float only if it lands exactly on the picosecond grid.
    pub fn from_f64_exact(ms: f64) -> Result<Self, CockpitError> {
        if !ms.is_finite() {
            return Err(CockpitError::InexactTime(ms.to_string()));
        }
        let ps = (ms * PS_PER_MS as f64).round();
        if ps.abs() >= i64::MAX as f64 || ps / PS_PER_MS as f64 != ms {
            return Err(CockpitError::InexactTime(ms.to_string()));
        }
        Ok(Self(ps as i64))
    }

    /// Nearest picosecond to `ms`. Only for derived quantities such as
    /// bleach-compensated exposures; inputs go through [`from_f64_exact`].
    ///
    /// [`from_f64_exact`]: TimeMs::from_f64_exact
    pub fn from_f64_rounded(ms: f64) -> Self {
        Self((ms * PS_PER_MS as f64).round() as i64)
    }

    pub fn as_ms_f64(self) -> f64 {
        self.0 as f64 / PS_PER_MS as f64
    }

    /// Wall-clock duration; negative times clamp to zero.
    pub fn as_duration(self) -> Duration {
        if self.0 <= 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((self.0 / 1_000) as u64)
        }
    }

    pub fn from_duration(d: Duration) -> Self {
        let ns = i64::try_from(d.as_nanos()).unwrap_or(i64::MAX / 1_000);
        Self(ns.saturating_mul(1_000))
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Half of this time, rounded toward zero at picosecond resolution.
    pub fn half(self) -> Self {
        Self(self.0 / 2)
    }

    pub fn abs(self) -> Self {
        Self(self.0.abs())
    }

    /// Multiply by a float factor, rounding to the nearest picosecond.
    pub fn scale(self, factor: f64) -> Self {
        Self((self.0 as f64 * factor).round() as i64)
    }

    /// Quantise to a device clock with `ticks_per_ms`, rounding half up.
    pub fn to_ticks(self, ticks_per_ms: i64) -> i64 {
        let scaled = self.0 as i128 * ticks_per_ms as i128 + (PS_PER_MS / 2) as i128;
        scaled.div_euclid(PS_PER_MS as i128) as i64
    }

    /// Parse a decimal millisecond string such as `"15.1"` or `"-0.005"`.
    pub fn parse(text: &str) -> Result<Self, CockpitError> {
        let inexact = || CockpitError::InexactTime(text.to_string());
        let trimmed = text.trim();
        let (negative, body) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        let (whole, fraction) = body.split_once('.').unwrap_or((body, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(inexact());
        }
        if !whole.chars().all(|c| c.is_ascii_digit())
            || !fraction.chars().all(|c| c.is_ascii_digit())
        {
            return Err(inexact());
        }
        let fraction = fraction.trim_end_matches('0');
        if fraction.len() > FRACTION_DIGITS {
            return Err(inexact());
        }
        let whole_ms: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| inexact())?
        };
        let mut frac_ps: i64 = 0;
        if !fraction.is_empty() {
            let digits: i64 = fraction.parse().map_err(|_| inexact())?;
            frac_ps = digits * 10_i64.pow((FRACTION_DIGITS - fraction.len()) as u32);
        }
        let ps = whole_ms
            .checked_mul(PS_PER_MS)
            .and_then(|v| v.checked_add(frac_ps))
            .ok_or_else(inexact)?;
        Ok(Self(if negative { -ps } else { ps }))
    }
}

impl FromStr for TimeMs {
    type Err = CockpitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let whole = abs / PS_PER_MS as u64;
        let fraction = abs % PS_PER_MS as u64;
        if fraction == 0 {
            write!(f, "{sign}{whole}")
        } else {
            let digits = format!("{fraction:09}");
            write!(f, "{sign}{whole}.{}", digits.trim_end_matches('0'))
        }
    }
}

impl Add for TimeMs {
    type Output = TimeMs;

    fn add(self, rhs: TimeMs) -> TimeMs {
        TimeMs(self.0 + rhs.0)
    }
}

impl AddAssign for TimeMs {
    fn add_assign(&mut self, rhs: TimeMs) {
        self.0 += rhs.0;
    }
}

impl Sub for TimeMs {
    type Output = TimeMs;

    fn sub(self, rhs: TimeMs) -> TimeMs {
        TimeMs(self.0 - rhs.0)
    }
}

impl SubAssign for TimeMs {
    fn sub_assign(&mut self, rhs: TimeMs) {
        self.0 -= rhs.0;
    }
}

impl Neg for TimeMs {
    type Output = TimeMs;

    fn neg(self) -> TimeMs {
        TimeMs(-self.0)
    }
}

impl Mul<i64> for TimeMs {
    type Output = TimeMs;

    fn mul(self, rhs: i64) -> TimeMs {
        TimeMs(self.0 * rhs)
    }
}

impl Div<i64> for TimeMs {
    type Output = TimeMs;

    fn div(self, rhs: i64) -> TimeMs {
        TimeMs(self.0 / rhs)
    }
}

impl std::iter::Sum for TimeMs {
    fn sum<I: Iterator<Item = TimeMs>>(iter: I) -> TimeMs {
        iter.fold(TimeMs::ZERO, |acc, t| acc + t)
    }
}

impl Serialize for TimeMs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

struct TimeMsVisitor;

impl<'de> de::Visitor<'de> for TimeMsVisitor {
    type Value = TimeMs;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a time in milliseconds as an integer, exact float or decimal string")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<TimeMs, E> {
        v.checked_mul(PS_PER_MS)
            .map(TimeMs)
            .ok_or_else(|| E::custom(format!("time {v} ms out of range")))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<TimeMs, E> {
        let v = i64::try_from(v).map_err(|_| E::custom(format!("time {v} ms out of range")))?;
        self.visit_i64(v)
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<TimeMs, E> {
        TimeMs::from_f64_exact(v).map_err(E::custom)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<TimeMs, E> {
        TimeMs::parse(v).map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for TimeMs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(TimeMsVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_constants_are_exact() {
        let settle = TimeMs::parse("0.1").unwrap();
        assert_eq!(
            TimeMs::from_ms(10) + TimeMs::from_ms(5) + settle,
            TimeMs::parse("15.1").unwrap()
        );
        assert_eq!(TimeMs::parse("0.005").unwrap(), TimeMs::from_us(5));
        assert_eq!(TimeMs::parse("0.000001").unwrap(), TimeMs::from_ns(1));
    }

    #[test]
    fn display_trims_trailing_zeros() {
        assert_eq!(TimeMs::parse("15.100").unwrap().to_string(), "15.1");
        assert_eq!(TimeMs::from_ms(50).to_string(), "50");
        assert_eq!((-TimeMs::from_us(5)).to_string(), "-0.005");
        assert_eq!(TimeMs::from_ns(1).to_string(), "0.000001");
    }

    #[test]
    fn parse_rejects_garbage_and_excess_precision() {
        assert!(TimeMs::parse("abc").is_err());
        assert!(TimeMs::parse("").is_err());
        assert!(TimeMs::parse("1.0000000001").is_err());
        assert_eq!(TimeMs::parse("1.0000000000").unwrap(), TimeMs::from_ms(1));
        assert_eq!(TimeMs::parse(".5").unwrap(), TimeMs::from_us(500));
    }

    #[test]
    fn floats_must_sit_on_the_grid() {
        assert_eq!(TimeMs::from_f64_exact(0.1).unwrap(), TimeMs::parse("0.1").unwrap());
        assert_eq!(TimeMs::from_f64_exact(50.0).unwrap(), TimeMs::from_ms(50));
        assert!(matches!(
            TimeMs::from_f64_exact(1.0 / 3.0),
            Err(CockpitError::InexactTime(_))
        ));
        assert!(TimeMs::from_f64_exact(f64::NAN).is_err());
    }

    #[test]
    fn ticks_round_half_up() {
        assert_eq!(TimeMs::parse("0.05").unwrap().to_ticks(10), 1);
        assert_eq!(TimeMs::parse("0.04").unwrap().to_ticks(10), 0);
        assert_eq!(TimeMs::from_ms(15).to_ticks(10), 150);
    }

    #[test]
    fn serde_accepts_numbers_and_strings() {
        let t: TimeMs = serde_json::from_str("50").unwrap();
        assert_eq!(t, TimeMs::from_ms(50));
        let t: TimeMs = serde_json::from_str("\"0.005\"").unwrap();
        assert_eq!(t, TimeMs::from_us(5));
        let t: TimeMs = serde_json::from_str("2.5").unwrap();
        assert_eq!(t, TimeMs::from_us(2500));
        assert_eq!(serde_json::to_string(&TimeMs::parse("15.1").unwrap()).unwrap(), "\"15.1\"");
    }

    #[test]
    fn negative_durations_clamp() {
        assert_eq!((-TimeMs::from_ms(3)).as_duration(), Duration::ZERO);
        assert_eq!(TimeMs::from_ms(3).as_duration(), Duration::from_millis(3));
    }
}
