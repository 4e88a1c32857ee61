// =============================================================================
// Timeframe: fixed-width candle buckets and their boundaries
// =============================================================================
//
// A timeframe is written the way exchanges spell intervals: a count followed
// by a unit (`1m`, `15m`, `4h`, `1d`, `1w`). Every supported unit has a fixed
// step in milliseconds, so alignment is plain modular arithmetic. Weekly
// buckets open on Monday 00:00 UTC, which sits four days after the epoch.
//
// Calendar months (`1M`) are rejected: they have no fixed step.
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HubError;

const SECOND_MS: i64 = 1_000;
const MINUTE_MS: i64 = 60 * SECOND_MS;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;
const WEEK_MS: i64 = 7 * DAY_MS;

/// 1970-01-01 was a Thursday; the first Monday is four days later.
const WEEK_OFFSET_MS: i64 = 4 * DAY_MS;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
enum Unit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
}

impl Unit {
    fn ms(self) -> i64 {
        match self {
            Self::Second => SECOND_MS,
            Self::Minute => MINUTE_MS,
            Self::Hour => HOUR_MS,
            Self::Day => DAY_MS,
            Self::Week => WEEK_MS,
        }
    }

    fn suffix(self) -> char {
        match self {
            Self::Second => 's',
            Self::Minute => 'm',
            Self::Hour => 'h',
            Self::Day => 'd',
            Self::Week => 'w',
        }
    }
}

/// Candle bucket width.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Timeframe {
    count: u32,
    unit: Unit,
}

impl Timeframe {
    /// Bucket width in milliseconds.
    pub fn step_ms(&self) -> i64 {
        i64::from(self.count) * self.unit.ms()
    }

    fn offset_ms(&self) -> i64 {
        match self.unit {
            Unit::Week => WEEK_OFFSET_MS,
            _ => 0,
        }
    }

    pub fn is_aligned(&self, ts: i64) -> bool {
        (ts - self.offset_ms()).rem_euclid(self.step_ms()) == 0
    }

    /// Open time of the bucket containing `ts`.
    pub fn align_down(&self, ts: i64) -> i64 {
        ts - (ts - self.offset_ms()).rem_euclid(self.step_ms())
    }

    /// Open time of the current (possibly unclosed) bucket as of `now`.
    pub fn ts_last(&self, now: i64) -> i64 {
        self.align_down(now)
    }

    /// First bucket boundary at or after `since`; `None` past the end of
    /// the representable range.
    pub fn ts_since(&self, since: i64) -> Option<i64> {
        let floor = self.align_down(since);
        if floor == since {
            Some(floor)
        } else {
            floor.checked_add(self.step_ms())
        }
    }

    /// Open time of the bucket after the one opening at `ts`.
    pub fn next_open(&self, ts: i64) -> i64 {
        ts.saturating_add(self.step_ms())
    }

    /// Whether the bucket opening at `ts` has not closed yet at `now`.
    pub fn is_open_at(&self, ts: i64, now: i64) -> bool {
        self.next_open(ts) > now
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.count, self.unit.suffix())
    }
}

impl FromStr for Timeframe {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let suffix = s
            .chars()
            .last()
            .ok_or_else(|| HubError::InvalidTimeframe("empty timeframe".into()))?;
        let unit = match suffix {
            's' => Unit::Second,
            'm' => Unit::Minute,
            'h' => Unit::Hour,
            'd' => Unit::Day,
            'w' => Unit::Week,
            'M' => {
                return Err(HubError::InvalidTimeframe(format!(
                    "{s}: calendar months have no fixed step"
                )))
            }
            other => {
                return Err(HubError::InvalidTimeframe(format!(
                    "{s}: unknown unit '{other}'"
                )))
            }
        };
        let count: u32 = s[..s.len() - suffix.len_utf8()]
            .parse()
            .map_err(|_| HubError::InvalidTimeframe(format!("{s}: bad count")))?;
        if count == 0 {
            return Err(HubError::InvalidTimeframe(format!("{s}: count must be positive")));
        }
        Ok(Self { count, unit })
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.to_string()
    }
}

impl TryFrom<String> for Timeframe {
    type Error = HubError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tf(s: &str) -> Timeframe {
        s.parse().unwrap()
    }

    #[test]
    fn parses_common_intervals() {
        assert_eq!(tf("1m").step_ms(), 60_000);
        assert_eq!(tf("15m").step_ms(), 900_000);
        assert_eq!(tf("4h").step_ms(), 4 * 3_600_000);
        assert_eq!(tf("1d").step_ms(), 86_400_000);
        assert_eq!(tf("1w").step_ms(), 7 * 86_400_000);
        assert_eq!(tf("4h").to_string(), "4h");
    }

    #[test]
    fn rejects_months_and_garbage() {
        assert!("1M".parse::<Timeframe>().is_err());
        assert!("0m".parse::<Timeframe>().is_err());
        assert!("m".parse::<Timeframe>().is_err());
        assert!("1y".parse::<Timeframe>().is_err());
        assert!("".parse::<Timeframe>().is_err());
    }

    #[test]
    fn alignment_and_boundaries() {
        let h = tf("1h");
        let now = 1_700_000_123_456;
        let last = h.ts_last(now);
        assert!(h.is_aligned(last));
        assert!(last <= now && now < last + 3_600_000);
        assert_eq!(h.ts_since(last), Some(last));
        assert_eq!(h.ts_since(last + 1), Some(last + 3_600_000));
        assert!(h.is_open_at(last, now));
        assert!(!h.is_open_at(last - 3_600_000, now));
    }

    #[test]
    fn boundaries_near_the_end_of_time_do_not_overflow() {
        let h = tf("1h");
        assert_eq!(h.ts_since(i64::MAX), None);
        assert_eq!(h.next_open(i64::MAX - 1), i64::MAX);
        assert!(h.is_open_at(i64::MAX - 1, i64::MAX - 1));
    }

    #[test]
    fn weeks_open_on_monday() {
        let w = tf("1w");
        // 2024-01-01 00:00 UTC was a Monday.
        let monday = 1_704_067_200_000;
        assert!(w.is_aligned(monday));
        assert!(!w.is_aligned(monday + DAY_MS));
        assert_eq!(w.align_down(monday + 3 * DAY_MS), monday);
    }

    #[test]
    fn serde_uses_interval_string() {
        let json = serde_json::to_string(&tf("15m")).unwrap();
        assert_eq!(json, "\"15m\"");
        let back: Timeframe = serde_json::from_str("\"1d\"").unwrap();
        assert_eq!(back, tf("1d"));
        assert!(serde_json::from_str::<Timeframe>("\"1M\"").is_err());
    }
}
