//! Trading-session and news-calendar signals.

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;

/// A same-day trading session in a fixed time zone, Monday to Friday.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradingSession {
    tz: Tz,
    open: NaiveTime,
    close: NaiveTime,
}

impl TradingSession {
    /// Create a session. Returns `None` unless `close` is after `open`.
    #[must_use]
    pub fn new(tz: Tz, open: NaiveTime, close: NaiveTime) -> Option<Self> {
        (close > open).then_some(Self { tz, open, close })
    }

    /// Time zone the session is defined in.
    #[must_use]
    pub const fn timezone(&self) -> Tz {
        self.tz
    }

    /// Whether the market is open at `now`.
    #[must_use]
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let t = local.time();
        t >= self.open && t < self.close
    }

    /// Whole minutes until the close, or `None` outside the session.
    #[must_use]
    pub fn minutes_left_at(&self, now: DateTime<Utc>) -> Option<i64> {
        if !self.is_open_at(now) {
            return None;
        }
        let t = now.with_timezone(&self.tz).time();
        Some((self.close - t).num_minutes())
    }
}

/// Scheduled news events, sorted ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewsCalendar {
    events: Vec<DateTime<Utc>>,
}

impl NewsCalendar {
    /// Build from unsorted event times.
    #[must_use]
    pub fn new(mut events: Vec<DateTime<Utc>>) -> Self {
        events.sort_unstable();
        events.dedup();
        Self { events }
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the calendar is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Minutes since the most recent event at or before `now`.
    #[must_use]
    pub fn minutes_since_last(&self, now: DateTime<Utc>) -> Option<i64> {
        let idx = self.events.partition_point(|e| *e <= now);
        idx.checked_sub(1)
            .map(|i| (now - self.events[i]).num_minutes())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn chicago() -> TradingSession {
        TradingSession::new(chrono_tz::America::Chicago, hm(8, 30), hm(15, 0)).unwrap()
    }

    #[test]
    fn test_rejects_inverted_session() {
        assert!(TradingSession::new(chrono_tz::UTC, hm(16, 0), hm(9, 0)).is_none());
    }

    #[test]
    fn test_minutes_left_during_session() {
        // 2024-12-04 is a Wednesday; 20:30 UTC is 14:30 in Chicago (CST).
        let now = Utc.with_ymd_and_hms(2024, 12, 4, 20, 30, 0).unwrap();
        assert!(chicago().is_open_at(now));
        assert_eq!(chicago().minutes_left_at(now), Some(30));
    }

    #[test]
    fn test_closed_outside_hours_and_weekends() {
        let evening = Utc.with_ymd_and_hms(2024, 12, 4, 23, 0, 0).unwrap();
        assert_eq!(chicago().minutes_left_at(evening), None);

        let saturday = Utc.with_ymd_and_hms(2024, 12, 7, 17, 0, 0).unwrap();
        assert!(!chicago().is_open_at(saturday));
    }

    #[test]
    fn test_news_minutes_since_last() {
        let base = Utc.with_ymd_and_hms(2024, 12, 4, 13, 30, 0).unwrap();
        let calendar = NewsCalendar::new(vec![
            base + chrono::Duration::hours(2),
            base,
        ]);

        assert_eq!(calendar.minutes_since_last(base - chrono::Duration::minutes(1)), None);
        assert_eq!(calendar.minutes_since_last(base), Some(0));
        assert_eq!(
            calendar.minutes_since_last(base + chrono::Duration::minutes(45)),
            Some(45)
        );
        assert_eq!(
            calendar.minutes_since_last(base + chrono::Duration::minutes(125)),
            Some(5)
        );
    }
}
