//! Eastern-time session and schedule helpers.
//!
//! Entry windows, the regular session, and the corporate-event blackout all
//! evaluate against America/New_York wall time regardless of the host clock.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::America::New_York;
use std::collections::HashMap;

/// Convert a UTC timestamp to the exchange's wall clock.
pub fn eastern(at: DateTime<Utc>) -> DateTime<chrono_tz::Tz> {
    New_York.from_utc_datetime(&at.naive_utc())
}

/// Regular session: 9:30–16:00 ET, Monday through Friday. Exchange holidays
/// are a data-feed concern; a holiday delivers no bars.
pub fn is_trading_hours(at: DateTime<Utc>) -> bool {
    let et = eastern(at);
    if matches!(et.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let minutes = et.hour() as i64 * 60 + et.minute() as i64;
    (9 * 60 + 30..16 * 60).contains(&minutes)
}

/// True when ET wall time has reached `hour:minute` on the bar's date.
pub fn is_at_or_after(at: DateTime<Utc>, hour: u32, minute: u32) -> bool {
    let et = eastern(at);
    (et.hour(), et.minute()) >= (hour, minute)
}

pub fn weekday(at: DateTime<Utc>) -> Weekday {
    eastern(at).weekday()
}

/// First Wednesday of the bar's month.
pub fn is_first_wednesday(at: DateTime<Utc>) -> bool {
    let et = eastern(at);
    et.weekday() == Weekday::Wed && et.day() <= 7
}

/// First weekday of the bar's month. Holiday-shifted first sessions arrive
/// with no earlier bars that month, so the first bar seen is authoritative.
pub fn is_first_trading_day_of_month(at: DateTime<Utc>) -> bool {
    let et = eastern(at);
    let date = et.date_naive();
    if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    // Every earlier day this month must be a weekend day.
    (1..date.day()).all(|d| {
        NaiveDate::from_ymd_opt(date.year(), date.month(), d)
            .map(|earlier| matches!(earlier.weekday(), Weekday::Sat | Weekday::Sun))
            .unwrap_or(false)
    })
}

/// Known earnings/dividend dates per underlying. Entries are blocked inside
/// the blackout window before each event.
#[derive(Debug, Clone, Default)]
pub struct CorporateEventTable {
    events: HashMap<String, Vec<NaiveDate>>,
}

impl CorporateEventTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event(&mut self, symbol: &str, date: NaiveDate) {
        self.events.entry(symbol.to_string()).or_default().push(date);
    }

    /// The event date putting `symbol` in blackout at `on`, if any.
    pub fn blackout_event(
        &self,
        symbol: &str,
        on: NaiveDate,
        blackout_days: i64,
    ) -> Option<NaiveDate> {
        self.events.get(symbol).and_then(|dates| {
            dates
                .iter()
                .copied()
                .find(|event| {
                    let lead = (*event - on).num_days();
                    (0..=blackout_days).contains(&lead)
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn session_bounds_in_eastern_time() {
        // 2026-08-07 is a Friday; 14:30 UTC = 10:30 ET (EDT).
        assert!(is_trading_hours(utc(2026, 8, 7, 14, 30)));
        // 13:29 UTC = 9:29 ET, pre-open.
        assert!(!is_trading_hours(utc(2026, 8, 7, 13, 29)));
        // 20:00 UTC = 16:00 ET, close.
        assert!(!is_trading_hours(utc(2026, 8, 7, 20, 0)));
        // Saturday.
        assert!(!is_trading_hours(utc(2026, 8, 8, 14, 30)));
    }

    #[test]
    fn first_wednesday_detection() {
        assert!(is_first_wednesday(utc(2026, 8, 5, 14, 0)));
        assert!(!is_first_wednesday(utc(2026, 8, 12, 14, 0)));
        assert!(!is_first_wednesday(utc(2026, 8, 6, 14, 0)));
    }

    #[test]
    fn first_trading_day_skips_weekend_starts() {
        // 2026-08-01 is a Saturday, so Monday the 3rd is the first session.
        assert!(!is_first_trading_day_of_month(utc(2026, 8, 1, 14, 0)));
        assert!(is_first_trading_day_of_month(utc(2026, 8, 3, 14, 0)));
        assert!(!is_first_trading_day_of_month(utc(2026, 8, 4, 14, 0)));
    }

    #[test]
    fn blackout_window_covers_days_before_event() {
        let mut table = CorporateEventTable::new();
        let event = NaiveDate::from_ymd_opt(2026, 8, 10).unwrap();
        table.add_event("AAPL", event);

        let on = NaiveDate::from_ymd_opt(2026, 8, 8).unwrap();
        assert_eq!(table.blackout_event("AAPL", on, 3), Some(event));
        let early = NaiveDate::from_ymd_opt(2026, 8, 4).unwrap();
        assert_eq!(table.blackout_event("AAPL", early, 3), None);
        let after = NaiveDate::from_ymd_opt(2026, 8, 11).unwrap();
        assert_eq!(table.blackout_event("AAPL", after, 3), None);
    }
}
