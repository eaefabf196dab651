//! Venue session gate — timezone-aware market-hours checking.
//!
//! Pure over the wall clock: trading days are Mon–Fri in venue-local time,
//! the open interval is half-open `[open, close)`. Holidays are pluggable
//! and empty by default.

use crate::models::VenueClass;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub venue_class: VenueClass,
    pub is_open: bool,
    pub local_time: String,
    pub timezone: &'static str,
    pub seconds_until_open: Option<i64>,
}

/// Session hours per venue class, with an optional holiday set.
#[derive(Debug, Clone, Default)]
pub struct SessionCalendar {
    holidays: HashSet<NaiveDate>,
}

fn venue_zone(class: VenueClass) -> (Tz, &'static str) {
    match class {
        VenueClass::Us => (chrono_tz::America::New_York, "America/New_York"),
        VenueClass::Asx => (chrono_tz::Australia::Sydney, "Australia/Sydney"),
        VenueClass::Tsx => (chrono_tz::America::Toronto, "America/Toronto"),
    }
}

fn venue_hours(class: VenueClass) -> (NaiveTime, NaiveTime) {
    match class {
        VenueClass::Us | VenueClass::Tsx => (
            NaiveTime::from_hms_opt(9, 30, 0).expect("valid open time"),
            NaiveTime::from_hms_opt(16, 0, 0).expect("valid close time"),
        ),
        VenueClass::Asx => (
            NaiveTime::from_hms_opt(10, 0, 0).expect("valid open time"),
            NaiveTime::from_hms_opt(16, 0, 0).expect("valid close time"),
        ),
    }
}

fn is_weekend(weekday: Weekday) -> bool {
    matches!(weekday, Weekday::Sat | Weekday::Sun)
}

impl SessionCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_holidays(holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            holidays: holidays.into_iter().collect(),
        }
    }

    fn is_trading_day(&self, date: NaiveDate) -> bool {
        !is_weekend(date.weekday()) && !self.holidays.contains(&date)
    }

    /// Is the venue open at `now`?
    pub fn is_open_at(&self, class: VenueClass, now: DateTime<Utc>) -> bool {
        let (tz, _) = venue_zone(class);
        let local = now.with_timezone(&tz);

        if !self.is_trading_day(local.date_naive()) {
            debug!(venue = class.as_str(), "market closed: non-trading day");
            return false;
        }

        let (open, close) = venue_hours(class);
        let t = local.time();
        open <= t && t < close
    }

    pub fn is_open(&self, class: VenueClass) -> bool {
        self.is_open_at(class, Utc::now())
    }

    /// Seconds until the next open, or `None` when currently open.
    ///
    /// Walks forward day by day with checked date arithmetic, so month and
    /// year boundaries behave.
    pub fn seconds_until_open_at(&self, class: VenueClass, now: DateTime<Utc>) -> Option<i64> {
        if self.is_open_at(class, now) {
            return None;
        }

        let (tz, _) = venue_zone(class);
        let (open, _) = venue_hours(class);
        let local = now.with_timezone(&tz);

        let mut date = local.date_naive();
        loop {
            if self.is_trading_day(date) {
                if let Some(next_open) = tz
                    .from_local_datetime(&date.and_time(open))
                    .earliest()
                {
                    let delta = next_open.signed_duration_since(local);
                    if delta > Duration::zero() {
                        return Some(delta.num_seconds());
                    }
                }
            }
            date = date.succ_opt()?;
        }
    }

    /// Detailed status for diagnostics and the CLI.
    pub fn status_at(&self, class: VenueClass, now: DateTime<Utc>) -> SessionStatus {
        let (tz, tz_name) = venue_zone(class);
        let local = now.with_timezone(&tz);
        SessionStatus {
            venue_class: class,
            is_open: self.is_open_at(class, now),
            local_time: local.format("%Y-%m-%d %H:%M:%S %Z").to_string(),
            timezone: tz_name,
            seconds_until_open: self.seconds_until_open_at(class, now),
        }
    }

    pub fn status(&self, class: VenueClass) -> SessionStatus {
        self.status_at(class, Utc::now())
    }
}
