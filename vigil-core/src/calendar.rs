//! Calendar-day boundaries for the daily dedup window

use chrono::{DateTime, Local, NaiveDate, Utc};
use chrono_tz::Tz;

use crate::error::{Error, Result};

/// The zone whose calendar days bound notification deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarZone {
    /// System local time
    Local,
    /// Named IANA zone
    Named(Tz),
}

impl CalendarZone {
    /// Parse an IANA zone name; `None` selects the system zone.
    pub fn from_name(name: Option<&str>) -> Result<Self> {
        match name {
            None => Ok(CalendarZone::Local),
            Some(name) => name
                .parse::<Tz>()
                .map(CalendarZone::Named)
                .map_err(|e| Error::Config(format!("invalid timezone '{}': {}", name, e))),
        }
    }

    /// Calendar day containing `instant`.
    pub fn day_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        match self {
            CalendarZone::Local => instant.with_timezone(&Local).date_naive(),
            CalendarZone::Named(tz) => instant.with_timezone(tz).date_naive(),
        }
    }
}

impl std::fmt::Display for CalendarZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalendarZone::Local => f.write_str("local"),
            CalendarZone::Named(tz) => f.write_str(tz.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_named_zone_day_boundary() {
        let zone = CalendarZone::from_name(Some("America/New_York")).unwrap();
        // 03:00 UTC is still the previous evening in New York
        let instant = Utc.with_ymd_and_hms(2026, 1, 15, 3, 0, 0).unwrap();
        assert_eq!(zone.day_of(instant), NaiveDate::from_ymd_opt(2026, 1, 14).unwrap());

        let after_midnight = Utc.with_ymd_and_hms(2026, 1, 15, 5, 0, 0).unwrap();
        assert_eq!(
            zone.day_of(after_midnight),
            NaiveDate::from_ymd_opt(2026, 1, 15).unwrap()
        );
    }

    #[test]
    fn test_utc_day_is_the_date() {
        let zone = CalendarZone::from_name(Some("UTC")).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 4, 13, 23, 59, 59).unwrap();
        let next = late + chrono::Duration::seconds(1);
        assert_eq!(zone.day_of(late), NaiveDate::from_ymd_opt(2026, 4, 13).unwrap());
        assert_eq!(zone.day_of(next), NaiveDate::from_ymd_opt(2026, 4, 14).unwrap());
    }

    #[test]
    fn test_invalid_zone() {
        assert!(CalendarZone::from_name(Some("Nowhere/Special")).is_err());
        assert_eq!(CalendarZone::from_name(None).unwrap(), CalendarZone::Local);
    }
}
