//! Daily deduplication of findings
//!
//! A (recipient, subject, check type) combination yields at most one
//! notification record per calendar day. Days are local calendar days in the
//! configured zone, not a sliding 24-hour window.

use chrono::{DateTime, NaiveDate, Utc};

use crate::calendar::CalendarZone;
use crate::error::Result;
use crate::store::NotificationStore;
use crate::types::{CheckType, Finding};

pub struct DeduplicationGuard<'a> {
    store: &'a dyn NotificationStore,
    zone: CalendarZone,
}

impl<'a> DeduplicationGuard<'a> {
    pub fn new(store: &'a dyn NotificationStore, zone: CalendarZone) -> Self {
        Self { store, zone }
    }

    /// Calendar day that `now` belongs to.
    pub fn day_of(&self, now: DateTime<Utc>) -> NaiveDate {
        self.zone.day_of(now)
    }

    pub fn already_reported_today(
        &self,
        recipient_id: &str,
        subject_id: &str,
        check_type: CheckType,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.store
            .exists_today(recipient_id, subject_id, check_type, self.day_of(now))
    }

    pub fn is_duplicate(&self, finding: &Finding, now: DateTime<Utc>) -> Result<bool> {
        self.already_reported_today(
            &finding.recipient_id,
            &finding.subject_id,
            finding.check_type,
            now,
        )
    }
}
