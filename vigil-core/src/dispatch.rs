//! Notification dispatch: persist first, deliver second
//!
//! The record is the durable source of truth. Delivery through the sink is
//! advisory and its failure never rolls the record back.

use chrono::{DateTime, Utc};

use crate::dedup::DeduplicationGuard;
use crate::error::{Error, Result};
use crate::sink::NotificationSink;
use crate::store::NotificationStore;
use crate::types::{Finding, NewNotification};

/// Outcome of dispatching one finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchResult {
    /// A new record was persisted
    pub created: bool,
    /// Id of the new record
    pub record_id: Option<i64>,
    /// The sink accepted the message
    pub delivered: bool,
}

impl DispatchResult {
    fn skipped() -> Self {
        Self {
            created: false,
            record_id: None,
            delivered: false,
        }
    }
}

pub struct NotificationDispatcher<'a> {
    store: &'a dyn NotificationStore,
    sink: &'a dyn NotificationSink,
    guard: DeduplicationGuard<'a>,
}

impl<'a> NotificationDispatcher<'a> {
    pub fn new(
        store: &'a dyn NotificationStore,
        sink: &'a dyn NotificationSink,
        guard: DeduplicationGuard<'a>,
    ) -> Self {
        Self { store, sink, guard }
    }

    /// Persist and deliver a finding unless it was already reported today.
    ///
    /// Errors are persistence failures only. A concurrent writer that already
    /// created the same record yields `created: false`.
    pub fn dispatch(&self, finding: &Finding, now: DateTime<Utc>) -> Result<DispatchResult> {
        if self.guard.is_duplicate(finding, now)? {
            tracing::debug!(
                subject_id = %finding.subject_id,
                check = %finding.check_type,
                recipient = %finding.recipient_id,
                "Skipping duplicate finding"
            );
            return Ok(DispatchResult::skipped());
        }

        let record = NewNotification::from_finding(finding, self.guard.day_of(now), now);
        let record_id = match self.store.create(&record) {
            Ok(id) => id,
            Err(Error::Duplicate(key)) => {
                tracing::debug!(key = %key, "Notification created concurrently, skipping");
                return Ok(DispatchResult::skipped());
            }
            Err(e) => return Err(e),
        };

        tracing::info!(
            record_id,
            subject_id = %finding.subject_id,
            check = %finding.check_type,
            severity = finding.severity.as_str(),
            "Notification created"
        );

        let delivered = match self
            .sink
            .deliver(&finding.recipient_id, &finding.title, &finding.message)
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    record_id,
                    recipient = %finding.recipient_id,
                    error = %e,
                    "Delivery failed; notification record kept"
                );
                false
            }
        };

        Ok(DispatchResult {
            created: true,
            record_id: Some(record_id),
            delivered,
        })
    }
}
