//! Retention scrubber.
//!
//! Deletes transmission records older than the retention window. Runs
//! off the ingestion path: the pipeline only nudges the scrubber, and
//! at most one delete worker is in flight at a time. The calendar-day
//! guard is a compare-and-swap, so concurrent nudges on a day boundary
//! still yield a single scrub.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};

use crate::errors::ScrubError;
use crate::models::day_number;
use crate::storage::XmitStore;

pub struct RetentionScrubber {
    store: Arc<dyn XmitStore>,
    retention_days: i32,
    /// Day number of the last completed or started scrub.
    last_scrub_day: AtomicI32,
    in_flight: Arc<AtomicBool>,
}

impl RetentionScrubber {
    pub fn new(store: Arc<dyn XmitStore>, retention_days: i32) -> Self {
        Self {
            store,
            retention_days,
            last_scrub_day: AtomicI32::new(-1),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Days the monitor will accept or serve: yesterday's history back to
    /// the retention horizon, plus tomorrow for stations transmitting
    /// across the UTC day boundary.
    pub fn check_day(&self, day: i32) -> Result<(), ScrubError> {
        let today = day_number(Utc::now());
        let earliest = today - self.retention_days;
        let latest = today + 1;
        if day < earliest || day > latest {
            return Err(ScrubError::DayOutOfRange {
                day,
                earliest,
                latest,
            });
        }
        Ok(())
    }

    pub fn retention_days(&self) -> i32 {
        self.retention_days
    }

    /// Kick off a scrub if one has not run yet today. Cheap to call on
    /// every ingested message.
    pub fn maybe_scrub(&self) {
        let today = day_number(Utc::now());
        let last = self.last_scrub_day.load(Ordering::Acquire);
        if last == today {
            return;
        }
        if self
            .last_scrub_day
            .compare_exchange(last, today, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another caller claimed this day.
            return;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // A previous worker is still running with yesterday's cutoff.
            // Give the day claim back so a later nudge retries today.
            self.last_scrub_day.store(last, Ordering::Release);
            return;
        }

        let store = self.store.clone();
        let in_flight = self.in_flight.clone();
        let cutoff = today - self.retention_days;
        tokio::task::spawn_blocking(move || {
            match store.delete_before(cutoff) {
                Ok(n) if n > 0 => info!("Scrubbed {n} transmission records older than day {cutoff}"),
                Ok(_) => {}
                Err(e) => error!("Retention scrub failed: {e}"),
            }
            in_flight.store(false, Ordering::Release);
        });
    }
}
