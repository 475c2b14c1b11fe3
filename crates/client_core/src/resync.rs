use chrono::{DateTime, Duration, Utc};

use crate::reconcile::ApplyOutcome;

/// Catch-up fetches re-read this much history before the cursor so clock
/// skew between client and server cannot open a gap. Overlap re-deliveries
/// are harmless; they resolve as duplicates.
pub const RESYNC_OVERLAP_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncReason {
    Reconnected,
    Foreground,
    Interval,
    Manual,
}

impl ResyncReason {
    pub fn label(self) -> &'static str {
        match self {
            ResyncReason::Reconnected => "reconnected",
            ResyncReason::Foreground => "foreground",
            ResyncReason::Interval => "interval",
            ResyncReason::Manual => "manual",
        }
    }
}

/// Where a catch-up fetch should start from.
pub fn since_cursor(last_known_at: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match last_known_at {
        Some(known) => known - Duration::seconds(RESYNC_OVERLAP_SECS),
        None => DateTime::<Utc>::UNIX_EPOCH,
    }
}

/// Tally of one catch-up run. Running resync twice with no new server data
/// must report zero insertions the second time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncOutcome {
    pub fetched: usize,
    pub inserted: usize,
    pub confirmed: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

impl ResyncOutcome {
    pub fn record(&mut self, outcome: &ApplyOutcome) {
        match outcome {
            ApplyOutcome::Inserted(_) => self.inserted += 1,
            ApplyOutcome::Confirmed(_) => self.confirmed += 1,
            ApplyOutcome::Duplicate(_) => self.duplicates += 1,
        }
    }
}

#[cfg(test)]
#[path = "tests/resync_tests.rs"]
mod tests;
