use super::*;
use chrono::TimeZone;
use shared::domain::MessageId;

#[test]
fn cursor_without_history_starts_at_the_epoch() {
    assert_eq!(since_cursor(None), DateTime::<Utc>::UNIX_EPOCH);
}

#[test]
fn cursor_rewinds_by_the_overlap_window() {
    let known = Utc.timestamp_opt(10_000, 0).single().expect("timestamp");
    let since = since_cursor(Some(known));
    assert_eq!((known - since).num_seconds(), RESYNC_OVERLAP_SECS);
}

#[test]
fn outcome_tally_tracks_each_apply_result() {
    let mut outcome = ResyncOutcome::default();
    outcome.record(&ApplyOutcome::Inserted(MessageId::new("a")));
    outcome.record(&ApplyOutcome::Inserted(MessageId::new("b")));
    outcome.record(&ApplyOutcome::Confirmed(MessageId::new("c")));
    outcome.record(&ApplyOutcome::Duplicate(MessageId::new("a")));

    assert_eq!(outcome.inserted, 2);
    assert_eq!(outcome.confirmed, 1);
    assert_eq!(outcome.duplicates, 1);
}

#[test]
fn reason_labels_are_stable_for_logging() {
    assert_eq!(ResyncReason::Reconnected.label(), "reconnected");
    assert_eq!(ResyncReason::Interval.label(), "interval");
}
