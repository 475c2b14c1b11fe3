use super::*;
use crate::reconcile::{CandidateMessage, ConversationState, Draft, Reconciler};
use chrono::TimeZone;
use shared::domain::{ChannelSource, ConversationId, MessageKind};
use std::collections::BTreeMap;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("timestamp")
}

fn candidate(id: Option<&str>, sender: &str, content: &str, at_secs: i64) -> CandidateMessage {
    CandidateMessage {
        id: id.map(MessageId::new),
        correlation_id: None,
        conversation_id: ConversationId::new("c-1"),
        sender_id: UserId::new(sender),
        content: content.to_string(),
        kind: MessageKind::Text,
        attachment: None,
        created_at: at(at_secs),
        reply_to: None,
        reactions: BTreeMap::new(),
        source: ChannelSource::Live,
        received_at: at(at_secs),
    }
}

#[test]
fn unknown_candidate_with_id_is_new() {
    let resolver = IdentityResolver::new();
    let state = ConversationState::new(ConversationId::new("c-1"));
    let verdict = resolver.resolve(&candidate(Some("m-1"), "u-1", "hello", 100), &state);
    assert_eq!(
        verdict,
        Verdict::New {
            canonical_id: MessageId::new("m-1")
        }
    );
}

#[test]
fn exact_id_match_is_duplicate() {
    let mut reconciler = Reconciler::new(ConversationState::new(ConversationId::new("c-1")));
    reconciler.apply_inbound(candidate(Some("m-1"), "u-1", "hello", 100));

    let resolver = IdentityResolver::new();
    let verdict = resolver.resolve(
        &candidate(Some("m-1"), "u-1", "hello", 100),
        reconciler.state(),
    );
    assert_eq!(
        verdict,
        Verdict::Duplicate {
            existing_id: MessageId::new("m-1")
        }
    );
}

#[test]
fn correlation_match_updates_pending() {
    let mut reconciler = Reconciler::new(ConversationState::new(ConversationId::new("c-1")));
    let correlation_id = reconciler
        .submit(UserId::new("me"), Draft::text("on my way"), at(100))
        .expect("submit");

    let mut confirmed = candidate(Some("srv-1"), "me", "on my way", 101);
    confirmed.correlation_id = Some(correlation_id.clone());

    let resolver = IdentityResolver::new();
    let verdict = resolver.resolve(&confirmed, reconciler.state());
    assert_eq!(verdict, Verdict::UpdatesPending { correlation_id });
}

#[test]
fn fingerprint_merges_canonical_into_pending_without_correlation() {
    let mut reconciler = Reconciler::new(ConversationState::new(ConversationId::new("c-1")));
    let correlation_id = reconciler
        .submit(UserId::new("me"), Draft::text("hi"), at(100))
        .expect("submit");

    // Canonical round-trip beat the local echo; no correlation on the wire.
    let resolver = IdentityResolver::new();
    let verdict = resolver.resolve(&candidate(Some("abc123"), "me", "hi", 103), reconciler.state());
    assert_eq!(verdict, Verdict::UpdatesPending { correlation_id });
}

#[test]
fn fingerprint_ignores_entries_outside_the_window() {
    let mut reconciler = Reconciler::new(ConversationState::new(ConversationId::new("c-1")));
    reconciler
        .submit(UserId::new("me"), Draft::text("hi"), at(100))
        .expect("submit");

    let resolver = IdentityResolver::new();
    let verdict = resolver.resolve(
        &candidate(Some("abc123"), "me", "hi", 100 + FINGERPRINT_WINDOW_SECS + 5),
        reconciler.state(),
    );
    assert!(matches!(verdict, Verdict::New { .. }));
}

#[test]
fn distinct_settled_ids_with_same_content_are_not_collapsed() {
    let mut reconciler = Reconciler::new(ConversationState::new(ConversationId::new("c-1")));
    reconciler.apply_inbound(candidate(Some("m-1"), "u-1", "ok", 100));

    // A deliberate double-text carries its own canonical id.
    let resolver = IdentityResolver::new();
    let verdict = resolver.resolve(&candidate(Some("m-2"), "u-1", "ok", 102), reconciler.state());
    assert_eq!(
        verdict,
        Verdict::New {
            canonical_id: MessageId::new("m-2")
        }
    );
}

#[test]
fn candidate_without_any_identifier_gets_deterministic_id() {
    let resolver = IdentityResolver::new();
    let state = ConversationState::new(ConversationId::new("c-1"));

    let first = resolver.resolve(&candidate(None, "u-1", "malformed", 100), &state);
    let second = resolver.resolve(&candidate(None, "u-1", "malformed", 101), &state);
    // Same 5-second bucket, same synthesized id.
    assert_eq!(first, second);
    let Verdict::New { canonical_id } = first else {
        panic!("expected a new verdict");
    };
    assert!(canonical_id.0.starts_with("synth-"));
}

#[test]
fn malformed_duplicate_collides_after_insert() {
    let mut reconciler = Reconciler::new(ConversationState::new(ConversationId::new("c-1")));
    reconciler.apply_inbound(candidate(None, "u-1", "malformed", 100));
    assert_eq!(reconciler.state().len(), 1);

    let resolver = IdentityResolver::new();
    let verdict = resolver.resolve(&candidate(None, "u-1", "malformed", 101), reconciler.state());
    assert!(matches!(verdict, Verdict::Duplicate { .. }));
}

#[test]
fn synthesized_ids_differ_across_senders_and_buckets() {
    let base = synthesize_id(&UserId::new("u-1"), "hello", at(100));
    assert_eq!(base, synthesize_id(&UserId::new("u-1"), " hello ", at(101)));
    assert_ne!(base, synthesize_id(&UserId::new("u-2"), "hello", at(100)));
    assert_ne!(
        base,
        synthesize_id(&UserId::new("u-1"), "hello", at(100 + FINGERPRINT_WINDOW_SECS))
    );
}

#[test]
fn recency_window_stays_bounded() {
    let mut resolver = IdentityResolver::new();
    for i in 0..500 {
        resolver.remember(MessageId::new(format!("m-{i}")));
    }
    assert_eq!(resolver.recency_len(), RECENCY_CAPACITY);
}
