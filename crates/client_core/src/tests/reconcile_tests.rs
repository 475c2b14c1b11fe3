use super::*;
use chrono::TimeZone;

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
        source: ChannelSource::Poll,
        received_at: at(at_secs),
    }
}

fn reconciler() -> Reconciler {
    Reconciler::new(ConversationState::new(ConversationId::new("c-1")))
}

fn ids(reconciler: &Reconciler) -> Vec<String> {
    reconciler
        .state()
        .messages()
        .map(|message| message.id.0.clone())
        .collect()
}

#[test]
fn submit_inserts_pending_entry() {
    let mut reconciler = reconciler();
    let correlation_id = reconciler
        .submit(UserId::new("me"), Draft::text("hello"), at(100))
        .expect("submit");

    assert_eq!(reconciler.state().len(), 1);
    let message = reconciler
        .state()
        .find_by_correlation(&correlation_id)
        .expect("pending entry");
    assert_eq!(message.status, MessageStatus::Pending);
    assert_eq!(message.content, "hello");
}

#[test]
fn submit_rejects_empty_content_before_creating_anything() {
    let mut reconciler = reconciler();
    let err = reconciler
        .submit(UserId::new("me"), Draft::text("   "), at(100))
        .expect_err("validation failure");
    assert_eq!(err.code, ErrorCode::Validation);
    assert!(reconciler.state().is_empty());
}

#[test]
fn submit_allows_attachment_only_drafts() {
    let mut reconciler = reconciler();
    let draft = Draft {
        content: String::new(),
        kind: MessageKind::Image,
        attachment: Some(Attachment {
            url: "https://cdn.example/x.png".into(),
            name: "x.png".into(),
            size_bytes: 10,
        }),
        reply_to: None,
    };
    reconciler
        .submit(UserId::new("me"), draft, at(100))
        .expect("attachment-only submit");
    assert_eq!(reconciler.state().len(), 1);
}

#[test]
fn submit_then_confirm_yields_exactly_one_sent_entry() {
    let mut reconciler = reconciler();
    let correlation_id = reconciler
        .submit(UserId::new("me"), Draft::text("hello"), at(100))
        .expect("submit");

    let mut confirmation = candidate(Some("srv-1"), "me", "hello", 102);
    confirmation.correlation_id = Some(correlation_id.clone());
    let outcome = reconciler.apply_inbound(confirmation);

    assert_eq!(outcome, ApplyOutcome::Confirmed(MessageId::new("srv-1")));
    assert_eq!(reconciler.state().len(), 1);
    let message = reconciler.state().get(&MessageId::new("srv-1")).expect("confirmed");
    assert_eq!(message.status, MessageStatus::Sent);
    assert_eq!(message.correlation_id, Some(correlation_id));
}

#[test]
fn cross_source_merge_collapses_fast_canonical_roundtrip() {
    let mut reconciler = reconciler();
    reconciler
        .submit(UserId::new("me"), Draft::text("hi"), at(100))
        .expect("submit");

    // Same sender and content inside the fingerprint window, canonical id,
    // no correlation on the wire.
    let outcome = reconciler.apply_inbound(candidate(Some("abc123"), "me", "hi", 103));

    assert_eq!(outcome, ApplyOutcome::Confirmed(MessageId::new("abc123")));
    assert_eq!(reconciler.state().len(), 1);
    let message = reconciler.state().get(&MessageId::new("abc123")).expect("merged");
    assert_eq!(message.status, MessageStatus::Sent);
}

#[test]
fn applying_the_same_event_twice_changes_nothing() {
    let mut reconciler = reconciler();
    let first = reconciler.apply_inbound(candidate(Some("m-1"), "u-1", "hello", 100));
    let before = ids(&reconciler);
    let second = reconciler.apply_inbound(candidate(Some("m-1"), "u-1", "hello", 100));

    assert_eq!(first, ApplyOutcome::Inserted(MessageId::new("m-1")));
    assert_eq!(second, ApplyOutcome::Duplicate(MessageId::new("m-1")));
    assert_eq!(ids(&reconciler), before);
}

#[test]
fn sequence_stays_sorted_under_out_of_order_arrival() {
    let mut reconciler = reconciler();
    reconciler.apply_inbound(candidate(Some("c"), "u-1", "third", 300));
    reconciler.apply_inbound(candidate(Some("a"), "u-1", "first", 100));
    reconciler.apply_inbound(candidate(Some("b"), "u-2", "second", 200));

    assert_eq!(ids(&reconciler), vec!["a", "b", "c"]);
    let timestamps: Vec<_> = reconciler
        .state()
        .messages()
        .map(|message| message.created_at)
        .collect();
    assert!(timestamps.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[test]
fn equal_timestamps_keep_insertion_order() {
    let mut reconciler = reconciler();
    reconciler.apply_inbound(candidate(Some("x"), "u-1", "one", 100));
    reconciler.apply_inbound(candidate(Some("y"), "u-2", "two", 100));
    assert_eq!(ids(&reconciler), vec!["x", "y"]);
}

#[test]
fn confirm_resorts_by_canonical_timestamp() {
    let mut reconciler = reconciler();
    reconciler.apply_inbound(candidate(Some("other"), "u-2", "earlier", 75));
    let correlation_id = reconciler
        .submit(UserId::new("me"), Draft::text("hello"), at(100))
        .expect("submit");

    // The server stamped the send before the other message.
    let mut confirmation = candidate(Some("srv-1"), "me", "hello", 50);
    confirmation.correlation_id = Some(correlation_id);
    reconciler.apply_inbound(confirmation);

    assert_eq!(ids(&reconciler), vec!["srv-1", "other"]);
}

#[test]
fn fail_keeps_the_message_visible_for_retry() {
    let mut reconciler = reconciler();
    let correlation_id = reconciler
        .submit(UserId::new("me"), Draft::text("hello"), at(100))
        .expect("submit");

    assert!(reconciler.fail(&correlation_id));
    let message = reconciler
        .state()
        .find_by_correlation(&correlation_id)
        .expect("failed entry");
    assert_eq!(message.status, MessageStatus::Failed);

    assert!(reconciler.mark_pending(&correlation_id));
    let message = reconciler
        .state()
        .find_by_correlation(&correlation_id)
        .expect("re-armed entry");
    assert_eq!(message.status, MessageStatus::Pending);
}

#[test]
fn late_confirmation_replaces_a_failed_entry() {
    let mut reconciler = reconciler();
    let correlation_id = reconciler
        .submit(UserId::new("me"), Draft::text("hello"), at(100))
        .expect("submit");
    reconciler.fail(&correlation_id);

    let mut confirmation = candidate(Some("srv-1"), "me", "hello", 101);
    confirmation.correlation_id = Some(correlation_id);
    let outcome = reconciler.apply_inbound(confirmation);

    assert_eq!(outcome, ApplyOutcome::Confirmed(MessageId::new("srv-1")));
    assert_eq!(reconciler.state().len(), 1);
}

#[test]
fn confirm_without_matching_entry_degrades_to_insert() {
    let mut reconciler = reconciler();
    let orphan = CorrelationId::generate();
    let id = reconciler.confirm(&orphan, candidate(Some("srv-9"), "me", "hello", 100));
    assert_eq!(id, MessageId::new("srv-9"));
    assert_eq!(reconciler.state().len(), 1);
}

#[test]
fn retract_blanks_content_and_is_idempotent() {
    let mut reconciler = reconciler();
    reconciler.apply_inbound(candidate(Some("m-1"), "u-1", "regret", 100));

    assert_eq!(reconciler.retract(&MessageId::new("m-1")), RetractOutcome::Applied);
    let message = reconciler.state().get(&MessageId::new("m-1")).expect("retracted");
    assert_eq!(message.status, MessageStatus::Retracted);
    assert!(message.content.is_empty());

    assert_eq!(
        reconciler.retract(&MessageId::new("m-1")),
        RetractOutcome::AlreadyRetracted
    );
    assert_eq!(
        reconciler.retract(&MessageId::new("missing")),
        RetractOutcome::Missing
    );
}

#[test]
fn retraction_survives_redelivery_of_the_original_event() {
    let mut reconciler = reconciler();
    reconciler.apply_inbound(candidate(Some("m-1"), "u-1", "regret", 100));
    reconciler.retract(&MessageId::new("m-1"));

    // A later poll window still contains the original payload.
    let outcome = reconciler.apply_inbound(candidate(Some("m-1"), "u-1", "regret", 100));
    assert_eq!(outcome, ApplyOutcome::Duplicate(MessageId::new("m-1")));
    let message = reconciler.state().get(&MessageId::new("m-1")).expect("still present");
    assert_eq!(message.status, MessageStatus::Retracted);
    assert!(message.content.is_empty());
}

#[test]
fn visible_messages_filters_hidden_but_state_retains_them() {
    let mut reconciler = reconciler();
    reconciler.apply_inbound(candidate(Some("m-1"), "u-1", "one", 100));
    reconciler.apply_inbound(candidate(Some("m-2"), "u-1", "two", 200));

    let hidden: HashSet<MessageId> = [MessageId::new("m-1")].into_iter().collect();
    let visible = reconciler.visible_messages(&hidden);
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, MessageId::new("m-2"));
    assert_eq!(reconciler.state().len(), 2);
}

#[test]
fn repeated_poll_window_inserts_only_unseen_messages() {
    let mut reconciler = reconciler();
    reconciler.apply_inbound(candidate(Some("a"), "u-1", "A", 36_000));
    reconciler.apply_inbound(candidate(Some("b"), "u-1", "B", 36_002));

    // Poll returns the overlap window [A, B, C]; only C is new.
    let window = [
        candidate(Some("a"), "u-1", "A", 36_000),
        candidate(Some("b"), "u-1", "B", 36_002),
        candidate(Some("c"), "u-1", "C", 36_005),
    ];
    let mut inserted = 0;
    for event in window.clone() {
        if matches!(reconciler.apply_inbound(event), ApplyOutcome::Inserted(_)) {
            inserted += 1;
        }
    }
    assert_eq!(inserted, 1);
    assert_eq!(ids(&reconciler), vec!["a", "b", "c"]);

    // Running the same window again inserts nothing.
    for event in window {
        assert!(matches!(
            reconciler.apply_inbound(event),
            ApplyOutcome::Duplicate(_)
        ));
    }
    assert_eq!(reconciler.state().len(), 3);
}

#[test]
fn snapshot_restore_preserves_order_and_cursor() {
    let mut reconciler = reconciler();
    reconciler.apply_inbound(candidate(Some("a"), "u-1", "A", 100));
    reconciler.apply_inbound(candidate(Some("b"), "u-1", "B", 200));
    let cursor = reconciler.state().last_known_at;

    let messages: Vec<Message> = reconciler.state().messages().cloned().collect();
    let restored = ConversationState::from_snapshot(
        ConversationId::new("c-1"),
        messages,
        cursor,
        None,
    );
    assert_eq!(restored.len(), 2);
    assert_eq!(restored.last_known_at, Some(at(200)));
    assert!(restored.contains(&MessageId::new("a")));
}
