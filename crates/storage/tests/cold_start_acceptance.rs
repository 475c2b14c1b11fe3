use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use shared::domain::{ConversationId, Message, MessageId, MessageKind, MessageStatus, UserId};
use storage::{ConversationSnapshot, Storage};

fn message(id: &str, at_secs: i64) -> Message {
    Message {
        id: MessageId::new(id),
        correlation_id: None,
        conversation_id: ConversationId::new("c-accept"),
        sender_id: UserId::new("u-1"),
        content: format!("content of {id}"),
        kind: MessageKind::Text,
        attachment: None,
        created_at: Utc.timestamp_opt(at_secs, 0).single().expect("timestamp"),
        reply_to: None,
        reactions: BTreeMap::new(),
        status: MessageStatus::Sent,
    }
}

// Cold-start contract: a fresh process must see the last persisted snapshot
// and the local-hide set before any network fetch has run.
#[tokio::test]
async fn snapshot_and_hidden_set_survive_reopen() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let db_path = temp_root.path().join("nested").join("client.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let device_user = UserId::new("device-user");
    let conversation = ConversationId::new("c-accept");

    {
        let storage = Storage::new(&database_url).await.expect("db");
        let snapshot = ConversationSnapshot {
            conversation_id: conversation.clone(),
            messages: vec![message("m-1", 1_000), message("m-2", 2_000)],
            last_known_at: Utc.timestamp_opt(2_000, 0).single(),
            last_sync_at: Utc.timestamp_opt(2_050, 0).single(),
        };
        storage
            .save_snapshot(&device_user, &snapshot)
            .await
            .expect("save snapshot");
        storage
            .hide_message(&device_user, &conversation, &MessageId::new("m-2"))
            .await
            .expect("hide");
    }

    assert!(db_path.exists(), "database file should exist on disk");

    let reopened = Storage::new(&database_url).await.expect("reopen db");
    let snapshot = reopened
        .load_snapshot(&device_user, &conversation)
        .await
        .expect("load snapshot")
        .expect("snapshot present after reopen");
    assert_eq!(snapshot.messages.len(), 2);
    assert_eq!(snapshot.last_known_at, Utc.timestamp_opt(2_000, 0).single());

    let hidden = reopened
        .hidden_messages(&device_user, &conversation)
        .await
        .expect("hidden set");
    assert!(hidden.contains(&MessageId::new("m-2")));
    assert_eq!(hidden.len(), 1);
}
