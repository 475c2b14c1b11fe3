use super::*;

fn store() -> TombstoneStore {
    TombstoneStore::in_memory(UserId::new("device-user"), ConversationId::new("c-1"))
}

#[tokio::test]
async fn hide_and_unhide_round_trip() {
    let mut store = store();
    let id = MessageId::new("m-1");

    assert!(!store.is_hidden(&id));
    store.hide(id.clone()).await;
    assert!(store.is_hidden(&id));

    assert!(store.unhide(&id).await);
    assert!(!store.is_hidden(&id));
    assert!(!store.unhide(&id).await);
}

#[tokio::test]
async fn hiding_twice_keeps_one_entry() {
    let mut store = store();
    store.hide(MessageId::new("m-1")).await;
    store.hide(MessageId::new("m-1")).await;
    assert_eq!(store.hidden().len(), 1);
}

#[test]
fn buffered_retraction_is_claimed_once() {
    let mut store = store();
    store.buffer_retraction(MessageId::new("m-9"));
    assert_eq!(store.buffered_len(), 1);

    assert!(store.take_buffered_retraction(&MessageId::new("m-9")));
    assert!(!store.take_buffered_retraction(&MessageId::new("m-9")));
    assert_eq!(store.buffered_len(), 0);
}

#[test]
fn unrelated_inserts_do_not_claim_buffered_retractions() {
    let mut store = store();
    store.buffer_retraction(MessageId::new("m-9"));
    assert!(!store.take_buffered_retraction(&MessageId::new("m-1")));
    assert_eq!(store.buffered_len(), 1);
}

#[tokio::test]
async fn persisted_hides_survive_reload() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let device_user = UserId::new("device-user");
    let conversation = ConversationId::new("c-1");

    {
        let mut store = TombstoneStore::load(
            device_user.clone(),
            conversation.clone(),
            storage.clone(),
        )
        .await
        .expect("load");
        store.hide(MessageId::new("m-1")).await;
    }

    let reloaded = TombstoneStore::load(device_user, conversation, storage)
        .await
        .expect("reload");
    assert!(reloaded.is_hidden(&MessageId::new("m-1")));
}
