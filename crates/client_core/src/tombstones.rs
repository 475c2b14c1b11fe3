use std::collections::HashSet;

use anyhow::Result;
use tracing::warn;

use shared::domain::{ConversationId, MessageId, UserId};
use storage::Storage;

/// Tracks the two tombstone scopes for one conversation.
///
/// Local hides are a device-only, read-side filter: persisted so they survive
/// restarts, never transmitted to any channel. Global retractions arrive
/// through the normal event path; ones that reference a message the store has
/// not seen yet are buffered here until the message is inserted.
pub struct TombstoneStore {
    device_user_id: UserId,
    conversation_id: ConversationId,
    hidden: HashSet<MessageId>,
    buffered_retractions: HashSet<MessageId>,
    storage: Option<Storage>,
}

impl TombstoneStore {
    pub fn in_memory(device_user_id: UserId, conversation_id: ConversationId) -> Self {
        Self {
            device_user_id,
            conversation_id,
            hidden: HashSet::new(),
            buffered_retractions: HashSet::new(),
            storage: None,
        }
    }

    /// Loads the persisted hidden set for this device user and conversation.
    pub async fn load(
        device_user_id: UserId,
        conversation_id: ConversationId,
        storage: Storage,
    ) -> Result<Self> {
        let hidden = storage
            .hidden_messages(&device_user_id, &conversation_id)
            .await?;
        Ok(Self {
            device_user_id,
            conversation_id,
            hidden,
            buffered_retractions: HashSet::new(),
            storage: Some(storage),
        })
    }

    pub fn is_hidden(&self, message_id: &MessageId) -> bool {
        self.hidden.contains(message_id)
    }

    pub fn hidden(&self) -> &HashSet<MessageId> {
        &self.hidden
    }

    pub async fn hide(&mut self, message_id: MessageId) {
        if !self.hidden.insert(message_id.clone()) {
            return;
        }
        if let Some(storage) = &self.storage {
            if let Err(err) = storage
                .hide_message(&self.device_user_id, &self.conversation_id, &message_id)
                .await
            {
                warn!(
                    conversation_id = %self.conversation_id,
                    message_id = %message_id,
                    "failed to persist local hide: {err:#}"
                );
            }
        }
    }

    /// Debug/recovery path; the hidden message reappears unchanged.
    pub async fn unhide(&mut self, message_id: &MessageId) -> bool {
        if !self.hidden.remove(message_id) {
            return false;
        }
        if let Some(storage) = &self.storage {
            if let Err(err) = storage
                .unhide_message(&self.device_user_id, &self.conversation_id, message_id)
                .await
            {
                warn!(
                    conversation_id = %self.conversation_id,
                    message_id = %message_id,
                    "failed to persist unhide: {err:#}"
                );
            }
        }
        true
    }

    /// Buffers a global retraction whose message has not been inserted yet.
    pub fn buffer_retraction(&mut self, message_id: MessageId) {
        self.buffered_retractions.insert(message_id);
    }

    /// Claims a buffered retraction for a message that just got inserted.
    pub fn take_buffered_retraction(&mut self, message_id: &MessageId) -> bool {
        self.buffered_retractions.remove(message_id)
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered_retractions.len()
    }
}

#[cfg(test)]
#[path = "tests/tombstones_tests.rs"]
mod tests;
