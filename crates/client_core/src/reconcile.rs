use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use shared::domain::{
    Attachment, ChannelSource, ConversationId, CorrelationId, Message, MessageId, MessageKind,
    MessageStatus, UserId,
};
use shared::error::{ChannelException, ErrorCode};

use crate::identity::{IdentityResolver, Verdict};

/// A normalized inbound event, whatever source it came from, before the
/// resolver has classified it.
#[derive(Debug, Clone)]
pub struct CandidateMessage {
    pub id: Option<MessageId>,
    pub correlation_id: Option<CorrelationId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    pub reply_to: Option<MessageId>,
    pub reactions: BTreeMap<UserId, String>,
    pub source: ChannelSource,
    pub received_at: DateTime<Utc>,
}

impl CandidateMessage {
    fn into_message(self, id: MessageId, status: MessageStatus) -> Message {
        Message {
            id,
            correlation_id: self.correlation_id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            content: self.content,
            kind: self.kind,
            attachment: self.attachment,
            created_at: self.created_at,
            reply_to: self.reply_to,
            reactions: self.reactions,
            status,
        }
    }
}

/// What the user asked to send, before it becomes an optimistic entry.
#[derive(Debug, Clone)]
pub struct Draft {
    pub content: String,
    pub kind: MessageKind,
    pub attachment: Option<Attachment>,
    pub reply_to: Option<MessageId>,
}

impl Draft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: MessageKind::Text,
            attachment: None,
            reply_to: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted(MessageId),
    Confirmed(MessageId),
    Duplicate(MessageId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetractOutcome {
    Applied,
    AlreadyRetracted,
    Missing,
}

struct Entry {
    message: Message,
    seq: u64,
}

/// The per-conversation ordered store. Ascending `created_at`, ties broken by
/// insertion sequence. Owned exclusively by the conversation's mutation
/// queue; readers get clones.
pub struct ConversationState {
    pub conversation_id: ConversationId,
    entries: Vec<Entry>,
    ids: HashSet<MessageId>,
    next_seq: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_known_at: Option<DateTime<Utc>>,
}

impl ConversationState {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            entries: Vec::new(),
            ids: HashSet::new(),
            next_seq: 0,
            last_sync_at: None,
            last_known_at: None,
        }
    }

    /// Rebuilds a state from a persisted snapshot. Messages are re-sorted in
    /// case the snapshot predates an ordering fix.
    pub fn from_snapshot(
        conversation_id: ConversationId,
        mut messages: Vec<Message>,
        last_known_at: Option<DateTime<Utc>>,
        last_sync_at: Option<DateTime<Utc>>,
    ) -> Self {
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let mut state = Self::new(conversation_id);
        state.last_known_at = last_known_at;
        state.last_sync_at = last_sync_at;
        for message in messages {
            state.insert(message);
        }
        state
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.entries
            .iter()
            .map(|entry| &entry.message)
            .find(|message| &message.id == id)
    }

    pub fn find_by_correlation(&self, correlation_id: &CorrelationId) -> Option<&Message> {
        self.entries
            .iter()
            .map(|entry| &entry.message)
            .find(|message| message.correlation_id.as_ref() == Some(correlation_id))
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|entry| &entry.message)
    }

    /// Messages whose `created_at` lies within `window_secs` of `around`.
    /// The store is sorted, so this is a bounded slice scan.
    pub fn within_window(
        &self,
        around: DateTime<Utc>,
        window_secs: i64,
    ) -> impl Iterator<Item = &Message> {
        let window = Duration::seconds(window_secs);
        let lo = around - window;
        let hi = around + window;
        let start = self
            .entries
            .partition_point(|entry| entry.message.created_at < lo);
        self.entries[start..]
            .iter()
            .take_while(move |entry| entry.message.created_at <= hi)
            .map(|entry| &entry.message)
    }

    fn insert(&mut self, message: Message) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.insert_with_seq(message, seq);
    }

    fn insert_with_seq(&mut self, message: Message, seq: u64) {
        let at = self.entries.partition_point(|entry| {
            (entry.message.created_at, entry.seq) <= (message.created_at, seq)
        });
        self.ids.insert(message.id.clone());
        self.entries.insert(at, Entry { message, seq });
    }

    fn remove_by_correlation(&mut self, correlation_id: &CorrelationId) -> Option<(Message, u64)> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.message.correlation_id.as_ref() == Some(correlation_id))?;
        let entry = self.entries.remove(index);
        self.ids.remove(&entry.message.id);
        Some((entry.message, entry.seq))
    }

    fn update<F>(&mut self, id: &MessageId, apply: F) -> bool
    where
        F: FnOnce(&mut Message),
    {
        for entry in &mut self.entries {
            if &entry.message.id == id {
                apply(&mut entry.message);
                return true;
            }
        }
        false
    }

    fn advance_cursor(&mut self, created_at: DateTime<Utc>) {
        if self.last_known_at.map_or(true, |known| created_at > known) {
            self.last_known_at = Some(created_at);
        }
    }
}

/// Owns the optimistic-send lifecycle and applies resolver verdicts to the
/// state. Every inbound candidate, regardless of source, goes through
/// `apply_inbound`.
pub struct Reconciler {
    state: ConversationState,
    resolver: IdentityResolver,
}

impl Reconciler {
    pub fn new(state: ConversationState) -> Self {
        Self {
            state,
            resolver: IdentityResolver::new(),
        }
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ConversationState {
        &mut self.state
    }

    /// Validates and inserts an optimistic entry at its chronological
    /// position, using the client clock as the provisional timestamp.
    pub fn submit(
        &mut self,
        sender_id: UserId,
        draft: Draft,
        now: DateTime<Utc>,
    ) -> Result<CorrelationId, ChannelException> {
        if draft.content.trim().is_empty() && draft.attachment.is_none() {
            return Err(ChannelException::new(
                ErrorCode::Validation,
                "message content must not be empty",
            ));
        }

        let correlation_id = CorrelationId::generate();
        let message = Message {
            id: MessageId(format!("local-{}", correlation_id.0)),
            correlation_id: Some(correlation_id.clone()),
            conversation_id: self.state.conversation_id.clone(),
            sender_id,
            content: draft.content,
            kind: draft.kind,
            attachment: draft.attachment,
            created_at: now,
            reply_to: draft.reply_to,
            reactions: BTreeMap::new(),
            status: MessageStatus::Pending,
        };
        self.state.insert(message);
        Ok(correlation_id)
    }

    pub fn apply_inbound(&mut self, candidate: CandidateMessage) -> ApplyOutcome {
        match self.resolver.resolve(&candidate, &self.state) {
            Verdict::Duplicate { existing_id } => {
                debug!(
                    conversation_id = %self.state.conversation_id,
                    message_id = %existing_id,
                    source = ?candidate.source,
                    "duplicate suppressed"
                );
                ApplyOutcome::Duplicate(existing_id)
            }
            Verdict::UpdatesPending { correlation_id } => {
                let id = self.confirm(&correlation_id, candidate);
                ApplyOutcome::Confirmed(id)
            }
            Verdict::New { canonical_id } => {
                let created_at = candidate.created_at;
                let message = candidate.into_message(canonical_id.clone(), MessageStatus::Sent);
                self.state.insert(message);
                self.state.advance_cursor(created_at);
                self.resolver.remember(canonical_id.clone());
                ApplyOutcome::Inserted(canonical_id)
            }
        }
    }

    /// Replaces the optimistic entry with the canonical message, re-sorting
    /// by the authoritative timestamp. Degrades to a plain insert when no
    /// matching entry remains.
    pub fn confirm(
        &mut self,
        correlation_id: &CorrelationId,
        candidate: CandidateMessage,
    ) -> MessageId {
        let canonical_id = candidate.id.clone().unwrap_or_else(|| {
            crate::identity::synthesize_id(
                &candidate.sender_id,
                &candidate.content,
                candidate.created_at,
            )
        });

        let created_at = candidate.created_at;
        let mut message = candidate.into_message(canonical_id.clone(), MessageStatus::Sent);
        message.correlation_id = Some(correlation_id.clone());

        match self.state.remove_by_correlation(correlation_id) {
            Some((previous, seq)) => {
                if message.reactions.is_empty() {
                    message.reactions = previous.reactions;
                }
                self.state.insert_with_seq(message, seq);
            }
            None => self.state.insert(message),
        }
        self.state.advance_cursor(created_at);
        self.resolver.remember(canonical_id.clone());
        canonical_id
    }

    /// Marks the optimistic entry failed without removing it, so the user
    /// can retry or see a failure marker.
    pub fn fail(&mut self, correlation_id: &CorrelationId) -> bool {
        let Some(id) = self
            .state
            .find_by_correlation(correlation_id)
            .filter(|message| message.status == MessageStatus::Pending)
            .map(|message| message.id.clone())
        else {
            return false;
        };
        self.state
            .update(&id, |message| message.status = MessageStatus::Failed)
    }

    /// Re-arms a failed send for another transport pass.
    pub fn mark_pending(&mut self, correlation_id: &CorrelationId) -> bool {
        let Some(id) = self
            .state
            .find_by_correlation(correlation_id)
            .filter(|message| message.status == MessageStatus::Failed)
            .map(|message| message.id.clone())
        else {
            return false;
        };
        self.state
            .update(&id, |message| message.status = MessageStatus::Pending)
    }

    /// Global retraction: blanks the content and marks the message
    /// retracted. Idempotent; retracting a missing message reports
    /// `Missing` so the caller can buffer the tombstone.
    pub fn retract(&mut self, message_id: &MessageId) -> RetractOutcome {
        match self.state.get(message_id).map(|message| message.status) {
            None => RetractOutcome::Missing,
            Some(MessageStatus::Retracted) => RetractOutcome::AlreadyRetracted,
            Some(_) => {
                self.state.update(message_id, |message| {
                    message.status = MessageStatus::Retracted;
                    message.content.clear();
                    message.attachment = None;
                });
                RetractOutcome::Applied
            }
        }
    }

    /// The sequence exposed to the presentation layer: ordered, with
    /// locally-hidden messages filtered out.
    pub fn visible_messages(&self, hidden: &HashSet<MessageId>) -> Vec<Message> {
        self.state
            .messages()
            .filter(|message| !hidden.contains(&message.id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
