use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::debug;

use shared::domain::{
    ChannelSource, ConversationId, CorrelationId, MessageId, MessageKind, UserId,
};
use shared::protocol::{
    fold_event_alias, EventKind, LiveFrame, RawAckPayload, RawMessagePayload,
    RawRetractionPayload, RawTypingPayload,
};

use crate::reconcile::CandidateMessage;

/// Untyped envelope from any source, stamped with where and when it arrived.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub source: ChannelSource,
    pub received_at: DateTime<Utc>,
    pub frame: LiveFrame,
}

impl ChannelEvent {
    pub fn new(source: ChannelSource, frame: LiveFrame) -> Self {
        Self {
            source,
            received_at: Utc::now(),
            frame,
        }
    }
}

/// A normalized event ready for the reconciliation step.
#[derive(Debug, Clone)]
pub enum RoutedEvent {
    Message(CandidateMessage),
    Retraction {
        message_id: MessageId,
        actor_id: Option<UserId>,
    },
    Typing {
        user_id: UserId,
        display_name: String,
    },
    StoppedTyping {
        user_id: UserId,
    },
    SendAck {
        correlation_id: CorrelationId,
    },
}

/// Maps a raw frame onto the canonical event shape. All event-name aliases
/// collapse before normalization, so aliased redeliveries reach the same
/// dedup path. Frames for other conversations and unknown event names yield
/// `None`.
pub fn route(event: ChannelEvent, conversation_id: &ConversationId) -> Result<Option<RoutedEvent>> {
    let Some(kind) = fold_event_alias(&event.frame.event) else {
        debug!(event = %event.frame.event, "ignoring unknown event name");
        return Ok(None);
    };

    match kind {
        EventKind::Message => {
            let raw: RawMessagePayload = serde_json::from_value(event.frame.payload)?;
            if let Some(conversation) = &raw.conversation_id {
                if conversation != &conversation_id.0 {
                    return Ok(None);
                }
            }
            let candidate =
                normalize_message(raw, event.source, event.received_at, conversation_id)?;
            Ok(Some(RoutedEvent::Message(candidate)))
        }
        EventKind::Retraction => {
            let raw: RawRetractionPayload = serde_json::from_value(event.frame.payload)?;
            if let Some(conversation) = &raw.conversation_id {
                if conversation != &conversation_id.0 {
                    return Ok(None);
                }
            }
            Ok(Some(RoutedEvent::Retraction {
                message_id: MessageId(raw.message_id),
                actor_id: raw.actor_id.map(UserId),
            }))
        }
        EventKind::Typing => {
            let raw: RawTypingPayload = serde_json::from_value(event.frame.payload)?;
            if let Some(conversation) = &raw.conversation_id {
                if conversation != &conversation_id.0 {
                    return Ok(None);
                }
            }
            let display_name = raw.display_name.unwrap_or_else(|| raw.user_id.clone());
            Ok(Some(RoutedEvent::Typing {
                user_id: UserId(raw.user_id),
                display_name,
            }))
        }
        EventKind::StoppedTyping => {
            let raw: RawTypingPayload = serde_json::from_value(event.frame.payload)?;
            if let Some(conversation) = &raw.conversation_id {
                if conversation != &conversation_id.0 {
                    return Ok(None);
                }
            }
            Ok(Some(RoutedEvent::StoppedTyping {
                user_id: UserId(raw.user_id),
            }))
        }
        EventKind::SendAck => {
            let raw: RawAckPayload = serde_json::from_value(event.frame.payload)?;
            Ok(Some(RoutedEvent::SendAck {
                correlation_id: CorrelationId(raw.correlation_id),
            }))
        }
    }
}

fn normalize_message(
    raw: RawMessagePayload,
    source: ChannelSource,
    received_at: DateTime<Utc>,
    conversation_id: &ConversationId,
) -> Result<CandidateMessage> {
    let sender_id = raw
        .sender_id
        .ok_or_else(|| anyhow!("message payload carries no sender"))?;

    let content = raw.content.unwrap_or_default();
    let attachment = raw.attachment.map(|a| a.into_attachment());
    if content.trim().is_empty() && attachment.is_none() {
        return Err(anyhow!("message payload carries neither content nor attachment"));
    }

    let kind = match &raw.kind {
        Some(kind) => MessageKind::parse(kind),
        None if attachment.is_some() => MessageKind::File,
        None => MessageKind::Text,
    };

    let created_at = raw
        .created_at
        .and_then(|ts| ts.to_utc())
        .unwrap_or(received_at);

    let reactions: BTreeMap<UserId, String> = raw
        .reactions
        .unwrap_or_default()
        .into_iter()
        .map(|(user, token)| (UserId(user), token))
        .collect();

    Ok(CandidateMessage {
        id: raw.id.map(MessageId),
        correlation_id: raw.correlation_id.map(CorrelationId),
        conversation_id: conversation_id.clone(),
        sender_id: UserId(sender_id),
        content,
        kind,
        attachment,
        created_at,
        reply_to: raw.reply_to.map(MessageId),
        reactions,
        source,
        received_at,
    })
}

/// Live-channel health. The channel never gives up: `Reconnecting` loops
/// with jittered exponential backoff until the link comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Reconnecting,
}

impl LinkState {
    pub fn is_online(self) -> bool {
        matches!(self, LinkState::Connected | LinkState::Degraded)
    }
}

/// Exponential backoff with half-delay jitter: each delay is drawn uniformly
/// from `[exp/2, exp]` where `exp` doubles per attempt up to the cap.
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        let half = exp / 2;
        let jitter = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
#[path = "tests/ingest_tests.rs"]
mod tests;
