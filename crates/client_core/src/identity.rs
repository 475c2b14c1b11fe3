use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};

use shared::domain::{CorrelationId, MessageId, MessageStatus, UserId};

use crate::reconcile::{CandidateMessage, ConversationState};

/// Two events from the same sender with the same trimmed content are treated
/// as one logical message when their timestamps fall within this window.
pub const FINGERPRINT_WINDOW_SECS: i64 = 5;

const RECENCY_CAPACITY: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    New { canonical_id: MessageId },
    UpdatesPending { correlation_id: CorrelationId },
    Duplicate { existing_id: MessageId },
}

/// Classifies candidates against the conversation state. Never mutates the
/// state; the recency window is a performance cache only — the state's own
/// membership check stays authoritative.
pub struct IdentityResolver {
    recent: RecencyWindow,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self {
            recent: RecencyWindow::new(RECENCY_CAPACITY),
        }
    }

    pub fn resolve(&self, candidate: &CandidateMessage, state: &ConversationState) -> Verdict {
        if let Some(id) = &candidate.id {
            if let Some(hit) = self.recent.get(id) {
                if state.contains(hit) {
                    return Verdict::Duplicate {
                        existing_id: hit.clone(),
                    };
                }
            }
            if state.contains(id) {
                return Verdict::Duplicate {
                    existing_id: id.clone(),
                };
            }
        }

        if let Some(correlation_id) = &candidate.correlation_id {
            if let Some(existing) = state.find_by_correlation(correlation_id) {
                return match existing.status {
                    MessageStatus::Pending | MessageStatus::Failed => Verdict::UpdatesPending {
                        correlation_id: correlation_id.clone(),
                    },
                    _ => Verdict::Duplicate {
                        existing_id: existing.id.clone(),
                    },
                };
            }
        }

        if let Some(verdict) = self.fingerprint_match(candidate, state) {
            return verdict;
        }

        let canonical_id = candidate
            .id
            .clone()
            .unwrap_or_else(|| synthesize_id(&candidate.sender_id, &candidate.content, candidate.created_at));
        Verdict::New { canonical_id }
    }

    /// Same sender + same trimmed content + close timestamps. An optimistic
    /// entry wins over a settled one so a fast canonical round-trip merges
    /// into the pending send instead of duplicating it; two settled messages
    /// with distinct canonical ids are left alone.
    fn fingerprint_match(
        &self,
        candidate: &CandidateMessage,
        state: &ConversationState,
    ) -> Option<Verdict> {
        let content = candidate.content.trim();
        let mut settled_hit: Option<MessageId> = None;

        for existing in state.within_window(candidate.created_at, FINGERPRINT_WINDOW_SECS) {
            if existing.sender_id != candidate.sender_id || existing.content.trim() != content {
                continue;
            }
            match existing.status {
                MessageStatus::Pending | MessageStatus::Failed => {
                    if let Some(correlation_id) = &existing.correlation_id {
                        return Some(Verdict::UpdatesPending {
                            correlation_id: correlation_id.clone(),
                        });
                    }
                }
                _ => {
                    if candidate.id.is_none() && settled_hit.is_none() {
                        settled_hit = Some(existing.id.clone());
                    }
                }
            }
        }

        settled_hit.map(|existing_id| Verdict::Duplicate { existing_id })
    }

    /// Records a key the reconciler just settled, so the next sighting skips
    /// the fingerprint scan.
    pub fn remember(&mut self, key: MessageId) {
        self.recent.put(key.clone(), key);
    }

    #[cfg(test)]
    pub(crate) fn recency_len(&self) -> usize {
        self.recent.order.len()
    }
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic id for events that carry neither a canonical id nor a
/// correlation id: later duplicates of the same malformed event land in the
/// same 5-second bucket and collide.
pub fn synthesize_id(sender_id: &UserId, content: &str, created_at: DateTime<Utc>) -> MessageId {
    let bucket = created_at.timestamp().div_euclid(FINGERPRINT_WINDOW_SECS);
    let mut hasher = Sha256::new();
    hasher.update(sender_id.0.as_bytes());
    hasher.update([0]);
    hasher.update(content.trim().as_bytes());
    hasher.update([0]);
    hasher.update(bucket.to_be_bytes());
    let digest = hasher.finalize();
    MessageId(format!("synth-{}", URL_SAFE_NO_PAD.encode(&digest[..16])))
}

struct RecencyWindow {
    capacity: usize,
    entries: HashMap<MessageId, MessageId>,
    order: VecDeque<MessageId>,
}

impl RecencyWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &MessageId) -> Option<&MessageId> {
        self.entries.get(key)
    }

    fn put(&mut self, key: MessageId, value: MessageId) {
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
            if self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/identity_tests.rs"]
mod tests;
