use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::info;

use shared::domain::{Attachment, ConversationId, CorrelationId, MessageId, UserId};
use shared::error::{ChannelException, ErrorCode};
use shared::protocol::{LiveFrame, OutboundMessage};
use storage::Storage;

pub mod engine;
pub mod identity;
pub mod ingest;
pub mod presence;
pub mod reconcile;
pub mod resync;
pub mod tombstones;
pub mod transport;

pub use engine::{ConversationEvent, ConversationHandle, EngineConfig};
pub use ingest::{ChannelEvent, LinkState};
pub use reconcile::Draft;
pub use resync::ResyncReason;

use engine::{ConversationEngine, EngineDeps};

/// How many closed conversations keep their live engine before eviction.
const RETAINED_ENGINE_BUDGET: usize = 4;

#[async_trait]
pub trait LiveChannel: Send + Sync {
    async fn connect(&self) -> Result<(Box<dyn LiveSender>, Box<dyn LiveReceiver>)>;
}

#[async_trait]
pub trait LiveSender: Send + Sync {
    async fn subscribe(&self, conversation_id: &ConversationId) -> Result<()>;
    /// Transport acceptance only; the canonical message event is the
    /// confirmation signal.
    async fn send_message(&self, outbound: &OutboundMessage) -> Result<()>;
}

#[async_trait]
pub trait LiveReceiver: Send {
    /// `Ok(None)` means the channel closed cleanly.
    async fn next_frame(&mut self) -> Result<Option<LiveFrame>>;
}

#[async_trait]
pub trait MessageApi: Send + Sync {
    async fn poll_messages(
        &self,
        conversation_id: &ConversationId,
        since: DateTime<Utc>,
    ) -> Result<Vec<serde_json::Value>>;
    async fn send_message(&self, outbound: &OutboundMessage) -> Result<()>;
    /// Global retraction only; local hides never leave the device.
    async fn delete_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct MediaMetadata {
    pub name: String,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadedMedia {
    pub url: String,
    pub name: String,
    pub size_bytes: u64,
}

#[async_trait]
pub trait MediaUploader: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, metadata: MediaMetadata) -> Result<UploadedMedia>;
}

pub trait SessionProvider: Send + Sync {
    fn current_user_id(&self) -> UserId;
    fn auth_token(&self) -> Option<String> {
        None
    }
}

pub struct MissingLiveChannel;

#[async_trait]
impl LiveChannel for MissingLiveChannel {
    async fn connect(&self) -> Result<(Box<dyn LiveSender>, Box<dyn LiveReceiver>)> {
        Err(anyhow!(ChannelException::new(
            ErrorCode::TransientNetwork,
            "live channel is unavailable",
        )))
    }
}

pub struct MissingMessageApi;

#[async_trait]
impl MessageApi for MissingMessageApi {
    async fn poll_messages(
        &self,
        conversation_id: &ConversationId,
        _since: DateTime<Utc>,
    ) -> Result<Vec<serde_json::Value>> {
        Err(anyhow!(ChannelException::new(
            ErrorCode::TransientNetwork,
            format!("message api unavailable for conversation {conversation_id}"),
        )))
    }

    async fn send_message(&self, _outbound: &OutboundMessage) -> Result<()> {
        Err(anyhow!(ChannelException::new(
            ErrorCode::TransientNetwork,
            "message api is unavailable",
        )))
    }

    async fn delete_message(
        &self,
        _conversation_id: &ConversationId,
        _message_id: &MessageId,
    ) -> Result<()> {
        Err(anyhow!(ChannelException::new(
            ErrorCode::TransientNetwork,
            "message api is unavailable",
        )))
    }
}

pub struct MissingMediaUploader;

#[async_trait]
impl MediaUploader for MissingMediaUploader {
    async fn upload(&self, _bytes: Vec<u8>, metadata: MediaMetadata) -> Result<UploadedMedia> {
        Err(anyhow!("media upload service unavailable for {}", metadata.name))
    }
}

/// Fixed credentials; renewal-capable providers implement the same trait.
pub struct StaticSession {
    user_id: UserId,
    token: Option<String>,
}

impl StaticSession {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            token: None,
        }
    }

    pub fn with_token(user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            user_id,
            token: Some(token.into()),
        }
    }
}

impl SessionProvider for StaticSession {
    fn current_user_id(&self) -> UserId {
        self.user_id.clone()
    }

    fn auth_token(&self) -> Option<String> {
        self.token.clone()
    }
}

/// Maps transport failures onto the error taxonomy. Anything a transport did
/// not classify is treated as transient and retried.
pub fn error_code(err: &anyhow::Error) -> ErrorCode {
    err.downcast_ref::<ChannelException>()
        .map(|exception| exception.code)
        .unwrap_or(ErrorCode::TransientNetwork)
}

/// One engine per conversation, shared by every surface that renders it.
/// Closing a conversation cancels its network work and retains the engine in
/// a small LRU; eviction persists the snapshot and tears the engine down.
pub struct SyncClient {
    live: Arc<dyn LiveChannel>,
    api: Arc<dyn MessageApi>,
    media: Arc<dyn MediaUploader>,
    session: Arc<dyn SessionProvider>,
    storage: Option<Storage>,
    config: EngineConfig,
    open: Mutex<HashMap<ConversationId, ConversationHandle>>,
    retained: Mutex<VecDeque<ConversationHandle>>,
}

impl SyncClient {
    pub fn new(
        live: Arc<dyn LiveChannel>,
        api: Arc<dyn MessageApi>,
        session: Arc<dyn SessionProvider>,
    ) -> Self {
        Self::new_with_dependencies(live, api, Arc::new(MissingMediaUploader), session, None)
    }

    pub fn new_with_dependencies(
        live: Arc<dyn LiveChannel>,
        api: Arc<dyn MessageApi>,
        media: Arc<dyn MediaUploader>,
        session: Arc<dyn SessionProvider>,
        storage: Option<Storage>,
    ) -> Self {
        Self {
            live,
            api,
            media,
            session,
            storage,
            config: EngineConfig::default(),
            open: Mutex::new(HashMap::new()),
            retained: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Opens (or reuses) the engine for a conversation. The snapshot renders
    /// immediately; a catch-up fetch runs in the background. The open-map
    /// lock is held across the spawn so concurrent opens cannot race two
    /// engines into existence for one conversation.
    pub async fn open(&self, conversation_id: ConversationId) -> Result<ConversationHandle> {
        let mut open = self.open.lock().await;
        if let Some(handle) = open.get(&conversation_id) {
            return Ok(handle.clone());
        }

        let revived = {
            let mut retained = self.retained.lock().await;
            let position = retained
                .iter()
                .position(|handle| handle.conversation_id() == &conversation_id);
            position.and_then(|at| retained.remove(at))
        };

        let handle = match revived {
            Some(handle) => {
                info!(conversation_id = %conversation_id, "reviving retained conversation engine");
                handle.resume().await;
                handle
            }
            None => {
                ConversationEngine::spawn(
                    conversation_id.clone(),
                    EngineDeps {
                        live: Arc::clone(&self.live),
                        api: Arc::clone(&self.api),
                        session: Arc::clone(&self.session),
                        storage: self.storage.clone(),
                    },
                    self.config.clone(),
                )
                .await?
            }
        };

        open.insert(conversation_id, handle.clone());
        Ok(handle)
    }

    /// Cancels the conversation's network work and parks the engine. The
    /// oldest retained engine beyond the budget is persisted and torn down.
    pub async fn close(&self, conversation_id: &ConversationId) -> Result<()> {
        let Some(handle) = self.open.lock().await.remove(conversation_id) else {
            return Ok(());
        };
        handle.suspend().await;

        let evicted = {
            let mut retained = self.retained.lock().await;
            retained.push_back(handle);
            if retained.len() > RETAINED_ENGINE_BUDGET {
                retained.pop_front()
            } else {
                None
            }
        };
        if let Some(stale) = evicted {
            info!(
                conversation_id = %stale.conversation_id(),
                "evicting retained conversation engine"
            );
            stale.shutdown().await;
        }
        Ok(())
    }

    /// Uploads the attachment first, then submits the draft carrying the
    /// durable URL. Upload failures never create a pending send.
    pub async fn submit_with_upload(
        &self,
        conversation_id: &ConversationId,
        mut draft: Draft,
        bytes: Vec<u8>,
        metadata: MediaMetadata,
    ) -> Result<CorrelationId> {
        let handle = {
            let open = self.open.lock().await;
            open.get(conversation_id)
                .cloned()
                .ok_or_else(|| anyhow!("conversation {conversation_id} is not open"))?
        };
        let uploaded = self.media.upload(bytes, metadata).await?;
        draft.attachment = Some(Attachment {
            url: uploaded.url,
            name: uploaded.name,
            size_bytes: uploaded.size_bytes,
        });
        handle.submit(draft).await
    }

    /// Tears down every engine, persisting snapshots.
    pub async fn shutdown(&self) {
        let open: Vec<ConversationHandle> = self.open.lock().await.drain().map(|(_, h)| h).collect();
        for handle in open {
            handle.shutdown().await;
        }
        let retained: Vec<ConversationHandle> = self.retained.lock().await.drain(..).collect();
        for handle in retained {
            handle.shutdown().await;
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
