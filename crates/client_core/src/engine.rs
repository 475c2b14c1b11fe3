use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch, RwLock},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use shared::domain::{
    ChannelSource, ConversationId, CorrelationId, Message, MessageId, UserId,
};
use shared::error::{ChannelException, ErrorCode};
use shared::protocol::{LiveFrame, OutboundMessage};
use storage::{ConversationSnapshot, Storage};

use crate::{
    error_code,
    ingest::{route, Backoff, ChannelEvent, LinkState, RoutedEvent},
    presence::PresenceTracker,
    reconcile::{ApplyOutcome, ConversationState, Draft, Reconciler, RetractOutcome},
    resync::{since_cursor, ResyncOutcome, ResyncReason},
    tombstones::TombstoneStore,
    LiveChannel, LiveSender, MessageApi, SessionProvider,
};

const COMMAND_QUEUE_DEPTH: usize = 256;
const EVENT_QUEUE_DEPTH: usize = 256;
const RETRACT_API_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    /// Attempts per transport before falling through to the next one.
    pub send_attempts: u32,
    pub send_retry_delay: Duration,
    pub send_timeout: Duration,
    /// Added to the send timeout per mebibyte of attachment payload.
    pub send_timeout_per_mib: Duration,
    /// Transport acceptance is not confirmation; a send still pending this
    /// long after acceptance is marked failed.
    pub confirm_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    /// Consecutive catch-up failures before the soft degraded indicator.
    pub degraded_after_failures: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            send_attempts: 3,
            send_retry_delay: Duration::from_millis(500),
            send_timeout: Duration::from_secs(10),
            send_timeout_per_mib: Duration::from_secs(8),
            confirm_timeout: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(20),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(30),
            degraded_after_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Live,
    Http,
}

impl TransportKind {
    fn label(self) -> &'static str {
        match self {
            TransportKind::Live => "live",
            TransportKind::Http => "http",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportAttempt {
    pub transport: TransportKind,
    pub error: String,
}

/// Discrete notifications for the presentation layer. The rendered message
/// list itself travels on a `watch` channel.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    MessageFailed {
        correlation_id: CorrelationId,
        reason: String,
    },
    TypingChanged {
        names: Vec<String>,
    },
    LinkChanged(LinkState),
    ResyncCompleted {
        reason: ResyncReason,
        outcome: ResyncOutcome,
    },
    SyncDegraded {
        consecutive_failures: u32,
    },
    AuthRequired {
        context: String,
    },
}

pub(crate) enum EngineCommand {
    Ingest(ChannelEvent),
    Submit {
        draft: Draft,
        reply: oneshot::Sender<Result<CorrelationId, ChannelException>>,
    },
    Retry {
        correlation_id: CorrelationId,
        reply: oneshot::Sender<bool>,
    },
    HideLocal {
        message_id: MessageId,
        reply: oneshot::Sender<()>,
    },
    Unhide {
        message_id: MessageId,
        reply: oneshot::Sender<bool>,
    },
    RetractGlobal {
        message_id: MessageId,
        reply: oneshot::Sender<()>,
    },
    Resync {
        reason: ResyncReason,
    },
    ResyncFetched {
        reason: ResyncReason,
        payloads: Vec<serde_json::Value>,
    },
    ResyncFailed {
        reason: ResyncReason,
        error: String,
    },
    SendAccepted {
        correlation_id: CorrelationId,
        transport: TransportKind,
    },
    SendFailed {
        correlation_id: CorrelationId,
        history: Vec<TransportAttempt>,
        auth: bool,
    },
    ConfirmTimeout {
        correlation_id: CorrelationId,
    },
    LinkChanged(LinkState),
    TypersTick,
    Persist {
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

struct SendTrack {
    accepted_transport: Option<TransportKind>,
}

pub(crate) struct EngineDeps {
    pub live: Arc<dyn LiveChannel>,
    pub api: Arc<dyn MessageApi>,
    pub session: Arc<dyn SessionProvider>,
    pub storage: Option<Storage>,
}

struct HandleShared {
    live: Arc<dyn LiveChannel>,
    cfg: EngineConfig,
    live_sender: Arc<RwLock<Option<Arc<dyn LiveSender>>>>,
    network_tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    worker_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one conversation's engine. Cloneable; the underlying state is
/// owned by the worker task and only ever mutated there.
#[derive(Clone)]
pub struct ConversationHandle {
    conversation_id: ConversationId,
    commands: mpsc::Sender<EngineCommand>,
    rendered: watch::Receiver<Vec<Message>>,
    events: broadcast::Sender<ConversationEvent>,
    shared: Arc<HandleShared>,
}

impl ConversationHandle {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Optimistic send: the entry is visible immediately and transport
    /// attempts run in the background.
    pub async fn submit(&self, draft: Draft) -> Result<CorrelationId> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(EngineCommand::Submit { draft, reply })
            .await
            .map_err(|_| anyhow!("conversation engine is gone"))?;
        Ok(response.await.map_err(|_| anyhow!("engine dropped reply"))??)
    }

    /// Re-runs the transports for a failed send.
    pub async fn retry(&self, correlation_id: CorrelationId) -> Result<bool> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(EngineCommand::Retry {
                correlation_id,
                reply,
            })
            .await
            .map_err(|_| anyhow!("conversation engine is gone"))?;
        response.await.map_err(|_| anyhow!("engine dropped reply"))
    }

    /// "Delete for me": hides the message on this device only.
    pub async fn hide(&self, message_id: MessageId) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(EngineCommand::HideLocal { message_id, reply })
            .await
            .map_err(|_| anyhow!("conversation engine is gone"))?;
        response.await.map_err(|_| anyhow!("engine dropped reply"))
    }

    pub async fn unhide(&self, message_id: MessageId) -> Result<bool> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(EngineCommand::Unhide { message_id, reply })
            .await
            .map_err(|_| anyhow!("conversation engine is gone"))?;
        response.await.map_err(|_| anyhow!("engine dropped reply"))
    }

    /// "Delete for everyone": applies the retraction locally and posts it to
    /// the server in the background.
    pub async fn retract(&self, message_id: MessageId) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(EngineCommand::RetractGlobal { message_id, reply })
            .await
            .map_err(|_| anyhow!("conversation engine is gone"))?;
        response.await.map_err(|_| anyhow!("engine dropped reply"))
    }

    pub async fn refresh(&self) -> Result<()> {
        self.request_resync(ResyncReason::Manual).await
    }

    pub async fn notify_foregrounded(&self) -> Result<()> {
        self.request_resync(ResyncReason::Foreground).await
    }

    async fn request_resync(&self, reason: ResyncReason) -> Result<()> {
        self.commands
            .send(EngineCommand::Resync { reason })
            .await
            .map_err(|_| anyhow!("conversation engine is gone"))
    }

    /// Feeds a raw event into the mutation queue, as the live channel and the
    /// poll loop do internally.
    pub async fn ingest(&self, event: ChannelEvent) -> Result<()> {
        self.commands
            .send(EngineCommand::Ingest(event))
            .await
            .map_err(|_| anyhow!("conversation engine is gone"))
    }

    /// Current rendered sequence: ordered, locally-hidden messages removed.
    pub fn messages(&self) -> Vec<Message> {
        self.rendered.borrow().clone()
    }

    pub fn watch_messages(&self) -> watch::Receiver<Vec<Message>> {
        self.rendered.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    pub async fn persist(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(EngineCommand::Persist { reply })
            .await
            .map_err(|_| anyhow!("conversation engine is gone"))?;
        response.await.map_err(|_| anyhow!("engine dropped reply"))?
    }

    /// Stops network activity while keeping the in-memory state, so a closed
    /// conversation cannot apply stale results.
    pub(crate) async fn suspend(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.shared.network_tasks.lock().await;
            guard.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
        self.shared.live_sender.write().await.take();
        if let Err(err) = self.persist().await {
            warn!(conversation_id = %self.conversation_id, "persist on suspend failed: {err:#}");
        }
    }

    /// Restarts network activity for a retained engine.
    pub(crate) async fn resume(&self) {
        self.spawn_network_tasks().await;
        let _ = self.request_resync(ResyncReason::Foreground).await;
    }

    /// Full teardown: persists, stops the worker, aborts every task.
    pub(crate) async fn shutdown(&self) {
        self.suspend().await;
        let (reply, response) = oneshot::channel();
        if self
            .commands
            .send(EngineCommand::Close { reply })
            .await
            .is_ok()
        {
            let _ = response.await;
        }
        if let Some(task) = self.shared.worker_task.lock().await.take() {
            task.abort();
        }
    }

    async fn spawn_network_tasks(&self) {
        let supervisor = tokio::spawn(run_link_supervisor(
            Arc::clone(&self.shared.live),
            self.conversation_id.clone(),
            Arc::clone(&self.shared.live_sender),
            self.commands.clone(),
            self.shared.cfg.clone(),
        ));
        let poll = tokio::spawn(run_poll_loop(
            self.commands.clone(),
            self.shared.cfg.poll_interval,
        ));
        let mut guard = self.shared.network_tasks.lock().await;
        guard.push(supervisor);
        guard.push(poll);
    }
}

pub(crate) struct ConversationEngine;

impl ConversationEngine {
    /// Restores state from the snapshot (if any), starts the worker that
    /// owns it, and brings up the live channel and poll loop.
    pub(crate) async fn spawn(
        conversation_id: ConversationId,
        deps: EngineDeps,
        cfg: EngineConfig,
    ) -> Result<ConversationHandle> {
        let device_user_id = deps.session.current_user_id();

        let state = match &deps.storage {
            Some(storage) => match storage.load_snapshot(&device_user_id, &conversation_id).await?
            {
                Some(snapshot) => {
                    info!(
                        conversation_id = %conversation_id,
                        messages = snapshot.messages.len(),
                        "restored conversation snapshot"
                    );
                    ConversationState::from_snapshot(
                        conversation_id.clone(),
                        snapshot.messages,
                        snapshot.last_known_at,
                        snapshot.last_sync_at,
                    )
                }
                None => ConversationState::new(conversation_id.clone()),
            },
            None => ConversationState::new(conversation_id.clone()),
        };

        let tombstones = match &deps.storage {
            Some(storage) => {
                TombstoneStore::load(
                    device_user_id.clone(),
                    conversation_id.clone(),
                    storage.clone(),
                )
                .await?
            }
            None => TombstoneStore::in_memory(device_user_id.clone(), conversation_id.clone()),
        };

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (events_tx, _) = broadcast::channel(EVENT_QUEUE_DEPTH);
        let reconciler = Reconciler::new(state);
        let (rendered_tx, rendered_rx) =
            watch::channel(reconciler.visible_messages(tombstones.hidden()));
        let live_sender: Arc<RwLock<Option<Arc<dyn LiveSender>>>> = Arc::new(RwLock::new(None));

        let worker = EngineWorker {
            cfg: cfg.clone(),
            conversation_id: conversation_id.clone(),
            device_user_id,
            reconciler,
            tombstones,
            presence: PresenceTracker::new(),
            sends: HashMap::new(),
            resync_inflight: false,
            resync_failures: 0,
            api: Arc::clone(&deps.api),
            live_sender: Arc::clone(&live_sender),
            storage: deps.storage.clone(),
            commands: commands_tx.clone(),
            rendered: rendered_tx,
            events: events_tx.clone(),
        };
        let worker_task = tokio::spawn(worker.run(commands_rx));

        let handle = ConversationHandle {
            conversation_id,
            commands: commands_tx,
            rendered: rendered_rx,
            events: events_tx,
            shared: Arc::new(HandleShared {
                live: deps.live,
                cfg,
                live_sender,
                network_tasks: tokio::sync::Mutex::new(Vec::new()),
                worker_task: tokio::sync::Mutex::new(Some(worker_task)),
            }),
        };
        handle.spawn_network_tasks().await;
        let _ = handle.request_resync(ResyncReason::Foreground).await;
        Ok(handle)
    }
}

/// Single serialized apply step: every mutation of the conversation state
/// happens inside this task, one command at a time.
struct EngineWorker {
    cfg: EngineConfig,
    conversation_id: ConversationId,
    device_user_id: UserId,
    reconciler: Reconciler,
    tombstones: TombstoneStore,
    presence: PresenceTracker,
    sends: HashMap<CorrelationId, SendTrack>,
    resync_inflight: bool,
    resync_failures: u32,
    api: Arc<dyn MessageApi>,
    live_sender: Arc<RwLock<Option<Arc<dyn LiveSender>>>>,
    storage: Option<Storage>,
    commands: mpsc::Sender<EngineCommand>,
    rendered: watch::Sender<Vec<Message>>,
    events: broadcast::Sender<ConversationEvent>,
}

impl EngineWorker {
    async fn run(mut self, mut commands: mpsc::Receiver<EngineCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                EngineCommand::Close { reply } => {
                    if let Err(err) = self.persist().await {
                        warn!(
                            conversation_id = %self.conversation_id,
                            "persist on close failed: {err:#}"
                        );
                    }
                    let _ = reply.send(());
                    break;
                }
                command => {
                    self.handle(command).await;
                    self.publish_rendered();
                }
            }
        }
        debug!(conversation_id = %self.conversation_id, "engine worker stopped");
    }

    async fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Ingest(event) => self.handle_ingest(event).await,
            EngineCommand::Submit { draft, reply } => {
                let _ = reply.send(self.handle_submit(draft));
            }
            EngineCommand::Retry {
                correlation_id,
                reply,
            } => {
                let _ = reply.send(self.handle_retry(correlation_id));
            }
            EngineCommand::HideLocal { message_id, reply } => {
                self.tombstones.hide(message_id).await;
                let _ = reply.send(());
            }
            EngineCommand::Unhide { message_id, reply } => {
                let _ = reply.send(self.tombstones.unhide(&message_id).await);
            }
            EngineCommand::RetractGlobal { message_id, reply } => {
                self.handle_retract_global(message_id);
                let _ = reply.send(());
            }
            EngineCommand::Resync { reason } => self.start_resync(reason),
            EngineCommand::ResyncFetched { reason, payloads } => {
                self.finish_resync(reason, payloads).await;
            }
            EngineCommand::ResyncFailed { reason, error } => {
                self.resync_inflight = false;
                self.resync_failures += 1;
                warn!(
                    conversation_id = %self.conversation_id,
                    reason = reason.label(),
                    consecutive_failures = self.resync_failures,
                    "catch-up fetch failed: {error}"
                );
                if self.resync_failures >= self.cfg.degraded_after_failures {
                    let _ = self.events.send(ConversationEvent::SyncDegraded {
                        consecutive_failures: self.resync_failures,
                    });
                }
            }
            EngineCommand::SendAccepted {
                correlation_id,
                transport,
            } => self.handle_send_accepted(correlation_id, transport),
            EngineCommand::SendFailed {
                correlation_id,
                history,
                auth,
            } => self.handle_send_failed(correlation_id, history, auth),
            EngineCommand::ConfirmTimeout { correlation_id } => {
                self.handle_confirm_timeout(correlation_id);
            }
            EngineCommand::LinkChanged(state) => self.handle_link_changed(state),
            EngineCommand::TypersTick => self.publish_typers(),
            EngineCommand::Persist { reply } => {
                let _ = reply.send(self.persist().await);
            }
            // Handled in `run` before dispatch.
            EngineCommand::Close { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn handle_ingest(&mut self, event: ChannelEvent) {
        let source = event.source;
        let routed = match route(event, &self.conversation_id) {
            Ok(Some(routed)) => routed,
            Ok(None) => return,
            Err(err) => {
                debug!(
                    conversation_id = %self.conversation_id,
                    source = ?source,
                    "dropping malformed event: {err:#}"
                );
                return;
            }
        };
        self.apply_routed(routed);
    }

    fn apply_routed(&mut self, routed: RoutedEvent) -> Option<ApplyOutcome> {
        match routed {
            RoutedEvent::Message(candidate) => {
                let outcome = self.reconciler.apply_inbound(candidate);
                match &outcome {
                    ApplyOutcome::Inserted(id) => {
                        if self.tombstones.take_buffered_retraction(id) {
                            self.reconciler.retract(id);
                            info!(
                                conversation_id = %self.conversation_id,
                                message_id = %id,
                                "applied buffered retraction on insert"
                            );
                        }
                    }
                    ApplyOutcome::Confirmed(id) => {
                        self.settle_confirmed_send(id.clone());
                        if self.tombstones.take_buffered_retraction(id) {
                            self.reconciler.retract(id);
                        }
                    }
                    ApplyOutcome::Duplicate(_) => {}
                }
                Some(outcome)
            }
            RoutedEvent::Retraction { message_id, .. } => {
                self.apply_retraction(message_id);
                None
            }
            RoutedEvent::Typing {
                user_id,
                display_name,
            } => {
                if user_id != self.device_user_id {
                    self.presence.on_typing(user_id, display_name);
                    self.publish_typers();
                    self.schedule_typers_tick();
                }
                None
            }
            RoutedEvent::StoppedTyping { user_id } => {
                self.presence.on_stopped_typing(&user_id);
                self.publish_typers();
                None
            }
            RoutedEvent::SendAck { correlation_id } => {
                debug!(
                    conversation_id = %self.conversation_id,
                    correlation_id = %correlation_id,
                    "transport acknowledged send"
                );
                None
            }
        }
    }

    fn settle_confirmed_send(&mut self, message_id: MessageId) {
        let Some(correlation_id) = self
            .reconciler
            .state()
            .get(&message_id)
            .and_then(|message| message.correlation_id.clone())
        else {
            return;
        };
        if self.sends.remove(&correlation_id).is_some() {
            info!(
                conversation_id = %self.conversation_id,
                correlation_id = %correlation_id,
                message_id = %message_id,
                "optimistic send confirmed"
            );
        }
    }

    fn apply_retraction(&mut self, message_id: MessageId) {
        match self.reconciler.retract(&message_id) {
            RetractOutcome::Applied => {
                info!(
                    conversation_id = %self.conversation_id,
                    message_id = %message_id,
                    "message retracted"
                );
            }
            RetractOutcome::AlreadyRetracted => {
                debug!(
                    conversation_id = %self.conversation_id,
                    message_id = %message_id,
                    "retraction was already applied"
                );
            }
            RetractOutcome::Missing => {
                debug!(
                    conversation_id = %self.conversation_id,
                    message_id = %message_id,
                    "buffering retraction for unseen message"
                );
                self.tombstones.buffer_retraction(message_id);
            }
        }
    }

    fn handle_submit(&mut self, draft: Draft) -> Result<CorrelationId, ChannelException> {
        let correlation_id =
            self.reconciler
                .submit(self.device_user_id.clone(), draft, Utc::now())?;
        self.start_send_attempts(correlation_id.clone());
        Ok(correlation_id)
    }

    fn handle_retry(&mut self, correlation_id: CorrelationId) -> bool {
        if !self.reconciler.mark_pending(&correlation_id) {
            return false;
        }
        self.start_send_attempts(correlation_id);
        true
    }

    fn start_send_attempts(&mut self, correlation_id: CorrelationId) {
        let Some(message) = self.reconciler.state().find_by_correlation(&correlation_id) else {
            return;
        };
        let outbound = OutboundMessage {
            correlation_id: correlation_id.clone(),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
            kind: message.kind,
            attachment: message.attachment.clone(),
            reply_to: message.reply_to.clone(),
            created_at: message.created_at,
        };
        self.sends.insert(
            correlation_id,
            SendTrack {
                accepted_transport: None,
            },
        );
        tokio::spawn(run_send_attempts(
            self.cfg.clone(),
            outbound,
            Arc::clone(&self.live_sender),
            Arc::clone(&self.api),
            self.commands.clone(),
        ));
    }

    fn handle_send_accepted(&mut self, correlation_id: CorrelationId, transport: TransportKind) {
        let Some(track) = self.sends.get_mut(&correlation_id) else {
            return;
        };
        track.accepted_transport = Some(transport);
        debug!(
            conversation_id = %self.conversation_id,
            correlation_id = %correlation_id,
            transport = transport.label(),
            "send accepted; awaiting canonical confirmation"
        );
        let commands = self.commands.clone();
        let confirm_timeout = self.cfg.confirm_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(confirm_timeout).await;
            let _ = commands
                .send(EngineCommand::ConfirmTimeout { correlation_id })
                .await;
        });
    }

    fn handle_send_failed(
        &mut self,
        correlation_id: CorrelationId,
        history: Vec<TransportAttempt>,
        auth: bool,
    ) {
        if self.sends.remove(&correlation_id).is_none() {
            return;
        }
        if !self.reconciler.fail(&correlation_id) {
            return;
        }
        let reason = history
            .last()
            .map(|attempt| format!("{}: {}", attempt.transport.label(), attempt.error))
            .unwrap_or_else(|| "no transport available".to_string());
        warn!(
            conversation_id = %self.conversation_id,
            correlation_id = %correlation_id,
            attempts = history.len(),
            "send failed after exhausting transports: {reason}"
        );
        if auth {
            let _ = self.events.send(ConversationEvent::AuthRequired {
                context: "send".to_string(),
            });
        }
        let _ = self.events.send(ConversationEvent::MessageFailed {
            correlation_id,
            reason,
        });
    }

    fn handle_confirm_timeout(&mut self, correlation_id: CorrelationId) {
        // A confirmation may have settled the send while the timer slept.
        let Some(track) = self.sends.remove(&correlation_id) else {
            return;
        };
        if self.reconciler.fail(&correlation_id) {
            let transport = track
                .accepted_transport
                .map(TransportKind::label)
                .unwrap_or("unknown");
            warn!(
                conversation_id = %self.conversation_id,
                correlation_id = %correlation_id,
                transport,
                "no canonical confirmation arrived in time"
            );
            let _ = self.events.send(ConversationEvent::MessageFailed {
                correlation_id,
                reason: format!("confirmation timed out after acceptance on {transport}"),
            });
        }
    }

    fn handle_retract_global(&mut self, message_id: MessageId) {
        self.apply_retraction(message_id.clone());
        let api = Arc::clone(&self.api);
        let conversation_id = self.conversation_id.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut delay = Duration::from_millis(500);
            for attempt in 1..=RETRACT_API_ATTEMPTS {
                match api.delete_message(&conversation_id, &message_id).await {
                    Ok(()) => return,
                    Err(err) => match error_code(&err) {
                        ErrorCode::Auth => {
                            let _ = events.send(ConversationEvent::AuthRequired {
                                context: "retract".to_string(),
                            });
                            return;
                        }
                        ErrorCode::Conflict => return,
                        _ if attempt < RETRACT_API_ATTEMPTS => {
                            tokio::time::sleep(delay).await;
                            delay *= 2;
                        }
                        _ => {
                            warn!(
                                conversation_id = %conversation_id,
                                message_id = %message_id,
                                "server retraction not acknowledged: {err:#}"
                            );
                        }
                    },
                }
            }
        });
    }

    fn start_resync(&mut self, reason: ResyncReason) {
        if self.resync_inflight {
            debug!(
                conversation_id = %self.conversation_id,
                reason = reason.label(),
                "catch-up already in flight; skipping duplicate trigger"
            );
            return;
        }
        self.resync_inflight = true;
        let since = since_cursor(self.reconciler.state().last_known_at);
        let api = Arc::clone(&self.api);
        let conversation_id = self.conversation_id.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = api.poll_messages(&conversation_id, since).await;
            let command = match result {
                Ok(payloads) => EngineCommand::ResyncFetched { reason, payloads },
                Err(err) => EngineCommand::ResyncFailed {
                    reason,
                    error: format!("{err:#}"),
                },
            };
            let _ = commands.send(command).await;
        });
    }

    async fn finish_resync(&mut self, reason: ResyncReason, payloads: Vec<serde_json::Value>) {
        self.resync_inflight = false;
        self.resync_failures = 0;

        let mut outcome = ResyncOutcome {
            fetched: payloads.len(),
            ..ResyncOutcome::default()
        };
        for payload in payloads {
            let event = ChannelEvent::new(ChannelSource::Poll, LiveFrame::new("message", payload));
            match route(event, &self.conversation_id) {
                Ok(Some(routed)) => {
                    if let Some(applied) = self.apply_routed(routed) {
                        outcome.record(&applied);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    outcome.rejected += 1;
                    debug!(
                        conversation_id = %self.conversation_id,
                        "dropping malformed poll payload: {err:#}"
                    );
                }
            }
        }

        self.reconciler.state_mut().last_sync_at = Some(Utc::now());
        info!(
            conversation_id = %self.conversation_id,
            reason = reason.label(),
            fetched = outcome.fetched,
            inserted = outcome.inserted,
            confirmed = outcome.confirmed,
            duplicates = outcome.duplicates,
            "catch-up merge complete"
        );
        if let Err(err) = self.persist().await {
            warn!(
                conversation_id = %self.conversation_id,
                "persist after catch-up failed: {err:#}"
            );
        }
        let _ = self
            .events
            .send(ConversationEvent::ResyncCompleted { reason, outcome });
    }

    fn handle_link_changed(&mut self, state: LinkState) {
        info!(
            conversation_id = %self.conversation_id,
            state = ?state,
            "live channel state changed"
        );
        if state == LinkState::Connected {
            // Typing state is not replayed by the server; rebuild from scratch.
            self.presence.clear();
            self.publish_typers();
            self.start_resync(ResyncReason::Reconnected);
        }
        let _ = self.events.send(ConversationEvent::LinkChanged(state));
    }

    fn publish_typers(&mut self) {
        let names = self.presence.active_typers();
        let _ = self
            .events
            .send(ConversationEvent::TypingChanged { names });
    }

    fn schedule_typers_tick(&self) {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(crate::presence::TYPING_TTL + Duration::from_millis(100)).await;
            let _ = commands.send(EngineCommand::TypersTick).await;
        });
    }

    fn publish_rendered(&self) {
        self.rendered
            .send_replace(self.reconciler.visible_messages(self.tombstones.hidden()));
    }

    async fn persist(&self) -> Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let state = self.reconciler.state();
        let snapshot = ConversationSnapshot {
            conversation_id: self.conversation_id.clone(),
            messages: state.messages().cloned().collect(),
            last_known_at: state.last_known_at,
            last_sync_at: state.last_sync_at,
        };
        storage.save_snapshot(&self.device_user_id, &snapshot).await
    }
}

fn send_timeout_for(cfg: &EngineConfig, outbound: &OutboundMessage) -> Duration {
    let attachment_mib = outbound
        .attachment
        .as_ref()
        .map(|a| a.size_bytes / (1024 * 1024))
        .unwrap_or(0);
    cfg.send_timeout + cfg.send_timeout_per_mib * attachment_mib.min(u32::MAX as u64) as u32
}

/// Transport ladder for one optimistic send: bounded attempts on the live
/// channel, then the HTTP fallback, then failure.
async fn run_send_attempts(
    cfg: EngineConfig,
    outbound: OutboundMessage,
    live_sender: Arc<RwLock<Option<Arc<dyn LiveSender>>>>,
    api: Arc<dyn MessageApi>,
    commands: mpsc::Sender<EngineCommand>,
) {
    let correlation_id = outbound.correlation_id.clone();
    let send_timeout = send_timeout_for(&cfg, &outbound);
    let mut history: Vec<TransportAttempt> = Vec::new();
    let mut auth = false;

    'live: for attempt in 1..=cfg.send_attempts {
        let Some(sender) = live_sender.read().await.clone() else {
            // Link is down; go straight to the fallback transport.
            break 'live;
        };
        match timeout(send_timeout, sender.send_message(&outbound)).await {
            Ok(Ok(())) => {
                let _ = commands
                    .send(EngineCommand::SendAccepted {
                        correlation_id,
                        transport: TransportKind::Live,
                    })
                    .await;
                return;
            }
            Ok(Err(err)) => {
                let code = error_code(&err);
                history.push(TransportAttempt {
                    transport: TransportKind::Live,
                    error: format!("{err:#}"),
                });
                if code == ErrorCode::Auth {
                    auth = true;
                    break 'live;
                }
                if !code.is_retryable() {
                    break 'live;
                }
            }
            Err(_) => {
                history.push(TransportAttempt {
                    transport: TransportKind::Live,
                    error: "timed out".to_string(),
                });
            }
        }
        if attempt < cfg.send_attempts {
            tokio::time::sleep(cfg.send_retry_delay * attempt).await;
        }
    }

    if !auth {
        'http: for attempt in 1..=cfg.send_attempts {
            match timeout(send_timeout, api.send_message(&outbound)).await {
                Ok(Ok(())) => {
                    let _ = commands
                        .send(EngineCommand::SendAccepted {
                            correlation_id,
                            transport: TransportKind::Http,
                        })
                        .await;
                    return;
                }
                Ok(Err(err)) => {
                    let code = error_code(&err);
                    history.push(TransportAttempt {
                        transport: TransportKind::Http,
                        error: format!("{err:#}"),
                    });
                    if code == ErrorCode::Auth {
                        auth = true;
                        break 'http;
                    }
                    if !code.is_retryable() {
                        break 'http;
                    }
                }
                Err(_) => {
                    history.push(TransportAttempt {
                        transport: TransportKind::Http,
                        error: "timed out".to_string(),
                    });
                }
            }
            if attempt < cfg.send_attempts {
                tokio::time::sleep(cfg.send_retry_delay * attempt).await;
            }
        }
    }

    let _ = commands
        .send(EngineCommand::SendFailed {
            correlation_id,
            history,
            auth,
        })
        .await;
}

/// Connection health loop: `Disconnected → Connecting → Connected → Degraded
/// → Reconnecting → Connected`, with jittered exponential backoff and no
/// retry limit.
async fn run_link_supervisor(
    channel: Arc<dyn LiveChannel>,
    conversation_id: ConversationId,
    live_sender: Arc<RwLock<Option<Arc<dyn LiveSender>>>>,
    commands: mpsc::Sender<EngineCommand>,
    cfg: EngineConfig,
) {
    let mut backoff = Backoff::new(cfg.reconnect_base, cfg.reconnect_cap);
    let mut first_attempt = true;

    loop {
        let connecting_state = if first_attempt {
            LinkState::Connecting
        } else {
            LinkState::Reconnecting
        };
        first_attempt = false;
        if commands
            .send(EngineCommand::LinkChanged(connecting_state))
            .await
            .is_err()
        {
            return;
        }

        match channel.connect().await {
            Ok((sender, mut receiver)) => {
                let sender: Arc<dyn LiveSender> = Arc::from(sender);
                if let Err(err) = sender.subscribe(&conversation_id).await {
                    warn!(
                        conversation_id = %conversation_id,
                        "room subscribe failed: {err:#}"
                    );
                } else {
                    *live_sender.write().await = Some(Arc::clone(&sender));
                    backoff.reset();
                    if commands
                        .send(EngineCommand::LinkChanged(LinkState::Connected))
                        .await
                        .is_err()
                    {
                        return;
                    }

                    let mut missed_heartbeat = false;
                    loop {
                        match timeout(cfg.heartbeat_timeout, receiver.next_frame()).await {
                            Ok(Ok(Some(frame))) => {
                                if missed_heartbeat {
                                    missed_heartbeat = false;
                                    let _ = commands
                                        .send(EngineCommand::LinkChanged(LinkState::Connected))
                                        .await;
                                }
                                let event = ChannelEvent::new(ChannelSource::Live, frame);
                                if commands.send(EngineCommand::Ingest(event)).await.is_err() {
                                    return;
                                }
                            }
                            Ok(Ok(None)) => {
                                warn!(conversation_id = %conversation_id, "live channel closed");
                                break;
                            }
                            Ok(Err(err)) => {
                                warn!(
                                    conversation_id = %conversation_id,
                                    "live channel receive failed: {err:#}"
                                );
                                break;
                            }
                            Err(_) => {
                                if missed_heartbeat {
                                    warn!(
                                        conversation_id = %conversation_id,
                                        "second heartbeat miss; reconnecting"
                                    );
                                    break;
                                }
                                missed_heartbeat = true;
                                let _ = commands
                                    .send(EngineCommand::LinkChanged(LinkState::Degraded))
                                    .await;
                            }
                        }
                    }
                    live_sender.write().await.take();
                }
            }
            Err(err) => {
                debug!(
                    conversation_id = %conversation_id,
                    "live channel connect failed: {err:#}"
                );
            }
        }

        if commands.is_closed() {
            return;
        }
        tokio::time::sleep(backoff.next_delay()).await;
    }
}

/// Redundant fixed-interval catch-up, independent of live-channel health, so
/// a degraded channel cannot cause silent message loss.
async fn run_poll_loop(commands: mpsc::Sender<EngineCommand>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if commands
            .send(EngineCommand::Resync {
                reason: ResyncReason::Interval,
            })
            .await
            .is_err()
        {
            return;
        }
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
