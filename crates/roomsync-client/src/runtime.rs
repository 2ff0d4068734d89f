//! Sync runtime task.
//!
//! The runtime owns the [`SyncEngine`] and drives its event loop:
//!
//! 1. Receives commands from [`SyncHandle`]s and, on a separate channel,
//!    feedback from collaborator callbacks and tasks
//! 2. Feeds them to the engine as [`SyncEvent`]s
//! 3. Executes the resulting [`SyncAction`]s (subscriptions, fetches,
//!    publishes, observer notifications)
//! 4. Sleeps until the engine's next timer and delivers a tick
//!
//! History fetches and mark-read calls run in their own tasks and report
//! back through the feedback channel, so a slow server never blocks the loop.
//! Feedback is drained before commands, so a handle always observes the
//! effects of collaborator callbacks that fired before its request. Only
//! handles hold command senders: the loop ends once the last one is dropped.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use roomsync_core::{
    Environment, LoadFailure, LoadStatus, RequestId, RoomId, SessionPhase, SyncAction, SyncConfig,
    SyncEngine, SyncError, SyncEvent, UserId,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::FetchError,
    handle::{RoomView, SyncHandle},
    observer::{ErrorObserver, LoadStateObserver, MessagesObserver, Observers},
    transport::{
        ConnectionSignal, EnvelopeHandler, HistoryFetcher, ReadReceiptApi, SignalHandler,
        Transport,
    },
};

/// How long the loop sleeps when the engine has no pending timer.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Collaborators the runtime executes actions against.
#[derive(Clone)]
pub struct Services {
    /// Publish/subscribe transport.
    pub transport: Arc<dyn Transport>,
    /// History API.
    pub history: Arc<dyn HistoryFetcher>,
    /// Read-receipt API.
    pub receipts: Arc<dyn ReadReceiptApi>,
}

/// Observer registration request.
pub(crate) enum Registration {
    Messages(MessagesObserver),
    Errors(ErrorObserver),
    LoadState(LoadStateObserver),
}

/// Input of the runtime loop.
pub(crate) enum Command<I> {
    /// Room selection; resolves once the transition settles or is superseded.
    Select { room_id: Option<RoomId>, reply: oneshot::Sender<bool> },
    /// UI intent; resolves once the engine accepted or rejected it.
    Intent { event: SyncEvent<I>, reply: oneshot::Sender<Result<(), SyncError>> },
    /// Observer registration.
    Observe(Registration),
    /// Read-only view of the active room.
    Snapshot { reply: oneshot::Sender<Option<RoomView>> },
}

/// Runtime owning one [`SyncEngine`].
pub struct SyncRuntime<E: Environment> {
    env: E,
    engine: SyncEngine<E>,
    services: Services,
    observers: Observers,
    commands: mpsc::UnboundedReceiver<Command<E::Instant>>,
    feedback: mpsc::UnboundedSender<SyncEvent<E::Instant>>,
    feedback_rx: mpsc::UnboundedReceiver<SyncEvent<E::Instant>>,
    shutdown: CancellationToken,

    /// Cancellation token per in-flight fetch.
    fetches: HashMap<RequestId, CancellationToken>,

    /// Select replies waiting for their transition to settle.
    pending_selects: HashMap<u64, oneshot::Sender<bool>>,

    /// Reply of the select being processed, until its transition id is known.
    select_reply: Option<oneshot::Sender<bool>>,
}

impl<E: Environment> SyncRuntime<E> {
    /// Create a runtime and its handle without starting it.
    pub fn new(
        env: E,
        current_user: UserId,
        config: SyncConfig,
        services: Services,
    ) -> (Self, SyncHandle<E::Instant>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (feedback, feedback_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let engine = SyncEngine::new(env.clone(), current_user, config);

        let runtime = Self {
            env,
            engine,
            services,
            observers: Observers::new(),
            commands: rx,
            feedback,
            feedback_rx,
            shutdown: shutdown.clone(),
            fetches: HashMap::new(),
            pending_selects: HashMap::new(),
            select_reply: None,
        };
        (runtime, SyncHandle::new(tx, shutdown))
    }

    /// Create a runtime and run it on the current tokio runtime.
    pub fn spawn(
        env: E,
        current_user: UserId,
        config: SyncConfig,
        services: Services,
    ) -> (SyncHandle<E::Instant>, JoinHandle<()>) {
        let (runtime, handle) = Self::new(env, current_user, config, services);
        (handle, tokio::spawn(runtime.run()))
    }

    /// Run the event loop until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        self.connect().await;

        loop {
            let env = self.env.clone();
            let timer = self.engine.next_timer(env.now());
            let wait = timer.unwrap_or(IDLE_WAIT);

            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                Some(event) = self.feedback_rx.recv() => self.on_feedback(event).await,
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                () = env.sleep(wait), if timer.is_some() => {
                    let now = env.now();
                    if let Err(e) = self.process(SyncEvent::Tick { now }).await {
                        tracing::warn!("Tick rejected: {e}");
                    }
                },
            }
        }

        for token in self.fetches.values() {
            token.cancel();
        }
        for (_, reply) in self.pending_selects.drain() {
            let _ = reply.send(false);
        }
        if let Some(topic) = self.engine.session().subscription().map(str::to_string) {
            self.services.transport.unsubscribe(&topic).await;
        }
        tracing::info!("sync runtime stopped");
    }

    async fn connect(&mut self) {
        let tx = self.feedback.clone();
        let on_signal: SignalHandler = Arc::new(move |signal| {
            let event = match signal {
                ConnectionSignal::Connected => SyncEvent::Connected,
                ConnectionSignal::Disconnected => SyncEvent::Disconnected,
                ConnectionSignal::Error(reason) => {
                    tracing::warn!(%reason, "transport error");
                    SyncEvent::Disconnected
                },
            };
            let _ = tx.send(event);
        });

        if let Err(e) = self.services.transport.connect(on_signal).await {
            tracing::error!("Transport connect failed: {e}");
        }
    }

    async fn on_command(&mut self, command: Command<E::Instant>) {
        match command {
            Command::Select { room_id, reply } => {
                self.select_reply = Some(reply);
                if let Err(e) = self.process(SyncEvent::SelectRoom { room_id }).await {
                    tracing::warn!("Room selection rejected: {e}");
                }
                if let Some(reply) = self.select_reply.take() {
                    let _ = reply.send(false);
                }
            },
            Command::Intent { event, reply } => {
                let result = self.process(event).await;
                if let Err(e) = &result {
                    tracing::debug!("Intent rejected: {e}");
                }
                let _ = reply.send(result);
            },
            Command::Observe(registration) => match registration {
                Registration::Messages(observer) => self.observers.add_messages(observer),
                Registration::Errors(observer) => self.observers.add_errors(observer),
                Registration::LoadState(observer) => self.observers.add_load_state(observer),
            },
            Command::Snapshot { reply } => {
                let _ = reply.send(self.view());
            },
        }
    }

    async fn on_feedback(&mut self, event: SyncEvent<E::Instant>) {
        if let SyncEvent::PageLoaded { request, .. } | SyncEvent::PageFailed { request, .. } = &event {
            self.fetches.remove(request);
        }
        if let Err(e) = self.process(event).await {
            tracing::warn!("Feedback rejected: {e}");
        }
    }

    /// Feed one event to the engine and execute everything that follows.
    ///
    /// Only the first event's rejection is returned; follow-up events
    /// produced while executing actions are logged when rejected.
    async fn process(&mut self, event: SyncEvent<E::Instant>) -> Result<(), SyncError> {
        let mut pending: VecDeque<SyncAction> = self.engine.handle(event)?.into();

        while let Some(action) = pending.pop_front() {
            if let Some(follow_up) = self.execute(action).await {
                match self.engine.handle(follow_up) {
                    Ok(actions) => pending.extend(actions),
                    Err(e) => tracing::warn!("Follow-up event rejected: {e}"),
                }
            }
        }
        Ok(())
    }

    async fn execute(&mut self, action: SyncAction) -> Option<SyncEvent<E::Instant>> {
        match action {
            SyncAction::Subscribe { topic, room_id } => {
                let tx = self.feedback.clone();
                let routed = topic.clone();
                let handler: EnvelopeHandler = Arc::new(move |envelope| {
                    let event = SyncEvent::Envelope { topic: routed.clone(), envelope };
                    let _ = tx.send(event);
                });

                match self.services.transport.subscribe(&topic, handler).await {
                    Some(subscription) => {
                        tracing::debug!(room = %room_id, %topic, id = subscription.id, "subscribed");
                    },
                    None => tracing::warn!(room = %room_id, %topic, "subscribe failed"),
                }
                None
            },
            SyncAction::Unsubscribe { topic } => {
                self.services.transport.unsubscribe(&topic).await;
                None
            },
            SyncAction::FetchPage { request, room_id, page, size } => {
                self.spawn_fetch(request, room_id, page, size);
                None
            },
            SyncAction::CancelFetch { request } => {
                if let Some(token) = self.fetches.remove(&request) {
                    token.cancel();
                }
                None
            },
            SyncAction::Publish { destination, envelope, temp_id } => {
                if self.services.transport.send(&destination, &envelope).await {
                    return None;
                }
                tracing::warn!(%destination, action = ?envelope.action, "transport refused publish");
                temp_id.map(|temp_id| SyncEvent::PublishRejected { temp_id })
            },
            SyncAction::PostMarkRead { room_id, user_id } => {
                self.spawn_mark_read(room_id, user_id);
                None
            },
            SyncAction::MessagesChanged { room_id, messages } => {
                self.observers.messages_changed(room_id.as_ref(), &messages);
                None
            },
            SyncAction::LoadStateChanged { room_id, status, has_more } => {
                self.observers.load_state_changed(&room_id, &status, has_more);
                None
            },
            SyncAction::RoomSyncError { room_id, error } => {
                self.observers.sync_error(&room_id, &error);
                None
            },
            SyncAction::TransitionStarted { transition, .. } => {
                if let Some(reply) = self.select_reply.take() {
                    self.pending_selects.insert(transition, reply);
                }
                None
            },
            SyncAction::TransitionSettled { transition } => {
                self.resolve_select(transition, true);
                None
            },
            SyncAction::TransitionAborted { transition } => {
                self.resolve_select(transition, false);
                None
            },
        }
    }

    fn spawn_fetch(&mut self, request: RequestId, room_id: RoomId, page: u32, size: u32) {
        let token = CancellationToken::new();
        self.fetches.insert(request, token.clone());
        let history = Arc::clone(&self.services.history);
        let tx = self.feedback.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                result = history.fetch_page(&room_id, page, size, token.clone()) => result,
                () = token.cancelled() => Err(FetchError::Cancelled),
            };

            let event = match result {
                Ok(page) => SyncEvent::PageLoaded { request, room_id, items: page.items },
                Err(FetchError::Cancelled) => {
                    SyncEvent::PageFailed { request, room_id, failure: LoadFailure::Cancelled }
                },
                Err(e) => SyncEvent::PageFailed {
                    request,
                    room_id,
                    failure: LoadFailure::Transient(e.to_string()),
                },
            };
            let _ = tx.send(event);
        });
    }

    fn spawn_mark_read(&self, room_id: RoomId, user_id: UserId) {
        let receipts = Arc::clone(&self.services.receipts);
        let tx = self.feedback.clone();

        tokio::spawn(async move {
            let success = match receipts.mark_read(&user_id, &room_id).await {
                Ok(response) => response.success,
                Err(e) => {
                    tracing::warn!(room = %room_id, "Mark-read call failed: {e}");
                    false
                },
            };
            let _ = tx.send(SyncEvent::MarkReadCompleted { room_id, success });
        });
    }

    fn resolve_select(&mut self, transition: u64, settled: bool) {
        if let Some(reply) = self.pending_selects.remove(&transition) {
            let _ = reply.send(settled);
        }
    }

    fn view(&self) -> Option<RoomView> {
        let state = self.engine.active_state()?;
        Some(RoomView {
            room_id: state.room_id.clone(),
            messages: state.messages.clone(),
            status: LoadStatus::of(state),
            has_more: state.has_more,
            page: state.page,
            retry_count: state.retry_count,
            transitioning: matches!(self.engine.phase(), SessionPhase::Transitioning { .. }),
            connected: self.engine.is_connected(),
        })
    }
}
