//! Synchronous simulation driver.
//!
//! `SimDriver` owns a [`SyncEngine`] on virtual time and executes its actions
//! against an in-memory [`SimServer`](crate::SimServer) without any async
//! runtime. Server responses are held back until the test releases them, so
//! every interleaving of fetch results, push deliveries, mark-read completions
//! and clock advances can be reproduced step by step.

use std::{collections::VecDeque, time::Duration};

use roomsync_core::{
    Envelope, LoadFailure, LoadStatus, Message, RequestId, RoomId, SyncAction, SyncConfig,
    SyncEngine, SyncError, SyncEvent, UserId,
};

use crate::{
    invariants::{ClientSnapshot, InvariantRegistry, SystemSnapshot},
    sim_env::{SimEnv, SimInstant},
    sim_server::{SharedSimServer, create_shared_server},
};

/// A fetch the engine requested and the driver has not answered yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFetch {
    /// Request id.
    pub request: RequestId,
    /// Room.
    pub room_id: RoomId,
    /// Page.
    pub page: u32,
    /// Page size.
    pub size: u32,
}

/// Simulation driver for deterministic engine tests.
pub struct SimDriver {
    env: SimEnv,
    engine: SyncEngine<SimEnv>,
    server: SharedSimServer,
    invariants: Option<InvariantRegistry>,
    context: String,

    subscription: Option<String>,
    connected: bool,
    refuse_sends: bool,

    fetches: VecDeque<PendingFetch>,
    fetch_count: usize,
    mark_reads: VecDeque<RoomId>,
    deliveries: VecDeque<(String, Envelope)>,

    visible: Vec<Message>,
    published: Vec<(String, Envelope)>,
    errors: Vec<(RoomId, SyncError)>,
    load_states: Vec<(RoomId, LoadStatus, bool)>,
    settled: Vec<u64>,
    aborted: Vec<u64>,
    steps: usize,
}

impl std::fmt::Debug for SimDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimDriver")
            .field("elapsed", &self.env.elapsed())
            .field("active", &self.engine.active_room())
            .field("pending_fetches", &self.fetches.len())
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

impl SimDriver {
    /// Driver for `user` with a fresh server, connected.
    pub fn new(user: &str, config: SyncConfig) -> Self {
        let env = SimEnv::new();
        // Start an hour in so seeded history has room before "now".
        env.advance(Duration::from_secs(3600));
        let server = create_shared_server(&env);
        Self::with_server(env, server, user, config)
    }

    /// Driver sharing `env` and `server`, e.g. a second client of the same
    /// server.
    pub fn with_server(env: SimEnv, server: SharedSimServer, user: &str, config: SyncConfig) -> Self {
        let engine = SyncEngine::new(env.clone(), UserId::from(user), config);
        let mut driver = Self {
            env,
            engine,
            server,
            invariants: None,
            context: String::new(),
            subscription: None,
            connected: false,
            refuse_sends: false,
            fetches: VecDeque::new(),
            fetch_count: 0,
            mark_reads: VecDeque::new(),
            deliveries: VecDeque::new(),
            visible: Vec::new(),
            published: Vec::new(),
            errors: Vec::new(),
            load_states: Vec::new(),
            settled: Vec::new(),
            aborted: Vec::new(),
            steps: 0,
        };
        driver.set_connected(true);
        driver
    }

    /// Enable invariant checking after every step.
    #[must_use]
    pub fn with_invariants(mut self, registry: InvariantRegistry) -> Self {
        self.invariants = Some(registry);
        self
    }

    /// Label included in invariant failures.
    pub fn set_context(&mut self, context: impl Into<String>) {
        self.context = context.into();
    }

    /// Virtual clock.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Engine under test.
    pub fn engine(&self) -> &SyncEngine<SimEnv> {
        &self.engine
    }

    /// Backing server.
    pub fn server(&self) -> &SharedSimServer {
        &self.server
    }

    /// Feed one event and execute the resulting actions.
    pub fn dispatch(&mut self, event: SyncEvent<SimInstant>) -> Result<(), SyncError> {
        let actions = self.engine.handle(event)?;
        let mut pending: VecDeque<_> = actions.into();

        while let Some(action) = pending.pop_front() {
            if let Some(follow_up) = self.execute(action) {
                match self.engine.handle(follow_up) {
                    Ok(actions) => pending.extend(actions),
                    Err(e) => tracing::warn!("Follow-up event rejected: {e}"),
                }
            }
        }

        self.steps += 1;
        self.check_invariants();
        Ok(())
    }

    /// Select a room and let the transition settle.
    pub fn open(&mut self, room: &str) {
        let _ = self.dispatch(SyncEvent::SelectRoom { room_id: Some(RoomId::from(room)) });
        self.advance(self.engine.config().settle_delay);
    }

    /// Send a text message.
    pub fn send(&mut self, content: &str) -> Result<(), SyncError> {
        self.dispatch(SyncEvent::SendMessage { content: content.to_string(), reply_to: None })
    }

    /// Move virtual time forward and deliver a tick.
    pub fn advance(&mut self, by: Duration) {
        self.env.advance(by);
        let now = roomsync_core::Environment::now(&self.env);
        let _ = self.dispatch(SyncEvent::Tick { now });
    }

    /// Answer every pending fetch from the server. Returns how many.
    pub fn respond_fetches(&mut self) -> usize {
        let mut answered = 0;
        while let Some(fetch) = self.fetches.pop_front() {
            let items = self.server.lock().page(&fetch.room_id, fetch.page, fetch.size);
            let _ = self.dispatch(SyncEvent::PageLoaded {
                request: fetch.request,
                room_id: fetch.room_id,
                items,
            });
            answered += 1;
        }
        answered
    }

    /// Fail every pending fetch. Returns how many.
    pub fn fail_fetches(&mut self, reason: &str) -> usize {
        let mut failed = 0;
        while let Some(fetch) = self.fetches.pop_front() {
            let _ = self.dispatch(SyncEvent::PageFailed {
                request: fetch.request,
                room_id: fetch.room_id,
                failure: LoadFailure::Transient(reason.to_string()),
            });
            failed += 1;
        }
        failed
    }

    /// Answer a fetch that was already cancelled, as a slow server would.
    pub fn respond_stale(&mut self, fetch: PendingFetch) {
        let items = self.server.lock().page(&fetch.room_id, fetch.page, fetch.size);
        let _ = self.dispatch(SyncEvent::PageLoaded {
            request: fetch.request,
            room_id: fetch.room_id,
            items,
        });
    }

    /// Another user posts to `room`. The push is queued for [`Self::deliver`].
    pub fn post(&mut self, room: &str, sender: &str, content: &str) {
        let room_id = RoomId::from(room);
        let envelope = self.server.lock().post(&room_id, &UserId::from(sender), content);
        self.queue_delivery(&room_id, envelope);
    }

    /// Queue a server broadcast on `room`'s topic, e.g. fan-out from another
    /// client's publish.
    pub fn inject(&mut self, room: &str, envelope: Envelope) {
        self.queue_delivery(&RoomId::from(room), envelope);
    }

    /// Deliver every queued push to the engine. Returns how many.
    pub fn deliver(&mut self) -> usize {
        let mut delivered = 0;
        while let Some((topic, envelope)) = self.deliveries.pop_front() {
            if self.subscription.as_deref() == Some(topic.as_str()) {
                let _ = self.dispatch(SyncEvent::Envelope { topic, envelope });
                delivered += 1;
            }
        }
        delivered
    }

    /// Complete every pending mark-read call.
    pub fn complete_mark_reads(&mut self, success: bool) -> usize {
        let mut completed = 0;
        while let Some(room_id) = self.mark_reads.pop_front() {
            if success {
                let user = self.engine.current_user().clone();
                let envelope = self.server.lock().mark_read(&user, &room_id);
                self.queue_delivery(&room_id, envelope);
            }
            let _ = self.dispatch(SyncEvent::MarkReadCompleted { room_id, success });
            completed += 1;
        }
        completed
    }

    /// Drop or restore the connection. Dropping it loses the subscription.
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
        if !connected {
            self.subscription = None;
        }
        let event = if connected { SyncEvent::Connected } else { SyncEvent::Disconnected };
        let _ = self.dispatch(event);
    }

    /// Refuse publishes while set.
    pub fn refuse_sends(&mut self, refuse: bool) {
        self.refuse_sends = refuse;
    }

    /// Unanswered fetches.
    pub fn pending_fetches(&self) -> &VecDeque<PendingFetch> {
        &self.fetches
    }

    /// Remove and return the oldest unanswered fetch.
    pub fn take_fetch(&mut self) -> Option<PendingFetch> {
        self.fetches.pop_front()
    }

    /// Fetches issued since the driver was created.
    pub fn fetch_count(&self) -> usize {
        self.fetch_count
    }

    /// Mark-read calls awaiting completion.
    pub fn pending_mark_reads(&self) -> usize {
        self.mark_reads.len()
    }

    /// Last list reported through `MessagesChanged`.
    pub fn visible(&self) -> &[Message] {
        &self.visible
    }

    /// Publishes the server accepted.
    pub fn published(&self) -> &[(String, Envelope)] {
        &self.published
    }

    /// Errors reported to the user.
    pub fn errors(&self) -> &[(RoomId, SyncError)] {
        &self.errors
    }

    /// Load-state notifications.
    pub fn load_states(&self) -> &[(RoomId, LoadStatus, bool)] {
        &self.load_states
    }

    /// Transitions that settled.
    pub fn settled(&self) -> &[u64] {
        &self.settled
    }

    /// Transitions that were superseded.
    pub fn aborted(&self) -> &[u64] {
        &self.aborted
    }

    /// Topic the driver is subscribed to.
    pub fn subscription(&self) -> Option<&str> {
        self.subscription.as_deref()
    }

    /// Observable state for invariant checks.
    pub fn snapshot(&self) -> SystemSnapshot {
        SystemSnapshot::single(ClientSnapshot::from_engine(0, &self.engine))
    }

    fn check_invariants(&self) {
        if let Some(registry) = &self.invariants {
            let context = format!("after step {} {}", self.steps, self.context);
            registry.assert_all(&self.snapshot(), &context);
        }
    }

    fn queue_delivery(&mut self, room_id: &RoomId, envelope: Envelope) {
        let topic = self.engine.config().topic_for(room_id);
        self.deliveries.push_back((topic, envelope));
    }

    fn execute(&mut self, action: SyncAction) -> Option<SyncEvent<SimInstant>> {
        match action {
            SyncAction::Subscribe { topic, .. } => {
                if self.connected {
                    self.subscription = Some(topic);
                }
            },
            SyncAction::Unsubscribe { topic } => {
                if self.subscription.as_deref() == Some(topic.as_str()) {
                    self.subscription = None;
                }
            },
            SyncAction::FetchPage { request, room_id, page, size } => {
                self.fetch_count += 1;
                self.fetches.push_back(PendingFetch { request, room_id, page, size });
            },
            SyncAction::CancelFetch { request } => {
                self.fetches.retain(|f| f.request != request);
            },
            SyncAction::Publish { destination, envelope, temp_id } => {
                if !self.connected || self.refuse_sends {
                    return temp_id.map(|temp_id| SyncEvent::PublishRejected { temp_id });
                }
                self.published.push((destination.clone(), envelope.clone()));

                let prefix = &self.engine.config().destination_prefix;
                if let Some(room) = destination.strip_prefix(prefix.as_str()) {
                    let room_id = RoomId::from(room);
                    let broadcast = self.server.lock().publish(&room_id, &envelope);
                    if let Some(broadcast) = broadcast {
                        self.queue_delivery(&room_id, broadcast);
                    }
                }
            },
            SyncAction::PostMarkRead { room_id, .. } => self.mark_reads.push_back(room_id),
            SyncAction::MessagesChanged { messages, .. } => self.visible = messages,
            SyncAction::LoadStateChanged { room_id, status, has_more } => {
                self.load_states.push((room_id, status, has_more));
            },
            SyncAction::RoomSyncError { room_id, error } => self.errors.push((room_id, error)),
            SyncAction::TransitionStarted { .. } => {},
            SyncAction::TransitionSettled { transition } => self.settled.push(transition),
            SyncAction::TransitionAborted { transition } => self.aborted.push(transition),
        }
        None
    }
}
