//! Sync engine.
//!
//! The [`SyncEngine`] composes the room session, pagination, merge and
//! read-receipt state machines behind a single `handle` entry point. It owns
//! all sync state; the caller owns all I/O.
//!
//! Every result coming back from the outside world (pages, failures, push
//! envelopes, mark-read completions) is checked against the active room and
//! the in-flight request before it mutates anything, so late answers for a
//! room the user already left are dropped instead of leaking into the wrong
//! list.

use std::{collections::HashSet, time::Duration};

use crate::{
    config::SyncConfig,
    env::Environment,
    error::SyncError,
    event::{LoadFailure, LoadStatus, SyncAction, SyncEvent},
    message::{Message, MessageId, MessageKind, RoomId, UserId},
    normalize::normalize,
    pagination::{FailureStep, OperationQueue, RequestId},
    receipts::{self, ReadStatus},
    room::{MergeOrigin, RoomSyncState},
    session::{RoomSession, SessionPhase},
    wire::{Envelope, EnvelopeAction, RawMessage, ReadUpdate},
};

/// Reason recorded when the watchdog fires.
const WATCHDOG_REASON: &str = "history fetch timed out";

/// Most recent send, for the duplicate-send debounce.
#[derive(Debug, Clone)]
struct LastSend<I> {
    room_id: RoomId,
    content: String,
    at: I,
}

/// Message about to be sent.
struct Outgoing {
    content: String,
    kind: MessageKind,
    file_url: Option<String>,
    reply_to: Option<MessageId>,
}

/// Message synchronization engine for one user.
pub struct SyncEngine<E: Environment> {
    /// Environment for monotonic and wall-clock time.
    env: E,

    /// Tunables.
    config: SyncConfig,

    /// Current user, for `is_me` and mark-read.
    current_user: UserId,

    /// Active room, cached rooms and the live subscription.
    session: RoomSession<E::Instant>,

    /// Load requests for the active room.
    queue: OperationQueue,

    /// Transport connection state.
    connected: bool,

    /// Last issued fetch id.
    next_request: u64,

    /// Last issued temp id number.
    next_temp: u64,

    /// Duplicate-send debounce.
    last_send: Option<LastSend<E::Instant>>,

    /// Mark-read scheduled after the first page of a room.
    deferred_read: Option<(RoomId, E::Instant)>,

    /// Rooms with a mark-read call in flight.
    reads_in_flight: HashSet<RoomId>,
}

impl<E: Environment> SyncEngine<E> {
    /// Create an engine for `current_user`. Starts disconnected with no room.
    pub fn new(env: E, current_user: UserId, config: SyncConfig) -> Self {
        let session = RoomSession::new(config.max_cached_rooms);
        Self {
            env,
            config,
            current_user,
            session,
            queue: OperationQueue::new(),
            connected: false,
            next_request: 0,
            next_temp: 0,
            last_send: None,
            deferred_read: None,
            reads_in_flight: HashSet::new(),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Current user.
    pub fn current_user(&self) -> &UserId {
        &self.current_user
    }

    /// Whether the transport is connected.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Session phase.
    pub fn phase(&self) -> SessionPhase<E::Instant> {
        self.session.phase()
    }

    /// Room session (active room, cache, subscription).
    pub fn session(&self) -> &RoomSession<E::Instant> {
        &self.session
    }

    /// Id of the active room.
    pub fn active_room(&self) -> Option<&RoomId> {
        self.session.active_room_id()
    }

    /// State of the active room.
    pub fn active_state(&self) -> Option<&RoomSyncState<E::Instant>> {
        self.session.active()
    }

    /// Cached state of an inactive room.
    pub fn cached_state(&self, room_id: &RoomId) -> Option<&RoomSyncState<E::Instant>> {
        self.session.cache().get(room_id)
    }

    /// Read status of a message in the active room.
    pub fn read_status(&self, msg: &Message) -> Option<ReadStatus> {
        let participants = self.session.active().and_then(|state| state.participant_count);
        receipts::read_status(msg, participants)
    }

    /// Time until the next timer (settle, watchdog, retry, deferred
    /// mark-read) is due. `None` when nothing is pending.
    pub fn next_timer(&self, now: E::Instant) -> Option<Duration> {
        let settle = self.session.next_settle(now, self.config.settle_delay);
        let load = self
            .session
            .active()
            .and_then(|state| state.next_timer(now, self.config.watchdog_timeout));
        let read = self
            .deferred_read
            .as_ref()
            .map(|(_, at)| self.config.mark_read_delay.saturating_sub(now - *at));

        [settle, load, read].into_iter().flatten().min()
    }

    /// Process an event and return resulting actions.
    ///
    /// `Err` rejects the event without changing any state.
    pub fn handle(
        &mut self,
        event: SyncEvent<E::Instant>,
    ) -> Result<Vec<SyncAction>, SyncError> {
        match event {
            SyncEvent::SelectRoom { room_id } => Ok(self.handle_select(room_id)),
            SyncEvent::LoadOlder => self.handle_load_older(),
            SyncEvent::RetryLoad => self.handle_retry(),
            SyncEvent::SendMessage { content, reply_to } => self.handle_send(Outgoing {
                content,
                kind: MessageKind::Text,
                file_url: None,
                reply_to,
            }),
            SyncEvent::SendAttachment { kind, file_url, name } => self.handle_send(Outgoing {
                content: name,
                kind,
                file_url: Some(file_url),
                reply_to: None,
            }),
            SyncEvent::Resend { temp_id } => self.handle_resend(&temp_id),
            SyncEvent::DeleteMessage { id } => self.handle_delete(id),
            SyncEvent::EditMessage { id, content } => self.handle_edit(id, content),
            SyncEvent::MarkRead => self.handle_mark_read(),
            SyncEvent::LeaveRoom { room_id } => Ok(self.handle_leave(&room_id)),
            SyncEvent::SetParticipants { room_id, count } => {
                Ok(self.handle_participants(&room_id, count))
            },
            SyncEvent::PageLoaded { request, room_id, items } => {
                Ok(self.handle_page_loaded(request, &room_id, items))
            },
            SyncEvent::PageFailed { request, room_id, failure } => {
                Ok(self.handle_page_failed(request, &room_id, failure))
            },
            SyncEvent::MarkReadCompleted { room_id, success } => {
                Ok(self.handle_mark_read_completed(room_id, success))
            },
            SyncEvent::PublishRejected { temp_id } => Ok(self.handle_publish_rejected(temp_id)),
            SyncEvent::Envelope { topic, envelope } => Ok(self.handle_envelope(&topic, envelope)),
            SyncEvent::Connected => Ok(self.handle_connected()),
            SyncEvent::Disconnected => {
                self.connected = false;
                tracing::info!("transport disconnected");
                Ok(Vec::new())
            },
            SyncEvent::Tick { now } => Ok(self.handle_tick(now)),
        }
    }

    fn handle_select(&mut self, target: Option<RoomId>) -> Vec<SyncAction> {
        let mut actions = Vec::new();

        if target.as_ref() == self.session.active_room_id() {
            let (transition, superseded) = self.session.reselect();
            if let Some(old) = superseded {
                actions.push(SyncAction::TransitionAborted { transition: old });
            }
            actions.push(SyncAction::TransitionStarted { transition, room_id: target });
            if !self.session.is_transitioning() {
                actions.push(SyncAction::TransitionSettled { transition });
            }
            return actions;
        }

        let now = self.env.now();
        self.queue.clear();
        self.deferred_read = None;

        let topic = target.as_ref().map(|room_id| self.config.topic_for(room_id));
        let switch = self.session.switch(target.clone(), topic.clone(), now);

        if let Some(old) = switch.superseded {
            tracing::debug!(transition = old, "room transition superseded");
            actions.push(SyncAction::TransitionAborted { transition: old });
        }
        actions.push(SyncAction::TransitionStarted {
            transition: switch.transition,
            room_id: target.clone(),
        });
        if let Some(request) = switch.cancel {
            actions.push(SyncAction::CancelFetch { request });
        }
        if let Some(topic) = switch.unsubscribe {
            actions.push(SyncAction::Unsubscribe { topic });
        }

        let Some(room_id) = target else {
            tracing::info!("left active room");
            actions.push(self.messages_changed());
            actions.push(SyncAction::TransitionSettled { transition: switch.transition });
            return actions;
        };

        tracing::info!(room = %room_id, restored = switch.restored, "switching room");
        if let Some(topic) = topic {
            actions.push(SyncAction::Subscribe { topic, room_id: room_id.clone() });
        }
        actions.push(self.messages_changed());

        if self.session.active().is_some_and(|state| state.page == 0) {
            self.queue.push(room_id, false);
            self.drain_queue(now, &mut actions);
        }
        if let Some(state) = self.session.active()
            && state.in_flight().is_none()
        {
            actions.push(load_state_changed(state));
        }
        actions
    }

    fn handle_load_older(&mut self) -> Result<Vec<SyncAction>, SyncError> {
        if self.session.is_transitioning() {
            tracing::debug!("load rejected during room transition");
            return Err(SyncError::Transitioning);
        }
        let room_id = self.session.active_room_id().cloned().ok_or(SyncError::NoActiveRoom)?;

        let mut actions = Vec::new();
        self.queue.push(room_id, false);
        self.drain_queue(self.env.now(), &mut actions);
        Ok(actions)
    }

    fn handle_retry(&mut self) -> Result<Vec<SyncAction>, SyncError> {
        if self.session.is_transitioning() {
            return Err(SyncError::Transitioning);
        }
        let state = self.session.active_mut().ok_or(SyncError::NoActiveRoom)?;

        let mut actions = Vec::new();
        if let Some(request) = state.in_flight() {
            actions.push(SyncAction::CancelFetch { request });
        }
        state.reset_for_manual_retry();
        tracing::info!(room = %state.room_id, page = state.page, "manual load retry");

        self.queue.push(state.room_id.clone(), true);
        self.drain_queue(self.env.now(), &mut actions);
        Ok(actions)
    }

    /// Start fetches for queued load requests of the current generation.
    ///
    /// At most one fetch is in flight: once one starts, later regular
    /// requests are no-ops and retries supersede it.
    fn drain_queue(&mut self, now: E::Instant, actions: &mut Vec<SyncAction>) {
        while let Some(op) = self.queue.pop() {
            let Some(state) = self.session.active_mut() else {
                continue;
            };
            if state.room_id != op.room_id {
                tracing::debug!(room = %op.room_id, "dropping load for inactive room");
                continue;
            }
            if let Some(reason) = state.load_blocker(op.retry) {
                tracing::debug!(room = %state.room_id, reason, "load skipped");
                continue;
            }

            self.next_request += 1;
            let request = RequestId(self.next_request);
            if let Some(previous) = state.begin_load(request, now) {
                actions.push(SyncAction::CancelFetch { request: previous });
            }
            tracing::debug!(room = %state.room_id, %request, page = state.page, retry = op.retry, "fetching history page");

            actions.push(SyncAction::FetchPage {
                request,
                room_id: state.room_id.clone(),
                page: state.page,
                size: self.config.page_size,
            });
            actions.push(load_state_changed(state));
        }
    }

    fn handle_page_loaded(
        &mut self,
        request: RequestId,
        room_id: &RoomId,
        items: Vec<RawMessage>,
    ) -> Vec<SyncAction> {
        let now = self.env.now();
        let wall_clock = self.env.wall_clock();
        let current_user = &self.current_user;

        let Some(state) = self.session.active_mut().filter(|state| state.room_id == *room_id) else {
            tracing::debug!(room = %room_id, %request, "dropping page for inactive room");
            return Vec::new();
        };
        if state.in_flight() != Some(request) {
            tracing::debug!(room = %room_id, %request, "dropping stale page");
            return Vec::new();
        }

        let first_page = state.page == 0;
        let messages = items
            .into_iter()
            .map(|raw| {
                let mut msg = normalize(raw, current_user, wall_clock);
                if msg.room_id.as_str().is_empty() {
                    msg.room_id = room_id.clone();
                }
                msg
            })
            .collect();

        let report = state.complete_load(messages, self.config.page_size, self.config.temp_match_window);
        tracing::info!(
            room = %room_id,
            page = state.page - 1,
            appended = report.appended,
            dropped = report.dropped,
            has_more = state.has_more,
            "history page loaded"
        );

        let load_state = load_state_changed(state);
        let mut actions = Vec::new();
        if report.changed() {
            actions.push(self.messages_changed());
        }
        actions.push(load_state);

        if first_page {
            self.deferred_read = Some((room_id.clone(), now));
        }
        self.drain_queue(now, &mut actions);
        actions
    }

    fn handle_page_failed(
        &mut self,
        request: RequestId,
        room_id: &RoomId,
        failure: LoadFailure,
    ) -> Vec<SyncAction> {
        let reason = match failure {
            LoadFailure::Cancelled => {
                tracing::debug!(room = %room_id, %request, "fetch cancelled");
                return Vec::new();
            },
            LoadFailure::Transient(reason) => reason,
        };

        let now = self.env.now();
        let Some(state) = self.session.active_mut().filter(|state| state.room_id == *room_id) else {
            tracing::debug!(room = %room_id, %request, "dropping failure for inactive room");
            return Vec::new();
        };
        if state.in_flight() != Some(request) {
            tracing::debug!(room = %room_id, %request, "dropping stale failure");
            return Vec::new();
        }

        let step = state.record_failure(reason, now, true, &self.config);
        self.after_failure(step)
    }

    fn after_failure(&self, step: FailureStep) -> Vec<SyncAction> {
        let Some(state) = self.session.active() else {
            return Vec::new();
        };
        let reason = state.last_error.clone().unwrap_or_default();

        match step {
            FailureStep::RetryAfter(delay) => {
                tracing::warn!(
                    room = %state.room_id,
                    attempt = state.retry_count,
                    ?delay,
                    %reason,
                    "history load failed, retrying"
                );
                vec![load_state_changed(state)]
            },
            FailureStep::Terminal => {
                tracing::error!(
                    room = %state.room_id,
                    attempts = state.retry_count,
                    %reason,
                    "history load failed, giving up"
                );
                vec![
                    load_state_changed(state),
                    SyncAction::RoomSyncError {
                        room_id: state.room_id.clone(),
                        error: SyncError::RetriesExhausted {
                            room_id: state.room_id.clone(),
                            attempts: state.retry_count,
                            reason,
                        },
                    },
                ]
            },
        }
    }

    fn handle_tick(&mut self, now: E::Instant) -> Vec<SyncAction> {
        let mut actions = Vec::new();

        if let Some(transition) = self.session.settle_if_due(now, self.config.settle_delay) {
            tracing::info!(room = ?self.session.active_room_id(), transition, "room transition settled");
            actions.push(SyncAction::TransitionSettled { transition });
        }

        if let Some(state) = self.session.active_mut()
            && let Some(request) = state.watchdog_expired(now, self.config.watchdog_timeout)
        {
            let step = state.record_failure(WATCHDOG_REASON.to_string(), now, false, &self.config);
            actions.push(SyncAction::CancelFetch { request });
            actions.extend(self.after_failure(step));
        }

        if let Some(state) = self.session.active()
            && state.retry_due(now)
        {
            self.queue.push(state.room_id.clone(), true);
            self.drain_queue(now, &mut actions);
        }

        if !self.session.is_transitioning()
            && let Some((room_id, at)) = &self.deferred_read
            && now - *at >= self.config.mark_read_delay
        {
            let room_id = room_id.clone();
            self.deferred_read = None;
            actions.extend(self.try_mark_read(&room_id, now));
        }

        actions
    }

    fn handle_send(&mut self, outgoing: Outgoing) -> Result<Vec<SyncAction>, SyncError> {
        if !self.connected {
            tracing::warn!("send rejected, transport not connected");
            return Err(SyncError::NotConnected);
        }
        if outgoing.content.trim().is_empty() && outgoing.file_url.is_none() {
            return Err(SyncError::EmptyMessage);
        }
        let room_id = self.session.active_room_id().cloned().ok_or(SyncError::NoActiveRoom)?;

        let now = self.env.now();
        if let Some(last) = &self.last_send
            && last.room_id == room_id
            && last.content == outgoing.content
            && now - last.at < self.config.send_debounce
        {
            tracing::debug!(room = %room_id, "duplicate send suppressed");
            return Err(SyncError::Debounced);
        }
        self.last_send =
            Some(LastSend { room_id: room_id.clone(), content: outgoing.content.clone(), at: now });

        self.next_temp += 1;
        let temp_id = format!("temp-{}", self.next_temp);
        let mut msg = Message::optimistic(
            temp_id.clone(),
            room_id.clone(),
            self.current_user.clone(),
            outgoing.content,
            self.env.wall_clock(),
        );
        msg.kind = outgoing.kind;
        msg.file_url = outgoing.file_url;
        msg.reply_to = outgoing.reply_to;

        let envelope = Envelope::message(EnvelopeAction::Send, &RawMessage::outgoing(&msg));
        let window = self.config.temp_match_window;
        let added = self.session.active_mut().is_some_and(|state| state.push_optimistic(msg, window));

        let mut actions = Vec::new();
        if added {
            actions.push(self.messages_changed());
        } else {
            tracing::debug!(room = %room_id, %temp_id, "equivalent message pending, publishing only");
        }
        actions.push(SyncAction::Publish {
            destination: self.config.destination_for(&room_id),
            envelope,
            temp_id: Some(temp_id),
        });
        Ok(actions)
    }

    fn handle_resend(&mut self, temp_id: &str) -> Result<Vec<SyncAction>, SyncError> {
        if !self.connected {
            return Err(SyncError::NotConnected);
        }
        let state = self.session.active_mut().ok_or(SyncError::NoActiveRoom)?;
        let destination = self.config.destination_for(&state.room_id);

        let msg = state
            .find_temp_mut(temp_id)
            .filter(|msg| msg.send_failed)
            .ok_or_else(|| SyncError::UnknownTempMessage { temp_id: temp_id.to_string() })?;
        msg.send_failed = false;
        let envelope = Envelope::message(EnvelopeAction::Send, &RawMessage::outgoing(msg));
        tracing::info!(room = %state.room_id, temp_id, "resending message");

        Ok(vec![
            self.messages_changed(),
            SyncAction::Publish { destination, envelope, temp_id: Some(temp_id.to_string()) },
        ])
    }

    fn handle_publish_rejected(&mut self, temp_id: String) -> Vec<SyncAction> {
        let Some(state) = self.session.active_mut() else {
            return Vec::new();
        };
        let room_id = state.room_id.clone();
        let Some(msg) = state.find_temp_mut(&temp_id) else {
            tracing::debug!(room = %room_id, %temp_id, "rejected message no longer pending");
            return Vec::new();
        };

        msg.send_failed = true;
        tracing::warn!(room = %room_id, %temp_id, "transport rejected message");
        vec![
            self.messages_changed(),
            SyncAction::RoomSyncError { room_id, error: SyncError::SendRejected { temp_id } },
        ]
    }

    fn handle_delete(&mut self, id: MessageId) -> Result<Vec<SyncAction>, SyncError> {
        if !self.connected {
            return Err(SyncError::NotConnected);
        }
        let room_id = self.session.active_room_id().cloned().ok_or(SyncError::NoActiveRoom)?;

        let raw = RawMessage {
            id: Some(id.as_str().into()),
            room_id: Some(room_id.as_str().into()),
            ..RawMessage::default()
        };
        Ok(vec![SyncAction::Publish {
            destination: self.config.destination_for(&room_id),
            envelope: Envelope::message(EnvelopeAction::Delete, &raw),
            temp_id: None,
        }])
    }

    fn handle_edit(&mut self, id: MessageId, content: String) -> Result<Vec<SyncAction>, SyncError> {
        if !self.connected {
            return Err(SyncError::NotConnected);
        }
        if content.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let state = self.session.active_mut().ok_or(SyncError::NoActiveRoom)?;
        if state.find_mut(&id).is_none() {
            tracing::warn!(room = %state.room_id, %id, "edit for unknown message");
            return Err(SyncError::EditOnUnknownMessage { id });
        }

        let raw = RawMessage {
            id: Some(id.as_str().into()),
            room_id: Some(state.room_id.as_str().into()),
            content: Some(content),
            ..RawMessage::default()
        };
        Ok(vec![SyncAction::Publish {
            destination: self.config.destination_for(&state.room_id),
            envelope: Envelope::message(EnvelopeAction::Edit, &raw),
            temp_id: None,
        }])
    }

    fn handle_mark_read(&mut self) -> Result<Vec<SyncAction>, SyncError> {
        if self.session.is_transitioning() {
            return Err(SyncError::Transitioning);
        }
        let room_id = self.session.active_room_id().cloned().ok_or(SyncError::NoActiveRoom)?;
        Ok(self.try_mark_read(&room_id, self.env.now()).into_iter().collect())
    }

    /// Dispatch a mark-read for the active room unless throttled.
    ///
    /// The throttle is measured from the last dispatch and a call already in
    /// flight for the same room suppresses new ones.
    fn try_mark_read(&mut self, room_id: &RoomId, now: E::Instant) -> Option<SyncAction> {
        if self.session.is_transitioning() {
            tracing::debug!(room = %room_id, "mark-read rejected during room transition");
            return None;
        }
        if self.reads_in_flight.contains(room_id) {
            tracing::debug!(room = %room_id, "mark-read already in flight");
            return None;
        }

        let state = self.session.active_mut().filter(|state| state.room_id == *room_id)?;
        if receipts::is_throttled(state.last_read_processed_at, now, self.config.read_throttle) {
            tracing::debug!(room = %room_id, "mark-read throttled");
            return None;
        }

        state.last_read_processed_at = Some(now);
        self.reads_in_flight.insert(room_id.clone());
        Some(SyncAction::PostMarkRead { room_id: room_id.clone(), user_id: self.current_user.clone() })
    }

    fn handle_mark_read_completed(&mut self, room_id: RoomId, success: bool) -> Vec<SyncAction> {
        self.reads_in_flight.remove(&room_id);

        let is_active = self.session.active_room_id() == Some(&room_id);
        let update =
            ReadUpdate { room_id: room_id.clone(), user_id: self.current_user.clone(), up_to: None };
        let Some(state) = self.session.state_mut(&room_id) else {
            return Vec::new();
        };

        if !success {
            tracing::warn!(room = %room_id, "mark-read failed");
            state.last_read_processed_at = None;
            return Vec::new();
        }

        let changed = state.apply_read(&update);
        if changed > 0 && is_active { vec![self.messages_changed()] } else { Vec::new() }
    }

    fn handle_leave(&mut self, room_id: &RoomId) -> Vec<SyncAction> {
        if self.session.active_room_id() == Some(room_id) {
            tracing::info!(room = %room_id, "leaving active room");
            return self.handle_select(None);
        }
        if self.session.forget(room_id) {
            tracing::info!(room = %room_id, "dropped cached room");
        }
        Vec::new()
    }

    fn handle_participants(&mut self, room_id: &RoomId, count: usize) -> Vec<SyncAction> {
        let Some(state) = self.session.state_mut(room_id) else {
            tracing::debug!(room = %room_id, "participant count for unknown room");
            return Vec::new();
        };
        state.participant_count = Some(count);

        if self.session.active_room_id() == Some(room_id) {
            vec![self.messages_changed()]
        } else {
            Vec::new()
        }
    }

    fn handle_connected(&mut self) -> Vec<SyncAction> {
        self.connected = true;
        tracing::info!("transport connected");

        match (self.session.subscription(), self.session.active_room_id()) {
            (Some(topic), Some(room_id)) => {
                vec![SyncAction::Subscribe { topic: topic.to_string(), room_id: room_id.clone() }]
            },
            _ => Vec::new(),
        }
    }

    fn handle_envelope(&mut self, topic: &str, envelope: Envelope) -> Vec<SyncAction> {
        if self.session.phase() != SessionPhase::Active {
            tracing::debug!(topic, action = ?envelope.action, "push rejected, no settled room");
            return Vec::new();
        }
        if self.session.subscription() != Some(topic) {
            tracing::debug!(topic, "push for unsubscribed topic");
            return Vec::new();
        }
        let Some(active) = self.session.active_room_id().cloned() else {
            return Vec::new();
        };

        match envelope.action {
            EnvelopeAction::Send => self.apply_push_message(&active, envelope.data),
            EnvelopeAction::Delete => self.apply_push_delete(&active, envelope.data),
            EnvelopeAction::Edit => self.apply_push_edit(&active, envelope.data),
            EnvelopeAction::MarkRead => self.apply_push_read(&active, envelope.data),
        }
    }

    fn apply_push_message(&mut self, active: &RoomId, data: serde_json::Value) -> Vec<SyncAction> {
        let raw = RawMessage::from_value(data);
        if let Some(room_id) = raw.room()
            && room_id != *active
        {
            tracing::debug!(room = %room_id, "push for another room");
            return Vec::new();
        }

        let mut msg = normalize(raw, &self.current_user, self.env.wall_clock());
        msg.room_id = active.clone();
        let from_me = msg.is_me;
        let origin = if from_me { MergeOrigin::OptimisticEcho } else { MergeOrigin::Push };

        let window = self.config.temp_match_window;
        let Some(state) = self.session.active_mut() else {
            return Vec::new();
        };
        let report = state.merge(vec![msg], origin, window);

        let mut actions = Vec::new();
        if report.changed() {
            actions.push(self.messages_changed());
        }
        if !from_me && report.appended > 0 {
            actions.extend(self.try_mark_read(active, self.env.now()));
        }
        actions
    }

    fn apply_push_delete(&mut self, active: &RoomId, data: serde_json::Value) -> Vec<SyncAction> {
        let raw = RawMessage::from_value(data);
        let Some(id) = self.targeted_message(active, &raw) else {
            return Vec::new();
        };
        let Some(state) = self.session.active_mut() else {
            return Vec::new();
        };

        if state.apply_delete(&id) {
            vec![self.messages_changed()]
        } else {
            tracing::debug!(room = %active, %id, "delete for unknown message");
            Vec::new()
        }
    }

    fn apply_push_edit(&mut self, active: &RoomId, data: serde_json::Value) -> Vec<SyncAction> {
        let raw = RawMessage::from_value(data);
        let Some(id) = self.targeted_message(active, &raw) else {
            return Vec::new();
        };
        let content = raw.content.unwrap_or_default();
        let Some(state) = self.session.active_mut() else {
            return Vec::new();
        };

        if state.apply_edit(&id, content) {
            vec![self.messages_changed()]
        } else {
            tracing::warn!(room = %active, %id, "edit for unknown message dropped");
            Vec::new()
        }
    }

    fn apply_push_read(&mut self, active: &RoomId, data: serde_json::Value) -> Vec<SyncAction> {
        let Some(update) = ReadUpdate::from_value(data) else {
            tracing::debug!(room = %active, "undecodable read update");
            return Vec::new();
        };
        if update.room_id != *active {
            tracing::debug!(room = %update.room_id, "read update for another room");
            return Vec::new();
        }
        let Some(state) = self.session.active_mut() else {
            return Vec::new();
        };

        if state.apply_read(&update) > 0 { vec![self.messages_changed()] } else { Vec::new() }
    }

    /// Id of the message a push edit/delete targets, if it belongs to `active`.
    fn targeted_message(&self, active: &RoomId, raw: &RawMessage) -> Option<MessageId> {
        if let Some(room_id) = raw.room()
            && room_id != *active
        {
            tracing::debug!(room = %room_id, "push for another room");
            return None;
        }
        let id = raw.message_id();
        if id.is_none() {
            tracing::debug!(room = %active, "push without message id");
        }
        id
    }

    fn messages_changed(&self) -> SyncAction {
        SyncAction::MessagesChanged {
            room_id: self.session.active_room_id().cloned(),
            messages: self.session.active().map(|state| state.messages.clone()).unwrap_or_default(),
        }
    }
}

fn load_state_changed<I>(state: &RoomSyncState<I>) -> SyncAction {
    SyncAction::LoadStateChanged {
        room_id: state.room_id.clone(),
        status: LoadStatus::of(state),
        has_more: state.has_more,
    }
}
