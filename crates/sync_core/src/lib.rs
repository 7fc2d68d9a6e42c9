use std::sync::Arc;

use backend_api::{EventStream, RealtimeBackend};
use chrono::Utc;
use futures::StreamExt;
use shared::{
    domain::{ChannelId, ClientMessageId, MessageToken, UserId},
    protocol::{
        ActionKind, BackendEvent, FileRef, MessagePayload, PresenceState, SenderProfile,
        SignalPayload, StatusEvent,
    },
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

pub mod config;
pub mod connection;
pub mod error;
mod messages;
mod presence;
mod reactions;
mod receipts;
mod typing;

pub use config::{load_config, SyncConfig};
pub use connection::ConnectionState;
pub use error::SyncError;
pub use messages::{MessageEntry, MessageStatus};
pub use presence::PresenceEntry;
pub use reactions::{ReactionMark, ReactionSet};
pub use receipts::ReadCursors;
pub use typing::TypingEntry;

use messages::MessageStore;
use presence::PresenceRoster;
use typing::TypingSet;

/// Local user identity as handed over by the identity provider.
#[derive(Debug, Clone)]
pub struct LocalProfile {
    pub user_id: UserId,
    pub name: String,
    pub avatar: Option<String>,
    pub color: Option<String>,
}

impl LocalProfile {
    fn sender_profile(&self) -> SenderProfile {
        SenderProfile {
            user_id: self.user_id.clone(),
            name: self.name.clone(),
            avatar: self.avatar.clone(),
            color: self.color.clone(),
        }
    }

    fn presence_state(&self) -> PresenceState {
        PresenceState {
            name: Some(self.name.clone()),
            avatar: self.avatar.clone(),
        }
    }
}

/// Change notifications for the rendering layer. State itself is pulled with
/// [`SyncEngine::snapshot`].
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ChannelChanged(Option<ChannelId>),
    MessagesUpdated,
    PresenceUpdated,
    TypingUpdated,
    ReadCursorsUpdated,
    ConnectionUpdated(ConnectionState),
    MessageFailed { client_message_id: ClientMessageId },
    SessionDenied { reason: String },
}

/// Read model for the active channel.
#[derive(Debug, Clone)]
pub struct ChannelView {
    pub channel_id: Option<ChannelId>,
    pub messages: Vec<MessageEntry>,
    pub online_users: Vec<PresenceEntry>,
    pub typing_users: Vec<TypingEntry>,
    pub read_cursors: ReadCursors,
    pub connection: ConnectionState,
    pub has_more_history: bool,
    pub is_paginating: bool,
}

struct ActiveChannel {
    channel_id: ChannelId,
    tasks: Vec<JoinHandle<()>>,
    typing_timer: Option<JoinHandle<()>>,
    read_timer: Option<JoinHandle<()>>,
}

impl ActiveChannel {
    fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            tasks: Vec::new(),
            typing_timer: None,
            read_timer: None,
        }
    }

    fn abort_all(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(timer) = self.typing_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.read_timer.take() {
            timer.abort();
        }
    }
}

struct EngineState {
    /// Bumped on every activate/deactivate; async completions compare it and
    /// discard results that belong to a previous channel.
    generation: u64,
    active: Option<ActiveChannel>,
    connection: ConnectionState,
    messages: MessageStore,
    roster: PresenceRoster,
    typing: TypingSet,
    read_cursors: ReadCursors,
    outbound_typing: bool,
    last_read_broadcast: Option<MessageToken>,
}

impl EngineState {
    fn reset_channel_slices(&mut self) {
        self.messages = MessageStore::default();
        self.roster = PresenceRoster::default();
        self.typing = TypingSet::default();
        self.read_cursors = ReadCursors::default();
        self.outbound_typing = false;
        self.last_read_broadcast = None;
    }
}

/// Keeps the local view of one active conversation consistent with the
/// realtime backend: optimistic sends reconciled against confirmed events,
/// paginated history, a self-healing presence roster, typing and read-receipt
/// signals, and per-message reactions.
pub struct SyncEngine {
    backend: Arc<dyn RealtimeBackend>,
    config: SyncConfig,
    profile: LocalProfile,
    inner: Mutex<EngineState>,
    events: broadcast::Sender<EngineEvent>,
}

impl SyncEngine {
    pub fn new(
        backend: Arc<dyn RealtimeBackend>,
        profile: LocalProfile,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_buffer);
        Arc::new(Self {
            backend,
            config,
            profile,
            inner: Mutex::new(EngineState {
                generation: 0,
                active: None,
                connection: ConnectionState::Disconnected,
                messages: MessageStore::default(),
                roster: PresenceRoster::default(),
                typing: TypingSet::default(),
                read_cursors: ReadCursors::default(),
                outbound_typing: false,
                last_read_broadcast: None,
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> ChannelView {
        let state = self.inner.lock().await;
        ChannelView {
            channel_id: state.active.as_ref().map(|active| active.channel_id.clone()),
            messages: state.messages.entries().to_vec(),
            online_users: state.roster.entries(),
            typing_users: state.typing.entries(),
            read_cursors: state.read_cursors.clone(),
            connection: state.connection,
            has_more_history: state.messages.has_more(),
            is_paginating: state.messages.is_paginating(),
        }
    }

    /// Makes `channel_id` the single active conversation. Any previous
    /// channel is fully torn down first; nothing of it survives, including
    /// results of its still-running fetches.
    pub async fn activate(self: &Arc<Self>, channel_id: ChannelId) -> Result<(), SyncError> {
        let (generation, previous) = {
            let mut state = self.inner.lock().await;
            state.generation += 1;
            let previous = state.active.take();
            state.reset_channel_slices();
            state.connection = ConnectionState::Connecting;
            state.active = Some(ActiveChannel::new(channel_id.clone()));
            (state.generation, previous)
        };
        self.notify(EngineEvent::ChannelChanged(Some(channel_id.clone())));
        self.notify(EngineEvent::ConnectionUpdated(ConnectionState::Connecting));

        if let Some(mut previous) = previous {
            previous.abort_all();
            if let Err(err) = self.backend.unsubscribe(&previous.channel_id).await {
                warn!(channel = %previous.channel_id, "unsubscribe failed: {err}");
            }
        }

        let stream = match self.backend.subscribe(&channel_id, true).await {
            Ok(stream) => stream,
            Err(err) if err.is_fatal() => {
                let reason = err.to_string();
                self.fail_session(generation, &reason).await;
                return Err(SyncError::AccessDenied(reason));
            }
            Err(err) => {
                warn!(channel = %channel_id, "subscribe failed, leaving reconnect to the backend: {err}");
                return Err(SyncError::Subscribe(err));
            }
        };

        info!(channel = %channel_id, user = %self.backend.local_user(), "channel subscription active");

        let pump = tokio::spawn(Arc::clone(self).run_pump(stream, generation, channel_id.clone()));
        let poll = tokio::spawn(Arc::clone(self).run_presence_poll(generation, channel_id.clone()));
        let state_broadcast =
            tokio::spawn(Arc::clone(self).assert_presence_state(generation, channel_id.clone()));

        {
            let mut state = self.inner.lock().await;
            if state.generation == generation {
                if let Some(active) = state.active.as_mut() {
                    active.tasks.extend([pump, poll, state_broadcast]);
                }
            } else {
                pump.abort();
                poll.abort();
                state_broadcast.abort();
                return Ok(());
            }
        }

        self.load_initial_history(generation, &channel_id).await;
        Ok(())
    }

    pub async fn deactivate(&self) {
        let previous = {
            let mut state = self.inner.lock().await;
            state.generation += 1;
            let previous = state.active.take();
            state.reset_channel_slices();
            state.connection = ConnectionState::Disconnected;
            previous
        };
        let Some(mut previous) = previous else {
            return;
        };
        previous.abort_all();
        if let Err(err) = self.backend.unsubscribe(&previous.channel_id).await {
            warn!(channel = %previous.channel_id, "unsubscribe failed: {err}");
        }
        self.notify(EngineEvent::ChannelChanged(None));
        self.notify(EngineEvent::ConnectionUpdated(ConnectionState::Disconnected));
    }

    /// Optimistic send. The entry shows up immediately as pending and later
    /// flips to confirmed (via the inbound event) or failed (publish error);
    /// it is never silently dropped.
    pub async fn send_message(
        self: &Arc<Self>,
        text: &str,
        file: Option<FileRef>,
    ) -> Result<ClientMessageId, SyncError> {
        let trimmed = text.trim();
        if trimmed.is_empty() && file.is_none() {
            return Err(SyncError::EmptyMessage);
        }

        let payload = MessagePayload {
            client_message_id: ClientMessageId::generate(),
            sender: self.profile.sender_profile(),
            text: (!trimmed.is_empty()).then(|| trimmed.to_string()),
            file,
            created_at: Utc::now(),
        };
        let client_message_id = payload.client_message_id;

        let (generation, channel_id) = {
            let mut state = self.inner.lock().await;
            let Some(active) = state.active.as_ref() else {
                return Err(SyncError::NoActiveChannel);
            };
            let channel_id = active.channel_id.clone();
            let generation = state.generation;
            state.messages.append_pending(payload.clone(), Utc::now());
            (generation, channel_id)
        };
        self.notify(EngineEvent::MessagesUpdated);

        // sending ends the local typing indicator
        self.set_typing(false).await;

        match self.backend.publish(&channel_id, payload).await {
            Ok(()) => Ok(client_message_id),
            Err(err) => {
                let marked = {
                    let mut state = self.inner.lock().await;
                    state.generation == generation && state.messages.mark_failed(&client_message_id)
                };
                if marked {
                    self.notify(EngineEvent::MessageFailed { client_message_id });
                    self.notify(EngineEvent::MessagesUpdated);
                }
                Err(SyncError::Publish(err))
            }
        }
    }

    /// Loads the next older page. A no-op while pagination is exhausted,
    /// uninitialized, or already in flight, so scroll handlers can call it
    /// freely without stacking requests.
    pub async fn fetch_more_history(self: &Arc<Self>) -> Result<(), SyncError> {
        let (generation, channel_id, cursor) = {
            let mut state = self.inner.lock().await;
            let Some(active) = state.active.as_ref() else {
                return Err(SyncError::NoActiveChannel);
            };
            let channel_id = active.channel_id.clone();
            if !state.messages.has_more() || state.messages.is_paginating() {
                return Ok(());
            }
            let Some(cursor) = state.messages.oldest_loaded() else {
                return Ok(());
            };
            state.messages.set_paginating(true);
            (state.generation, channel_id, cursor)
        };
        self.notify(EngineEvent::MessagesUpdated);

        let result = self
            .backend
            .fetch_history(&channel_id, self.config.history_page_size, Some(cursor))
            .await;

        {
            let mut state = self.inner.lock().await;
            if state.generation != generation {
                // stale result for a channel that is no longer active
                return Ok(());
            }
            state.messages.set_paginating(false);
            match result {
                Ok(page) => {
                    state
                        .messages
                        .prepend_page(page, self.config.history_page_size);
                }
                Err(err) => {
                    warn!(channel = %channel_id, "pagination fetch failed: {err}");
                }
            }
        }
        self.notify(EngineEvent::MessagesUpdated);
        Ok(())
    }

    /// Issues an idempotent reaction add. The ledger itself only changes when
    /// the corresponding action event arrives; failures are logged and
    /// swallowed, reactions are not worth interrupting the user over.
    pub async fn add_reaction(&self, message_token: MessageToken, value: &str) {
        let Some(channel_id) = self.active_channel_id().await else {
            return;
        };
        if let Err(err) = self
            .backend
            .add_message_action(&channel_id, message_token, ActionKind::Reaction, value)
            .await
        {
            warn!(channel = %channel_id, token = message_token.0, "reaction add failed: {err}");
        }
    }

    /// Removes the local user's own reaction, which requires the action token
    /// the backend assigned to the original add.
    pub async fn remove_reaction(&self, message_token: MessageToken, value: &str) {
        let (channel_id, action_token) = {
            let state = self.inner.lock().await;
            let Some(active) = state.active.as_ref() else {
                return;
            };
            let Some(action_token) =
                state
                    .messages
                    .reaction_token_for(message_token, value, &self.profile.user_id)
            else {
                debug!(token = message_token.0, "no own reaction to remove");
                return;
            };
            (active.channel_id.clone(), action_token)
        };
        if let Err(err) = self
            .backend
            .remove_message_action(&channel_id, message_token, action_token)
            .await
        {
            warn!(channel = %channel_id, token = message_token.0, "reaction remove failed: {err}");
        }
    }

    /// Outbound typing indicator. The first keystroke broadcasts start and
    /// arms the idle timer; every further keystroke re-arms it; expiry or an
    /// explicit stop (e.g. on send) broadcasts stop.
    pub async fn set_typing(self: &Arc<Self>, typing: bool) {
        let outcome = {
            let mut state = self.inner.lock().await;
            let generation = state.generation;
            let Some(active) = state.active.as_mut() else {
                return;
            };
            let channel_id = active.channel_id.clone();
            if let Some(timer) = active.typing_timer.take() {
                timer.abort();
            }
            if typing {
                let engine = Arc::clone(self);
                active.typing_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(engine.config.typing_idle_timeout).await;
                    engine.stop_typing_after_idle(generation).await;
                }));
            }
            let should_signal = if typing {
                !std::mem::replace(&mut state.outbound_typing, true)
            } else {
                std::mem::replace(&mut state.outbound_typing, false)
            };
            should_signal.then_some(channel_id)
        };

        if let Some(channel_id) = outcome {
            self.send_typing_signal(&channel_id, typing).await;
        }
    }

    /// Marks the conversation read once the view has settled on the newest
    /// message. Repeated calls within the settle window coalesce into one
    /// broadcast, and an unchanged cursor is not re-broadcast.
    pub async fn mark_read(self: &Arc<Self>) {
        let mut state = self.inner.lock().await;
        let generation = state.generation;
        let Some(active) = state.active.as_mut() else {
            return;
        };
        if let Some(timer) = active.read_timer.take() {
            timer.abort();
        }
        let engine = Arc::clone(self);
        active.read_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(engine.config.read_settle_delay).await;
            engine.broadcast_read_cursor(generation).await;
        }));
    }

    fn notify(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    async fn active_channel_id(&self) -> Option<ChannelId> {
        let state = self.inner.lock().await;
        state.active.as_ref().map(|active| active.channel_id.clone())
    }

    async fn still_current(&self, generation: u64) -> bool {
        self.inner.lock().await.generation == generation
    }

    async fn fail_session(&self, generation: u64, reason: &str) {
        {
            let mut state = self.inner.lock().await;
            if state.generation != generation {
                return;
            }
            state.connection = ConnectionState::Denied;
        }
        error!("backend denied access, session needs re-authentication: {reason}");
        self.notify(EngineEvent::ConnectionUpdated(ConnectionState::Denied));
        self.notify(EngineEvent::SessionDenied {
            reason: reason.to_string(),
        });
    }

    async fn load_initial_history(self: &Arc<Self>, generation: u64, channel_id: &ChannelId) {
        let page = match self
            .backend
            .fetch_history(channel_id, self.config.history_page_size, None)
            .await
        {
            Ok(page) => page,
            Err(err) => {
                warn!(channel = %channel_id, "initial history fetch failed: {err}");
                return;
            }
        };
        {
            let mut state = self.inner.lock().await;
            if state.generation != generation {
                return;
            }
            state
                .messages
                .load_initial(page, self.config.history_page_size);
        }
        self.notify(EngineEvent::MessagesUpdated);
    }

    async fn run_pump(self: Arc<Self>, mut stream: EventStream, generation: u64, channel_id: ChannelId) {
        while let Some(event) = stream.next().await {
            if !self.still_current(generation).await {
                break;
            }
            self.handle_event(generation, &channel_id, event).await;
        }
        debug!(channel = %channel_id, "event stream closed");
    }

    async fn handle_event(
        self: &Arc<Self>,
        generation: u64,
        channel_id: &ChannelId,
        event: BackendEvent,
    ) {
        match event {
            BackendEvent::Message(envelope) => {
                if envelope.channel_id != *channel_id {
                    return;
                }
                let changed = {
                    let mut state = self.inner.lock().await;
                    state.generation == generation && state.messages.apply_confirmed(envelope)
                };
                if changed {
                    self.notify(EngineEvent::MessagesUpdated);
                }
            }
            BackendEvent::Presence(presence) => {
                if presence.channel_id != *channel_id {
                    return;
                }
                {
                    let mut state = self.inner.lock().await;
                    if state.generation != generation {
                        return;
                    }
                    state.roster = state.roster.with_event(&presence);
                }
                self.notify(EngineEvent::PresenceUpdated);
            }
            BackendEvent::Signal(signal) => {
                if signal.channel_id != *channel_id || signal.sender == self.profile.user_id {
                    return;
                }
                match signal.payload {
                    SignalPayload::Typing {
                        user_id,
                        name,
                        typing,
                    } => {
                        if user_id == self.profile.user_id {
                            return;
                        }
                        {
                            let mut state = self.inner.lock().await;
                            if state.generation != generation {
                                return;
                            }
                            state.typing = state.typing.with_signal(&user_id, &name, typing);
                        }
                        self.notify(EngineEvent::TypingUpdated);
                    }
                    SignalPayload::Read { user_id, last_read } => {
                        if user_id == self.profile.user_id {
                            return;
                        }
                        {
                            let mut state = self.inner.lock().await;
                            if state.generation != generation {
                                return;
                            }
                            state.read_cursors.record(user_id, last_read);
                        }
                        self.notify(EngineEvent::ReadCursorsUpdated);
                    }
                }
            }
            BackendEvent::Action(action) => {
                if action.channel_id != *channel_id {
                    return;
                }
                let changed = {
                    let mut state = self.inner.lock().await;
                    state.generation == generation && state.messages.apply_action(&action)
                };
                if changed {
                    self.notify(EngineEvent::MessagesUpdated);
                }
            }
            BackendEvent::Status(status) => {
                self.handle_status(generation, channel_id, status).await;
            }
        }
    }

    async fn handle_status(
        self: &Arc<Self>,
        generation: u64,
        channel_id: &ChannelId,
        status: StatusEvent,
    ) {
        if status == StatusEvent::AccessDenied {
            self.fail_session(generation, "subscription rejected by backend")
                .await;
            return;
        }

        let transition = {
            let mut state = self.inner.lock().await;
            if state.generation != generation {
                return;
            }
            let was = state.connection;
            state.connection = was.apply_status(status);
            (was != state.connection).then_some(state.connection)
        };
        if let Some(next) = transition {
            self.notify(EngineEvent::ConnectionUpdated(next));
        }

        if status == StatusEvent::Reconnected {
            // the backend resubscribed under the hood; re-assert who we are
            // and heal the roster right away instead of waiting for the poll
            let engine = Arc::clone(self);
            let channel_id = channel_id.clone();
            tokio::spawn(async move {
                engine
                    .clone()
                    .assert_presence_state(generation, channel_id.clone())
                    .await;
                engine.refresh_presence(generation, &channel_id).await;
            });
        }
    }

    async fn run_presence_poll(self: Arc<Self>, generation: u64, channel_id: ChannelId) {
        let mut interval = tokio::time::interval(self.config.presence_poll_interval);
        loop {
            interval.tick().await;
            if !self.still_current(generation).await {
                break;
            }
            self.refresh_presence(generation, &channel_id).await;
        }
    }

    async fn refresh_presence(self: &Arc<Self>, generation: u64, channel_id: &ChannelId) {
        let occupants = match self.backend.presence_snapshot(channel_id).await {
            Ok(occupants) => occupants,
            Err(err) => {
                debug!(channel = %channel_id, "presence snapshot failed: {err}");
                return;
            }
        };
        {
            let mut state = self.inner.lock().await;
            if state.generation != generation {
                return;
            }
            state.roster = state.roster.with_snapshot(&occupants);
        }
        self.notify(EngineEvent::PresenceUpdated);
    }

    /// Broadcasts the local display state, retrying quietly with backoff;
    /// presence metadata is not worth surfacing failures for.
    async fn assert_presence_state(self: Arc<Self>, generation: u64, channel_id: ChannelId) {
        let state = self.profile.presence_state();
        let mut delay = self.config.presence_state_retry_base_delay;
        for _ in 0..self.config.presence_state_retry_attempts {
            if !self.still_current(generation).await {
                return;
            }
            match self.backend.set_presence_state(&channel_id, state.clone()).await {
                Ok(()) => return,
                Err(err) => {
                    debug!(channel = %channel_id, "presence state broadcast failed: {err}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        warn!(channel = %channel_id, "presence state broadcast gave up after retries");
    }

    async fn stop_typing_after_idle(self: Arc<Self>, generation: u64) {
        let channel_id = {
            let mut state = self.inner.lock().await;
            if state.generation != generation || !state.outbound_typing {
                return;
            }
            state.outbound_typing = false;
            let Some(active) = state.active.as_ref() else {
                return;
            };
            active.channel_id.clone()
        };
        self.send_typing_signal(&channel_id, false).await;
    }

    async fn send_typing_signal(&self, channel_id: &ChannelId, typing: bool) {
        let payload = SignalPayload::Typing {
            user_id: self.profile.user_id.clone(),
            name: self.profile.name.clone(),
            typing,
        };
        if let Err(err) = self.backend.signal(channel_id, payload).await {
            debug!(channel = %channel_id, "typing signal failed: {err}");
        }
    }

    async fn broadcast_read_cursor(self: Arc<Self>, generation: u64) {
        let send = {
            let mut state = self.inner.lock().await;
            if state.generation != generation {
                return;
            }
            let channel_id = match state.active.as_ref() {
                Some(active) => active.channel_id.clone(),
                None => return,
            };
            let Some(token) = state.messages.newest_confirmed_token() else {
                return;
            };
            if state.last_read_broadcast == Some(token) {
                return;
            }
            state.last_read_broadcast = Some(token);
            (channel_id, token)
        };
        let (channel_id, token) = send;
        let payload = SignalPayload::Read {
            user_id: self.profile.user_id.clone(),
            last_read: token,
        };
        if let Err(err) = self.backend.signal(&channel_id, payload).await {
            debug!(channel = %channel_id, "read signal failed: {err}");
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
