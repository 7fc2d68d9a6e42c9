use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use shared::{
    domain::{ActionToken, ChannelId, MessageToken, UserId},
    error::BackendError,
    protocol::{ActionKind, BackendEvent, HistoryPage, MessagePayload, Occupant, PresenceState, SignalPayload},
};

mod loopback;

pub use loopback::{LoopbackBackend, LoopbackHub};

pub type EventStream = Pin<Box<dyn Stream<Item = BackendEvent> + Send>>;

/// Operations the realtime messaging backend offers a single client. The
/// transport behind it is opaque; delivery is at-least-once and events for a
/// subscribed channel arrive on the stream returned by `subscribe`.
#[async_trait]
pub trait RealtimeBackend: Send + Sync {
    async fn subscribe(
        &self,
        channel: &ChannelId,
        with_presence: bool,
    ) -> Result<EventStream, BackendError>;

    async fn unsubscribe(&self, channel: &ChannelId) -> Result<(), BackendError>;

    /// Acknowledged persisted publish. Confirmation of the message itself
    /// arrives later as a `BackendEvent::Message` on the channel stream.
    async fn publish(
        &self,
        channel: &ChannelId,
        payload: MessagePayload,
    ) -> Result<(), BackendError>;

    /// Page of persisted messages older than `before` (newest page when
    /// `before` is `None`), ascending by token within the page.
    async fn fetch_history(
        &self,
        channel: &ChannelId,
        count: usize,
        before: Option<MessageToken>,
    ) -> Result<HistoryPage, BackendError>;

    async fn presence_snapshot(&self, channel: &ChannelId) -> Result<Vec<Occupant>, BackendError>;

    async fn set_presence_state(
        &self,
        channel: &ChannelId,
        state: PresenceState,
    ) -> Result<(), BackendError>;

    /// Ephemeral unacknowledged broadcast.
    async fn signal(
        &self,
        channel: &ChannelId,
        payload: SignalPayload,
    ) -> Result<(), BackendError>;

    async fn add_message_action(
        &self,
        channel: &ChannelId,
        message_token: MessageToken,
        kind: ActionKind,
        value: &str,
    ) -> Result<ActionToken, BackendError>;

    async fn remove_message_action(
        &self,
        channel: &ChannelId,
        message_token: MessageToken,
        action_token: ActionToken,
    ) -> Result<(), BackendError>;

    /// Identity this backend client was built for.
    fn local_user(&self) -> &UserId;
}

/// Fallback used where no backend has been wired up yet.
pub struct UnavailableBackend {
    user_id: UserId,
}

impl UnavailableBackend {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }

    fn unavailable(&self) -> BackendError {
        BackendError::internal("realtime backend unavailable")
    }
}

#[async_trait]
impl RealtimeBackend for UnavailableBackend {
    async fn subscribe(
        &self,
        _channel: &ChannelId,
        _with_presence: bool,
    ) -> Result<EventStream, BackendError> {
        Err(self.unavailable())
    }

    async fn unsubscribe(&self, _channel: &ChannelId) -> Result<(), BackendError> {
        Err(self.unavailable())
    }

    async fn publish(
        &self,
        _channel: &ChannelId,
        _payload: MessagePayload,
    ) -> Result<(), BackendError> {
        Err(self.unavailable())
    }

    async fn fetch_history(
        &self,
        _channel: &ChannelId,
        _count: usize,
        _before: Option<MessageToken>,
    ) -> Result<HistoryPage, BackendError> {
        Err(self.unavailable())
    }

    async fn presence_snapshot(
        &self,
        _channel: &ChannelId,
    ) -> Result<Vec<Occupant>, BackendError> {
        Err(self.unavailable())
    }

    async fn set_presence_state(
        &self,
        _channel: &ChannelId,
        _state: PresenceState,
    ) -> Result<(), BackendError> {
        Err(self.unavailable())
    }

    async fn signal(
        &self,
        _channel: &ChannelId,
        _payload: SignalPayload,
    ) -> Result<(), BackendError> {
        Err(self.unavailable())
    }

    async fn add_message_action(
        &self,
        _channel: &ChannelId,
        _message_token: MessageToken,
        _kind: ActionKind,
        _value: &str,
    ) -> Result<ActionToken, BackendError> {
        Err(self.unavailable())
    }

    async fn remove_message_action(
        &self,
        _channel: &ChannelId,
        _message_token: MessageToken,
        _action_token: ActionToken,
    ) -> Result<(), BackendError> {
        Err(self.unavailable())
    }

    fn local_user(&self) -> &UserId {
        &self.user_id
    }
}
