use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use futures::{stream, StreamExt};
use shared::{
    domain::{ActionToken, ChannelId, MessageToken, UserId},
    error::{BackendError, ErrorCode},
    protocol::{
        ActionEvent, ActionKind, ActionOp, ActionRecord, BackendEvent, HistoryPage,
        MessageEnvelope, MessagePayload, Occupant, PresenceAction, PresenceEvent, PresenceState,
        SignalEnvelope, SignalPayload, StatusEvent, StoredMessage,
    },
};
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::{EventStream, RealtimeBackend};

const FANOUT_CAPACITY: usize = 256;

/// In-process hub shared by every `LoopbackBackend` client. Messages get
/// strictly increasing tokens in the same time domain a real backend uses, so
/// history pagination and ordering behave like the real thing without any
/// transport underneath.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

#[derive(Default)]
struct HubState {
    last_token: i64,
    last_action_token: i64,
    channels: HashMap<ChannelId, ChannelState>,
}

struct ChannelState {
    history: Vec<StoredMessage>,
    occupants: HashMap<UserId, Option<PresenceState>>,
    fanout: broadcast::Sender<BackendEvent>,
}

impl ChannelState {
    fn new() -> Self {
        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
        Self {
            history: Vec::new(),
            occupants: HashMap::new(),
            fanout,
        }
    }
}

impl HubState {
    fn channel_mut(&mut self, channel_id: &ChannelId) -> &mut ChannelState {
        self.channels
            .entry(channel_id.clone())
            .or_insert_with(ChannelState::new)
    }

    fn next_message_token(&mut self) -> MessageToken {
        let now = MessageToken::synthetic(Utc::now()).0;
        self.last_token = now.max(self.last_token + 1);
        MessageToken(self.last_token)
    }

    fn next_action_token(&mut self) -> ActionToken {
        self.last_action_token += 1;
        ActionToken(self.last_action_token)
    }
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend handle bound to one user identity, the way a real backend
    /// client is configured with the local user id.
    pub fn client(&self, user_id: UserId) -> LoopbackBackend {
        LoopbackBackend {
            hub: self.clone(),
            user_id,
        }
    }
}

pub struct LoopbackBackend {
    hub: LoopbackHub,
    user_id: UserId,
}

#[async_trait]
impl RealtimeBackend for LoopbackBackend {
    async fn subscribe(
        &self,
        channel: &ChannelId,
        with_presence: bool,
    ) -> Result<EventStream, BackendError> {
        let rx = {
            let mut hub = self.hub.state.lock().await;
            let state = hub.channel_mut(channel);
            let rx = state.fanout.subscribe();
            if with_presence && !state.occupants.contains_key(&self.user_id) {
                state.occupants.insert(self.user_id.clone(), None);
                let _ = state.fanout.send(BackendEvent::Presence(PresenceEvent {
                    channel_id: channel.clone(),
                    action: PresenceAction::Join,
                    user_id: self.user_id.clone(),
                    state: None,
                }));
            }
            rx
        };
        debug!(channel = %channel, user = %self.user_id, "loopback subscribe");

        let connected = stream::iter([BackendEvent::Status(StatusEvent::Connected)]);
        let events = BroadcastStream::new(rx).filter_map(|event| async move { event.ok() });
        Ok(Box::pin(connected.chain(events)))
    }

    async fn unsubscribe(&self, channel: &ChannelId) -> Result<(), BackendError> {
        let mut hub = self.hub.state.lock().await;
        if let Some(state) = hub.channels.get_mut(channel) {
            if state.occupants.remove(&self.user_id).is_some() {
                let _ = state.fanout.send(BackendEvent::Presence(PresenceEvent {
                    channel_id: channel.clone(),
                    action: PresenceAction::Leave,
                    user_id: self.user_id.clone(),
                    state: None,
                }));
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        channel: &ChannelId,
        payload: MessagePayload,
    ) -> Result<(), BackendError> {
        let mut hub = self.hub.state.lock().await;
        let token = hub.next_message_token();
        let state = hub.channel_mut(channel);
        state.history.push(StoredMessage {
            token,
            publisher: self.user_id.clone(),
            payload: payload.clone(),
            actions: Vec::new(),
        });
        let _ = state.fanout.send(BackendEvent::Message(MessageEnvelope {
            channel_id: channel.clone(),
            token,
            publisher: self.user_id.clone(),
            payload,
        }));
        Ok(())
    }

    async fn fetch_history(
        &self,
        channel: &ChannelId,
        count: usize,
        before: Option<MessageToken>,
    ) -> Result<HistoryPage, BackendError> {
        let hub = self.hub.state.lock().await;
        let messages = match hub.channels.get(channel) {
            Some(state) => {
                let eligible: Vec<_> = state
                    .history
                    .iter()
                    .filter(|message| before.map_or(true, |cursor| message.token < cursor))
                    .cloned()
                    .collect();
                let skip = eligible.len().saturating_sub(count);
                eligible.into_iter().skip(skip).collect()
            }
            None => Vec::new(),
        };
        Ok(HistoryPage { messages })
    }

    async fn presence_snapshot(&self, channel: &ChannelId) -> Result<Vec<Occupant>, BackendError> {
        let hub = self.hub.state.lock().await;
        let occupants = hub
            .channels
            .get(channel)
            .map(|state| {
                state
                    .occupants
                    .iter()
                    .map(|(user_id, state)| Occupant {
                        user_id: user_id.clone(),
                        state: state.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(occupants)
    }

    async fn set_presence_state(
        &self,
        channel: &ChannelId,
        state: PresenceState,
    ) -> Result<(), BackendError> {
        let mut hub = self.hub.state.lock().await;
        let channel_state = hub.channel_mut(channel);
        channel_state
            .occupants
            .insert(self.user_id.clone(), Some(state.clone()));
        let _ = channel_state
            .fanout
            .send(BackendEvent::Presence(PresenceEvent {
                channel_id: channel.clone(),
                action: PresenceAction::StateChange,
                user_id: self.user_id.clone(),
                state: Some(state),
            }));
        Ok(())
    }

    async fn signal(
        &self,
        channel: &ChannelId,
        payload: SignalPayload,
    ) -> Result<(), BackendError> {
        let mut hub = self.hub.state.lock().await;
        let state = hub.channel_mut(channel);
        let _ = state.fanout.send(BackendEvent::Signal(SignalEnvelope {
            channel_id: channel.clone(),
            sender: self.user_id.clone(),
            payload,
        }));
        Ok(())
    }

    async fn add_message_action(
        &self,
        channel: &ChannelId,
        message_token: MessageToken,
        kind: ActionKind,
        value: &str,
    ) -> Result<ActionToken, BackendError> {
        let mut hub = self.hub.state.lock().await;
        let action_token = hub.next_action_token();
        let state = hub.channel_mut(channel);
        let message = state
            .history
            .iter_mut()
            .find(|message| message.token == message_token)
            .ok_or_else(|| BackendError::new(ErrorCode::NotFound, "message not found"))?;
        let record = ActionRecord {
            action_token,
            message_token,
            actor: self.user_id.clone(),
            kind,
            value: value.to_string(),
        };
        message.actions.push(record.clone());
        let _ = state.fanout.send(BackendEvent::Action(ActionEvent {
            channel_id: channel.clone(),
            op: ActionOp::Added,
            action: record,
        }));
        Ok(action_token)
    }

    async fn remove_message_action(
        &self,
        channel: &ChannelId,
        message_token: MessageToken,
        action_token: ActionToken,
    ) -> Result<(), BackendError> {
        let mut hub = self.hub.state.lock().await;
        let state = hub
            .channels
            .get_mut(channel)
            .ok_or_else(|| BackendError::new(ErrorCode::NotFound, "channel not found"))?;
        let message = state
            .history
            .iter_mut()
            .find(|message| message.token == message_token)
            .ok_or_else(|| BackendError::new(ErrorCode::NotFound, "message not found"))?;
        let position = message
            .actions
            .iter()
            .position(|action| action.action_token == action_token)
            .ok_or_else(|| BackendError::new(ErrorCode::NotFound, "action not found"))?;
        let record = message.actions.remove(position);
        let _ = state.fanout.send(BackendEvent::Action(ActionEvent {
            channel_id: channel.clone(),
            op: ActionOp::Removed,
            action: record,
        }));
        Ok(())
    }

    fn local_user(&self) -> &UserId {
        &self.user_id
    }
}
