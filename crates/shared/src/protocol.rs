use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ActionToken, ChannelId, ClientMessageId, MessageToken, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderProfile {
    pub user_id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    pub file_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Published message body. `client_message_id` is the idempotency key that
/// reconciles the sender's optimistic copy with the confirmed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub client_message_id: ClientMessageId,
    pub sender: SenderProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileRef>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub channel_id: ChannelId,
    pub token: MessageToken,
    pub publisher: UserId,
    pub payload: MessagePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub token: MessageToken,
    pub publisher: UserId,
    pub payload: MessagePayload,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionRecord>,
}

/// One page of history, ascending by token within the page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub messages: Vec<StoredMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Reaction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action_token: ActionToken,
    pub message_token: MessageToken,
    pub actor: UserId,
    pub kind: ActionKind,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOp {
    Added,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEvent {
    pub channel_id: ChannelId,
    pub op: ActionOp,
    pub action: ActionRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceAction {
    Join,
    Leave,
    Timeout,
    StateChange,
}

/// Display state a client attaches to its presence; fields are optional so a
/// partial state-change never erases what an earlier event established.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub channel_id: ChannelId,
    pub action: PresenceAction,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PresenceState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Occupant {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PresenceState>,
}

/// Unacknowledged ephemeral broadcast, distinct from persisted messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SignalPayload {
    Typing {
        user_id: UserId,
        name: String,
        typing: bool,
    },
    Read {
        user_id: UserId,
        last_read: MessageToken,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub channel_id: ChannelId,
    pub sender: UserId,
    pub payload: SignalPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusEvent {
    Connected,
    Reconnected,
    NetworkDown,
    NetworkIssues,
    AccessDenied,
}

/// Everything the backend delivers for a subscribed channel. Consumers
/// dispatch with an exhaustive match; there is no by-name listener registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BackendEvent {
    Message(MessageEnvelope),
    Presence(PresenceEvent),
    Signal(SignalEnvelope),
    Action(ActionEvent),
    Status(StatusEvent),
}
