use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::domain::{ClientMessageId, MessageToken, UserId};
use shared::protocol::{
    ActionEvent, ActionOp, FileRef, HistoryPage, MessageEnvelope, MessagePayload, SenderProfile,
    StoredMessage,
};

use crate::reactions::ReactionSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct MessageEntry {
    /// Effective ordering token: synthetic until the backend confirms.
    pub token: MessageToken,
    pub client_message_id: Option<ClientMessageId>,
    pub sender: SenderProfile,
    pub text: Option<String>,
    pub file: Option<FileRef>,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub reactions: ReactionSet,
}

impl MessageEntry {
    fn from_stored(stored: StoredMessage) -> Self {
        Self {
            token: stored.token,
            client_message_id: Some(stored.payload.client_message_id),
            sender: stored.payload.sender,
            text: stored.payload.text,
            file: stored.payload.file,
            created_at: stored.payload.created_at,
            status: MessageStatus::Confirmed,
            reactions: ReactionSet::from_records(&stored.actions),
        }
    }

    fn from_envelope(envelope: MessageEnvelope) -> Self {
        Self {
            token: envelope.token,
            client_message_id: Some(envelope.payload.client_message_id),
            sender: envelope.payload.sender,
            text: envelope.payload.text,
            file: envelope.payload.file,
            created_at: envelope.payload.created_at,
            status: MessageStatus::Confirmed,
            reactions: ReactionSet::default(),
        }
    }
}

/// The single authoritative message list for the active channel: sorted
/// ascending by effective token, deduplicated against redelivery by confirmed
/// token and against optimistic copies by client message id. Pagination state
/// lives here too since it is meaningless without the list.
#[derive(Debug)]
pub struct MessageStore {
    entries: Vec<MessageEntry>,
    by_client_id: HashMap<ClientMessageId, MessageToken>,
    confirmed_tokens: HashSet<MessageToken>,
    oldest_loaded: Option<MessageToken>,
    has_more: bool,
    is_paginating: bool,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            by_client_id: HashMap::new(),
            confirmed_tokens: HashSet::new(),
            oldest_loaded: None,
            has_more: true,
            is_paginating: false,
        }
    }
}

impl MessageStore {
    pub fn entries(&self) -> &[MessageEntry] {
        &self.entries
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_paginating(&self) -> bool {
        self.is_paginating
    }

    pub fn set_paginating(&mut self, value: bool) {
        self.is_paginating = value;
    }

    pub fn oldest_loaded(&self) -> Option<MessageToken> {
        self.oldest_loaded
    }

    pub fn newest_confirmed_token(&self) -> Option<MessageToken> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.status == MessageStatus::Confirmed)
            .map(|entry| entry.token)
    }

    /// Most recent page of history. Pagination keeps loading while full pages
    /// come back; a short page means the start of the channel was reached.
    pub fn load_initial(&mut self, page: HistoryPage, page_size: usize) {
        let count = page.messages.len();
        self.entries.clear();
        self.by_client_id.clear();
        self.confirmed_tokens.clear();
        for stored in page.messages {
            self.index_confirmed(&stored.payload.client_message_id, stored.token);
            self.entries.push(MessageEntry::from_stored(stored));
        }
        self.entries.sort_by_key(|entry| entry.token);
        self.oldest_loaded = self.entries.first().map(|entry| entry.token);
        self.has_more = count == page_size;
    }

    /// Older page fetched with the cursor; prepends and moves the cursor.
    pub fn prepend_page(&mut self, page: HistoryPage, page_size: usize) {
        let count = page.messages.len();
        let mut older: Vec<MessageEntry> = Vec::with_capacity(count);
        for stored in page.messages {
            if self.confirmed_tokens.contains(&stored.token) {
                continue;
            }
            self.index_confirmed(&stored.payload.client_message_id, stored.token);
            older.push(MessageEntry::from_stored(stored));
        }
        older.sort_by_key(|entry| entry.token);
        if let Some(first) = older.first() {
            self.oldest_loaded = Some(first.token);
        }
        self.entries.splice(0..0, older);
        self.has_more = count == page_size;
    }

    /// Optimistic append for a local send. The synthetic token is bumped past
    /// the newest token in the list so rapid sends in the same millisecond
    /// still order and dedupe correctly.
    pub fn append_pending(&mut self, payload: MessagePayload, at: DateTime<Utc>) -> MessageToken {
        let base = MessageToken::synthetic(at);
        let token = match self.entries.last() {
            Some(last) => MessageToken(base.0.max(last.token.0 + 1)),
            None => base,
        };
        self.by_client_id.insert(payload.client_message_id, token);
        self.entries.push(MessageEntry {
            token,
            client_message_id: Some(payload.client_message_id),
            sender: payload.sender,
            text: payload.text,
            file: payload.file,
            created_at: payload.created_at,
            status: MessageStatus::Pending,
            reactions: ReactionSet::default(),
        });
        token
    }

    pub fn mark_failed(&mut self, client_message_id: &ClientMessageId) -> bool {
        let Some(&token) = self.by_client_id.get(client_message_id) else {
            return false;
        };
        let Ok(index) = self.position_of(token) else {
            return false;
        };
        let entry = &mut self.entries[index];
        if entry.status == MessageStatus::Pending {
            entry.status = MessageStatus::Failed;
            return true;
        }
        false
    }

    /// Backend-confirmed arrival. Reconciles an optimistic copy in place when
    /// the client id matches, discards redelivered duplicates by token, and
    /// otherwise inserts sorted.
    pub fn apply_confirmed(&mut self, envelope: MessageEnvelope) -> bool {
        if self.confirmed_tokens.contains(&envelope.token) {
            return false;
        }

        let client_id = envelope.payload.client_message_id;
        if let Some(&effective) = self.by_client_id.get(&client_id) {
            let Ok(index) = self.position_of(effective) else {
                return false;
            };
            if self.entries[index].status == MessageStatus::Confirmed {
                // same client id already confirmed under another token
                return false;
            }
            let mut entry = self.entries.remove(index);
            entry.token = envelope.token;
            entry.sender = envelope.payload.sender;
            entry.text = envelope.payload.text;
            entry.file = envelope.payload.file;
            entry.created_at = envelope.payload.created_at;
            entry.status = MessageStatus::Confirmed;
            let position = match self.position_of(envelope.token) {
                Ok(position) | Err(position) => position,
            };
            self.entries.insert(position, entry);
            self.index_confirmed(&client_id, envelope.token);
            return true;
        }

        let position = match self.position_of(envelope.token) {
            Ok(position) | Err(position) => position,
        };
        self.index_confirmed(&client_id, envelope.token);
        self.entries
            .insert(position, MessageEntry::from_envelope(envelope));
        true
    }

    pub fn apply_action(&mut self, event: &ActionEvent) -> bool {
        let Ok(index) = self.position_of(event.action.message_token) else {
            return false;
        };
        let entry = &mut self.entries[index];
        match event.op {
            ActionOp::Added => entry.reactions.apply_added(&event.action),
            ActionOp::Removed => entry.reactions.apply_removed(&event.action),
        }
    }

    pub fn reaction_token_for(
        &self,
        message_token: MessageToken,
        value: &str,
        actor: &UserId,
    ) -> Option<shared::domain::ActionToken> {
        let index = self.position_of(message_token).ok()?;
        self.entries[index].reactions.action_token_for(value, actor)
    }

    fn index_confirmed(&mut self, client_id: &ClientMessageId, token: MessageToken) {
        self.by_client_id.insert(*client_id, token);
        self.confirmed_tokens.insert(token);
    }

    fn position_of(&self, token: MessageToken) -> Result<usize, usize> {
        self.entries
            .binary_search_by(|entry| entry.token.cmp(&token))
    }
}
