use std::collections::HashMap;

use shared::domain::{MessageToken, UserId};

/// Last-read cursor per remote participant. Each inbound read signal
/// overwrites the previous cursor; arrival order wins.
#[derive(Debug, Clone, Default)]
pub struct ReadCursors {
    cursors: HashMap<UserId, MessageToken>,
}

impl ReadCursors {
    pub fn record(&mut self, user_id: UserId, token: MessageToken) {
        self.cursors.insert(user_id, token);
    }

    pub fn cursor(&self, user_id: &UserId) -> Option<MessageToken> {
        self.cursors.get(user_id).copied()
    }

    /// Users whose broadcast cursor equals exactly this token. Readers of
    /// older messages are not reported; a cursor attaches to the one message
    /// it named.
    pub fn readers_at(&self, token: MessageToken) -> Vec<UserId> {
        let mut readers: Vec<UserId> = self
            .cursors
            .iter()
            .filter(|(_, cursor)| **cursor == token)
            .map(|(user_id, _)| user_id.clone())
            .collect();
        readers.sort_by(|a, b| a.0.cmp(&b.0));
        readers
    }

    pub fn to_map(&self) -> HashMap<UserId, MessageToken> {
        self.cursors.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}
