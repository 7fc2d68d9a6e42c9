use std::collections::BTreeMap;

use shared::domain::UserId;

#[derive(Debug, Clone, PartialEq)]
pub struct TypingEntry {
    pub user_id: UserId,
    pub display_name: String,
}

/// Peers currently typing, keyed by user id. An entry lives until an explicit
/// stop signal arrives; there is no timeout-based expiry, so a peer that
/// drops without signalling stays listed until the channel changes.
#[derive(Debug, Clone, Default)]
pub struct TypingSet {
    entries: BTreeMap<String, TypingEntry>,
}

impl TypingSet {
    pub fn with_signal(&self, user_id: &UserId, name: &str, typing: bool) -> Self {
        let mut next = self.clone();
        if typing {
            next.entries.insert(
                user_id.0.clone(),
                TypingEntry {
                    user_id: user_id.clone(),
                    display_name: name.to_string(),
                },
            );
        } else {
            next.entries.remove(user_id.as_str());
        }
        next
    }

    pub fn entries(&self) -> Vec<TypingEntry> {
        self.entries.values().cloned().collect()
    }
}
