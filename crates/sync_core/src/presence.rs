use std::collections::BTreeMap;

use shared::domain::UserId;
use shared::protocol::{Occupant, PresenceAction, PresenceEvent, PresenceState};

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar: Option<String>,
}

/// Online roster for the active channel. Incremental events keep it fresh
/// between snapshot polls; the periodic snapshot is the self-healing baseline
/// that corrects any missed join or leave within one interval.
#[derive(Debug, Clone, Default)]
pub struct PresenceRoster {
    entries: BTreeMap<String, PresenceEntry>,
}

fn placeholder_name(user_id: &UserId) -> String {
    let prefix: String = user_id.as_str().chars().take(4).collect();
    format!("User {prefix}")
}

impl PresenceRoster {
    pub fn with_event(&self, event: &PresenceEvent) -> Self {
        let mut next = self.clone();
        match event.action {
            PresenceAction::Join | PresenceAction::StateChange => {
                let entry = next.merged_entry(&event.user_id, event.state.as_ref());
                next.entries.insert(event.user_id.0.clone(), entry);
            }
            PresenceAction::Leave | PresenceAction::Timeout => {
                next.entries.remove(event.user_id.as_str());
            }
        }
        next
    }

    pub fn with_snapshot(&self, occupants: &[Occupant]) -> Self {
        let mut entries = BTreeMap::new();
        for occupant in occupants {
            let entry = self.merged_entry(&occupant.user_id, occupant.state.as_ref());
            entries.insert(occupant.user_id.0.clone(), entry);
        }
        Self { entries }
    }

    /// New entry for a user, taking display fields from the incoming partial
    /// state first, then from what the roster already knows, then falling
    /// back to a placeholder derived from the user id.
    fn merged_entry(&self, user_id: &UserId, state: Option<&PresenceState>) -> PresenceEntry {
        let known = self.entries.get(user_id.as_str());
        let display_name = state
            .and_then(|s| s.name.clone())
            .or_else(|| known.map(|entry| entry.display_name.clone()))
            .unwrap_or_else(|| placeholder_name(user_id));
        let avatar = state
            .and_then(|s| s.avatar.clone())
            .or_else(|| known.and_then(|entry| entry.avatar.clone()));
        PresenceEntry {
            user_id: user_id.clone(),
            display_name,
            avatar,
        }
    }

    pub fn entries(&self) -> Vec<PresenceEntry> {
        self.entries.values().cloned().collect()
    }
}
