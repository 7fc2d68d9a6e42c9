use std::collections::BTreeMap;

use shared::domain::{ActionToken, UserId};
use shared::protocol::ActionRecord;

#[derive(Debug, Clone, PartialEq)]
pub struct ReactionMark {
    pub actor: UserId,
    pub action_token: ActionToken,
}

/// Per-message reaction index: reaction value → one mark per actor. Replayed
/// add events are ignored by action token so at-least-once delivery cannot
/// double-count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReactionSet {
    by_value: BTreeMap<String, Vec<ReactionMark>>,
}

impl ReactionSet {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ActionRecord>) -> Self {
        let mut set = Self::default();
        for record in records {
            set.apply_added(record);
        }
        set
    }

    pub fn apply_added(&mut self, record: &ActionRecord) -> bool {
        let marks = self.by_value.entry(record.value.clone()).or_default();
        if let Some(mark) = marks.iter_mut().find(|mark| mark.actor == record.actor) {
            if mark.action_token == record.action_token {
                return false;
            }
            mark.action_token = record.action_token;
            return true;
        }
        marks.push(ReactionMark {
            actor: record.actor.clone(),
            action_token: record.action_token,
        });
        true
    }

    pub fn apply_removed(&mut self, record: &ActionRecord) -> bool {
        let Some(marks) = self.by_value.get_mut(&record.value) else {
            return false;
        };
        let before = marks.len();
        marks.retain(|mark| {
            !(mark.actor == record.actor && mark.action_token == record.action_token)
        });
        let changed = marks.len() != before;
        if marks.is_empty() {
            self.by_value.remove(&record.value);
        }
        changed
    }

    /// Action token of the given actor's mark for `value`, needed to issue a
    /// remove against the backend.
    pub fn action_token_for(&self, value: &str, actor: &UserId) -> Option<ActionToken> {
        self.by_value
            .get(value)?
            .iter()
            .find(|mark| mark.actor == *actor)
            .map(|mark| mark.action_token)
    }

    pub fn marks(&self, value: &str) -> &[ReactionMark] {
        self.by_value
            .get(value)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[ReactionMark])> {
        self.by_value
            .iter()
            .map(|(value, marks)| (value.as_str(), marks.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.by_value.is_empty()
    }
}
