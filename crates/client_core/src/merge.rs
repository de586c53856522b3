use std::collections::HashMap;

use shared::domain::{ClientMsgId, MessageId, TimelineMessage};

/// Reconciles two message collections into one deduplicated timeline.
///
/// Entries are resolved by server id first, then by correlation id. A
/// correlation id only joins entries when one side is still pending, so two
/// confirmed messages with different server ids are never collapsed. The
/// result is sorted by created-at with the identity key as tie-breaker.
pub fn merge(existing: &[TimelineMessage], incoming: &[TimelineMessage]) -> Vec<TimelineMessage> {
    let mut timeline = Timeline::with_capacity(existing.len() + incoming.len());
    for message in existing.iter().chain(incoming) {
        timeline.upsert(message);
    }
    timeline.into_sorted()
}

#[derive(Default)]
struct Timeline {
    entries: Vec<Option<TimelineMessage>>,
    by_server_id: HashMap<MessageId, usize>,
    by_client_id: HashMap<ClientMsgId, usize>,
}

impl Timeline {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            by_server_id: HashMap::with_capacity(capacity),
            by_client_id: HashMap::with_capacity(capacity),
        }
    }

    fn upsert(&mut self, message: &TimelineMessage) {
        let index = match self.slot_for(message) {
            Some(index) => {
                if let Some(entry) = self.entries[index].as_mut() {
                    entry.absorb(message);
                }
                index
            }
            None => {
                self.entries.push(Some(message.clone()));
                self.entries.len() - 1
            }
        };
        self.fold_pending_twin(index);
        self.index(index);
    }

    fn slot_for(&self, message: &TimelineMessage) -> Option<usize> {
        if let Some(index) = message
            .server_id()
            .and_then(|id| self.by_server_id.get(id))
        {
            return Some(*index);
        }

        let index = *self.by_client_id.get(message.client_msg_id()?)?;
        let entry = self.entries[index].as_ref()?;
        let either_pending = message.server_id().is_none() || entry.server_id().is_none();
        either_pending.then_some(index)
    }

    /// A confirmed entry located by server id may still have a pending twin
    /// under its correlation id; fold the twin into it.
    fn fold_pending_twin(&mut self, index: usize) {
        let Some(entry) = self.entries[index].as_ref() else {
            return;
        };
        if entry.server_id().is_none() {
            return;
        }
        let Some(twin) = entry
            .client_msg_id()
            .and_then(|client_id| self.by_client_id.get(client_id))
            .copied()
        else {
            return;
        };
        if twin == index || !matches!(self.entries[twin], Some(TimelineMessage::Pending(_))) {
            return;
        }

        if let (Some(mut pending), Some(confirmed)) =
            (self.entries[twin].take(), self.entries[index].take())
        {
            pending.absorb(&confirmed);
            self.entries[index] = Some(pending);
        }
    }

    fn index(&mut self, index: usize) {
        let Some(entry) = self.entries[index].as_ref() else {
            return;
        };
        if let Some(id) = entry.server_id() {
            self.by_server_id.insert(id.clone(), index);
        }
        if let Some(client_id) = entry.client_msg_id() {
            self.by_client_id.insert(client_id.clone(), index);
        }
    }

    fn into_sorted(self) -> Vec<TimelineMessage> {
        let mut entries: Vec<TimelineMessage> = self.entries.into_iter().flatten().collect();
        entries.sort_by(|a, b| a.timeline_cmp(b));
        entries
    }
}

#[cfg(test)]
#[path = "tests/merge_tests.rs"]
mod tests;
