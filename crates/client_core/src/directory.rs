use std::sync::{Mutex, MutexGuard};

use shared::domain::{Conversation, ConversationId, ConversationKind};

/// Conversation summaries of one kind, shared by the registry and its stores.
pub struct ConversationDirectory {
    kind: ConversationKind,
    entries: Mutex<Vec<Conversation>>,
}

impl ConversationDirectory {
    pub fn new(kind: ConversationKind) -> Self {
        Self {
            kind,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> ConversationKind {
        self.kind
    }

    pub fn snapshot(&self) -> Vec<Conversation> {
        self.lock().clone()
    }

    pub fn get(&self, id: &ConversationId) -> Option<Conversation> {
        self.lock().iter().find(|c| &c.id == id).cloned()
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.lock().iter().any(|c| &c.id == id)
    }

    pub fn replace_all(&self, conversations: Vec<Conversation>) {
        *self.lock() = conversations;
    }

    /// Inserts at the front, or replaces the entry with the same id in place.
    pub fn upsert(&self, conversation: Conversation) {
        let mut entries = self.lock();
        match entries.iter_mut().find(|c| c.id == conversation.id) {
            Some(existing) => *existing = conversation,
            None => entries.insert(0, conversation),
        }
    }

    pub fn update<R>(
        &self,
        id: &ConversationId,
        apply: impl FnOnce(&mut Conversation) -> R,
    ) -> Option<R> {
        self.lock().iter_mut().find(|c| &c.id == id).map(apply)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Conversation>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
