use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ClientMsgId, Conversation, ConversationId, ConversationKind, MessageId, ServerMessage, UserId},
    protocol::{AddMembersRequest, CreateDialogRequest, CreateGroupRequest},
};
use storage::{load_snapshot, save_snapshot, CacheKey};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    directory::ConversationDirectory,
    error::RestError,
    store::{ConversationStore, StoreContext},
};

/// How to address the other side when starting a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationTarget {
    PeerId(UserId),
    PeerUsername(String),
    Group {
        name: String,
        member_usernames: Vec<String>,
    },
}

#[derive(Default)]
struct RegistryState {
    stores: HashMap<ConversationId, Arc<ConversationStore>>,
    list_loading: bool,
    list_error: Option<RestError>,
}

/// Owns the conversation list and the stores of one conversation kind.
pub struct ConversationRegistry {
    kind: ConversationKind,
    context: StoreContext,
    directory: Arc<ConversationDirectory>,
    state: Mutex<RegistryState>,
    /// Bumped by `reset`; results of calls started before it are dropped.
    epoch: AtomicU64,
    persist_gate: Mutex<()>,
}

impl ConversationRegistry {
    pub fn new(kind: ConversationKind, context: StoreContext) -> Self {
        Self {
            kind,
            context,
            directory: Arc::new(ConversationDirectory::new(kind)),
            state: Mutex::new(RegistryState::default()),
            epoch: AtomicU64::new(0),
            persist_gate: Mutex::new(()),
        }
    }

    pub fn kind(&self) -> ConversationKind {
        self.kind
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.directory.snapshot()
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.directory.get(id)
    }

    pub async fn list_error(&self) -> Option<RestError> {
        self.state.lock().await.list_error.clone()
    }

    /// Store for `id`, created on first use.
    pub async fn store(&self, id: &ConversationId) -> Arc<ConversationStore> {
        let mut state = self.state.lock().await;
        let store = state.stores.entry(id.clone()).or_insert_with(|| {
            Arc::new(ConversationStore::new(
                self.kind,
                id.clone(),
                self.context.clone(),
                Arc::clone(&self.directory),
            ))
        });
        Arc::clone(store)
    }

    pub async fn existing_store(&self, id: &ConversationId) -> Option<Arc<ConversationStore>> {
        self.state.lock().await.stores.get(id).cloned()
    }

    /// Restores the cached list and every cached timeline it names.
    pub async fn hydrate(&self) {
        let list_key = CacheKey::ConversationList(self.kind);
        let cached: Vec<Conversation> =
            match load_snapshot(self.context.cache.as_ref(), &list_key).await {
                Ok(Some(conversations)) => conversations,
                Ok(None) => return,
                Err(err) => {
                    warn!(kind = ?self.kind, error = %err, "ignoring unreadable conversation list cache");
                    return;
                }
            };
        let ids: Vec<ConversationId> = cached.iter().map(|c| c.id.clone()).collect();
        self.directory.replace_all(cached);
        for id in &ids {
            self.store(id).await.hydrate().await;
        }
        info!(kind = ?self.kind, conversations = ids.len(), "conversation list hydrated");
    }

    /// Reloads the list from the server. Failures are kept as `list_error`.
    pub async fn refresh(&self) -> Result<(), RestError> {
        let epoch = self.epoch();
        {
            let mut state = self.state.lock().await;
            if state.list_loading {
                return Ok(());
            }
            state.list_loading = true;
            state.list_error = None;
        }

        let result = self.context.api.list_conversations(self.kind).await;

        let mut state = self.state.lock().await;
        if self.epoch() != epoch {
            debug!(kind = ?self.kind, "registry reset during list refresh; dropping result");
            return result.map(|_| ());
        }
        state.list_loading = false;
        match result {
            Ok(conversations) => {
                debug!(kind = ?self.kind, count = conversations.len(), "conversation list refreshed");
                self.directory.replace_all(conversations);
                drop(state);
                self.persist_list(epoch).await;
                Ok(())
            }
            Err(err) => {
                warn!(kind = ?self.kind, error = %err, "conversation list refresh failed");
                state.list_error = Some(err.clone());
                Err(err)
            }
        }
    }

    pub async fn start_conversation(
        &self,
        target: ConversationTarget,
    ) -> Result<Conversation, RestError> {
        let epoch = self.epoch();
        let api = &self.context.api;
        let conversation = match target {
            ConversationTarget::PeerId(peer_user_id) => {
                api.create_dialog(&CreateDialogRequest {
                    peer_user_id: Some(peer_user_id),
                    peer_username: None,
                })
                .await?
            }
            ConversationTarget::PeerUsername(peer_username) => {
                api.create_dialog(&CreateDialogRequest {
                    peer_user_id: None,
                    peer_username: Some(peer_username),
                })
                .await?
            }
            ConversationTarget::Group {
                name,
                member_usernames,
            } => {
                api.create_group(&CreateGroupRequest {
                    name,
                    member_usernames,
                })
                .await?
            }
        };
        info!(kind = ?conversation.kind, conversation_id = %conversation.id, "conversation started");
        self.remember(conversation.clone(), epoch).await;
        Ok(conversation)
    }

    pub async fn add_members(
        &self,
        group_id: &ConversationId,
        member_usernames: Vec<String>,
    ) -> Result<Conversation, RestError> {
        let epoch = self.epoch();
        let conversation = self
            .context
            .api
            .add_group_members(group_id, &AddMembersRequest { member_usernames })
            .await?;
        self.remember(conversation.clone(), epoch).await;
        Ok(conversation)
    }

    pub async fn apply_push(&self, message: ServerMessage) {
        let id = message.conversation_id.clone();
        self.store(&id).await.apply_push(message).await;
        if !self.directory.contains(&id) {
            debug!(kind = ?self.kind, conversation_id = %id, "message for unlisted conversation; refreshing list");
            let _ = self.refresh().await;
        }
    }

    pub async fn apply_ack(&self, client_msg_id: &ClientMsgId, message: ServerMessage) {
        let id = message.conversation_id.clone();
        self.store(&id).await.apply_ack(client_msg_id, message).await;
    }

    /// Routes a status patch by conversation id, or to whichever store holds
    /// the message when the id is missing.
    pub async fn apply_status_update(
        &self,
        conversation_id: Option<&ConversationId>,
        message_id: &MessageId,
        delivered_at: Option<DateTime<Utc>>,
        read_at: Option<DateTime<Utc>>,
    ) -> bool {
        if let Some(id) = conversation_id {
            let Some(store) = self.existing_store(id).await else {
                return false;
            };
            return store
                .apply_status_update(message_id, delivered_at, read_at)
                .await;
        }

        let stores: Vec<Arc<ConversationStore>> =
            self.state.lock().await.stores.values().cloned().collect();
        for store in stores {
            if store.contains_message(message_id).await {
                return store
                    .apply_status_update(message_id, delivered_at, read_at)
                    .await;
            }
        }
        false
    }

    /// Drops every store and summary. Cached keys are cleared by the session.
    pub async fn reset(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let _gate = self.persist_gate.lock().await;
        let stores: Vec<Arc<ConversationStore>> = {
            let mut state = self.state.lock().await;
            state.list_error = None;
            state.list_loading = false;
            let stores = state.stores.drain().map(|(_, store)| store).collect();
            stores
        };
        for store in stores {
            store.reset().await;
        }
        self.directory.clear();
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    async fn remember(&self, conversation: Conversation, epoch: u64) {
        if self.epoch() != epoch {
            debug!(kind = ?self.kind, conversation_id = %conversation.id, "registry reset while request was in flight");
            return;
        }
        self.directory.upsert(conversation);
        self.persist_list(epoch).await;
    }

    async fn persist_list(&self, epoch: u64) {
        let _gate = self.persist_gate.lock().await;
        if self.epoch() != epoch {
            return;
        }
        let list_key = CacheKey::ConversationList(self.kind);
        if let Err(err) = save_snapshot(
            self.context.cache.as_ref(),
            &list_key,
            &self.directory.snapshot(),
        )
        .await
        {
            warn!(kind = ?self.kind, error = %err, "failed to persist conversation list");
        }
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
