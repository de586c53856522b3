use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{
        ClientMsgId, Conversation, ConversationId, ConversationKind, LastMessage, LocalMessage,
        MessageId, ServerMessage, TimelineMessage, UserId,
    },
    protocol::{ClientFrame, Cursor, OutgoingBody},
};
use storage::{load_snapshot, save_snapshot, CacheKey, CacheStore};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    api::{ChatApi, FileUpload, Uploader},
    connection::ConnectionManager,
    directory::ConversationDirectory,
    error::{RestError, SendError},
    focus::FocusTracker,
    merge::merge,
};

/// Collaborators shared by every store of a session.
#[derive(Clone)]
pub struct StoreContext {
    pub local_user: UserId,
    pub api: Arc<dyn ChatApi>,
    pub uploader: Arc<dyn Uploader>,
    pub connection: Arc<ConnectionManager>,
    pub cache: Arc<dyn CacheStore>,
    pub focus: Arc<FocusTracker>,
    pub page_size: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineState {
    pub messages: Vec<TimelineMessage>,
    pub loading: bool,
    pub cursor: Option<Cursor>,
    pub has_more: bool,
    pub last_error: Option<RestError>,
}

impl Default for TimelineState {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            loading: false,
            cursor: None,
            has_more: true,
            last_error: None,
        }
    }
}

/// Timeline of one conversation. Every mutation goes through [`merge`] and
/// is followed by a best-effort save.
pub struct ConversationStore {
    kind: ConversationKind,
    id: ConversationId,
    context: StoreContext,
    directory: Arc<ConversationDirectory>,
    state: Mutex<TimelineState>,
    loading: AtomicBool,
    closed: AtomicBool,
    persist_gate: Mutex<()>,
}

/// Clears the loading flag however the page fetch ends, cancellation included.
struct LoadingGuard<'a>(&'a AtomicBool);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ConversationStore {
    pub fn new(
        kind: ConversationKind,
        id: ConversationId,
        context: StoreContext,
        directory: Arc<ConversationDirectory>,
    ) -> Self {
        Self {
            kind,
            id,
            context,
            directory,
            state: Mutex::new(TimelineState::default()),
            loading: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            persist_gate: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    pub fn kind(&self) -> ConversationKind {
        self.kind
    }

    pub async fn snapshot(&self) -> TimelineState {
        let mut snapshot = self.state.lock().await.clone();
        snapshot.loading = self.loading.load(Ordering::Acquire);
        snapshot
    }

    pub async fn messages(&self) -> Vec<TimelineMessage> {
        self.state.lock().await.messages.clone()
    }

    pub fn summary(&self) -> Option<Conversation> {
        self.directory.get(&self.id)
    }

    pub async fn last_error(&self) -> Option<RestError> {
        self.state.lock().await.last_error.clone()
    }

    pub async fn contains_message(&self, message_id: &MessageId) -> bool {
        self.state
            .lock()
            .await
            .messages
            .iter()
            .any(|m| m.server_id() == Some(message_id))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn cache_key(&self) -> CacheKey {
        CacheKey::timeline(self.kind, &self.id)
    }

    /// Restores the persisted timeline. Missing or unreadable snapshots leave
    /// the store empty.
    pub async fn hydrate(&self) {
        let cached: Vec<ServerMessage> =
            match load_snapshot(self.context.cache.as_ref(), &self.cache_key()).await {
                Ok(Some(messages)) => messages,
                Ok(None) => return,
                Err(err) => {
                    warn!(conversation_id = %self.id, error = %err, "ignoring unreadable timeline cache");
                    return;
                }
            };
        let incoming: Vec<TimelineMessage> =
            cached.into_iter().map(TimelineMessage::Confirmed).collect();
        let mut state = self.state.lock().await;
        state.messages = merge(&state.messages, &incoming);
        debug!(conversation_id = %self.id, count = state.messages.len(), "timeline hydrated");
    }

    /// Fetches the next older page. No-op while a fetch is in flight or once
    /// the server reported no further pages.
    pub async fn load_page(&self) -> Result<(), RestError> {
        let cursor = {
            let state = self.state.lock().await;
            if self.is_closed() || !state.has_more {
                return Ok(());
            }
            if self.loading.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            state.cursor.clone()
        };
        let _loading = LoadingGuard(&self.loading);

        let result = self
            .context
            .api
            .list_messages(
                self.kind,
                &self.id,
                cursor.as_ref(),
                self.context.page_size,
            )
            .await;

        {
            let mut state = self.state.lock().await;
            if self.is_closed() {
                debug!(conversation_id = %self.id, "store reset during page load; dropping result");
                return Ok(());
            }
            match &result {
                Ok(page) => {
                    let incoming: Vec<TimelineMessage> = page
                        .items
                        .iter()
                        .cloned()
                        .map(TimelineMessage::Confirmed)
                        .collect();
                    state.messages = merge(&state.messages, &incoming);
                    state.has_more = page.next_cursor.is_some();
                    state.cursor = page.next_cursor.clone();
                    state.last_error = None;
                    debug!(
                        conversation_id = %self.id,
                        received = page.items.len(),
                        has_more = state.has_more,
                        "page loaded"
                    );
                }
                Err(err) => {
                    warn!(conversation_id = %self.id, error = %err, "page load failed");
                    state.last_error = Some(err.clone());
                }
            }
        }

        match result {
            Ok(_) => {
                self.persist().await;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Optimistic send. The pending entry is visible before any network
    /// call; a failed upload leaves it in `sending`.
    pub async fn send(
        &self,
        text: Option<String>,
        upload: Option<FileUpload>,
    ) -> Result<ClientMsgId, SendError> {
        let client_msg_id = ClientMsgId::generate();
        let mut local = LocalMessage {
            client_msg_id: client_msg_id.clone(),
            conversation_id: self.id.clone(),
            sender_id: self.context.local_user.clone(),
            kind: upload.as_ref().map(|file| file.kind).unwrap_or_default(),
            text,
            attachment: upload
                .as_ref()
                .map(FileUpload::local_attachment)
                .unwrap_or_default(),
            created_at: Utc::now(),
        };

        self.insert_pending(&local).await;
        self.directory.update(&self.id, |conversation| {
            conversation.record_last_message(LastMessage::from(&local), local.created_at)
        });
        self.persist().await;

        if let Some(file) = upload.as_ref() {
            let uploaded = self.context.uploader.upload(file).await.map_err(|err| {
                warn!(conversation_id = %self.id, client_msg_id = %client_msg_id, error = %err, "attachment upload failed");
                SendError::Upload(err)
            })?;
            local.attachment = uploaded;
            self.insert_pending(&local).await;
        }

        let body = OutgoingBody {
            client_msg_id: client_msg_id.clone(),
            kind: local.kind,
            text: local.text.clone(),
            attachment: local.attachment.clone(),
        };
        self.context
            .connection
            .send(&ClientFrame::send(self.kind, self.id.clone(), body.clone()));

        if !self.context.connection.is_connected() {
            info!(conversation_id = %self.id, client_msg_id = %client_msg_id, "push channel down; posting message over rest");
            match self
                .context
                .api
                .send_message(self.kind, &self.id, &body)
                .await
            {
                Ok(message) => self.apply_ack(&client_msg_id, message).await,
                Err(err) => {
                    warn!(conversation_id = %self.id, client_msg_id = %client_msg_id, error = %err, "rest fallback send failed")
                }
            }
        }

        Ok(client_msg_id)
    }

    async fn insert_pending(&self, local: &LocalMessage) {
        let mut state = self.state.lock().await;
        if self.is_closed() {
            return;
        }
        state.messages = merge(
            &state.messages,
            &[TimelineMessage::Pending(local.clone())],
        );
    }

    /// Folds the pending entry with `client_msg_id` into the canonical
    /// server message.
    pub async fn apply_ack(&self, client_msg_id: &ClientMsgId, message: ServerMessage) {
        if self.is_closed() {
            return;
        }
        let mut message = message;
        if message.client_msg_id.is_none() {
            message.client_msg_id = Some(client_msg_id.clone());
        }
        {
            let mut state = self.state.lock().await;
            state.messages = merge(
                &state.messages,
                &[TimelineMessage::Confirmed(message.clone())],
            );
        }
        self.directory.update(&self.id, |conversation| {
            conversation.record_last_message(LastMessage::from(&message), message.created_at)
        });
        debug!(conversation_id = %self.id, client_msg_id = %client_msg_id, message_id = %message.id, "send acknowledged");
        self.persist().await;
    }

    /// Applies a pushed message. A focused conversation acknowledges it
    /// straight away; otherwise messages from other users bump unread.
    /// A re-delivered message is merged but counted and acknowledged once.
    pub async fn apply_push(&self, message: ServerMessage) {
        if self.is_closed() {
            return;
        }
        let from_peer = message.sender_id != self.context.local_user;
        let focused = self.context.focus.is_focused(self.kind, &self.id);
        let now = Utc::now();
        let mut message = message;

        let (is_new, acknowledge) = {
            let mut state = self.state.lock().await;
            let is_new = !state
                .messages
                .iter()
                .any(|m| m.server_id() == Some(&message.id));
            let acknowledge = focused && from_peer && is_new;
            if acknowledge && message.delivered_at.is_none() {
                message.delivered_at = Some(now);
            }
            state.messages = merge(
                &state.messages,
                &[TimelineMessage::Confirmed(message.clone())],
            );
            if acknowledge {
                mark_read_locked(&mut state, &message.id, now);
            }
            (is_new, acknowledge)
        };
        if !is_new {
            debug!(conversation_id = %self.id, message_id = %message.id, "push for known message merged");
        }

        self.directory.update(&self.id, |conversation| {
            conversation.record_last_message(LastMessage::from(&message), message.created_at);
            if acknowledge {
                conversation.unread_count = 0;
            } else if from_peer && is_new {
                conversation.unread_count += 1;
            }
        });

        if acknowledge {
            let connection = &self.context.connection;
            connection.send(&ClientFrame::delivered(
                self.kind,
                self.id.clone(),
                message.id.clone(),
                now,
            ));
            connection.send(&ClientFrame::read(
                self.kind,
                self.id.clone(),
                message.id.clone(),
                now,
            ));
        }
        self.persist().await;
    }

    /// Patches delivery timestamps of one message. Returns false when the
    /// message is not in this timeline.
    pub async fn apply_status_update(
        &self,
        message_id: &MessageId,
        delivered_at: Option<DateTime<Utc>>,
        read_at: Option<DateTime<Utc>>,
    ) -> bool {
        if self.is_closed() {
            return false;
        }
        {
            let mut state = self.state.lock().await;
            let Some(mut patched) = state
                .messages
                .iter()
                .filter_map(TimelineMessage::as_confirmed)
                .find(|m| &m.id == message_id)
                .cloned()
            else {
                return false;
            };
            if delivered_at.is_some() {
                patched.delivered_at = delivered_at;
            }
            if read_at.is_some() {
                patched.read_at = read_at;
            }
            state.messages = merge(&state.messages, &[TimelineMessage::Confirmed(patched)]);
        }
        if read_at.is_some() {
            self.directory
                .update(&self.id, |conversation| conversation.unread_count = 0);
        }
        self.persist().await;
        true
    }

    /// Marks every confirmed message created at or before `read_at` as read
    /// and clears the unread counter.
    pub async fn mark_read_up_to(&self, last_read_message_id: &MessageId, read_at: DateTime<Utc>) {
        if self.is_closed() {
            return;
        }
        {
            let mut state = self.state.lock().await;
            mark_read_locked(&mut state, last_read_message_id, read_at);
        }
        self.directory
            .update(&self.id, |conversation| conversation.unread_count = 0);
        self.persist().await;
    }

    /// Acknowledges the newest unread message from another user, if any.
    pub async fn acknowledge_latest(&self) -> Option<MessageId> {
        let latest = {
            let state = self.state.lock().await;
            let latest = state
                .messages
                .iter()
                .rev()
                .filter_map(TimelineMessage::as_confirmed)
                .find(|m| m.sender_id != self.context.local_user && m.read_at.is_none())
                .map(|m| m.id.clone());
            latest
        }?;
        let now = Utc::now();
        self.context.connection.send(&ClientFrame::read(
            self.kind,
            self.id.clone(),
            latest.clone(),
            now,
        ));
        self.mark_read_up_to(&latest, now).await;
        Some(latest)
    }

    /// Clears the timeline and detaches the store. Work still in flight
    /// finishes without touching the state or the cache.
    pub async fn reset(&self) {
        self.closed.store(true, Ordering::Release);
        let _gate = self.persist_gate.lock().await;
        *self.state.lock().await = TimelineState::default();
    }

    /// Saves the confirmed timeline and the conversation list. Failures are
    /// logged and swallowed.
    async fn persist(&self) {
        let _gate = self.persist_gate.lock().await;
        if self.is_closed() {
            return;
        }
        let confirmed: Vec<ServerMessage> = {
            let state = self.state.lock().await;
            let confirmed = state
                .messages
                .iter()
                .filter_map(TimelineMessage::as_confirmed)
                .cloned()
                .collect();
            confirmed
        };
        let cache = self.context.cache.as_ref();
        if let Err(err) = save_snapshot(cache, &self.cache_key(), &confirmed).await {
            warn!(conversation_id = %self.id, error = %err, "failed to persist timeline");
        }
        let list_key = CacheKey::ConversationList(self.kind);
        if let Err(err) = save_snapshot(cache, &list_key, &self.directory.snapshot()).await {
            warn!(kind = ?self.kind, error = %err, "failed to persist conversation list");
        }
    }
}

/// The named message is always included so a skewed server clock cannot
/// leave it unread.
fn mark_read_locked(state: &mut TimelineState, last_read_message_id: &MessageId, read_at: DateTime<Utc>) {
    let patches: Vec<TimelineMessage> = state
        .messages
        .iter()
        .filter_map(TimelineMessage::as_confirmed)
        .filter(|m| m.read_at.is_none())
        .filter(|m| m.created_at <= read_at || &m.id == last_read_message_id)
        .map(|m| {
            let mut patched = m.clone();
            patched.read_at = Some(read_at);
            TimelineMessage::Confirmed(patched)
        })
        .collect();
    if patches.is_empty() {
        return;
    }
    state.messages = merge(&state.messages, &patches);
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
