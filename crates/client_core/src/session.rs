use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::Context;
use async_trait::async_trait;
use shared::{
    domain::{ClientMsgId, ConversationId, ConversationKind, UserId},
    protocol::ServerEvent,
};
use storage::CacheStore;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    api::{ChatApi, CredentialProvider, FileUpload, HttpChatApi, Uploader},
    config::ClientSettings,
    connection::{ConnectionEvent, ConnectionManager, ConnectionOptions, EventFilter, Subscription},
    error::{RestError, SendError},
    focus::FocusTracker,
    registry::ConversationRegistry,
    store::{ConversationStore, StoreContext},
    transport::WebSocketConnector,
};

/// Forwards renewed tokens to the push connection so an open socket
/// re-authenticates with the same credential the REST client uses.
pub struct CredentialRelay {
    inner: Arc<dyn CredentialProvider>,
    connection: Weak<ConnectionManager>,
}

impl CredentialRelay {
    pub fn new(inner: Arc<dyn CredentialProvider>, connection: Weak<ConnectionManager>) -> Self {
        Self { inner, connection }
    }
}

#[async_trait]
impl CredentialProvider for CredentialRelay {
    fn access_token(&self) -> Option<String> {
        self.inner.access_token()
    }

    async fn refresh(&self) -> Option<String> {
        let renewed = self.inner.refresh().await?;
        if let Some(connection) = self.connection.upgrade() {
            connection.set_credential(renewed.clone());
        }
        Some(renewed)
    }
}

pub struct SessionDependencies {
    pub local_user: UserId,
    pub api: Arc<dyn ChatApi>,
    pub uploader: Arc<dyn Uploader>,
    pub connection: Arc<ConnectionManager>,
    pub cache: Arc<dyn CacheStore>,
    pub page_size: u32,
}

struct Dispatcher {
    _subscription: Subscription,
    task: JoinHandle<()>,
}

/// Wires the connection, both registries, focus state and the cache into
/// one signed-in session.
pub struct ChatSession {
    connection: Arc<ConnectionManager>,
    cache: Arc<dyn CacheStore>,
    focus: Arc<FocusTracker>,
    direct: ConversationRegistry,
    groups: ConversationRegistry,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl ChatSession {
    pub fn new(deps: SessionDependencies) -> Arc<Self> {
        let focus = Arc::new(FocusTracker::new());
        let context = StoreContext {
            local_user: deps.local_user,
            api: deps.api,
            uploader: deps.uploader,
            connection: Arc::clone(&deps.connection),
            cache: Arc::clone(&deps.cache),
            focus: Arc::clone(&focus),
            page_size: deps.page_size,
        };
        Arc::new(Self {
            connection: deps.connection,
            cache: deps.cache,
            focus,
            direct: ConversationRegistry::new(ConversationKind::Direct, context.clone()),
            groups: ConversationRegistry::new(ConversationKind::Group, context),
            dispatcher: Mutex::new(None),
        })
    }

    /// Builds the websocket connector and HTTP client described by `settings`.
    pub fn from_settings(
        settings: &ClientSettings,
        local_user: UserId,
        credentials: Arc<dyn CredentialProvider>,
        cache: Arc<dyn CacheStore>,
    ) -> anyhow::Result<Arc<Self>> {
        let connector = WebSocketConnector::new(settings.websocket_url())
            .context("invalid websocket url")?;
        let websocket_url = connector.url().to_string();
        let connection = ConnectionManager::new(
            Arc::new(connector),
            ConnectionOptions {
                reconnect_delay: settings.reconnect_delay,
            },
        );
        let relay: Arc<dyn CredentialProvider> = Arc::new(CredentialRelay::new(
            credentials,
            Arc::downgrade(&connection),
        ));
        let api = Arc::new(
            HttpChatApi::new(
                settings.api_base_url.clone(),
                settings.request_timeout,
                relay,
            )
            .context("failed to build http client")?,
        );
        info!(
            api_base_url = api.base_url(),
            websocket_url = %websocket_url,
            "chat session configured"
        );
        Ok(Self::new(SessionDependencies {
            local_user,
            api: api.clone(),
            uploader: api,
            connection,
            cache,
            page_size: settings.page_size,
        }))
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn focus(&self) -> &FocusTracker {
        &self.focus
    }

    pub fn registry(&self, kind: ConversationKind) -> &ConversationRegistry {
        match kind {
            ConversationKind::Direct => &self.direct,
            ConversationKind::Group => &self.groups,
        }
    }

    /// Restores both conversation lists and their timelines from the cache.
    pub async fn hydrate(&self) {
        self.direct.hydrate().await;
        self.groups.hydrate().await;
    }

    /// Hydrates, starts routing server events, opens the push connection and
    /// refreshes both lists. List failures stay on the registries.
    pub async fn start(self: &Arc<Self>, credential: Option<String>) {
        self.hydrate().await;
        self.attach();
        self.connection.connect(credential);
        for registry in [&self.direct, &self.groups] {
            if let Err(err) = registry.refresh().await {
                warn!(kind = ?registry.kind(), error = %err, "initial list refresh failed");
            }
        }
        info!("chat session started");
    }

    /// Routes server events into the registries from a single task, so they
    /// are applied in arrival order.
    fn attach(self: &Arc<Self>) {
        let mut dispatcher = self.lock_dispatcher();
        if dispatcher.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
        let subscription = self.connection.subscribe(EventFilter::All, move |event| {
            if let ConnectionEvent::Server(event) = event {
                let _ = tx.send(event.clone());
            }
        });
        let session = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                session.handle_event(event).await;
            }
            debug!("event dispatcher stopped");
        });
        *dispatcher = Some(Dispatcher {
            _subscription: subscription,
            task,
        });
    }

    fn detach(&self) {
        if let Some(dispatcher) = self.lock_dispatcher().take() {
            dispatcher.task.abort();
        }
    }

    pub async fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::MessageNew { message } => self.direct.apply_push(message).await,
            ServerEvent::GroupMessageNew { message } => self.groups.apply_push(message).await,
            ServerEvent::MessageAck {
                client_msg_id,
                message,
            } => self.direct.apply_ack(&client_msg_id, message).await,
            ServerEvent::GroupMessageAck {
                client_msg_id,
                message,
            } => self.groups.apply_ack(&client_msg_id, message).await,
            ServerEvent::MessageStatus {
                dialog_id,
                message_id,
                delivered_at,
                read_at,
            } => {
                let applied = self
                    .direct
                    .apply_status_update(dialog_id.as_ref(), &message_id, delivered_at, read_at)
                    .await;
                if !applied {
                    debug!(message_id = %message_id, "status update for unknown message");
                }
            }
            ServerEvent::Error { error } => {
                debug!(code = %error.code, "server error frame received");
            }
        }
    }

    /// Makes `id` the active conversation and acknowledges its newest unread
    /// message when the app is in the foreground.
    pub async fn focus_conversation(
        &self,
        kind: ConversationKind,
        id: &ConversationId,
    ) -> Arc<ConversationStore> {
        self.focus.set_active(Some((kind, id.clone())));
        let store = self.registry(kind).store(id).await;
        if self.focus.is_foreground() {
            store.acknowledge_latest().await;
        }
        store
    }

    pub fn clear_focus(&self) {
        self.focus.set_active(None);
    }

    pub async fn set_foreground(&self, foreground: bool) {
        self.focus.set_foreground(foreground);
        if !foreground {
            return;
        }
        if let Some((kind, id)) = self.focus.active() {
            self.registry(kind).store(&id).await.acknowledge_latest().await;
        }
    }

    pub async fn load_older(&self, kind: ConversationKind, id: &ConversationId) -> Result<(), RestError> {
        self.registry(kind).store(id).await.load_page().await
    }

    pub async fn send_message(
        &self,
        kind: ConversationKind,
        id: &ConversationId,
        text: Option<String>,
        upload: Option<FileUpload>,
    ) -> Result<ClientMsgId, SendError> {
        let registry = self.registry(kind);
        if registry.conversation(id).is_none() {
            return Err(SendError::UnknownConversation(id.clone()));
        }
        registry.store(id).await.send(text, upload).await
    }

    /// Signs out: closes the connection and drops every store, the focus
    /// state and all cached keys.
    pub async fn reset(&self) -> anyhow::Result<()> {
        self.connection.disconnect();
        self.detach();
        self.direct.reset().await;
        self.groups.reset().await;
        self.focus.clear();
        self.cache
            .clear()
            .await
            .context("failed to clear conversation cache")?;
        info!("chat session reset");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.detach();
        self.connection.disconnect();
    }

    fn lock_dispatcher(&self) -> MutexGuard<'_, Option<Dispatcher>> {
        self.dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
