use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{
        Attachment, Conversation, ConversationId, ConversationKind, Counterpart, MessageId,
        MessageKind, ServerMessage, UserId, UserSummary,
    },
    protocol::{AddMembersRequest, CreateDialogRequest, CreateGroupRequest, Cursor, OutgoingBody, Page},
};
use storage::MemoryCache;
use tokio::sync::mpsc;

use crate::{
    api::{ChatApi, FileUpload, Uploader},
    connection::{ConnectionEvent, ConnectionManager, ConnectionOptions, EventFilter, Subscription},
    error::{RestError, TransportError},
    focus::FocusTracker,
    store::StoreContext,
    transport::{Connector, Transport, TransportEvent},
};

pub(crate) const LOCAL_USER: &str = "me";
pub(crate) const PEER_USER: &str = "peer";

/// Server end of an in-memory socket.
pub(crate) struct ServerSide {
    pub received: mpsc::UnboundedReceiver<String>,
    pub push: mpsc::UnboundedSender<TransportEvent>,
}

impl ServerSide {
    pub async fn next_frame(&mut self) -> serde_json::Value {
        let text = tokio::time::timeout(Duration::from_secs(2), self.received.recv())
            .await
            .expect("frame within timeout")
            .expect("socket open");
        serde_json::from_str(&text).expect("json frame")
    }

    pub fn push_json(&self, value: serde_json::Value) {
        self.push
            .send(TransportEvent::Frame(value.to_string()))
            .expect("client reader alive");
    }
}

#[derive(Default)]
pub(crate) struct MemoryConnector {
    attempts: AtomicUsize,
    fail: AtomicBool,
    dead_writer: AtomicBool,
    sockets: Mutex<Vec<Option<ServerSide>>>,
}

impl MemoryConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Connections succeed but their writer is already closed.
    pub fn set_dead_writer(&self, dead: bool) {
        self.dead_writer.store(dead, Ordering::SeqCst);
    }

    /// Waits for the `index`-th successful connection and takes its server end.
    pub async fn socket(&self, index: usize) -> ServerSide {
        for _ in 0..400 {
            {
                let mut sockets = self.sockets.lock().expect("sockets");
                if let Some(slot) = sockets.get_mut(index) {
                    return slot.take().expect("socket already taken");
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("socket {index} never opened");
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Transport, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("refused".into()));
        }
        let (outbound, received) = mpsc::unbounded_channel();
        let (push, inbound) = mpsc::unbounded_channel();
        if self.dead_writer.load(Ordering::SeqCst) {
            drop(received);
            return Ok(Transport { outbound, inbound });
        }
        self.sockets
            .lock()
            .expect("sockets")
            .push(Some(ServerSide { received, push }));
        Ok(Transport { outbound, inbound })
    }
}

pub(crate) fn record_events(
    manager: &ConnectionManager,
    filter: EventFilter,
) -> (Arc<Mutex<Vec<ConnectionEvent>>>, Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription = manager.subscribe(filter, move |event| {
        sink.lock().expect("events").push(event.clone());
    });
    (seen, subscription)
}

pub(crate) async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

pub(crate) async fn wait_until_async<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

pub(crate) fn at_minute(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).single().expect("valid time")
        + chrono::Duration::minutes(minute)
}

pub(crate) fn server_message(id: &str, conversation: &str, sender: &str, minute: i64) -> ServerMessage {
    ServerMessage {
        id: MessageId::new(id),
        conversation_id: ConversationId::new(conversation),
        client_msg_id: None,
        sender_id: UserId::new(sender),
        sender_username: None,
        kind: MessageKind::Text,
        text: Some(format!("text of {id}")),
        attachment: Attachment::default(),
        created_at: at_minute(minute),
        delivered_at: None,
        read_at: None,
    }
}

pub(crate) fn direct_conversation(id: &str) -> Conversation {
    Conversation {
        id: ConversationId::new(id),
        kind: ConversationKind::Direct,
        counterpart: Counterpart::Peer {
            peer: UserSummary {
                id: UserId::new(PEER_USER),
                username: "bob".into(),
                avatar_url: None,
            },
        },
        last_message: None,
        last_message_at: None,
        unread_count: 0,
    }
}

pub(crate) fn group_conversation(id: &str, name: &str) -> Conversation {
    Conversation {
        id: ConversationId::new(id),
        kind: ConversationKind::Group,
        counterpart: Counterpart::Members {
            name: name.into(),
            owner_id: Some(UserId::new(LOCAL_USER)),
            members: Vec::new(),
        },
        last_message: None,
        last_message_at: None,
        unread_count: 0,
    }
}

pub(crate) fn page(items: Vec<ServerMessage>, next_cursor: Option<&str>) -> Page<ServerMessage> {
    Page {
        items,
        next_cursor: next_cursor.map(|c| Cursor(c.to_string())),
    }
}

/// Scripted REST backend. Unscripted calls answer with empty pages or
/// echo the request back.
#[derive(Default)]
pub(crate) struct MockApi {
    pub page_requests: Mutex<Vec<(ConversationId, Option<Cursor>, u32)>>,
    pub pages: Mutex<VecDeque<Result<Page<ServerMessage>, RestError>>>,
    /// Held by a test to keep `list_messages` in flight.
    pub page_gate: tokio::sync::Mutex<()>,
    pub list_calls: AtomicUsize,
    /// Held by a test to keep `list_conversations` in flight.
    pub list_gate: tokio::sync::Mutex<()>,
    pub direct_list: Mutex<Vec<Conversation>>,
    pub group_list: Mutex<Vec<Conversation>>,
    pub list_error: Mutex<Option<RestError>>,
    pub sent: Mutex<Vec<(ConversationId, OutgoingBody)>>,
    pub send_error: Mutex<Option<RestError>>,
    pub created_dialogs: Mutex<Vec<(Option<UserId>, Option<String>)>>,
    pub added_members: Mutex<Vec<(ConversationId, Vec<String>)>>,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_page(&self, result: Result<Page<ServerMessage>, RestError>) {
        self.pages.lock().expect("pages").push_back(result);
    }

    pub fn page_request_count(&self) -> usize {
        self.page_requests.lock().expect("page requests").len()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("sent").len()
    }
}

#[async_trait]
impl ChatApi for MockApi {
    async fn list_conversations(
        &self,
        kind: ConversationKind,
    ) -> Result<Vec<Conversation>, RestError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let _gate = self.list_gate.lock().await;
        if let Some(err) = self.list_error.lock().expect("list error").clone() {
            return Err(err);
        }
        let list = match kind {
            ConversationKind::Direct => &self.direct_list,
            ConversationKind::Group => &self.group_list,
        };
        Ok(list.lock().expect("list").clone())
    }

    async fn list_messages(
        &self,
        _kind: ConversationKind,
        conversation_id: &ConversationId,
        before: Option<&Cursor>,
        limit: u32,
    ) -> Result<Page<ServerMessage>, RestError> {
        self.page_requests.lock().expect("page requests").push((
            conversation_id.clone(),
            before.cloned(),
            limit,
        ));
        let _gate = self.page_gate.lock().await;
        self.pages
            .lock()
            .expect("pages")
            .pop_front()
            .unwrap_or_else(|| Ok(page(Vec::new(), None)))
    }

    async fn send_message(
        &self,
        _kind: ConversationKind,
        conversation_id: &ConversationId,
        body: &OutgoingBody,
    ) -> Result<ServerMessage, RestError> {
        self.sent
            .lock()
            .expect("sent")
            .push((conversation_id.clone(), body.clone()));
        if let Some(err) = self.send_error.lock().expect("send error").clone() {
            return Err(err);
        }
        Ok(ServerMessage {
            id: MessageId::new(format!("rest-{}", body.client_msg_id)),
            conversation_id: conversation_id.clone(),
            client_msg_id: Some(body.client_msg_id.clone()),
            sender_id: UserId::new(LOCAL_USER),
            sender_username: None,
            kind: body.kind,
            text: body.text.clone(),
            attachment: body.attachment.clone(),
            created_at: Utc::now(),
            delivered_at: None,
            read_at: None,
        })
    }

    async fn create_dialog(&self, request: &CreateDialogRequest) -> Result<Conversation, RestError> {
        self.created_dialogs
            .lock()
            .expect("dialogs")
            .push((request.peer_user_id.clone(), request.peer_username.clone()));
        Ok(direct_conversation("d-new"))
    }

    async fn create_group(&self, request: &CreateGroupRequest) -> Result<Conversation, RestError> {
        Ok(group_conversation("g-new", &request.name))
    }

    async fn add_group_members(
        &self,
        group_id: &ConversationId,
        request: &AddMembersRequest,
    ) -> Result<Conversation, RestError> {
        self.added_members
            .lock()
            .expect("members")
            .push((group_id.clone(), request.member_usernames.clone()));
        let mut group = group_conversation(group_id.as_str(), "renamed");
        if let Counterpart::Members { members, .. } = &mut group.counterpart {
            members.extend(request.member_usernames.iter().map(|name| UserSummary {
                id: UserId::new(format!("id-{name}")),
                username: name.clone(),
                avatar_url: None,
            }));
        }
        Ok(group)
    }
}

#[derive(Default)]
pub(crate) struct MockUploader {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

impl MockUploader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Uploader for MockUploader {
    async fn upload(&self, file: &FileUpload) -> Result<Attachment, RestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(RestError::Status(413));
        }
        Ok(Attachment {
            url: Some(format!("http://files.test/uploads/{}", file.file_name)),
            name: Some(file.file_name.clone()),
            mime_type: file.mime_type.clone(),
            size: Some(file.bytes.len() as u64),
        })
    }
}

/// Store collaborators backed by in-memory fakes. The connection starts
/// disconnected.
pub(crate) struct Harness {
    pub api: Arc<MockApi>,
    pub uploader: Arc<MockUploader>,
    pub connector: Arc<MemoryConnector>,
    pub connection: Arc<ConnectionManager>,
    pub cache: Arc<MemoryCache>,
    pub focus: Arc<FocusTracker>,
}

impl Harness {
    pub fn new() -> Self {
        let connector = MemoryConnector::new();
        let connection = ConnectionManager::new(
            connector.clone(),
            ConnectionOptions {
                reconnect_delay: Duration::from_millis(50),
            },
        );
        Self {
            api: MockApi::new(),
            uploader: MockUploader::new(),
            connector,
            connection,
            cache: Arc::new(MemoryCache::new()),
            focus: Arc::new(FocusTracker::new()),
        }
    }

    pub fn context(&self) -> StoreContext {
        StoreContext {
            local_user: UserId::new(LOCAL_USER),
            api: self.api.clone(),
            uploader: self.uploader.clone(),
            connection: Arc::clone(&self.connection),
            cache: self.cache.clone(),
            focus: Arc::clone(&self.focus),
            page_size: 30,
        }
    }

    /// Opens the push connection and returns the server end after auth.
    pub async fn connect(&self) -> ServerSide {
        self.connection.connect(Some("token".into()));
        let mut socket = self.connector.socket(0).await;
        let auth = socket.next_frame().await;
        assert_eq!(auth["type"], "auth");
        let connection = Arc::clone(&self.connection);
        wait_until(move || connection.is_connected()).await;
        socket
    }
}
