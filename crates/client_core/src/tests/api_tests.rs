use super::*;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex as StdMutex,
};

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode as AxumStatus},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use shared::domain::{ClientMsgId, Counterpart};
use tokio::net::TcpListener;

struct TestCredentials {
    token: StdMutex<Option<String>>,
    renewed: Option<String>,
    refreshes: AtomicUsize,
}

impl TestCredentials {
    fn new(token: &str, renewed: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            token: StdMutex::new(Some(token.to_string())),
            renewed: renewed.map(str::to_string),
            refreshes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl CredentialProvider for TestCredentials {
    fn access_token(&self) -> Option<String> {
        self.token.lock().expect("token").clone()
    }

    async fn refresh(&self) -> Option<String> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let renewed = self.renewed.clone()?;
        *self.token.lock().expect("token") = Some(renewed.clone());
        Some(renewed)
    }
}

#[derive(Clone, Default)]
struct ServerState {
    accepted_token: Arc<StdMutex<String>>,
    queries: Arc<StdMutex<Vec<std::collections::HashMap<String, String>>>>,
    uploads: Arc<StdMutex<Vec<(String, String, usize)>>>,
}

fn authorized(state: &ServerState, headers: &HeaderMap) -> bool {
    let expected = format!("Bearer {}", state.accepted_token.lock().expect("token"));
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        == Some(expected.as_str())
}

fn message_json(id: &str, dialog_id: &str) -> Value {
    json!({
        "id": id,
        "dialog_id": dialog_id,
        "client_msg_id": null,
        "sender_id": "u1",
        "type": "text",
        "text": "hello",
        "created_at": "2024-05-01T10:00:00+00:00",
        "delivered_at": null,
        "read_at": null
    })
}

async fn list_messages_handler(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Path(dialog_id): Path<String>,
    Query(query): Query<std::collections::HashMap<String, String>>,
) -> (AxumStatus, Json<Value>) {
    if !authorized(&state, &headers) {
        return (
            AxumStatus::UNAUTHORIZED,
            Json(json!({"error": {"code": "unauthorized", "message": "token expired"}})),
        );
    }
    state.queries.lock().expect("queries").push(query);
    (
        AxumStatus::OK,
        Json(json!({
            "items": [message_json("s1", &dialog_id)],
            "next_cursor": "2024-05-01T10:00:00+00:00"
        })),
    )
}

async fn post_message_handler(
    Path(dialog_id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let mut message = message_json("s77", &dialog_id);
    message["client_msg_id"] = body["client_msg_id"].clone();
    message["text"] = body["text"].clone();
    Json(json!({ "message": message }))
}

async fn create_dialog_handler(Json(body): Json<Value>) -> (AxumStatus, Json<Value>) {
    if body.get("peer_username").is_none() {
        return (
            AxumStatus::BAD_REQUEST,
            Json(json!({"error": {"code": "bad_request", "message": "peer required"}})),
        );
    }
    (
        AxumStatus::OK,
        Json(json!({"dialog": {
            "id": "d9",
            "peer": {"id": "u2", "username": body["peer_username"], "avatar_url": null},
            "last_message": null,
            "unread_count": 0,
            "last_message_at": null
        }})),
    )
}

async fn missing_group_handler() -> (AxumStatus, Json<Value>) {
    (
        AxumStatus::NOT_FOUND,
        Json(json!({"error": {"code": "not_found", "message": "group not found"}})),
    )
}

async fn upload_handler(State(state): State<ServerState>, mut multipart: Multipart) -> Json<Value> {
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.expect("field bytes");
        state
            .uploads
            .lock()
            .expect("uploads")
            .push((name, file_name, bytes.len()));
    }
    Json(json!({
        "url": "/uploads/abc.png",
        "file_name": "photo.png",
        "file_mime": "image/png",
        "file_size": 4
    }))
}

async fn spawn_server(accepted_token: &str) -> (String, ServerState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = ServerState::default();
    *state.accepted_token.lock().expect("token") = accepted_token.to_string();
    let app = Router::new()
        .route(
            "/dialogs/:dialog_id/messages",
            get(list_messages_handler).post(post_message_handler),
        )
        .route("/dialogs", post(create_dialog_handler))
        .route("/groups/:group_id/members", post(missing_group_handler))
        .route("/uploads", post(upload_handler))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

fn client(base_url: &str, credentials: Arc<TestCredentials>) -> HttpChatApi {
    HttpChatApi::new(base_url, DEFAULT_REQUEST_TIMEOUT, credentials).expect("client")
}

#[tokio::test]
async fn list_messages_sends_cursor_limit_and_bearer_token() {
    let (base_url, state) = spawn_server("token-1").await;
    let api = client(&base_url, TestCredentials::new("token-1", None));

    let page = api
        .list_messages(
            ConversationKind::Direct,
            &ConversationId::new("d1"),
            Some(&Cursor("2024-05-02T00:00:00+00:00".into())),
            30,
        )
        .await
        .expect("page");

    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].conversation_id, ConversationId::new("d1"));
    assert!(page.next_cursor.is_some());
    let queries = state.queries.lock().expect("queries");
    assert_eq!(queries[0].get("limit").map(String::as_str), Some("30"));
    assert_eq!(
        queries[0].get("before").map(String::as_str),
        Some("2024-05-02T00:00:00+00:00")
    );
}

#[tokio::test]
async fn first_page_request_omits_before() {
    let (base_url, state) = spawn_server("token-1").await;
    let api = client(&base_url, TestCredentials::new("token-1", None));

    api.list_messages(ConversationKind::Direct, &ConversationId::new("d1"), None, 30)
        .await
        .expect("page");

    assert!(!state.queries.lock().expect("queries")[0].contains_key("before"));
}

#[tokio::test]
async fn unauthorized_requests_share_one_refresh_and_retry() {
    let (base_url, _state) = spawn_server("fresh").await;
    let credentials = TestCredentials::new("stale", Some("fresh"));
    let api = client(&base_url, credentials.clone());
    let dialog = ConversationId::new("d1");

    let (first, second) = tokio::join!(
        api.list_messages(ConversationKind::Direct, &dialog, None, 30),
        api.list_messages(ConversationKind::Direct, &dialog, None, 30),
    );

    assert!(first.is_ok(), "first: {first:?}");
    assert!(second.is_ok(), "second: {second:?}");
    assert_eq!(credentials.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_refresh_surfaces_unauthorized() {
    let (base_url, _state) = spawn_server("fresh").await;
    let credentials = TestCredentials::new("stale", None);
    let api = client(&base_url, credentials.clone());

    let err = api
        .list_messages(ConversationKind::Direct, &ConversationId::new("d1"), None, 30)
        .await
        .expect_err("must fail");

    assert_eq!(err, RestError::Unauthorized);
    assert_eq!(credentials.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn error_envelope_is_decoded() {
    let (base_url, _state) = spawn_server("token-1").await;
    let api = client(&base_url, TestCredentials::new("token-1", None));

    let err = api
        .add_group_members(
            &ConversationId::new("g404"),
            &AddMembersRequest {
                member_usernames: vec!["carol".into()],
            },
        )
        .await
        .expect_err("must fail");

    match err {
        RestError::Server { status, error } => {
            assert_eq!(status, 404);
            assert_eq!(error.code, "not_found");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn create_dialog_returns_direct_conversation() {
    let (base_url, _state) = spawn_server("token-1").await;
    let api = client(&base_url, TestCredentials::new("token-1", None));

    let conversation = api
        .create_dialog(&CreateDialogRequest {
            peer_user_id: None,
            peer_username: Some("bob".into()),
        })
        .await
        .expect("dialog");

    assert_eq!(conversation.id, ConversationId::new("d9"));
    match conversation.counterpart {
        Counterpart::Peer { peer } => assert_eq!(peer.username, "bob"),
        other => panic!("unexpected counterpart: {other:?}"),
    }
}

#[tokio::test]
async fn rest_send_returns_canonical_message() {
    let (base_url, _state) = spawn_server("token-1").await;
    let api = client(&base_url, TestCredentials::new("token-1", None));
    let body = OutgoingBody {
        client_msg_id: ClientMsgId::new("c1"),
        kind: MessageKind::Text,
        text: Some("offline hello".into()),
        attachment: Attachment::default(),
    };

    let message = api
        .send_message(ConversationKind::Direct, &ConversationId::new("d1"), &body)
        .await
        .expect("message");

    assert_eq!(message.client_msg_id, Some(ClientMsgId::new("c1")));
    assert_eq!(message.text.as_deref(), Some("offline hello"));
}

#[tokio::test]
async fn upload_posts_multipart_file_and_normalizes_relative_url() {
    let (base_url, state) = spawn_server("token-1").await;
    let api = client(&base_url, TestCredentials::new("token-1", None));

    let attachment = api
        .upload(&FileUpload {
            kind: MessageKind::Image,
            file_name: "photo.png".into(),
            mime_type: Some("image/png".into()),
            bytes: vec![1, 2, 3, 4],
        })
        .await
        .expect("upload");

    assert_eq!(
        attachment.url.as_deref(),
        Some(format!("{base_url}/uploads/abc.png").as_str())
    );
    assert_eq!(attachment.mime_type.as_deref(), Some("image/png"));
    assert_eq!(
        state.uploads.lock().expect("uploads")[0],
        ("file".to_string(), "photo.png".to_string(), 4)
    );
}

#[test]
fn absolute_urls_are_kept() {
    let api = HttpChatApi::new(
        "http://api.local/",
        DEFAULT_REQUEST_TIMEOUT,
        Arc::new(StaticCredentials::new(None)),
    )
    .expect("client");

    assert_eq!(api.base_url(), "http://api.local");
    assert_eq!(
        api.normalize_url("https://cdn.local/a.png"),
        "https://cdn.local/a.png"
    );
    assert_eq!(api.normalize_url("/uploads/a.png"), "http://api.local/uploads/a.png");
    assert_eq!(api.normalize_url("uploads/a.png"), "http://api.local/uploads/a.png");
}
