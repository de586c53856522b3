use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{Attachment, Conversation, ConversationId, ConversationKind, MessageKind, ServerMessage},
    error::ErrorEnvelope,
    protocol::{
        AddMembersRequest, CreateDialogRequest, CreateGroupRequest, Cursor, DialogEnvelope,
        DialogSummary, GroupEnvelope, GroupSummary, MessageEnvelope, OutgoingBody, Page,
        UploadResponse,
    },
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::RestError;

pub const DEFAULT_PAGE_SIZE: u32 = 30;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(12);

/// Supplies the bearer token and renews it after a 401.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    fn access_token(&self) -> Option<String>;

    /// Returns the renewed token, or `None` when the session cannot be renewed.
    async fn refresh(&self) -> Option<String>;
}

/// A fixed token that is never renewed.
pub struct StaticCredentials {
    token: Option<String>,
}

impl StaticCredentials {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    fn access_token(&self) -> Option<String> {
        self.token.clone()
    }

    async fn refresh(&self) -> Option<String> {
        None
    }
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_conversations(
        &self,
        kind: ConversationKind,
    ) -> Result<Vec<Conversation>, RestError>;

    /// Next older page; `before = None` requests the newest page.
    async fn list_messages(
        &self,
        kind: ConversationKind,
        conversation_id: &ConversationId,
        before: Option<&Cursor>,
        limit: u32,
    ) -> Result<Page<ServerMessage>, RestError>;

    async fn send_message(
        &self,
        kind: ConversationKind,
        conversation_id: &ConversationId,
        body: &OutgoingBody,
    ) -> Result<ServerMessage, RestError>;

    async fn create_dialog(&self, request: &CreateDialogRequest) -> Result<Conversation, RestError>;

    async fn create_group(&self, request: &CreateGroupRequest) -> Result<Conversation, RestError>;

    async fn add_group_members(
        &self,
        group_id: &ConversationId,
        request: &AddMembersRequest,
    ) -> Result<Conversation, RestError>;
}

/// File chosen by the user, before upload.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub kind: MessageKind,
    pub file_name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl FileUpload {
    /// Descriptor shown while the upload is in flight.
    pub fn local_attachment(&self) -> Attachment {
        Attachment {
            url: None,
            name: Some(self.file_name.clone()),
            mime_type: self.mime_type.clone(),
            size: Some(self.bytes.len() as u64),
        }
    }
}

#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, file: &FileUpload) -> Result<Attachment, RestError>;
}

#[derive(Serialize)]
struct ListMessagesQuery<'a> {
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<&'a str>,
}

/// REST client for the chat server.
pub struct HttpChatApi {
    http: Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
    refresh_gate: Mutex<()>,
}

impl HttpChatApi {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, RestError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            refresh_gate: Mutex::new(()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn collection(kind: ConversationKind) -> &'static str {
        match kind {
            ConversationKind::Direct => "/dialogs",
            ConversationKind::Group => "/groups",
        }
    }

    /// Relative upload URLs are served from the API host.
    pub fn normalize_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else if url.starts_with('/') {
            self.url(url)
        } else {
            format!("{}/{url}", self.base_url)
        }
    }

    /// Sends the request with the current token. On 401 the token is renewed
    /// once, shared across concurrent callers, and the request is replayed.
    async fn execute<T, F>(&self, build: F) -> Result<T, RestError>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> Result<RequestBuilder, RestError> + Send + Sync,
    {
        let token = self.credentials.access_token();
        let response = self.dispatch(&build, token.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return decode(response).await;
        }

        let Some(renewed) = self.renew_token(token).await else {
            warn!("credential refresh unavailable after 401");
            return Err(RestError::Unauthorized);
        };
        let retried = self.dispatch(&build, Some(&renewed)).await?;
        decode(retried).await
    }

    async fn dispatch<F>(&self, build: &F, token: Option<&str>) -> Result<Response, RestError>
    where
        F: Fn(&Client) -> Result<RequestBuilder, RestError> + Send + Sync,
    {
        let mut request = build(&self.http)?;
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?)
    }

    async fn renew_token(&self, stale: Option<String>) -> Option<String> {
        let _gate = self.refresh_gate.lock().await;
        let current = self.credentials.access_token();
        if current.is_some() && current != stale {
            debug!("token already renewed by a concurrent request");
            return current;
        }
        let renewed = self.credentials.refresh().await;
        if renewed.is_some() {
            info!("access token renewed");
        }
        renewed
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, RestError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|err| RestError::Decode(err.to_string()));
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(RestError::Unauthorized);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => Err(RestError::Server {
            status: status.as_u16(),
            error: envelope.error,
        }),
        Err(_) => Err(RestError::Status(status.as_u16())),
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_conversations(
        &self,
        kind: ConversationKind,
    ) -> Result<Vec<Conversation>, RestError> {
        let url = self.url(Self::collection(kind));
        let conversations = match kind {
            ConversationKind::Direct => {
                let page: Page<DialogSummary> =
                    self.execute(|http| Ok(http.get(url.as_str()))).await?;
                page.items.into_iter().map(Conversation::from).collect()
            }
            ConversationKind::Group => {
                let page: Page<GroupSummary> =
                    self.execute(|http| Ok(http.get(url.as_str()))).await?;
                page.items.into_iter().map(Conversation::from).collect()
            }
        };
        Ok(conversations)
    }

    async fn list_messages(
        &self,
        kind: ConversationKind,
        conversation_id: &ConversationId,
        before: Option<&Cursor>,
        limit: u32,
    ) -> Result<Page<ServerMessage>, RestError> {
        let url = self.url(&format!(
            "{}/{conversation_id}/messages",
            Self::collection(kind)
        ));
        let query = ListMessagesQuery {
            limit,
            before: before.map(|cursor| cursor.0.as_str()),
        };
        self.execute(|http| Ok(http.get(url.as_str()).query(&query)))
            .await
    }

    async fn send_message(
        &self,
        kind: ConversationKind,
        conversation_id: &ConversationId,
        body: &OutgoingBody,
    ) -> Result<ServerMessage, RestError> {
        let url = self.url(&format!(
            "{}/{conversation_id}/messages",
            Self::collection(kind)
        ));
        let envelope: MessageEnvelope = self
            .execute(|http| Ok(http.post(url.as_str()).json(body)))
            .await?;
        Ok(envelope.message)
    }

    async fn create_dialog(&self, request: &CreateDialogRequest) -> Result<Conversation, RestError> {
        let url = self.url("/dialogs");
        let envelope: DialogEnvelope = self
            .execute(|http| Ok(http.post(url.as_str()).json(request)))
            .await?;
        Ok(envelope.dialog.into())
    }

    async fn create_group(&self, request: &CreateGroupRequest) -> Result<Conversation, RestError> {
        let url = self.url("/groups");
        let envelope: GroupEnvelope = self
            .execute(|http| Ok(http.post(url.as_str()).json(request)))
            .await?;
        Ok(envelope.group.into())
    }

    async fn add_group_members(
        &self,
        group_id: &ConversationId,
        request: &AddMembersRequest,
    ) -> Result<Conversation, RestError> {
        let url = self.url(&format!("/groups/{group_id}/members"));
        let envelope: GroupEnvelope = self
            .execute(|http| Ok(http.post(url.as_str()).json(request)))
            .await?;
        Ok(envelope.group.into())
    }
}

#[async_trait]
impl Uploader for HttpChatApi {
    async fn upload(&self, file: &FileUpload) -> Result<Attachment, RestError> {
        let url = self.url("/uploads");
        let response: UploadResponse = self
            .execute(|http| {
                let part = multipart::Part::bytes(file.bytes.clone())
                    .file_name(file.file_name.clone())
                    .mime_str(
                        file.mime_type
                            .as_deref()
                            .unwrap_or("application/octet-stream"),
                    )?;
                let form = multipart::Form::new().part("file", part);
                Ok(http.post(url.as_str()).multipart(form))
            })
            .await?;

        let raw_url = response
            .absolute_url
            .or(response.url)
            .ok_or(RestError::MissingUploadUrl)?;
        Ok(Attachment {
            url: Some(self.normalize_url(&raw_url)),
            name: response.file_name.or_else(|| Some(file.file_name.clone())),
            mime_type: response.file_mime.or_else(|| file.mime_type.clone()),
            size: response.file_size.or(Some(file.bytes.len() as u64)),
        })
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
