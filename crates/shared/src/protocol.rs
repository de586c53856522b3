use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        Attachment, ClientMsgId, Conversation, ConversationId, ConversationKind, Counterpart,
        LastMessage, MessageId, MessageKind, ServerMessage, UserId, UserSummary,
    },
    error::ApiError,
};

/// Body shared by `message:send`, `group:message:send` and the REST
/// fallback POST.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingBody {
    pub client_msg_id: ClientMsgId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub text: Option<String>,
    #[serde(flatten)]
    pub attachment: Attachment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectSend {
    pub dialog_id: ConversationId,
    #[serde(flatten)]
    pub body: OutgoingBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSend {
    pub group_id: ConversationId,
    #[serde(flatten)]
    pub body: OutgoingBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientFrame {
    #[serde(rename = "auth")]
    Auth { access_token: String },
    #[serde(rename = "message:send")]
    MessageSend(DirectSend),
    #[serde(rename = "message:delivered")]
    MessageDelivered {
        message_id: MessageId,
        delivered_at: DateTime<Utc>,
    },
    #[serde(rename = "message:read")]
    MessageRead {
        dialog_id: ConversationId,
        last_read_message_id: MessageId,
        read_at: DateTime<Utc>,
    },
    #[serde(rename = "group:message:send")]
    GroupMessageSend(GroupSend),
    #[serde(rename = "group:message:delivered")]
    GroupMessageDelivered {
        group_id: ConversationId,
        message_id: MessageId,
        delivered_at: DateTime<Utc>,
    },
    #[serde(rename = "group:message:read")]
    GroupMessageRead {
        group_id: ConversationId,
        last_read_message_id: MessageId,
        read_at: DateTime<Utc>,
    },
}

impl ClientFrame {
    pub fn send(kind: ConversationKind, conversation_id: ConversationId, body: OutgoingBody) -> Self {
        match kind {
            ConversationKind::Direct => ClientFrame::MessageSend(DirectSend {
                dialog_id: conversation_id,
                body,
            }),
            ConversationKind::Group => ClientFrame::GroupMessageSend(GroupSend {
                group_id: conversation_id,
                body,
            }),
        }
    }

    pub fn delivered(
        kind: ConversationKind,
        conversation_id: ConversationId,
        message_id: MessageId,
        delivered_at: DateTime<Utc>,
    ) -> Self {
        match kind {
            ConversationKind::Direct => ClientFrame::MessageDelivered {
                message_id,
                delivered_at,
            },
            ConversationKind::Group => ClientFrame::GroupMessageDelivered {
                group_id: conversation_id,
                message_id,
                delivered_at,
            },
        }
    }

    pub fn read(
        kind: ConversationKind,
        conversation_id: ConversationId,
        last_read_message_id: MessageId,
        read_at: DateTime<Utc>,
    ) -> Self {
        match kind {
            ConversationKind::Direct => ClientFrame::MessageRead {
                dialog_id: conversation_id,
                last_read_message_id,
                read_at,
            },
            ConversationKind::Group => ClientFrame::GroupMessageRead {
                group_id: conversation_id,
                last_read_message_id,
                read_at,
            },
        }
    }

    /// Wire name of the frame, as carried in the `type` field.
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientFrame::Auth { .. } => "auth",
            ClientFrame::MessageSend(_) => "message:send",
            ClientFrame::MessageDelivered { .. } => "message:delivered",
            ClientFrame::MessageRead { .. } => "message:read",
            ClientFrame::GroupMessageSend(_) => "group:message:send",
            ClientFrame::GroupMessageDelivered { .. } => "group:message:delivered",
            ClientFrame::GroupMessageRead { .. } => "group:message:read",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "message:new")]
    MessageNew { message: ServerMessage },
    #[serde(rename = "message:ack")]
    MessageAck {
        client_msg_id: ClientMsgId,
        message: ServerMessage,
    },
    #[serde(rename = "message:status")]
    MessageStatus {
        #[serde(default)]
        dialog_id: Option<ConversationId>,
        message_id: MessageId,
        #[serde(default)]
        delivered_at: Option<DateTime<Utc>>,
        #[serde(default)]
        read_at: Option<DateTime<Utc>>,
    },
    #[serde(rename = "group:message:new")]
    GroupMessageNew { message: ServerMessage },
    #[serde(rename = "group:message:ack")]
    GroupMessageAck {
        client_msg_id: ClientMsgId,
        message: ServerMessage,
    },
    #[serde(rename = "error")]
    Error { error: ApiError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    MessageNew,
    MessageAck,
    MessageStatus,
    GroupMessageNew,
    GroupMessageAck,
    Error,
}

impl ServerEvent {
    pub fn kind(&self) -> ServerEventKind {
        match self {
            ServerEvent::MessageNew { .. } => ServerEventKind::MessageNew,
            ServerEvent::MessageAck { .. } => ServerEventKind::MessageAck,
            ServerEvent::MessageStatus { .. } => ServerEventKind::MessageStatus,
            ServerEvent::GroupMessageNew { .. } => ServerEventKind::GroupMessageNew,
            ServerEvent::GroupMessageAck { .. } => ServerEventKind::GroupMessageAck,
            ServerEvent::Error { .. } => ServerEventKind::Error,
        }
    }
}

/// Opaque pagination pointer returned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub String);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(default)]
    pub next_cursor: Option<Cursor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogSummary {
    pub id: ConversationId,
    pub peer: UserSummary,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
}

impl From<DialogSummary> for Conversation {
    fn from(value: DialogSummary) -> Self {
        Self {
            id: value.id,
            kind: ConversationKind::Direct,
            counterpart: Counterpart::Peer { peer: value.peer },
            last_message: value.last_message,
            last_message_at: value.last_message_at,
            unread_count: value.unread_count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSummary {
    pub id: ConversationId,
    pub name: String,
    #[serde(default)]
    pub owner_id: Option<UserId>,
    #[serde(default)]
    pub members: Vec<UserSummary>,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
}

impl From<GroupSummary> for Conversation {
    fn from(value: GroupSummary) -> Self {
        Self {
            id: value.id,
            kind: ConversationKind::Group,
            counterpart: Counterpart::Members {
                name: value.name,
                owner_id: value.owner_id,
                members: value.members,
            },
            last_message: value.last_message,
            last_message_at: value.last_message_at,
            unread_count: value.unread_count,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DialogEnvelope {
    pub dialog: DialogSummary,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupEnvelope {
    pub group: GroupSummary,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageEnvelope {
    pub message: ServerMessage,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateDialogRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_user_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_username: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub member_usernames: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddMembersRequest {
    pub member_usernames: Vec<String>,
}

/// Response of the multipart upload endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadResponse {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub absolute_url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_mime: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}
