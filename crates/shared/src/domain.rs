use std::{cmp::Ordering, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(ClientMsgId);

impl ClientMsgId {
    /// Fresh correlation id for an optimistic send.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
}

/// Attachment descriptor as it travels on the wire (`file_*` fields).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "file_url", default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "file_name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "file_mime", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(rename = "file_size", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl Attachment {
    pub fn is_empty(&self) -> bool {
        self.url.is_none() && self.name.is_none() && self.mime_type.is_none() && self.size.is_none()
    }

    /// Field-wise overlay: populated fields of `other` win, absent ones keep `self`.
    pub fn overlay(&mut self, other: &Attachment) {
        overlay_field(&mut self.url, &other.url);
        overlay_field(&mut self.name, &other.name);
        overlay_field(&mut self.mime_type, &other.mime_type);
        overlay_field(&mut self.size, &other.size);
    }
}

pub(crate) fn overlay_field<T: Clone>(target: &mut Option<T>, incoming: &Option<T>) {
    if let Some(value) = incoming {
        *target = Some(value.clone());
    }
}

/// A message as confirmed by the server.
///
/// Accepts both `dialog_id` and `group_id` on input so the same record serves
/// direct and group timelines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub id: MessageId,
    #[serde(alias = "dialog_id", alias = "group_id")]
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_msg_id: Option<ClientMsgId>,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(flatten)]
    pub attachment: Attachment,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

impl ServerMessage {
    /// Shallow merge of `incoming` over `self`. Null fields on the incoming
    /// side count as absent, so timestamps never regress.
    pub fn overlay(&mut self, incoming: &ServerMessage) {
        self.id = incoming.id.clone();
        self.conversation_id = incoming.conversation_id.clone();
        overlay_field(&mut self.client_msg_id, &incoming.client_msg_id);
        self.sender_id = incoming.sender_id.clone();
        overlay_field(&mut self.sender_username, &incoming.sender_username);
        self.kind = incoming.kind;
        overlay_field(&mut self.text, &incoming.text);
        self.attachment.overlay(&incoming.attachment);
        self.created_at = incoming.created_at;
        overlay_field(&mut self.delivered_at, &incoming.delivered_at);
        overlay_field(&mut self.read_at, &incoming.read_at);
    }

    pub fn status(&self) -> DeliveryStatus {
        if self.read_at.is_some() {
            DeliveryStatus::Read
        } else if self.delivered_at.is_some() {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Sent
        }
    }
}

/// A locally originated message that the server has not acknowledged yet.
/// Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalMessage {
    pub client_msg_id: ClientMsgId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub kind: MessageKind,
    pub text: Option<String>,
    pub attachment: Attachment,
    pub created_at: DateTime<Utc>,
}

impl LocalMessage {
    fn overlay(&mut self, incoming: &LocalMessage) {
        self.kind = incoming.kind;
        overlay_field(&mut self.text, &incoming.text);
        self.attachment.overlay(&incoming.attachment);
        self.created_at = incoming.created_at;
    }
}

/// Resolved identity of a timeline entry: the server id when known, the
/// correlation id otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKey {
    Server(MessageId),
    Local(ClientMsgId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimelineMessage {
    Pending(LocalMessage),
    Confirmed(ServerMessage),
}

impl TimelineMessage {
    pub fn key(&self) -> MessageKey {
        match self {
            TimelineMessage::Pending(local) => MessageKey::Local(local.client_msg_id.clone()),
            TimelineMessage::Confirmed(message) => MessageKey::Server(message.id.clone()),
        }
    }

    pub fn client_msg_id(&self) -> Option<&ClientMsgId> {
        match self {
            TimelineMessage::Pending(local) => Some(&local.client_msg_id),
            TimelineMessage::Confirmed(message) => message.client_msg_id.as_ref(),
        }
    }

    pub fn server_id(&self) -> Option<&MessageId> {
        match self {
            TimelineMessage::Pending(_) => None,
            TimelineMessage::Confirmed(message) => Some(&message.id),
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            TimelineMessage::Pending(local) => local.created_at,
            TimelineMessage::Confirmed(message) => message.created_at,
        }
    }

    pub fn sender_id(&self) -> &UserId {
        match self {
            TimelineMessage::Pending(local) => &local.sender_id,
            TimelineMessage::Confirmed(message) => &message.sender_id,
        }
    }

    pub fn status(&self) -> DeliveryStatus {
        match self {
            TimelineMessage::Pending(_) => DeliveryStatus::Sending,
            TimelineMessage::Confirmed(message) => message.status(),
        }
    }

    pub fn as_confirmed(&self) -> Option<&ServerMessage> {
        match self {
            TimelineMessage::Confirmed(message) => Some(message),
            TimelineMessage::Pending(_) => None,
        }
    }

    /// Folds `incoming` into `self` in place. A confirmed record always
    /// replaces a pending one; a pending record never downgrades a confirmed
    /// one.
    pub fn absorb(&mut self, incoming: &TimelineMessage) {
        match (&mut *self, incoming) {
            (TimelineMessage::Confirmed(current), TimelineMessage::Confirmed(next)) => {
                current.overlay(next);
            }
            (TimelineMessage::Pending(current), TimelineMessage::Pending(next)) => {
                current.overlay(next);
            }
            (TimelineMessage::Pending(local), TimelineMessage::Confirmed(next)) => {
                let mut confirmed = next.clone();
                if confirmed.text.is_none() {
                    confirmed.text = local.text.clone();
                }
                let mut attachment = local.attachment.clone();
                attachment.overlay(&confirmed.attachment);
                confirmed.attachment = attachment;
                if confirmed.client_msg_id.is_none() {
                    confirmed.client_msg_id = Some(local.client_msg_id.clone());
                }
                *self = TimelineMessage::Confirmed(confirmed);
            }
            (TimelineMessage::Confirmed(_), TimelineMessage::Pending(_)) => {}
        }
    }

    /// Timeline ordering: created-at ascending, identity key as tie-breaker.
    pub fn timeline_cmp(&self, other: &TimelineMessage) -> Ordering {
        self.created_at()
            .cmp(&other.created_at())
            .then_with(|| self.key().cmp(&other.key()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Counterpart {
    Peer {
        peer: UserSummary,
    },
    Members {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner_id: Option<UserId>,
        members: Vec<UserSummary>,
    },
}

/// Denormalized preview of the newest message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastMessage {
    #[serde(default)]
    pub id: Option<MessageId>,
    #[serde(default)]
    pub sender_id: Option<UserId>,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(flatten)]
    pub attachment: Attachment,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl From<&ServerMessage> for LastMessage {
    fn from(message: &ServerMessage) -> Self {
        Self {
            id: Some(message.id.clone()),
            sender_id: Some(message.sender_id.clone()),
            kind: message.kind,
            text: message.text.clone(),
            attachment: message.attachment.clone(),
            created_at: Some(message.created_at),
        }
    }
}

impl From<&LocalMessage> for LastMessage {
    fn from(message: &LocalMessage) -> Self {
        Self {
            id: None,
            sender_id: Some(message.sender_id.clone()),
            kind: message.kind,
            text: message.text.clone(),
            attachment: message.attachment.clone(),
            created_at: Some(message.created_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub counterpart: Counterpart,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
}

impl Conversation {
    /// Moves the last-message snapshot forward; older messages never replace
    /// a newer preview.
    pub fn record_last_message(&mut self, preview: LastMessage, at: DateTime<Utc>) {
        if self.last_message_at.is_some_and(|current| current > at) {
            return;
        }
        self.last_message = Some(preview);
        self.last_message_at = Some(at);
    }
}
