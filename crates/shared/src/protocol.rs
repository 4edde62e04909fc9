use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChatMessage, ComplaintId, ComplaintStatus, ConversationId, MessageType, ThreadRef, UserProfile},
    error::ApiError,
};

/// Wrapper every REST response body uses. Error bodies omit `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default)]
    pub message: String,
    pub status_code: u16,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            data: Some(data),
            message: String::new(),
            status_code: 200,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

impl Envelope<serde_json::Value> {
    pub fn error(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            data: None,
            message: message.into(),
            status_code,
        }
    }
}

impl<T> From<&Envelope<T>> for ApiError {
    fn from(value: &Envelope<T>) -> Self {
        ApiError::new(value.status_code, value.message.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: UserProfile,
}

/// Body of a successful `/auth/refresh-token` call. Cookie-only backends
/// rotate the refresh cookie and return no token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// One page of message history, newest message first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<ChatMessage>,
    pub page: u32,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: ConversationId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub last_message: Option<ChatMessage>,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplaintSummary {
    pub id: ComplaintId,
    pub subject: String,
    pub status: ComplaintStatus,
    #[serde(default)]
    pub last_message: Option<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplaintStatusUpdate {
    pub status: ComplaintStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    NewMessage(ChatMessage),
    NewComplaintMessage(ChatMessage),
    Error(ApiError),
}

impl ServerEvent {
    /// The pushed message, if this event carries one for `thread`.
    pub fn message_for(&self, thread: ThreadRef) -> Option<&ChatMessage> {
        match (self, thread) {
            (Self::NewMessage(message), ThreadRef::Conversation(id)) if message.thread_id == id.0 => {
                Some(message)
            }
            (Self::NewComplaintMessage(message), ThreadRef::Complaint(id))
                if message.thread_id == id.0 =>
            {
                Some(message)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub conversation_id: ConversationId,
    pub message_type: MessageType,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendComplaintMessagePayload {
    pub complaint_id: ComplaintId,
    pub message_type: MessageType,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ChannelRequest {
    SendMessage(SendMessagePayload),
    SendComplaintMessage(SendComplaintMessagePayload),
}

impl ChannelRequest {
    pub fn for_thread(thread: ThreadRef, message_type: MessageType, content: impl Into<String>) -> Self {
        let content = content.into();
        match thread {
            ThreadRef::Conversation(conversation_id) => Self::SendMessage(SendMessagePayload {
                conversation_id,
                message_type,
                content,
            }),
            ThreadRef::Complaint(complaint_id) => {
                Self::SendComplaintMessage(SendComplaintMessagePayload {
                    complaint_id,
                    message_type,
                    content,
                })
            }
        }
    }
}
