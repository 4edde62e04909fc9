use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);
id_newtype!(ConversationId);
id_newtype!(ComplaintId);

/// A message thread a real-time channel can be scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadRef {
    Conversation(ConversationId),
    Complaint(ComplaintId),
}

impl ThreadRef {
    pub fn raw_id(&self) -> i64 {
        match self {
            Self::Conversation(id) => id.0,
            Self::Complaint(id) => id.0,
        }
    }

    /// WebSocket namespace path.
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Conversation(_) => "/chat",
            Self::Complaint(_) => "/complaint",
        }
    }

    /// Query parameter identifying the thread on the channel handshake.
    pub fn query_key(&self) -> &'static str {
        match self {
            Self::Conversation(_) => "conversationId",
            Self::Complaint(_) => "complaintId",
        }
    }

    /// REST path of the paginated message history.
    pub fn history_path(&self) -> String {
        match self {
            Self::Conversation(id) => format!("/chat/conversations/{id}/messages"),
            Self::Complaint(id) => format!("/complaints/{id}/messages"),
        }
    }
}

impl fmt::Display for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversation(id) => write!(f, "conversation:{id}"),
            Self::Complaint(id) => write!(f, "complaint:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Text,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Staff,
    Customer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    pub role: Role,
}

/// A chat or complaint message. The thread id arrives as either
/// `conversationId` or `complaintId` depending on the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    #[serde(rename = "conversationId", alias = "complaintId")]
    pub thread_id: i64,
    pub sender_id: UserId,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplaintStatus {
    Open,
    InProgress,
    Resolved,
    Rejected,
}

/// REST collections managed from the admin dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdminResource {
    Users,
    Vehicles,
    Equipment,
    Combos,
    Bookings,
    Payments,
    Refunds,
    Reviews,
    Posts,
    Notifications,
    Conversations,
    Complaints,
}

impl AdminResource {
    pub const ALL: [AdminResource; 12] = [
        Self::Users,
        Self::Vehicles,
        Self::Equipment,
        Self::Combos,
        Self::Bookings,
        Self::Payments,
        Self::Refunds,
        Self::Reviews,
        Self::Posts,
        Self::Notifications,
        Self::Conversations,
        Self::Complaints,
    ];

    pub fn collection_path(&self) -> &'static str {
        match self {
            Self::Users => "/users",
            Self::Vehicles => "/vehicles",
            Self::Equipment => "/equipment",
            Self::Combos => "/combos",
            Self::Bookings => "/bookings",
            Self::Payments => "/payments",
            Self::Refunds => "/refunds",
            Self::Reviews => "/reviews",
            Self::Posts => "/posts",
            Self::Notifications => "/notifications",
            Self::Conversations => "/chat/conversations",
            Self::Complaints => "/complaints",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Vehicles => "vehicles",
            Self::Equipment => "equipment",
            Self::Combos => "combos",
            Self::Bookings => "bookings",
            Self::Payments => "payments",
            Self::Refunds => "refunds",
            Self::Reviews => "reviews",
            Self::Posts => "posts",
            Self::Notifications => "notifications",
            Self::Conversations => "conversations",
            Self::Complaints => "complaints",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|resource| resource.name() == raw)
    }
}
