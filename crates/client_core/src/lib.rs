//! Client core for the rental admin backend: the authenticated request
//! client, the real-time message channel, and the typed auth/resource
//! operations built on them.

use shared::domain::ThreadRef;

pub mod auth;
pub mod channel;
pub mod config;
pub mod credentials;
pub mod error;
pub mod message_window;
pub mod refresh;
pub mod request_client;
pub mod resources;

pub use channel::{ChannelSlot, ChannelStatus, MessageChannel, MessageHistory};
pub use config::{load_settings, ClientSettings, ReconnectPolicy};
pub use credentials::{CredentialStore, InMemoryCredentialStore};
pub use error::{ChannelError, RequestError};
pub use message_window::{
    MessageArrival, MessageWindow, OlderFetch, ScrollAction, ScrollAnchor, Viewport,
};
pub use request_client::{RequestClient, RequestOptions};
pub use resources::{AdminApi, ListQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Transient user-visible notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Notification(Notice),
    SessionExpired,
    /// Navigate to the login entry point.
    RedirectToLogin { route: String },
    ChannelStatusChanged {
        thread: ThreadRef,
        status: ChannelStatus,
    },
}

impl ClientEvent {
    pub fn notice(level: NoticeLevel, text: impl Into<String>) -> Self {
        Self::Notification(Notice {
            level,
            text: text.into(),
        })
    }
}
