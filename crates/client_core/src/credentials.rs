use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use shared::domain::UserProfile;
use storage::Storage;
use tokio::sync::RwLock;

/// Where the signed-in session lives between runs.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn token(&self) -> Result<Option<String>>;
    async fn set_token(&self, token: &str) -> Result<()>;
    async fn profile(&self) -> Result<Option<UserProfile>>;
    async fn set_profile(&self, profile: &UserProfile) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

#[async_trait]
impl CredentialStore for Storage {
    async fn token(&self) -> Result<Option<String>> {
        self.load_session_token().await
    }

    async fn set_token(&self, token: &str) -> Result<()> {
        self.save_session_token(token).await
    }

    async fn profile(&self) -> Result<Option<UserProfile>> {
        self.load_profile().await
    }

    async fn set_profile(&self, profile: &UserProfile) -> Result<()> {
        self.save_profile(profile).await
    }

    async fn clear(&self) -> Result<()> {
        self.clear_session().await
    }
}

#[derive(Default)]
pub struct InMemoryCredentialStore {
    token: RwLock<Option<String>>,
    profile: RwLock<Option<UserProfile>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_token(token: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            token: RwLock::new(Some(token.into())),
            profile: RwLock::new(None),
        })
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn token(&self) -> Result<Option<String>> {
        Ok(self.token.read().await.clone())
    }

    async fn set_token(&self, token: &str) -> Result<()> {
        *self.token.write().await = Some(token.to_string());
        Ok(())
    }

    async fn profile(&self) -> Result<Option<UserProfile>> {
        Ok(self.profile.read().await.clone())
    }

    async fn set_profile(&self, profile: &UserProfile) -> Result<()> {
        *self.profile.write().await = Some(profile.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.token.write().await = None;
        *self.profile.write().await = None;
        Ok(())
    }
}
