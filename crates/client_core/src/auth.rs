use reqwest::Method;
use serde_json::Value;
use shared::{
    domain::UserProfile,
    protocol::{LoginRequest, LoginResponse},
};
use tracing::{info, warn};

use crate::{
    error::RequestError,
    request_client::{RequestClient, RequestOptions},
    NoticeLevel,
};

pub const LOGIN_PATH: &str = "/auth/login";
pub const LOGOUT_PATH: &str = "/auth/logout";
pub const ME_PATH: &str = "/auth/me";

impl RequestClient {
    /// Signs in and persists the returned token and profile.
    pub async fn login(&self, email: &str, password: &str) -> Result<UserProfile, RequestError> {
        let body = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let response: LoginResponse = self
            .request(
                Method::POST,
                LOGIN_PATH,
                Some(&body),
                RequestOptions::skip_refresh(),
            )
            .await?;

        self.credentials
            .set_token(&response.token)
            .await
            .map_err(|err| RequestError::Storage(err.to_string()))?;
        self.credentials
            .set_profile(&response.user)
            .await
            .map_err(|err| RequestError::Storage(err.to_string()))?;
        self.gate.note_new_credential();

        info!(user_id = response.user.id.0, "auth: signed in");
        self.notify(NoticeLevel::Success, "Signed in");
        Ok(response.user)
    }

    /// Session bootstrap check. A dead session surfaces as
    /// [`RequestError::Unauthorized`] without navigating to login.
    pub async fn current_user(&self) -> Result<UserProfile, RequestError> {
        let profile: UserProfile = self
            .request::<_, ()>(Method::GET, ME_PATH, None, RequestOptions::auth_bootstrap())
            .await?;
        if let Err(err) = self.credentials.set_profile(&profile).await {
            warn!(error = %err, "auth: failed to cache profile");
        }
        Ok(profile)
    }

    pub async fn cached_profile(&self) -> Result<Option<UserProfile>, RequestError> {
        self.credentials
            .profile()
            .await
            .map_err(|err| RequestError::Storage(err.to_string()))
    }

    /// Server-side logout is best effort; the local session is always cleared.
    pub async fn logout(&self) -> Result<(), RequestError> {
        let server_result = self
            .request::<Value, ()>(
                Method::POST,
                LOGOUT_PATH,
                None,
                RequestOptions::skip_refresh(),
            )
            .await;
        if let Err(err) = &server_result {
            warn!(error = %err, "auth: server logout failed; clearing local session anyway");
        }
        self.credentials
            .clear()
            .await
            .map_err(|err| RequestError::Storage(err.to_string()))?;
        info!("auth: signed out");
        Ok(())
    }
}
