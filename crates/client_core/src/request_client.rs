use std::sync::Arc;

use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION},
    Client, Method, Response, StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::protocol::{Envelope, RefreshResponse};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::ClientSettings,
    credentials::CredentialStore,
    error::RequestError,
    refresh::{wait_outcome, RefreshGate, RefreshOutcome, RefreshTicket},
    ClientEvent, NoticeLevel,
};

pub const REFRESH_PATH: &str = "/auth/refresh-token";
const REQUEST_ID_HEADER: &str = "x-request-id";
const SESSION_EXPIRED_NOTICE: &str = "Your session has expired. Please sign in again.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Surface a 401 as an ordinary error instead of refreshing (login).
    pub skip_refresh: bool,
    /// Session bootstrap check: a terminal 401 does not navigate to login.
    pub auth_bootstrap: bool,
}

impl RequestOptions {
    pub fn skip_refresh() -> Self {
        Self {
            skip_refresh: true,
            ..Self::default()
        }
    }

    pub fn auth_bootstrap() -> Self {
        Self {
            auth_bootstrap: true,
            ..Self::default()
        }
    }
}

/// HTTP client for the admin REST API: bearer credential, envelope unwrap,
/// single-flight refresh with retry-once.
pub struct RequestClient {
    pub(crate) http: Client,
    pub(crate) settings: ClientSettings,
    pub(crate) credentials: Arc<dyn CredentialStore>,
    pub(crate) gate: RefreshGate,
    pub(crate) events: broadcast::Sender<ClientEvent>,
}

impl RequestClient {
    pub fn new(
        settings: ClientSettings,
        credentials: Arc<dyn CredentialStore>,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(settings.request_timeout)
            .cookie_store(true)
            .build()?;
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            http,
            settings,
            credentials,
            gate: RefreshGate::new(),
            events,
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn credentials(&self) -> Arc<dyn CredentialStore> {
        Arc::clone(&self.credentials)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<ClientEvent> {
        self.events.clone()
    }

    pub fn is_refreshing(&self) -> bool {
        self.gate.is_refreshing()
    }

    pub(crate) fn notify(&self, level: NoticeLevel, text: impl Into<String>) {
        let _ = self.events.send(ClientEvent::notice(level, text));
    }

    pub(crate) fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.settings.api_base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RequestError> {
        self.request::<T, ()>(Method::GET, path, None, RequestOptions::default())
            .await
    }

    pub async fn get_with_query<T, Q>(&self, path: &str, query: &Q) -> Result<T, RequestError>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        self.request_with_query::<T, Q, ()>(
            Method::GET,
            path,
            Some(query),
            None,
            RequestOptions::default(),
        )
        .await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, RequestError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request(Method::POST, path, Some(body), RequestOptions::default())
            .await
    }

    pub async fn patch<T, B>(&self, path: &str, body: &B) -> Result<T, RequestError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request(Method::PATCH, path, Some(body), RequestOptions::default())
            .await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, RequestError> {
        self.request::<T, ()>(Method::DELETE, path, None, RequestOptions::default())
            .await
    }

    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        options: RequestOptions,
    ) -> Result<T, RequestError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request_with_query::<T, (), B>(method, path, None, body, options)
            .await
    }

    pub async fn request_with_query<T, Q, B>(
        &self,
        method: Method,
        path: &str,
        query: Option<&Q>,
        body: Option<&B>,
        options: RequestOptions,
    ) -> Result<T, RequestError>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
        B: Serialize + ?Sized,
    {
        let url = self.url(path);
        let mut retried = false;
        loop {
            let epoch = self.gate.epoch();
            let response = self.send_once(&method, &url, query, body).await?;

            if response.status() != StatusCode::UNAUTHORIZED || options.skip_refresh {
                return self.unwrap_envelope(&url, response).await;
            }

            if retried {
                return Err(self
                    .expire_session(options, epoch, "credential rejected after refresh")
                    .await);
            }

            match self.gate.begin_or_enqueue(epoch) {
                RefreshTicket::Lead(lease) => match self.refresh_token().await {
                    Ok(()) => {
                        let released = lease.succeed();
                        info!(released, "auth: session refreshed");
                    }
                    Err(reason) => {
                        let released = lease.fail(reason.clone());
                        warn!(released, %reason, "auth: session refresh failed");
                        return Err(self.expire_session(options, epoch, reason).await);
                    }
                },
                RefreshTicket::Wait(rx) => {
                    if let RefreshOutcome::Failed(reason) = wait_outcome(rx).await {
                        return Err(RequestError::Unauthorized(reason));
                    }
                }
                RefreshTicket::Settled(RefreshOutcome::Refreshed) => {}
                RefreshTicket::Settled(RefreshOutcome::Failed(reason)) => {
                    return Err(RequestError::Unauthorized(reason));
                }
            }

            debug!(%method, %url, "http: replaying request after refresh");
            retried = true;
        }
    }

    async fn auth_headers(&self) -> Result<HeaderMap, RequestError> {
        let mut headers = HeaderMap::new();
        let token = self
            .credentials
            .token()
            .await
            .map_err(|err| RequestError::Storage(err.to_string()))?;
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
                warn!("auth: stored credential is not a valid header value");
                RequestError::Storage("stored credential is not a valid header value".into())
            })?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    async fn send_once<Q, B>(
        &self,
        method: &Method,
        url: &str,
        query: Option<&Q>,
        body: Option<&B>,
    ) -> Result<Response, RequestError>
    where
        Q: Serialize + ?Sized,
        B: Serialize + ?Sized,
    {
        let request_id = Uuid::new_v4().to_string();
        let mut builder = self
            .http
            .request(method.clone(), url)
            .headers(self.auth_headers().await?)
            .header(REQUEST_ID_HEADER, &request_id);
        if let Some(query) = query {
            builder = builder.query(query);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        debug!(%request_id, %method, %url, "http: sending request");
        match builder.send().await {
            Ok(response) => {
                debug!(%request_id, status = response.status().as_u16(), "http: response received");
                Ok(response)
            }
            Err(err) => Err(self.transport_failure(url, &err)),
        }
    }

    fn transport_failure(&self, url: &str, err: &reqwest::Error) -> RequestError {
        let failure = if err.is_timeout() {
            RequestError::Timeout {
                url: url.to_string(),
                seconds: self.settings.request_timeout.as_secs(),
            }
        } else {
            RequestError::Unreachable {
                url: url.to_string(),
                guidance: unreachable_guidance(err),
            }
        };
        warn!(%url, error = %err, "http: no response received");
        self.notify(NoticeLevel::Error, failure.to_string());
        failure
    }

    async fn unwrap_envelope<T: DeserializeOwned>(
        &self,
        url: &str,
        response: Response,
    ) -> Result<T, RequestError> {
        let status = response.status();
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => return Err(self.transport_failure(url, &err)),
        };
        let result = decode_envelope(url, status, &bytes);
        if let Err(RequestError::Api { message, .. }) = &result {
            self.notify(NoticeLevel::Error, message.clone());
        }
        result
    }

    /// Exactly one call to the refresh endpoint. The refresh credential
    /// rides in the cookie jar; a returned token replaces the stored one.
    async fn refresh_token(&self) -> Result<(), String> {
        let url = self.url(REFRESH_PATH);
        info!(%url, "auth: refreshing session token");
        let response = self
            .http
            .post(&url)
            .header(REQUEST_ID_HEADER, Uuid::new_v4().to_string())
            .send()
            .await
            .map_err(|err| format!("refresh request failed: {err}"))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| format!("refresh response unreadable: {err}"))?;
        let refreshed: Option<RefreshResponse> =
            decode_envelope(&url, status, &bytes).map_err(|err| err.to_string())?;
        if let Some(token) = refreshed.and_then(|r| r.token) {
            self.credentials
                .set_token(&token)
                .await
                .map_err(|err| format!("failed to store refreshed token: {err}"))?;
        }
        Ok(())
    }

    /// Ends the session once per credential epoch; later callers that hit
    /// the same dead session only get the error.
    pub(crate) async fn expire_session(
        &self,
        options: RequestOptions,
        seen_epoch: u64,
        reason: impl Into<String>,
    ) -> RequestError {
        let reason = reason.into();
        if !self.gate.claim_expiry(seen_epoch) {
            debug!(%reason, "auth: session already expired");
            return RequestError::Unauthorized(reason);
        }
        warn!(%reason, auth_bootstrap = options.auth_bootstrap, "auth: session expired");
        if let Err(err) = self.credentials.clear().await {
            warn!(error = %err, "auth: failed to clear stored session");
        }
        self.notify(NoticeLevel::Warning, SESSION_EXPIRED_NOTICE);
        let _ = self.events.send(ClientEvent::SessionExpired);
        if !options.auth_bootstrap {
            self.schedule_login_redirect();
        }
        RequestError::Unauthorized(reason)
    }

    fn schedule_login_redirect(&self) {
        let events = self.events.clone();
        let delay = self.settings.redirect_delay;
        let route = self.settings.login_route.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(ClientEvent::RedirectToLogin { route });
        });
    }
}

/// Decodes a response body as an envelope and extracts `data` as `T`.
pub(crate) fn decode_envelope<T: DeserializeOwned>(
    url: &str,
    status: StatusCode,
    bytes: &[u8],
) -> Result<T, RequestError> {
    let envelope: Envelope<Value> = match serde_json::from_slice(bytes) {
        Ok(envelope) => envelope,
        Err(err) if status.is_success() => {
            return Err(RequestError::MalformedEnvelope {
                url: url.to_string(),
                reason: err.to_string(),
            });
        }
        Err(_) => {
            return Err(RequestError::Api {
                status_code: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string(),
            });
        }
    };

    if !envelope.is_success() || !status.is_success() {
        let status_code = if envelope.is_success() {
            status.as_u16()
        } else {
            envelope.status_code
        };
        let message = if envelope.message.is_empty() {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        } else {
            envelope.message
        };
        return Err(RequestError::Api {
            status_code,
            message,
        });
    }

    serde_json::from_value(envelope.data.unwrap_or(Value::Null)).map_err(|err| {
        RequestError::MalformedEnvelope {
            url: url.to_string(),
            reason: format!("unexpected data: {err}"),
        }
    })
}

fn unreachable_guidance(err: &reqwest::Error) -> String {
    if err.is_builder() {
        "wrong URL: the request could not be built; check api_base_url".to_string()
    } else if err.is_connect() {
        "server down or wrong URL: the connection was refused or the host did not resolve"
            .to_string()
    } else {
        "no response: the server may be down, the URL may be wrong, or a CORS/proxy policy blocked the call"
            .to_string()
    }
}

#[cfg(test)]
#[path = "tests/request_client_tests.rs"]
mod tests;
