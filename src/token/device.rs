//! OAuth 2.0 device-authorization grant against the AWS SSO OIDC endpoint,
//! used for headless credential acquisition. Sessions are in-memory only and
//! bounded to five minutes; a background task polls the token endpoint at the
//! server-specified interval and creates the account row on success.

use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::constants::{
    AMAZONQ_AMZ_USER_AGENT, AMAZONQ_CLIENT_REGISTER_URL, AMAZONQ_DEVICE_AUTH_URL,
    AMAZONQ_OIDC_SCOPES, AMAZONQ_START_URL, AMAZONQ_TOKEN_URL, AMAZONQ_USER_AGENT,
    DEVICE_AUTH_CEILING_SECS,
};
use crate::error::{ProxyError, ProxyResult};
use crate::models::{Account, AccountType};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Pending,
    Completed,
    Timeout,
    Error,
}

#[derive(Debug, Clone)]
pub struct DeviceAuthSession {
    pub auth_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub device_code: String,
    pub interval_s: u64,
    pub expires_in_s: u64,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub user_code: String,
    pub started_at: i64,
    pub status: AuthStatus,
    pub account_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegisterClientResponse {
    #[serde(rename = "clientId")]
    client_id: String,
    #[serde(rename = "clientSecret")]
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct DeviceAuthResponse {
    #[serde(rename = "deviceCode")]
    device_code: String,
    #[serde(rename = "userCode")]
    user_code: String,
    #[serde(rename = "verificationUri")]
    verification_uri: String,
    #[serde(rename = "verificationUriComplete", default)]
    verification_uri_complete: Option<String>,
    #[serde(rename = "expiresIn", default)]
    expires_in: Option<u64>,
    #[serde(rename = "interval", default)]
    interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DeviceTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "refreshToken", default)]
    refresh_token: Option<String>,
}

pub struct DeviceAuthRegistry {
    sessions: DashMap<String, DeviceAuthSession>,
    http: reqwest::Client,
}

impl DeviceAuthRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn get(&self, auth_id: &str) -> Option<DeviceAuthSession> {
        self.sessions.get(auth_id).map(|s| s.clone())
    }

    /// Drop sessions past their five-minute window; pending ones flip to
    /// timeout so a late claim sees a terminal state.
    pub fn purge_expired(&self) {
        let now = chrono::Utc::now().timestamp();
        self.sessions.retain(|_, session| {
            let age = now - session.started_at;
            if age > 2 * DEVICE_AUTH_CEILING_SECS as i64 {
                return false;
            }
            if age > DEVICE_AUTH_CEILING_SECS as i64 && session.status == AuthStatus::Pending {
                session.status = AuthStatus::Timeout;
            }
            true
        });
    }

    async fn post_oidc(&self, url: &str, payload: serde_json::Value) -> ProxyResult<reqwest::Response> {
        Ok(self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .header("User-Agent", AMAZONQ_USER_AGENT)
            .header("X-Amz-User-Agent", AMAZONQ_AMZ_USER_AGENT)
            .json(&payload)
            .send()
            .await?)
    }

    /// Register an OIDC client, request a device code, and kick off the
    /// polling task. Returns the session the admin UI shows to the user.
    pub async fn start(
        self: Arc<Self>,
        store: Arc<Store>,
        label: Option<String>,
    ) -> ProxyResult<DeviceAuthSession> {
        self.purge_expired();

        let register = self
            .post_oidc(
                AMAZONQ_CLIENT_REGISTER_URL,
                serde_json::json!({
                    "clientName": format!("pontoon-{}", &Uuid::new_v4().to_string()[..8]),
                    "clientType": "public",
                    "scopes": AMAZONQ_OIDC_SCOPES,
                }),
            )
            .await?;
        if !register.status().is_success() {
            let body = register.text().await.unwrap_or_default();
            return Err(ProxyError::UpstreamServer(format!(
                "client registration failed: {}",
                body
            )));
        }
        let register: RegisterClientResponse = register.json().await?;

        let device = self
            .post_oidc(
                AMAZONQ_DEVICE_AUTH_URL,
                serde_json::json!({
                    "clientId": register.client_id,
                    "clientSecret": register.client_secret,
                    "startUrl": AMAZONQ_START_URL,
                }),
            )
            .await?;
        if !device.status().is_success() {
            let body = device.text().await.unwrap_or_default();
            return Err(ProxyError::UpstreamServer(format!(
                "device authorization failed: {}",
                body
            )));
        }
        let device: DeviceAuthResponse = device.json().await?;

        let session = DeviceAuthSession {
            auth_id: Uuid::new_v4().to_string(),
            client_id: register.client_id,
            client_secret: register.client_secret,
            device_code: device.device_code,
            interval_s: device.interval.unwrap_or(5).max(1),
            expires_in_s: device.expires_in.unwrap_or(DEVICE_AUTH_CEILING_SECS),
            verification_uri: device.verification_uri,
            verification_uri_complete: device
                .verification_uri_complete
                .unwrap_or_default(),
            user_code: device.user_code,
            started_at: chrono::Utc::now().timestamp(),
            status: AuthStatus::Pending,
            account_id: None,
            error: None,
        };
        self.sessions.insert(session.auth_id.clone(), session.clone());

        let registry = Arc::clone(&self);
        let poll_session = session.clone();
        tokio::spawn(async move {
            registry.poll_until_done(store, poll_session, label).await;
        });

        Ok(session)
    }

    async fn poll_until_done(
        &self,
        store: Arc<Store>,
        session: DeviceAuthSession,
        label: Option<String>,
    ) {
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(session.expires_in_s.min(DEVICE_AUTH_CEILING_SECS));
        let mut interval = session.interval_s;

        loop {
            if tokio::time::Instant::now() >= deadline {
                self.finish(&session.auth_id, AuthStatus::Timeout, None, None);
                return;
            }
            tokio::time::sleep(Duration::from_secs(interval)).await;

            let response = self
                .post_oidc(
                    AMAZONQ_TOKEN_URL,
                    serde_json::json!({
                        "clientId": session.client_id,
                        "clientSecret": session.client_secret,
                        "deviceCode": session.device_code,
                        "grantType": "urn:ietf:params:oauth:grant-type:device_code",
                    }),
                )
                .await;

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    warn!("[DeviceAuth] poll request failed: {}", e);
                    continue;
                }
            };

            if response.status().is_success() {
                let parsed: Result<DeviceTokenResponse, _> = response.json().await;
                match parsed {
                    Ok(token) => {
                        let account_id = Uuid::new_v4().to_string();
                        let mut account = Account::new(
                            account_id.clone(),
                            AccountType::AmazonQ,
                            label.clone().unwrap_or_else(|| {
                                format!("amazon-q-{}", &account_id[..8])
                            }),
                            session.client_id.clone(),
                            session.client_secret.clone(),
                            token.refresh_token.clone().unwrap_or_default(),
                        );
                        account.access_token = Some(token.access_token);
                        account.last_refresh_status = Some("success".to_string());
                        account.last_refresh_at = Some(chrono::Utc::now().timestamp());
                        match store.create_account(&account).await {
                            Ok(()) => {
                                info!("[DeviceAuth] created account {} via device flow", account_id);
                                self.finish(
                                    &session.auth_id,
                                    AuthStatus::Completed,
                                    Some(account_id),
                                    None,
                                );
                            }
                            Err(e) => {
                                self.finish(
                                    &session.auth_id,
                                    AuthStatus::Error,
                                    None,
                                    Some(e.to_string()),
                                );
                            }
                        }
                    }
                    Err(e) => {
                        self.finish(&session.auth_id, AuthStatus::Error, None, Some(e.to_string()));
                    }
                }
                return;
            }

            let body = response.text().await.unwrap_or_default();
            if body.contains("authorization_pending") {
                continue;
            }
            if body.contains("slow_down") {
                interval += 5;
                continue;
            }
            self.finish(&session.auth_id, AuthStatus::Error, None, Some(body));
            return;
        }
    }

    fn finish(
        &self,
        auth_id: &str,
        status: AuthStatus,
        account_id: Option<String>,
        error: Option<String>,
    ) {
        if let Some(mut session) = self.sessions.get_mut(auth_id) {
            session.status = status;
            session.account_id = account_id;
            session.error = error;
        }
    }

    /// Block until the session leaves `pending`, up to the five-minute
    /// ceiling. Backs `POST /v2/auth/claim/{authId}`.
    pub async fn claim(&self, auth_id: &str) -> ProxyResult<DeviceAuthSession> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(DEVICE_AUTH_CEILING_SECS);
        loop {
            let session = self
                .get(auth_id)
                .ok_or_else(|| ProxyError::Account(format!("auth session '{}' not found", auth_id)))?;
            match session.status {
                AuthStatus::Pending => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(ProxyError::AuthTimeout);
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                AuthStatus::Timeout => return Err(ProxyError::AuthTimeout),
                AuthStatus::Error => {
                    return Err(ProxyError::UpstreamServer(
                        session.error.unwrap_or_else(|| "device authorization failed".into()),
                    ))
                }
                AuthStatus::Completed => return Ok(session),
            }
        }
    }
}

impl Default for DeviceAuthRegistry {
    fn default() -> Self {
        Self::new()
    }
}
