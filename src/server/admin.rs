//! Account-management endpoints under `/v2`, authenticated with
//! `X-Admin-Key`. Listing responses are redacted summaries; secrets never
//! leave the store through this surface.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::ProxyError;
use crate::models::{Account, AccountType, ModelMapping};
use crate::server::handlers::error_response;
use crate::server::AppState;
use crate::store::AccountPatch;

fn check_admin_key(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.config.admin_key else {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "type": "error",
                "error": {"type": "authentication_error",
                          "message": "admin access is disabled (ADMIN_KEY not configured)"}
            })),
        )
            .into_response());
    };
    let provided = headers.get("X-Admin-Key").and_then(|v| v.to_str().ok());
    if provided == Some(expected.as_str()) {
        return Ok(());
    }
    Err((
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "type": "error",
            "error": {"type": "authentication_error", "message": "Invalid admin key"}
        })),
    )
        .into_response())
}

pub async fn handle_list_accounts(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = check_admin_key(&state, &headers) {
        return response;
    }
    match state.store.list_accounts().await {
        Ok(accounts) => {
            let summaries: Vec<Value> = accounts.iter().map(Account::to_summary).collect();
            Json(json!({"accounts": summaries})).into_response()
        }
        Err(error) => error_response(&error),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateAccountBody {
    #[serde(rename = "type")]
    pub account_type: AccountType,
    pub label: String,
    #[serde(rename = "clientId", default)]
    pub client_id: String,
    #[serde(rename = "clientSecret", default)]
    pub client_secret: String,
    #[serde(rename = "refreshToken", default)]
    pub refresh_token: String,
    #[serde(default)]
    pub extension: Option<Value>,
    #[serde(rename = "modelMappings", default)]
    pub model_mappings: Vec<ModelMapping>,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(rename = "rateLimitPerHour", default)]
    pub rate_limit_per_hour: Option<u32>,
}

pub async fn handle_create_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateAccountBody>,
) -> Response {
    if let Err(response) = check_admin_key(&state, &headers) {
        return response;
    }
    if body.account_type == AccountType::CustomApi && body.client_secret.is_empty() {
        return error_response(&ProxyError::InvalidRequest(
            "custom_api accounts need clientSecret (the API key)".into(),
        ));
    }

    let mut account = Account::new(
        Uuid::new_v4().to_string(),
        body.account_type,
        body.label,
        body.client_id,
        body.client_secret,
        body.refresh_token,
    );
    if let Some(extension) = body.extension {
        account.extension = extension;
    }
    account.model_mappings = body.model_mappings;
    if let Some(weight) = body.weight {
        account.weight = weight.clamp(1, 100);
    }
    if let Some(limit) = body.rate_limit_per_hour {
        account.rate_limit_per_hour = limit;
    }

    match state.store.create_account(&account).await {
        Ok(()) => (StatusCode::CREATED, Json(account.to_summary())).into_response(),
        Err(error) => error_response(&error),
    }
}

pub async fn handle_update_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(patch): Json<AccountPatch>,
) -> Response {
    if let Err(response) = check_admin_key(&state, &headers) {
        return response;
    }
    let patch = AccountPatch {
        weight: patch.weight.map(|w| w.clamp(1, 100)),
        ..patch
    };
    match state.store.update_account(&id, &patch).await {
        Ok(()) => match state.store.get_account(&id).await {
            Ok(Some(account)) => Json(account.to_summary()).into_response(),
            Ok(None) => error_response(&ProxyError::Account(format!("Account '{}' not found", id))),
            Err(error) => error_response(&error),
        },
        Err(error) => error_response(&error),
    }
}

pub async fn handle_delete_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(response) = check_admin_key(&state, &headers) {
        return response;
    }
    match state.store.delete_account(&id).await {
        Ok(()) => {
            state.tokens.forget(&id);
            Json(json!({"deleted": id})).into_response()
        }
        Err(error) => error_response(&error),
    }
}

pub async fn handle_refresh_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(response) = check_admin_key(&state, &headers) {
        return response;
    }
    let account = match state.store.get_account(&id).await {
        Ok(Some(account)) => account,
        Ok(None) => {
            return error_response(&ProxyError::Account(format!("Account '{}' not found", id)))
        }
        Err(error) => return error_response(&error),
    };
    match state.tokens.force_refresh(&account).await {
        Ok(entry) => Json(json!({
            "status": "success",
            "expiresAt": entry.expires_at,
        }))
        .into_response(),
        Err(error) => error_response(&error),
    }
}

pub async fn handle_account_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(response) = check_admin_key(&state, &headers) {
        return response;
    }
    let account = match state.store.get_account(&id).await {
        Ok(Some(account)) => account,
        Ok(None) => {
            return error_response(&ProxyError::Account(format!("Account '{}' not found", id)))
        }
        Err(error) => return error_response(&error),
    };
    match state.pool.call_log().stats(&id).await {
        Ok(stats) => Json(json!({
            "account": account.to_summary(),
            "calls": stats,
            "errorStreak": state.pool.error_streak(&id),
        }))
        .into_response(),
        Err(error) => error_response(&error),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AuthStartBody {
    #[serde(default)]
    pub label: Option<String>,
}

pub async fn handle_auth_start(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<AuthStartBody>>,
) -> Response {
    if let Err(response) = check_admin_key(&state, &headers) {
        return response;
    }
    let label = body.and_then(|Json(b)| b.label);
    match std::sync::Arc::clone(&state.sessions)
        .start(std::sync::Arc::clone(&state.store), label)
        .await
    {
        Ok(session) => Json(json!({
            "authId": session.auth_id,
            "verificationUri": session.verification_uri,
            "verificationUriComplete": session.verification_uri_complete,
            "userCode": session.user_code,
            "expiresIn": session.expires_in_s,
            "interval": session.interval_s,
        }))
        .into_response(),
        Err(error) => error_response(&error),
    }
}

/// Blocks until the user approves (or the five-minute ceiling passes) and
/// returns the freshly created account.
pub async fn handle_auth_claim(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(auth_id): Path<String>,
) -> Response {
    if let Err(response) = check_admin_key(&state, &headers) {
        return response;
    }
    match state.sessions.claim(&auth_id).await {
        Ok(session) => {
            let account_id = session.account_id.unwrap_or_default();
            match state.store.get_account(&account_id).await {
                Ok(Some(account)) => Json(account.to_summary()).into_response(),
                _ => error_response(&ProxyError::Account(format!(
                    "Account '{}' not found",
                    account_id
                ))),
            }
        }
        Err(error) => error_response(&error),
    }
}

pub async fn handle_auth_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(auth_id): Path<String>,
) -> Response {
    if let Err(response) = check_admin_key(&state, &headers) {
        return response;
    }
    state.sessions.purge_expired();
    match state.sessions.get(&auth_id) {
        Some(session) => Json(json!({
            "status": session.status,
            "accountId": session.account_id,
            "error": session.error,
        }))
        .into_response(),
        None => error_response(&ProxyError::Account(format!(
            "auth session '{}' not found",
            auth_id
        ))),
    }
}
