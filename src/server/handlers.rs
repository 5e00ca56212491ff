//! Public endpoints: the Claude-compatible messages API, token counting,
//! usage snapshots, and health.

use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};
use tracing::warn;

use crate::config::InputValidationMode;
use crate::error::ProxyError;
use crate::models::{AccountType, ClaudeRequest};
use crate::orchestrator::open_claude_stream;
use crate::server::AppState;
use crate::tokenizer::estimate_request_input;
use crate::usage::Period;

pub(crate) fn error_response(error: &ProxyError) -> Response {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(error.to_claude_body())).into_response();
    if matches!(error, ProxyError::UpstreamRateLimit(_)) {
        response.headers_mut().insert(
            "Retry-After",
            axum::http::HeaderValue::from_static("60"),
        );
    }
    response
}

/// Optional shared-secret gate on the public surface.
fn check_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.config.api_key else {
        return Ok(());
    };
    let provided = headers.get("X-API-Key").and_then(|v| v.to_str().ok());
    if provided == Some(expected.as_str()) {
        return Ok(());
    }
    Err((
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "type": "error",
            "error": {"type": "authentication_error", "message": "Invalid API key"}
        })),
    )
        .into_response())
}

fn invalid_request(message: String) -> Response {
    error_response(&ProxyError::InvalidRequest(message))
}

pub async fn handle_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    messages_inner(state, headers, body, None).await
}

/// Same surface, pinned to the Gemini channel.
pub async fn handle_gemini_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    messages_inner(state, headers, body, Some(AccountType::Gemini)).await
}

async fn messages_inner(
    state: AppState,
    headers: HeaderMap,
    body: Value,
    forced_type: Option<AccountType>,
) -> Response {
    if let Err(response) = check_api_key(&state, &headers) {
        return response;
    }

    let request: ClaudeRequest = match serde_json::from_value(body.clone()) {
        Ok(request) => request,
        Err(e) => return invalid_request(format!("Invalid request body: {}", e)),
    };
    if !request.stream {
        return invalid_request("only stream=true is supported".to_string());
    }
    if request.messages.is_empty() {
        return invalid_request("messages must not be empty".to_string());
    }

    match state.config.input_validation {
        InputValidationMode::Off => {}
        mode => {
            let estimate = estimate_request_input(state.estimator.as_ref(), &request);
            if estimate > state.config.max_input_tokens {
                if mode == InputValidationMode::Strict {
                    return invalid_request(format!(
                        "estimated input of {} tokens exceeds the {} limit",
                        estimate, state.config.max_input_tokens
                    ));
                }
                warn!(
                    "[Api] request estimated at {} input tokens (limit {})",
                    estimate, state.config.max_input_tokens
                );
            }
        }
    }

    let pinned = headers
        .get("X-Account-ID")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    match open_claude_stream(&state, body, request, pinned, forced_type).await {
        Ok(opened) => {
            let body = Body::from_stream(opened.stream);
            Response::builder()
                .header("Content-Type", "text/event-stream")
                .header("Cache-Control", "no-cache")
                .header("Connection", "keep-alive")
                .header("X-Accel-Buffering", "no")
                .header("X-Account-ID", opened.account_id)
                .header("X-Mapped-Model", opened.mapped_model)
                .body(body)
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(error) => error_response(&error),
    }
}

pub async fn handle_count_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(response) = check_api_key(&state, &headers) {
        return response;
    }
    let request: ClaudeRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => return invalid_request(format!("Invalid request body: {}", e)),
    };
    let input_tokens = estimate_request_input(state.estimator.as_ref(), &request);
    Json(json!({"input_tokens": input_tokens})).into_response()
}

#[derive(serde::Deserialize)]
pub struct UsageQuery {
    #[serde(default)]
    period: Option<String>,
}

pub async fn handle_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UsageQuery>,
) -> Response {
    if let Err(response) = check_api_key(&state, &headers) {
        return response;
    }
    let period = match query.period.as_deref() {
        None => Period::Day,
        Some(raw) => match Period::parse(raw) {
            Some(period) => period,
            None => return invalid_request(format!("unknown period '{}'", raw)),
        },
    };
    match state.usage.summary(period).await {
        Ok(summary) => Json(json!({
            "summary": summary,
            "cache": state.cache.stats(),
        }))
        .into_response(),
        Err(error) => error_response(&error),
    }
}

pub async fn handle_health(State(state): State<AppState>) -> Response {
    match state.store.list_accounts().await {
        Ok(accounts) => {
            let enabled = accounts.iter().filter(|a| a.enabled).count();
            Json(json!({
                "status": "ok",
                "total_accounts": accounts.len(),
                "enabled_accounts": enabled,
            }))
            .into_response()
        }
        Err(error) => error_response(&error),
    }
}
