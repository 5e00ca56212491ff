//! Request lifecycle: route → token → cache stats → upstream dispatch →
//! Claude SSE framing → bookkeeping. Retries are bounded and happen only at
//! the account-selection boundary, before any byte reaches the client; after
//! the first downstream byte, failures close the stream synthetically and
//! are final.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{cache_key_for, CacheOutcome};
use crate::constants::{
    AMAZONQ_API_URL, AMAZONQ_CONTENT_TYPE, AMAZONQ_TARGET, ANTHROPIC_VERSION,
    GEMINI_DEFAULT_ENDPOINT, GEMINI_STREAM_PATH,
};
use crate::convert;
use crate::error::{ProxyError, ProxyResult};
use crate::models::{AccountType, ClaudeRequest, CustomApiFormat, ModelQuota};
use crate::router::RouteTarget;
use crate::server::AppState;
use crate::stream::{self, sse, ClaudeSseStream, StreamContext, StreamUsage};
use crate::token::is_token_invalid_body;
use crate::tokenizer::estimate_request_input;

pub const MAX_RETRIES: usize = 3;

pub struct OpenedStream {
    pub account_id: String,
    pub mapped_model: String,
    pub stream: ClaudeSseStream,
}

impl std::fmt::Debug for OpenedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedStream")
            .field("account_id", &self.account_id)
            .field("mapped_model", &self.mapped_model)
            .field("stream", &"<stream>")
            .finish()
    }
}

enum SendOutcome {
    Stream(stream::UpstreamByteStream),
    Failure { status: u16, body: String },
}

/// Top-level algorithm of the proxy: at most `MAX_RETRIES` account attempts,
/// then either an open Claude SSE stream or a typed error.
pub async fn open_claude_stream(
    state: &AppState,
    raw: Value,
    request: ClaudeRequest,
    pinned: Option<String>,
    forced_type: Option<AccountType>,
) -> ProxyResult<OpenedStream> {
    let thinking_enabled = request.thinking_enabled(state.config.thinking_always_on);
    let input_estimate = estimate_request_input(state.estimator.as_ref(), &request) as i64;

    let mut attempted: HashSet<String> = HashSet::new();
    let mut same_type: Option<AccountType> = forced_type;
    let mut reauthed_accounts: HashSet<String> = HashSet::new();
    let mut last_error = ProxyError::NoEligibleAccount;

    for attempt in 0..MAX_RETRIES {
        let target = match state
            .router
            .route(&request.model, pinned.as_deref(), same_type, &attempted)
            .await
        {
            Ok(target) => target,
            Err(e) => {
                // Nothing left to try; surface the most specific error seen.
                return Err(match e {
                    ProxyError::NoEligibleAccount if attempt > 0 => last_error,
                    other => other,
                });
            }
        };
        attempted.insert(target.account.id.clone());

        let token = match state.tokens.get_valid_token(&target.account).await {
            Ok(token) => token,
            Err(e @ ProxyError::TokenRefresh { .. }) => {
                warn!("[Orchestrator] {}", e);
                state.pool.mark_error(&target.account.id).await;
                last_error = e;
                continue;
            }
            Err(e) => return Err(e),
        };

        let cache_outcome = if state.config.cache_simulation_enabled {
            cache_key_for(state.estimator.as_ref(), &request)
                .map(|(key, tokens)| state.cache.check(&key, tokens))
                .unwrap_or(CacheOutcome::NONE)
        } else {
            CacheOutcome::NONE
        };

        let outcome = match send_upstream(state, &target, &token, &raw, &request, thinking_enabled).await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                state.pool.mark_error(&target.account.id).await;
                return Err(e);
            }
        };
        match outcome {
            SendOutcome::Stream(upstream) => {
                debug!(
                    "[Orchestrator] upstream open on account {} (attempt {})",
                    target.account.id,
                    attempt + 1
                );
                let stream = frame_and_account(
                    state,
                    &target,
                    &request,
                    upstream,
                    thinking_enabled,
                    input_estimate,
                    cache_outcome,
                );
                return Ok(OpenedStream {
                    account_id: target.account.id,
                    mapped_model: target.target_model,
                    stream,
                });
            }
            SendOutcome::Failure { status: 429, body } => {
                warn!(
                    "[Orchestrator] 429 from upstream on account {}: {}",
                    target.account.id, body
                );
                state.pool.open_breaker(&target.account.id).await;
                if target.channel == AccountType::Gemini {
                    note_gemini_limit(state, &target, &request.model, &body).await;
                }
                last_error = ProxyError::UpstreamRateLimit(body);
                if pinned.is_some() {
                    return Err(last_error);
                }
                // Immediate failover to a sibling account, no backoff.
                same_type = Some(target.channel);
                continue;
            }
            SendOutcome::Failure { status, body }
                if (status == 401 || status == 403) && is_token_invalid_body(&body) =>
            {
                if reauthed_accounts.insert(target.account.id.clone()) {
                    info!(
                        "[Orchestrator] token rejected for {}, forcing re-refresh",
                        target.account.id
                    );
                    state.tokens.invalidate(&target.account.id);
                    attempted.remove(&target.account.id);
                    continue;
                }
                state.pool.mark_error(&target.account.id).await;
                return Err(ProxyError::UpstreamClient { status, body });
            }
            SendOutcome::Failure { status, body } if status >= 500 => {
                state.pool.mark_error(&target.account.id).await;
                return Err(ProxyError::UpstreamServer(format!("{}: {}", status, body)));
            }
            SendOutcome::Failure { status, body } => {
                state.pool.mark_error(&target.account.id).await;
                // OpenAI-format upstream errors are translated to the
                // Claude error vocabulary before surfacing.
                let body = if target.channel == AccountType::CustomApi {
                    serde_json::from_str::<Value>(&body)
                        .map(|parsed| {
                            let mapped = convert::openai::error_to_claude(&parsed, status);
                            mapped["error"]["message"]
                                .as_str()
                                .unwrap_or(&body)
                                .to_string()
                        })
                        .unwrap_or(body)
                } else {
                    body
                };
                return Err(ProxyError::UpstreamClient { status, body });
            }
        }
    }
    Err(last_error)
}

/// Build the channel-specific upstream request and open the byte stream.
async fn send_upstream(
    state: &AppState,
    target: &RouteTarget,
    token: &str,
    raw: &Value,
    request: &ClaudeRequest,
    thinking_enabled: bool,
) -> ProxyResult<SendOutcome> {
    let response = match target.channel {
        AccountType::AmazonQ => {
            let extension = target.account.amazon_q_extension();
            let built = convert::amazonq::build_request(
                request,
                &target.target_model,
                extension.profile_arn.as_deref(),
                thinking_enabled,
            );
            state
                .http
                .post(AMAZONQ_API_URL)
                .header("Content-Type", AMAZONQ_CONTENT_TYPE)
                .header("X-Amz-Target", AMAZONQ_TARGET)
                .bearer_auth(token)
                .json(&built.body)
                .send()
                .await?
        }
        AccountType::Gemini => {
            let extension = target.account.gemini_extension();
            let endpoint = extension
                .endpoint
                .clone()
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| GEMINI_DEFAULT_ENDPOINT.to_string());
            let url = format!("{}{}", endpoint.trim_end_matches('/'), GEMINI_STREAM_PATH);
            let body = serde_json::json!({
                "model": target.target_model,
                "project": extension.project_id,
                "request": convert::gemini::build_request(
                    request,
                    thinking_enabled,
                    request.thinking_budget(),
                ),
            });
            state.http.post(url).bearer_auth(token).json(&body).send().await?
        }
        AccountType::CustomApi => {
            let extension = target.account.custom_api_extension();
            match extension.format {
                CustomApiFormat::OpenAi => {
                    let model = if extension.model.is_empty() {
                        target.target_model.clone()
                    } else {
                        extension.model.clone()
                    };
                    let body = convert::openai::build_request(request, &model, thinking_enabled);
                    state
                        .http
                        .post(extension.openai_url())
                        .bearer_auth(token)
                        .json(&body)
                        .send()
                        .await?
                }
                CustomApiFormat::Claude => {
                    let mut body = if extension.is_azure() {
                        convert::claude::clean_for_azure(raw)
                    } else {
                        raw.clone()
                    };
                    body["model"] = Value::from(target.target_model.clone());
                    body["stream"] = Value::Bool(true);
                    state
                        .http
                        .post(extension.claude_url())
                        .header("x-api-key", token)
                        .header("anthropic-version", ANTHROPIC_VERSION)
                        .json(&body)
                        .send()
                        .await?
                }
            }
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Ok(SendOutcome::Failure {
            status: status.as_u16(),
            body,
        });
    }
    Ok(SendOutcome::Stream(Box::pin(response.bytes_stream())))
}

/// Adapt the upstream bytes to Claude SSE and attach the bookkeeping guard
/// that settles counters, call log, and usage rows when the stream ends —
/// whether it drains cleanly, fails mid-flight, or the client disconnects.
fn frame_and_account(
    state: &AppState,
    target: &RouteTarget,
    request: &ClaudeRequest,
    upstream: stream::UpstreamByteStream,
    thinking_enabled: bool,
    input_estimate: i64,
    cache_outcome: CacheOutcome,
) -> ClaudeSseStream {
    let context = StreamContext {
        message_id: format!("msg_{}", &Uuid::new_v4().simple().to_string()[..24]),
        model: request.model.clone(),
        input_tokens: input_estimate,
        cache_creation_tokens: cache_outcome.cache_creation_tokens as i64,
        cache_read_tokens: cache_outcome.cache_read_tokens as i64,
    };
    let usage = Arc::new(StreamUsage::default());

    let inner = match target.channel {
        AccountType::AmazonQ => stream::amazonq::adapt(
            upstream,
            context.clone(),
            Arc::clone(&state.estimator),
            Arc::clone(&usage),
        ),
        AccountType::Gemini => stream::gemini::adapt(
            upstream,
            context.clone(),
            Arc::clone(&state.estimator),
            Arc::clone(&usage),
        ),
        AccountType::CustomApi => match target.account.custom_api_extension().format {
            CustomApiFormat::OpenAi => stream::openai::adapt(
                upstream,
                context.clone(),
                thinking_enabled,
                Arc::clone(&state.estimator),
                Arc::clone(&usage),
            ),
            CustomApiFormat::Claude => {
                stream::passthrough::adapt(upstream, context.clone(), Arc::clone(&usage))
            }
        },
    };

    let bookkeeper = Bookkeeper {
        state: state.clone(),
        account_id: target.account.id.clone(),
        model: request.model.clone(),
        channel: target.channel,
        usage: Arc::clone(&usage),
        cache_outcome,
    };

    let deadline = tokio::time::Instant::now()
        + std::time::Duration::from_secs(state.config.request_deadline_secs());

    Box::pin(async_stream::stream! {
        let _bookkeeper = bookkeeper;
        let mut inner = inner;
        use futures::StreamExt;
        loop {
            let item = match tokio::time::timeout_at(deadline, inner.next()).await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(_) => {
                    // Overall request deadline: terminate the task tree.
                    warn!("[Orchestrator] request deadline exceeded, closing stream");
                    yield Ok(sse::message_delta("error", usage.input(), usage.output(), 0, 0));
                    yield Ok(sse::message_stop());
                    break;
                }
            };
            match item {
                Ok(chunk) => yield Ok(chunk),
                Err(e) => {
                    // Already committed to SSE: close the message so the
                    // client sees a well-formed ending, then stop. The guard
                    // records the error on drop.
                    warn!("[Orchestrator] mid-stream failure: {}", e);
                    yield Ok(sse::error_event("upstream_error", &e));
                    yield Ok(sse::message_delta(
                        "error",
                        usage.input(),
                        usage.output(),
                        0,
                        0,
                    ));
                    yield Ok(sse::message_stop());
                    break;
                }
            }
        }
    })
}

/// Settles per-account outcome once the response stream is finished or
/// abandoned. Runs from `Drop` so a client disconnect still books the
/// request; the call log only records clean upstream completions.
struct Bookkeeper {
    state: AppState,
    account_id: String,
    model: String,
    channel: AccountType,
    usage: Arc<StreamUsage>,
    cache_outcome: CacheOutcome,
}

impl Drop for Bookkeeper {
    fn drop(&mut self) {
        let state = self.state.clone();
        let account_id = self.account_id.clone();
        let model = self.model.clone();
        let channel = self.channel;
        let usage = Arc::clone(&self.usage);
        let cache_outcome = self.cache_outcome;

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            if usage.is_completed() {
                state.pool.mark_success(&account_id).await;
                if let Err(e) = state.pool.call_log().record(&account_id, &model).await {
                    warn!("[Orchestrator] call log write failed: {}", e);
                }
                if let Err(e) = state
                    .usage
                    .record(
                        &model,
                        channel.as_str(),
                        Some(&account_id),
                        usage.input(),
                        usage.output(),
                        cache_outcome.cache_creation_tokens as i64,
                        cache_outcome.cache_read_tokens as i64,
                    )
                    .await
                {
                    warn!("[Orchestrator] usage write failed: {}", e);
                }
            } else {
                state.pool.mark_error(&account_id).await;
            }
        });
    }
}

/// Gemini 429s split into "slow down" (short cooldown, try again soon) and
/// "out for the day" (zero the model's quota until reset).
async fn note_gemini_limit(state: &AppState, target: &RouteTarget, model: &str, body: &str) {
    let daily = body.contains("PerDay")
        || body.contains("daily")
        || body.contains("QUOTA_EXHAUSTED")
        || body.contains("quota exceeded");
    if !daily {
        state.pool.set_cooldown_secs(&target.account.id, 60).await;
        return;
    }

    let Ok(Some(account)) = state.store.get_account(&target.account.id).await else {
        return;
    };
    let mut extension = account.gemini_extension();
    extension.model_quotas.insert(
        model.to_string(),
        ModelQuota {
            remaining: 0,
            reset_at: Some(chrono::Utc::now().timestamp() + 86_400),
        },
    );
    let patch = crate::store::AccountPatch {
        extension: serde_json::to_value(&extension).ok(),
        ..Default::default()
    };
    if let Err(e) = state.store.update_account(&target.account.id, &patch).await {
        warn!("[Orchestrator] failed to persist gemini quota state: {}", e);
    } else {
        info!(
            "[Orchestrator] gemini model {} exhausted on account {}",
            model, target.account.id
        );
    }
}
