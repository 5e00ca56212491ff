//! Account data model. The `extension` blob is opaque to the store; typed
//! views over it live here so the router and converters do not hand-roll
//! JSON access.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::constants::{DEFAULT_RATE_LIMIT_PER_HOUR, DEFAULT_WEIGHT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    AmazonQ,
    Gemini,
    CustomApi,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::AmazonQ => "amazon_q",
            AccountType::Gemini => "gemini",
            AccountType::CustomApi => "custom_api",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "amazon_q" => Some(AccountType::AmazonQ),
            "gemini" => Some(AccountType::Gemini),
            "custom_api" => Some(AccountType::CustomApi),
            _ => None,
        }
    }

    pub const ALL: [AccountType; 3] =
        [AccountType::AmazonQ, AccountType::Gemini, AccountType::CustomApi];
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMapping {
    #[serde(rename = "requestModel")]
    pub request_model: String,
    #[serde(rename = "targetModel")]
    pub target_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    pub label: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default)]
    pub access_token: Option<String>,
    /// Free-form per-account blob; see the typed views below.
    #[serde(default)]
    pub extension: Value,
    #[serde(default)]
    pub model_mappings: Vec<ModelMapping>,
    pub enabled: bool,
    pub weight: u32,
    pub rate_limit_per_hour: u32,
    #[serde(default)]
    pub cooldown_until: Option<i64>,
    #[serde(default)]
    pub last_used_at: Option<i64>,
    pub request_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    #[serde(default)]
    pub last_refresh_status: Option<String>,
    #[serde(default)]
    pub last_refresh_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Account {
    pub fn new(
        id: String,
        account_type: AccountType,
        label: String,
        client_id: String,
        client_secret: String,
        refresh_token: String,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id,
            account_type,
            label,
            client_id,
            client_secret,
            refresh_token,
            access_token: None,
            extension: Value::Null,
            model_mappings: Vec::new(),
            enabled: true,
            weight: DEFAULT_WEIGHT,
            rate_limit_per_hour: DEFAULT_RATE_LIMIT_PER_HOUR,
            cooldown_until: None,
            last_used_at: None,
            request_count: 0,
            success_count: 0,
            error_count: 0,
            last_refresh_status: None,
            last_refresh_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn in_cooldown(&self, now: i64) -> bool {
        self.cooldown_until.map(|until| until > now).unwrap_or(false)
    }

    /// First matching mapping wins; no match passes the model through.
    pub fn map_model<'a>(&'a self, requested: &'a str) -> &'a str {
        self.model_mappings
            .iter()
            .find(|m| m.request_model == requested)
            .map(|m| m.target_model.as_str())
            .unwrap_or(requested)
    }

    pub fn amazon_q_extension(&self) -> AmazonQExtension {
        serde_json::from_value(self.extension.clone()).unwrap_or_default()
    }

    pub fn gemini_extension(&self) -> GeminiExtension {
        serde_json::from_value(self.extension.clone()).unwrap_or_default()
    }

    pub fn custom_api_extension(&self) -> CustomApiExtension {
        serde_json::from_value(self.extension.clone()).unwrap_or_default()
    }

    /// Redacted listing view for the admin API.
    pub fn to_summary(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "type": self.account_type,
            "label": self.label,
            "enabled": self.enabled,
            "weight": self.weight,
            "rateLimitPerHour": self.rate_limit_per_hour,
            "cooldownUntil": self.cooldown_until,
            "lastUsedAt": self.last_used_at,
            "requestCount": self.request_count,
            "successCount": self.success_count,
            "errorCount": self.error_count,
            "lastRefreshStatus": self.last_refresh_status,
            "lastRefreshAt": self.last_refresh_at,
            "modelMappings": self.model_mappings,
            "hasAccessToken": self.access_token.as_deref().map(|t| !t.is_empty()).unwrap_or(false),
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AmazonQExtension {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelQuota {
    #[serde(default)]
    pub remaining: i64,
    #[serde(default)]
    pub reset_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeminiExtension {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model_quotas: HashMap<String, ModelQuota>,
}

impl GeminiExtension {
    /// A model with a recorded quota of zero stays blocked until its reset
    /// time passes; models without an entry are assumed available.
    pub fn model_available(&self, model: &str, now: i64) -> bool {
        match self.model_quotas.get(model) {
            Some(quota) => {
                quota.remaining > 0 || quota.reset_at.map(|t| t <= now).unwrap_or(false)
            }
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomApiFormat {
    OpenAi,
    Claude,
}

impl Default for CustomApiFormat {
    fn default() -> Self {
        CustomApiFormat::OpenAi
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomApiExtension {
    #[serde(default)]
    pub api_base: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub format: CustomApiFormat,
    /// Empty for a stock endpoint; "azure" triggers the request cleanup.
    #[serde(default)]
    pub provider: String,
}

impl CustomApiExtension {
    pub fn is_azure(&self) -> bool {
        self.provider == "azure"
    }

    /// `api_base` auto-appends `/v1` when absent (OpenAI format only).
    pub fn openai_url(&self) -> String {
        let base = self.api_base.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{}/chat/completions", base)
        } else {
            format!("{}/v1/chat/completions", base)
        }
    }

    pub fn claude_url(&self) -> String {
        format!("{}/v1/messages", self.api_base.trim_end_matches('/'))
    }
}

/// Token cache row: one per account, file-backed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCacheEntry {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
}

impl TokenCacheEntry {
    /// Entries inside the 5-minute skew window count as expired.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at - now < crate::constants::TOKEN_EXPIRY_SKEW_SECS
    }
}
