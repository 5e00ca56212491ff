//! Per-request token usage accounting and the aggregated summaries behind
//! `GET /v1/usage`.

use std::sync::Arc;

use crate::error::ProxyResult;
use crate::store::{Store, UsageRow, UsageSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Hour,
    Day,
    Week,
    Month,
    All,
}

impl Period {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hour" => Some(Period::Hour),
            "day" => Some(Period::Day),
            "week" => Some(Period::Week),
            "month" => Some(Period::Month),
            "all" => Some(Period::All),
            _ => None,
        }
    }

    pub fn since(&self, now: i64) -> Option<i64> {
        match self {
            Period::Hour => Some(now - 3600),
            Period::Day => Some(now - 86_400),
            Period::Week => Some(now - 7 * 86_400),
            Period::Month => Some(now - 30 * 86_400),
            Period::All => None,
        }
    }
}

pub struct UsageTracker {
    store: Arc<Store>,
    /// Models whose input tokens are recorded as zero (operator-listed
    /// "small models" excluded from input accounting).
    zero_input_models: Vec<String>,
}

impl UsageTracker {
    pub fn new(store: Arc<Store>, zero_input_models: Vec<String>) -> Self {
        Self {
            store,
            zero_input_models,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        model: &str,
        channel: &str,
        account_id: Option<&str>,
        input_tokens: i64,
        output_tokens: i64,
        cache_creation_tokens: i64,
        cache_read_tokens: i64,
    ) -> ProxyResult<()> {
        let input_tokens = if self.zero_input_models.iter().any(|m| m == model) {
            0
        } else {
            input_tokens
        };
        self.store
            .record_usage(&UsageRow {
                account_id: account_id.map(|s| s.to_string()),
                model: model.to_string(),
                channel: channel.to_string(),
                input_tokens,
                output_tokens,
                cache_creation_tokens,
                cache_read_tokens,
                timestamp: chrono::Utc::now().timestamp(),
            })
            .await
    }

    pub async fn summary(&self, period: Period) -> ProxyResult<UsageSummary> {
        let since = period.since(chrono::Utc::now().timestamp());
        self.store.usage_summary(since).await
    }
}
