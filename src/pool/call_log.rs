//! Sliding-window request tally. One row per clean upstream completion —
//! never per SSE event, never for failed requests (those land in the
//! account's error counter instead).

use std::sync::Arc;

use crate::error::ProxyResult;
use crate::store::{CallStats, Store};

pub const WINDOW_SECS: i64 = 3600;
/// Rows older than this may be purged out of band.
pub const RETENTION_SECS: i64 = 7 * 86_400;

pub struct CallLogRecorder {
    store: Arc<Store>,
}

impl CallLogRecorder {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn record(&self, account_id: &str, model: &str) -> ProxyResult<()> {
        let now = chrono::Utc::now().timestamp();
        self.store.record_call(account_id, model, now).await
    }

    pub async fn count_in_window(&self, account_id: &str) -> ProxyResult<i64> {
        let now = chrono::Utc::now().timestamp();
        self.store
            .count_calls_since(account_id, now - WINDOW_SECS)
            .await
    }

    pub async fn stats(&self, account_id: &str) -> ProxyResult<CallStats> {
        let now = chrono::Utc::now().timestamp();
        self.store.call_stats(account_id, now).await
    }

    pub async fn purge_old(&self) -> ProxyResult<u64> {
        let cutoff = chrono::Utc::now().timestamp() - RETENTION_SECS;
        self.store.purge_calls_before(cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    async fn recorder() -> (tempfile::TempDir, CallLogRecorder, Arc<Store>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let store = Arc::new(Store::open(&config).await.expect("store"));
        (dir, CallLogRecorder::new(Arc::clone(&store)), store)
    }

    #[tokio::test]
    async fn window_only_counts_recent_calls() {
        let (_dir, recorder, store) = recorder().await;
        let now = chrono::Utc::now().timestamp();
        store.record_call("a", "m", now - 2 * WINDOW_SECS).await.unwrap();
        recorder.record("a", "m").await.unwrap();
        recorder.record("a", "m").await.unwrap();

        assert_eq!(recorder.count_in_window("a").await.unwrap(), 2);
        let stats = recorder.stats("a").await.unwrap();
        assert_eq!(stats.last_hour, 2);
        assert_eq!(stats.total, 3);
    }

    #[tokio::test]
    async fn purge_drops_only_expired_rows() {
        let (_dir, recorder, store) = recorder().await;
        let now = chrono::Utc::now().timestamp();
        store
            .record_call("a", "m", now - RETENTION_SECS - 10)
            .await
            .unwrap();
        store.record_call("a", "m", now - 10).await.unwrap();
        assert_eq!(recorder.purge_old().await.unwrap(), 1);
        let stats = recorder.stats("a").await.unwrap();
        assert_eq!(stats.total, 1);
    }
}
