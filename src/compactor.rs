use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::{DayStore, EngineError};

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites a tenant's WAL once enough appends pile up.
pub async fn run_compactor(store: Arc<DayStore>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&store, threshold).await {
            warn!("compaction failed: {e}");
        }
    }
}

/// Compact when at least `threshold` appends happened since the last rewrite.
/// Returns whether a compaction ran.
pub async fn compact_if_due(store: &DayStore, threshold: u64) -> Result<bool, EngineError> {
    let appends = store.appends_since_compact().await;
    if appends < threshold.max(1) {
        return Ok(false);
    }
    debug!(appends, threshold, "compaction due");
    store.compact().await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, EngineOptions};
    use crate::model::{ServiceInfo, TimeRangeInput};
    use chrono::NaiveDate;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("freeslot_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = Arc::new(DayStore::open(&path, Duration::from_secs(1)).unwrap());
        let engine = Engine::with_day_store(store.clone(), EngineOptions::default());
        let date = NaiveDate::from_ymd_opt(2025, 3, 3).unwrap();

        engine
            .register_service(ServiceInfo { id: 1, owner_id: 7, name: "cut".into() })
            .await
            .unwrap();
        assert!(!compact_if_due(&store, 3).await.unwrap());

        for (start, end) in [("09:00", "09:30"), ("10:00", "10:30")] {
            let ranges = vec![TimeRangeInput::new(start, end)];
            engine.save_day_schedule(7, date, &ranges).await.unwrap();
        }
        assert!(compact_if_due(&store, 3).await.unwrap());
        assert_eq!(store.appends_since_compact().await, 0);

        drop(engine);
        drop(store);
        let reopened = DayStore::open(&path, Duration::from_secs(1)).unwrap();
        let engine = Engine::with_day_store(Arc::new(reopened), EngineOptions::default());
        let day = engine.get_day_schedule(7, date).await;
        assert_eq!(day.len(), 1);
        assert_eq!(engine.list_services(7).len(), 1);
    }

    #[tokio::test]
    async fn in_memory_store_never_compacts() {
        let store = DayStore::in_memory(Duration::from_secs(1));
        assert!(!compact_if_due(&store, 0).await.unwrap());
    }
}
