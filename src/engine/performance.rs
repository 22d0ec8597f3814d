// ==========================================
// 模式化排产系统 - 性能跟踪
// ==========================================
// 职责: 每次求解后与模式基线比较，写入性能历史
// 红线: 回归只告警不阻断; 历史只追加
// 规则: 模式无基线时以本次耗时为基线 (退化 0%)
// ==========================================

use crate::domain::performance::{
    degradation_percent, PerformanceRecord, DEFAULT_REGRESSION_THRESHOLD_PCT,
};
use crate::repository::{PerformanceStore, RepositoryResult};
use chrono::Local;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

pub struct PerformanceTracker {
    store: Arc<dyn PerformanceStore>,
    regression_threshold_pct: f64,
}

impl PerformanceTracker {
    pub fn new(store: Arc<dyn PerformanceStore>) -> Self {
        Self {
            store,
            regression_threshold_pct: DEFAULT_REGRESSION_THRESHOLD_PCT,
        }
    }

    pub fn with_threshold(mut self, regression_threshold_pct: f64) -> Self {
        self.regression_threshold_pct = regression_threshold_pct;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.regression_threshold_pct
    }

    /// 记录一次求解性能
    ///
    /// # 参数
    /// - pattern_id: 模式ID
    /// - solve_time_seconds: 本次求解耗时
    /// - instance_count: 参与实例数
    /// - speedup_factor: 相对扁平建模的加速比 (未测量为 None)
    ///
    /// # 返回
    /// 已写入历史的性能记录
    #[instrument(skip(self), fields(threshold = self.regression_threshold_pct))]
    pub async fn record(
        &self,
        pattern_id: &str,
        solve_time_seconds: f64,
        instance_count: usize,
        speedup_factor: Option<f64>,
    ) -> RepositoryResult<PerformanceRecord> {
        let baseline = match self.store.baseline(pattern_id).await? {
            Some(seconds) if seconds > 0.0 => seconds,
            _ => {
                debug!(pattern_id, solve_time_seconds, "模式无基线，采用本次耗时");
                self.store.set_baseline(pattern_id, solve_time_seconds).await?;
                solve_time_seconds
            }
        };

        let degradation = degradation_percent(solve_time_seconds, baseline);
        let is_regression = degradation > self.regression_threshold_pct;

        let record = PerformanceRecord {
            record_id: Uuid::new_v4().to_string(),
            pattern_id: pattern_id.to_string(),
            solve_time_seconds,
            instance_count: instance_count as i64,
            speedup_factor,
            baseline_seconds: baseline,
            degradation_percent: degradation,
            is_regression,
            recorded_at: Local::now().naive_local(),
        };
        self.store.append(&record).await?;

        if is_regression {
            warn!(
                pattern_id,
                solve_time_seconds,
                baseline_seconds = baseline,
                degradation_percent = degradation,
                "求解性能回归"
            );
        }
        Ok(record)
    }

    /// 手动重置模式基线
    pub async fn reset_baseline(
        &self,
        pattern_id: &str,
        baseline_seconds: f64,
    ) -> RepositoryResult<()> {
        self.store.set_baseline(pattern_id, baseline_seconds).await
    }

    pub async fn history(
        &self,
        pattern_id: &str,
        limit: usize,
    ) -> RepositoryResult<Vec<PerformanceRecord>> {
        self.store.history(pattern_id, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::RepositoryError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        baselines: Mutex<HashMap<String, Option<f64>>>,
        records: Mutex<Vec<PerformanceRecord>>,
    }

    impl MemoryStore {
        fn with_pattern(pattern_id: &str, baseline: Option<f64>) -> Self {
            let store = Self::default();
            store
                .baselines
                .lock()
                .unwrap()
                .insert(pattern_id.to_string(), baseline);
            store
        }
    }

    #[async_trait]
    impl PerformanceStore for MemoryStore {
        async fn baseline(&self, pattern_id: &str) -> RepositoryResult<Option<f64>> {
            self.baselines
                .lock()
                .unwrap()
                .get(pattern_id)
                .copied()
                .ok_or_else(|| RepositoryError::not_found("Pattern", pattern_id))
        }

        async fn set_baseline(&self, pattern_id: &str, seconds: f64) -> RepositoryResult<()> {
            let mut baselines = self.baselines.lock().unwrap();
            match baselines.get_mut(pattern_id) {
                Some(slot) => {
                    *slot = Some(seconds);
                    Ok(())
                }
                None => Err(RepositoryError::not_found("Pattern", pattern_id)),
            }
        }

        async fn append(&self, record: &PerformanceRecord) -> RepositoryResult<()> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn history(&self, pattern_id: &str, limit: usize) -> RepositoryResult<Vec<PerformanceRecord>> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .rev()
                .filter(|r| r.pattern_id == pattern_id)
                .take(limit)
                .cloned()
                .collect())
        }
    }

    #[tokio::test]
    async fn test_first_solve_becomes_baseline() {
        let store = Arc::new(MemoryStore::with_pattern("P1", None));
        let tracker = PerformanceTracker::new(store.clone());

        let record = tracker.record("P1", 2.0, 3, None).await.unwrap();
        assert_eq!(record.baseline_seconds, 2.0);
        assert_eq!(record.degradation_percent, 0.0);
        assert!(!record.is_regression);
        assert_eq!(store.baseline("P1").await.unwrap(), Some(2.0));
    }

    #[tokio::test]
    async fn test_regression_flag_against_threshold() {
        let store = Arc::new(MemoryStore::with_pattern("P1", Some(1.0)));
        let tracker = PerformanceTracker::new(store.clone());

        // 恰好 20%: 不算回归
        let at_threshold = tracker.record("P1", 1.2, 3, Some(4.0)).await.unwrap();
        assert!((at_threshold.degradation_percent - 20.0).abs() < 1e-6);
        assert!(!at_threshold.is_regression);

        let slow = tracker.record("P1", 1.5, 3, None).await.unwrap();
        assert!(slow.is_regression);

        let faster = tracker.record("P1", 0.5, 3, None).await.unwrap();
        assert!(faster.degradation_percent < 0.0);
        assert!(!faster.is_regression);

        // 基线不随记录漂移
        assert_eq!(store.baseline("P1").await.unwrap(), Some(1.0));

        let history = tracker.history("P1", 10).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].record_id, faster.record_id);
    }

    #[tokio::test]
    async fn test_custom_threshold_and_manual_baseline() {
        let store = Arc::new(MemoryStore::with_pattern("P1", Some(1.0)));
        let tracker = PerformanceTracker::new(store).with_threshold(50.0);
        assert_eq!(tracker.threshold(), 50.0);

        assert!(!tracker.record("P1", 1.4, 1, None).await.unwrap().is_regression);

        tracker.reset_baseline("P1", 0.5).await.unwrap();
        assert!(tracker.record("P1", 1.4, 1, None).await.unwrap().is_regression);
    }

    #[tokio::test]
    async fn test_unknown_pattern_propagates() {
        let tracker = PerformanceTracker::new(Arc::new(MemoryStore::default()));
        assert!(matches!(
            tracker.record("P9", 1.0, 1, None).await,
            Err(RepositoryError::NotFound { .. })
        ));
    }
}
