// ==========================================
// 模式化排产系统 - 性能记录领域模型
// ==========================================
// 职责: 每次求解后的耗时/加速比/回归标记
// 红线: 只追加，不修改历史
// ==========================================

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// 默认回归阈值 (%)
pub const DEFAULT_REGRESSION_THRESHOLD_PCT: f64 = 20.0;

// ==========================================
// PerformanceRecord - 性能记录
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub record_id: String,               // UUID
    pub pattern_id: String,              // 模式
    pub solve_time_seconds: f64,         // 本次耗时
    pub instance_count: i64,             // 实例数
    pub speedup_factor: Option<f64>,     // 相对扁平建模的加速比
    pub baseline_seconds: f64,           // 比较所用基线
    pub degradation_percent: f64,        // (solve - baseline) / baseline × 100
    pub is_regression: bool,             // degradation > threshold
    pub recorded_at: NaiveDateTime,
}

/// 计算退化百分比
///
/// # 参数
/// - solve_time_seconds: 本次耗时
/// - baseline_seconds: 基线耗时 (≤ 0 视为无基线, 返回 0)
pub fn degradation_percent(solve_time_seconds: f64, baseline_seconds: f64) -> f64 {
    if baseline_seconds <= 0.0 {
        return 0.0;
    }
    (solve_time_seconds - baseline_seconds) / baseline_seconds * 100.0
}
