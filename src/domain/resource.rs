// ==========================================
// 模式化排产系统 - 序列资源领域模型
// ==========================================
// 职责: 测试站等受约束共享/独占资源的定义与自检
// 红线: EXCLUSIVE ⇒ capacity = max_concurrent_jobs = 1
// ==========================================

use crate::domain::types::ResourceType;
use serde::{Deserialize, Serialize};

// ==========================================
// SequenceResource - 序列资源
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceResource {
    pub sequence_id: String,              // 资源ID (如 "Opto")
    pub name: String,                     // 资源名称
    pub capacity: i32,                    // 物理单元数
    pub max_concurrent_jobs: i32,         // 最大并发作业数 (≤ capacity)
    pub resource_type: ResourceType,      // 独占/共享/资源池
    pub setup_minutes: i64,               // 预留前置准备时间
    pub teardown_minutes: i64,            // 预留后置拆卸时间
    pub window_start_minute: i64,         // 可用窗口起点 (相对排程原点)
    pub window_end_minute: Option<i64>,   // 可用窗口终点 (None 表示不限)
    pub is_active: bool,                  // 是否启用
}

impl SequenceResource {
    /// 创建独占资源
    pub fn exclusive(sequence_id: &str) -> Self {
        Self {
            sequence_id: sequence_id.to_string(),
            name: sequence_id.to_string(),
            capacity: 1,
            max_concurrent_jobs: 1,
            resource_type: ResourceType::Exclusive,
            setup_minutes: 0,
            teardown_minutes: 0,
            window_start_minute: 0,
            window_end_minute: None,
            is_active: true,
        }
    }

    /// 创建共享资源
    pub fn shared(sequence_id: &str, capacity: i32, max_concurrent_jobs: i32) -> Self {
        Self {
            capacity,
            max_concurrent_jobs,
            resource_type: ResourceType::Shared,
            ..Self::exclusive(sequence_id)
        }
    }

    pub fn with_offsets(mut self, setup_minutes: i64, teardown_minutes: i64) -> Self {
        self.setup_minutes = setup_minutes;
        self.teardown_minutes = teardown_minutes;
        self
    }

    pub fn with_window(mut self, start_minute: i64, end_minute: Option<i64>) -> Self {
        self.window_start_minute = start_minute;
        self.window_end_minute = end_minute;
        self
    }

    /// 同时可持有预留的作业数上限
    pub fn concurrency_limit(&self) -> i32 {
        match self.resource_type {
            ResourceType::Exclusive => 1,
            ResourceType::Shared | ResourceType::Pooled => self.max_concurrent_jobs,
        }
    }

    /// 可用窗口长度 (None 表示不限)
    pub fn window_length(&self) -> Option<i64> {
        self.window_end_minute
            .map(|end| (end - self.window_start_minute).max(0))
    }

    /// 一次预留实际占用的时长 (含准备/拆卸)
    pub fn occupied_length(&self, duration_minutes: i64) -> i64 {
        self.setup_minutes + duration_minutes + self.teardown_minutes
    }

    /// 任务最早可开始时间 (窗口下沿 + 准备, 不早于排程原点)
    pub fn earliest_start_minute(&self) -> i64 {
        (self.window_start_minute + self.setup_minutes).max(0)
    }

    /// 给定加工时长能否放进可用窗口
    ///
    /// 原点之前的窗口部分只能容纳准备时间, 不能容纳加工
    pub fn fits_duration(&self, duration_minutes: i64) -> bool {
        self.window_end_minute.map_or(true, |end| {
            self.earliest_start_minute() + duration_minutes + self.teardown_minutes <= end
        })
    }

    /// 结构自检
    ///
    /// # 返回
    /// - Ok(()): 合法
    /// - Err(String): 违规原因
    pub fn validate(&self) -> Result<(), String> {
        if self.capacity < 1 {
            return Err(format!("capacity 必须 ≥ 1, 实际 {}", self.capacity));
        }
        if self.max_concurrent_jobs < 1 {
            return Err(format!(
                "max_concurrent_jobs 必须 ≥ 1, 实际 {}",
                self.max_concurrent_jobs
            ));
        }
        if self.max_concurrent_jobs > self.capacity {
            return Err(format!(
                "max_concurrent_jobs({}) 超过 capacity({})",
                self.max_concurrent_jobs, self.capacity
            ));
        }
        if self.resource_type == ResourceType::Exclusive
            && (self.capacity != 1 || self.max_concurrent_jobs != 1)
        {
            return Err(format!(
                "独占资源要求 capacity = max_concurrent_jobs = 1, 实际 capacity={}, max_concurrent_jobs={}",
                self.capacity, self.max_concurrent_jobs
            ));
        }
        if self.setup_minutes < 0 || self.teardown_minutes < 0 {
            return Err("准备/拆卸时间不能为负".to_string());
        }
        if let Some(end) = self.window_end_minute {
            if end <= self.window_start_minute {
                return Err(format!(
                    "可用窗口为空: [{}, {})",
                    self.window_start_minute, end
                ));
            }
        }
        Ok(())
    }
}
