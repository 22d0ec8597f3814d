// ==========================================
// 模式化排产系统 - 作业实例领域模型
// ==========================================
// 职责: 由 Pattern 派生的具体作业 (带交期)
// 红线: due_date 必填 (拖期目标依赖)
// ==========================================

use crate::domain::types::InstanceStatus;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

// ==========================================
// JobInstance - 作业实例
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstance {
    pub instance_id: String,     // 实例ID
    pub pattern_id: String,      // 引用的模式
    pub due_date: NaiveDateTime, // 交期
    pub priority: i32,           // 优先级 (越大越优先)
    pub status: InstanceStatus,  // 状态
}

impl JobInstance {
    pub fn new(instance_id: &str, pattern_id: &str, due_date: NaiveDateTime) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            pattern_id: pattern_id.to_string(),
            due_date,
            priority: 0,
            status: InstanceStatus::Pending,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// 交期相对排程原点的分钟偏移 (向下取整)
    pub fn due_offset_minutes(&self, origin: NaiveDateTime) -> i64 {
        let delta = self.due_date - origin;
        let minutes = delta.num_minutes();
        // num_minutes 向零截断，负数需要向下取整
        if delta < chrono::Duration::minutes(minutes) {
            minutes - 1
        } else {
            minutes
        }
    }
}
