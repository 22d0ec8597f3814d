// ==========================================
// 模式化排产系统 - 排程结果领域模型
// ==========================================
// 职责: 求解结果 (SolvedSchedule) 及其任务分配/资源预留
// 红线: SolvedSchedule 创建后不可变，新求解生成新记录
// ==========================================

use crate::domain::types::{SolvePhase, SolveStatus};
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

// ==========================================
// ObjectiveValues - 三级目标值
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectiveValues {
    pub total_lateness_minutes: i64, // Σ max(0, 完工 - 交期)
    pub makespan_minutes: i64,       // 最大完工时间
    pub total_cost_cents: i64,       // 总成本 (分)
}

impl ObjectiveValues {
    /// 按阶段取目标值
    pub fn value_of(&self, phase: SolvePhase) -> i64 {
        match phase {
            SolvePhase::Lateness => self.total_lateness_minutes,
            SolvePhase::Makespan => self.makespan_minutes,
            SolvePhase::Cost => self.total_cost_cents,
        }
    }

    /// 字典序三元组
    pub fn as_triple(&self) -> (i64, i64, i64) {
        (
            self.total_lateness_minutes,
            self.makespan_minutes,
            self.total_cost_cents,
        )
    }
}

// ==========================================
// TaskAssignment - 任务分配
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub instance_id: String, // 作业实例
    pub task_id: String,     // 模式任务
    pub mode_id: String,     // 选中的执行模式
    pub machine_id: String,  // 设备
    pub start_minute: i64,   // 开始 (相对原点)
    pub end_minute: i64,     // 结束 (相对原点)
}

impl TaskAssignment {
    pub fn duration_minutes(&self) -> i64 {
        self.end_minute - self.start_minute
    }

    pub fn start_time(&self, origin: NaiveDateTime) -> NaiveDateTime {
        origin + Duration::minutes(self.start_minute)
    }

    pub fn end_time(&self, origin: NaiveDateTime) -> NaiveDateTime {
        origin + Duration::minutes(self.end_minute)
    }
}

// ==========================================
// SequenceReservation - 序列资源预留
// ==========================================
// 区间已包含 setup/teardown: [start - setup, end + teardown]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceReservation {
    pub sequence_id: String,
    pub instance_id: String,
    pub task_id: String,
    pub start_minute: i64,
    pub end_minute: i64,
}

// ==========================================
// PhaseResult - 单阶段求解结果
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: SolvePhase,
    pub status: SolveStatus,
    pub objective_value: Option<i64>, // None: 本阶段无解 (超时)
    pub elapsed_seconds: f64,
    pub locked: Option<ObjectiveLock>, // 传递给后续阶段的锁
}

/// 阶段目标锁
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectiveLock {
    Exact(i64),  // objective == value (阶段最优)
    AtMost(i64), // objective <= value (阶段仅可行)
}

impl ObjectiveLock {
    pub fn admits(&self, value: i64) -> bool {
        match *self {
            ObjectiveLock::Exact(v) => value == v,
            ObjectiveLock::AtMost(v) => value <= v,
        }
    }

    pub fn bound(&self) -> i64 {
        match *self {
            ObjectiveLock::Exact(v) | ObjectiveLock::AtMost(v) => v,
        }
    }
}

// ==========================================
// SolvedSchedule - 排程结果
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolvedSchedule {
    pub schedule_id: String,                     // UUID
    pub pattern_id: String,                      // 模式
    pub instance_ids: Vec<String>,               // 参与求解的实例
    pub origin: NaiveDateTime,                   // 时间原点
    pub status: SolveStatus,                     // 各阶段最弱状态
    pub solve_time_seconds: f64,                 // 求解耗时
    pub objectives: ObjectiveValues,             // 最终目标值
    pub assignments: Vec<TaskAssignment>,        // 任务分配
    pub reservations: Vec<SequenceReservation>,  // 资源预留
    pub phase_results: Vec<PhaseResult>,         // 分阶段明细
    pub created_at: NaiveDateTime,
}

impl SolvedSchedule {
    /// 实例完工时间 (最后一个任务的结束)
    pub fn completion_of(&self, instance_id: &str) -> Option<i64> {
        self.assignments
            .iter()
            .filter(|a| a.instance_id == instance_id)
            .map(|a| a.end_minute)
            .max()
    }

    /// 所有任务中的最大结束时间
    pub fn max_completion(&self) -> i64 {
        self.assignments
            .iter()
            .map(|a| a.end_minute)
            .max()
            .unwrap_or(0)
    }

    /// 按 (instance, task) 排序的分配视图
    pub fn sorted_assignments(&self) -> Vec<TaskAssignment> {
        let mut sorted = self.assignments.clone();
        sorted.sort_by(|a, b| {
            a.instance_id
                .cmp(&b.instance_id)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        sorted
    }
}
