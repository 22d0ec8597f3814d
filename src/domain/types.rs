// ==========================================
// 模式化排产系统 - 领域类型定义
// ==========================================
// 职责: 跨模块共享的枚举类型
// 序列化格式: SCREAMING_SNAKE_CASE (与数据库一致)
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ==========================================
// 序列资源类型 (Sequence Resource Type)
// ==========================================
// 红线: EXCLUSIVE 必须 capacity = max_concurrent_jobs = 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    Exclusive, // 独占 (如 Opto 测试站)
    Shared,    // 共享 (并发受 max_concurrent_jobs 限制)
    Pooled,    // 资源池 (多台物理单元)
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Exclusive => write!(f, "EXCLUSIVE"),
            ResourceType::Shared => write!(f, "SHARED"),
            ResourceType::Pooled => write!(f, "POOLED"),
        }
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "EXCLUSIVE" => Ok(ResourceType::Exclusive),
            "SHARED" => Ok(ResourceType::Shared),
            "POOLED" => Ok(ResourceType::Pooled),
            other => Err(format!("未知的资源类型: {}", other)),
        }
    }
}

// ==========================================
// 求解状态 (Solve Status)
// ==========================================
// 顺序: Infeasible < Timeout < Feasible < Optimal
// 最终状态取各阶段中"最弱"的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SolveStatus {
    Infeasible,
    Timeout,
    Feasible,
    Optimal,
}

impl SolveStatus {
    /// 是否得到了可用的排程
    pub fn has_solution(&self) -> bool {
        matches!(self, SolveStatus::Feasible | SolveStatus::Optimal)
    }

    /// 取两者中较弱的状态
    pub fn weakest(self, other: SolveStatus) -> SolveStatus {
        self.min(other)
    }
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveStatus::Infeasible => write!(f, "INFEASIBLE"),
            SolveStatus::Timeout => write!(f, "TIMEOUT"),
            SolveStatus::Feasible => write!(f, "FEASIBLE"),
            SolveStatus::Optimal => write!(f, "OPTIMAL"),
        }
    }
}

impl FromStr for SolveStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "INFEASIBLE" => Ok(SolveStatus::Infeasible),
            "TIMEOUT" => Ok(SolveStatus::Timeout),
            "FEASIBLE" => Ok(SolveStatus::Feasible),
            "OPTIMAL" => Ok(SolveStatus::Optimal),
            other => Err(format!("未知的求解状态: {}", other)),
        }
    }
}

// ==========================================
// 优化阶段 (Solve Phase)
// ==========================================
// 依据: 分层字典序优化 L → M → C
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SolvePhase {
    Lateness, // 阶段 L: 总拖期最小
    Makespan, // 阶段 M: 最大完工时间最小
    Cost,     // 阶段 C: 成本最小
}

impl SolvePhase {
    /// 严格的阶段执行顺序
    pub const ORDER: [SolvePhase; 3] = [SolvePhase::Lateness, SolvePhase::Makespan, SolvePhase::Cost];

    pub fn as_str(&self) -> &'static str {
        match self {
            SolvePhase::Lateness => "LATENESS",
            SolvePhase::Makespan => "MAKESPAN",
            SolvePhase::Cost => "COST",
        }
    }
}

impl fmt::Display for SolvePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 作业实例状态 (Instance Status)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Pending,    // 待排产
    Scheduled,  // 已排产
    InProgress, // 执行中
    Completed,  // 已完工
    Cancelled,  // 已取消
}

impl InstanceStatus {
    /// 是否仍可参与排产
    pub fn is_schedulable(&self) -> bool {
        matches!(self, InstanceStatus::Pending | InstanceStatus::Scheduled)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Pending => write!(f, "PENDING"),
            InstanceStatus::Scheduled => write!(f, "SCHEDULED"),
            InstanceStatus::InProgress => write!(f, "IN_PROGRESS"),
            InstanceStatus::Completed => write!(f, "COMPLETED"),
            InstanceStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PENDING" => Ok(InstanceStatus::Pending),
            "SCHEDULED" => Ok(InstanceStatus::Scheduled),
            "IN_PROGRESS" => Ok(InstanceStatus::InProgress),
            "COMPLETED" => Ok(InstanceStatus::Completed),
            "CANCELLED" => Ok(InstanceStatus::Cancelled),
            other => Err(format!("未知的实例状态: {}", other)),
        }
    }
}
