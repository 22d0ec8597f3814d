// ==========================================
// 模式化排产系统 - 领域模型层
// ==========================================
// 职责: 定义领域实体、类型
// 红线: 不含数据访问逻辑,不含引擎逻辑
// ==========================================

pub mod instance;
pub mod pattern;
pub mod performance;
pub mod resource;
pub mod schedule;
pub mod types;

// 重导出核心类型
pub use instance::JobInstance;
pub use pattern::{Machine, Pattern, PatternTask, Precedence, SetupTimeEntry, TaskMode};
pub use performance::{degradation_percent, PerformanceRecord, DEFAULT_REGRESSION_THRESHOLD_PCT};
pub use resource::SequenceResource;
pub use schedule::{
    ObjectiveLock, ObjectiveValues, PhaseResult, SequenceReservation, SolvedSchedule,
    TaskAssignment,
};
pub use types::{InstanceStatus, ResourceType, SolvePhase, SolveStatus};
